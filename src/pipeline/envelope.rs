//! The unit of data flowing through the graph.
//!
//! Every value posted on an emitter travels inside a `Message`, paired with an
//! `Envelope` carrying its source, per-emitter sequence number and the two
//! timestamps the scheduler orders by.

use crate::pipeline::id::ComponentId;
use crate::pipeline::time::Time;
use std::fmt;
use std::time::Duration;

/// Timestamp and sequence metadata accompanying every message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Component that owns the emitter the message was posted on.
    pub source_id: ComponentId,
    /// Strictly increasing per emitter, starting at 1.
    pub sequence_id: u64,
    /// When the real-world event this message describes happened.
    pub originating_time: Time,
    /// When the message was produced, per the pipeline clock.
    pub creation_time: Time,
}

impl Envelope {
    pub fn new(
        source_id: ComponentId,
        sequence_id: u64,
        originating_time: Time,
        creation_time: Time,
    ) -> Self {
        Self {
            source_id,
            sequence_id,
            originating_time,
            creation_time,
        }
    }

    /// Time between the event and the production of the message.
    pub fn latency(&self) -> Duration {
        self.creation_time
            .saturating_duration_since(self.originating_time)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("source", &self.source_id)
            .field("seq", &self.sequence_id)
            .field("originating", &self.originating_time)
            .field("creation", &self.creation_time)
            .finish()
    }
}

/// A value paired with its envelope. Immutable once posted.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub data: T,
    pub envelope: Envelope,
}

impl<T> Message<T> {
    pub fn new(data: T, envelope: Envelope) -> Self {
        Self { data, envelope }
    }

    pub fn originating_time(&self) -> Time {
        self.envelope.originating_time
    }

    pub fn into_parts(self) -> (T, Envelope) {
        (self.data, self.envelope)
    }
}
