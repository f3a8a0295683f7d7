//! Persistence and replay.
//!
//! The runtime does not define an on-disk format. It talks to stores through
//! two small capabilities, [`StoreWriter`] and [`StoreReader`], exchanging
//! `(originating time, bytes)` records; a [`Serializer`] turns payloads into
//! bytes and back.
//!
//! - [`Exporter`] persists every message reaching one receiver.
//! - [`ReplaySource`] reads records back and re-posts them, paced by the
//!   pipeline clock.
//! - [`InMemoryStore`] implements both capabilities over a shared vector.

pub mod exporter;
pub mod memory;
pub mod replay;
pub mod serializer;

pub use exporter::Exporter;
pub use memory::InMemoryStore;
pub use replay::ReplaySource;
pub use serializer::{JsonSerializer, Serializer};

use crate::pipeline::error::PipelineResult;
use crate::pipeline::time::Time;

/// A persisted message: originating time and encoded payload.
pub type Record = (Time, Vec<u8>);

/// Sequential access to persisted records, in originating-time order.
#[cfg_attr(test, mockall::automock)]
pub trait StoreReader: Send {
    /// The next record, or `None` once the store is exhausted.
    fn next_record(&mut self) -> PipelineResult<Option<Record>>;
}

/// Append-only record sink.
#[cfg_attr(test, mockall::automock)]
pub trait StoreWriter: Send {
    fn append_record(&mut self, originating_time: Time, data: &[u8]) -> PipelineResult<()>;

    /// Make appended records durable. Called when the exporter stops.
    fn flush(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

impl<R: StoreReader + ?Sized> StoreReader for Box<R> {
    fn next_record(&mut self) -> PipelineResult<Option<Record>> {
        (**self).next_record()
    }
}

impl<W: StoreWriter + ?Sized> StoreWriter for Box<W> {
    fn append_record(&mut self, originating_time: Time, data: &[u8]) -> PipelineResult<()> {
        (**self).append_record(originating_time, data)
    }

    fn flush(&mut self) -> PipelineResult<()> {
        (**self).flush()
    }
}
