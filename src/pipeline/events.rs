//! Pipeline event notifications.
//!
//! Any number of observers can call [`EventBus::subscribe`] and receive every
//! event published after that point on their own crossbeam channel.
//! Subscribers whose receiving end has been dropped are pruned on the next
//! publish.

use crate::pipeline::component::LifecycleState;
use crate::pipeline::id::{ComponentId, PipelineId};
use crate::pipeline::sync::lock;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

/// Something observable happened in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The pipeline moved between lifecycle states.
    LifecycleChanged {
        pipeline: PipelineId,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// A component's `on_start` returned.
    ComponentStarted { component: ComponentId, name: String },
    /// A component's `on_stop` returned.
    ComponentStopped { component: ComponentId, name: String },
    /// A callback failed; the full error is on the error channel.
    ComponentFailed {
        component: Option<ComponentId>,
        message: String,
    },
    /// A component stopped receiving messages after an upstream failure.
    ComponentIsolated { component: ComponentId, name: String },
    /// A source reported it has nothing more to produce.
    SourceCompleted { component: ComponentId, name: String },
}

impl PipelineEvent {
    pub fn is_lifecycle(&self, to: LifecycleState) -> bool {
        matches!(self, PipelineEvent::LifecycleChanged { to: t, .. } if *t == to)
    }
}

/// Fan-out of pipeline events to subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, event: PipelineEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
