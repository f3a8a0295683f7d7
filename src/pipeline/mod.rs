//! Streaming dataflow runtime.
//!
//! Components own typed emitters and receivers. An emitter stamps each post
//! with an [`Envelope`] and fans it out to every connected receiver; each
//! receiver applies its [`DeliveryPolicy`] and hands one message at a time to
//! the shared scheduler, which runs dispatches and timers in envelope-time
//! order on a fixed worker pool.
//!
//! # Architecture
//!
//! ```text
//! [camera] ──► Emitter ──┬──► Receiver (Throttle) ──► [detector]
//!                        └──► Receiver (Unlimited) ──► [Exporter]
//!                                    │
//!                                    ▼
//!                     Scheduler (heap keyed by originating time)
//! ```
//!
//! # Design
//!
//! - **Single outstanding dispatch** per receiver: handlers never run
//!   concurrently with themselves, and a receiver never occupies more than one
//!   heap slot.
//! - **Cycles through the heap**: a handler posting downstream queues work;
//!   it never recurses into the consumer (except the bounded inline path of
//!   `SynchronousOrThrottle`).
//! - **Blocking yields the worker**: a producer blocked on a full
//!   `Throttle` receiver is compensated by an extra worker.
//! - **Errors are routed, not thrown**: callback failures go to the error
//!   channel and the configured [`ErrorPolicy`](crate::config::ErrorPolicy).

pub mod clock;
pub mod component;
pub mod diagnostics;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod events;
pub mod executor;
pub(crate) mod graph;
pub mod id;
pub mod nodes;
pub mod policy;
pub mod port;
pub mod receiver;
pub(crate) mod runtime;
pub mod scheduler;
pub(crate) mod sync;
pub mod time;

pub use clock::Clock;
pub use component::{Component, ComponentContext, LifecycleState, MessageHandler, Passive};
pub use diagnostics::{
    ComponentSnapshot, EmitterSnapshot, ReceiverSnapshot, SchedulerSnapshot, TopologySnapshot,
};
pub use emitter::Emitter;
pub use envelope::{Envelope, Message};
pub use error::{BoxError, CallbackStage, PipelineError, PipelineResult};
pub use events::{EventBus, PipelineEvent};
pub use executor::{Pipeline, PipelineBuilder};
pub use graph::Edge;
pub use id::{ComponentId, EdgeId, EmitterId, PipelineId, ReceiverId};
pub use nodes::{Connector, Merge};
pub use policy::{DeliveryPolicy, ThrottleMode};
pub use port::{PayloadType, PortDescriptor, PortDirection};
pub use receiver::{Receiver, ReceiverStats, MAX_SYNC_DEPTH};
pub use runtime::ERROR_CHANNEL_CAPACITY;
pub use scheduler::{Scheduler, SchedulerStatus, WorkKind};
pub use time::Time;
