//! # sensorflow-rs: Streaming Dataflow Runtime
//!
//! A runtime for graphs of components exchanging time-stamped messages, as
//! found in multimodal sensor processing: cameras, microphones and detectors
//! connected by typed streams, running live or replaying a recording.
//!
//! ## Architecture
//!
//! - **Pipeline**: owns the graph and drives the component lifecycle
//!   (Created → Started → Running → Stopping → Stopped)
//! - **Emitters / Receivers**: typed ports; every post carries an
//!   [`Envelope`](pipeline::Envelope) with source, sequence number and
//!   originating/creation times
//! - **Delivery policies**: per-receiver buffering (`Unlimited`,
//!   `LatestMessage`, `Throttle`, `SynchronousOrThrottle`)
//! - **Scheduler**: time-ordered work heap drained by a worker pool
//! - **Clock**: wall-clock time live, log-driven time in replay
//! - **Buffer pool**: recycled, reference-counted byte buffers for large
//!   payloads
//!
//! ## Example
//!
//! ```ignore
//! use sensorflow_rs::pipeline::{DeliveryPolicy, Passive, Pipeline, Time};
//!
//! let pipeline = Pipeline::builder().name("demo").workers(2).build();
//! let camera = pipeline.add_component("camera", Passive);
//! let detector = pipeline.add_component("detector", Passive);
//!
//! let frames = pipeline.create_emitter::<u64>(camera, "frames")?;
//! let input = pipeline.create_receiver(
//!     detector,
//!     "frames",
//!     DeliveryPolicy::LatestMessage,
//!     |frame: u64, envelope| {
//!         println!("frame {frame} seq {}", envelope.sequence_id);
//!         Ok(())
//!     },
//! )?;
//! pipeline.connect(&frames, &input)?;
//!
//! pipeline.run_async()?;
//! frames.post(1, pipeline.now())?;
//! pipeline.stop();
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use buffer::{Buffer, BufferPool, SharedBuffer};
pub use config::PipelineConfig;
pub use error::{Result, SensorFlowError};
pub use pipeline::{
    Component, ComponentContext, DeliveryPolicy, Emitter, Envelope, Pipeline, PipelineBuilder,
    PipelineError, Receiver, Time,
};
