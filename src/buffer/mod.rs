//! Pooled payload buffers.
//!
//! Large payloads (frames, audio blocks) travel through the graph as
//! [`Shared<Buffer>`] handles: fan-out clones the handle rather than the
//! bytes, and the block returns to its [`BufferPool`] once the last consumer
//! is done with it.

pub mod pool;
pub mod shared;

pub use pool::{Buffer, BufferPool, PoolStats, SizeClass, MIN_BLOCK_SIZE};
pub use shared::{Recycler, Shared};

/// Handle type carried by messages with pooled byte payloads.
pub type SharedBuffer = Shared<Buffer>;
