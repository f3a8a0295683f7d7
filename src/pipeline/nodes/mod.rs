//! Built-in pipeline components.

pub mod connector;
pub mod merge;

pub use connector::Connector;
pub use merge::Merge;
