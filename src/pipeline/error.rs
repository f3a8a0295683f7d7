//! Pipeline-specific error types.

use crate::pipeline::component::LifecycleState;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::id::{ComponentId, EmitterId, ReceiverId};
use crate::pipeline::time::Time;
use std::fmt;
use thiserror::Error;

/// Boxed error produced by component code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Where inside a component a callback failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStage {
    Start,
    Message { receiver: String },
    Timer,
    Stop,
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackStage::Start => write!(f, "on_start"),
            CallbackStage::Message { receiver } => write!(f, "on_message[{receiver}]"),
            CallbackStage::Timer => write!(f, "timer"),
            CallbackStage::Stop => write!(f, "on_stop"),
        }
    }
}

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Clock regression: requested {requested}, clock already at {current}")]
    ClockRegression { requested: Time, current: Time },

    #[error(
        "Originating time regression on emitter '{emitter}' of {component}: {attempted} after {last}"
    )]
    OriginatingTimeOrder {
        component: ComponentId,
        emitter: String,
        attempted: Time,
        last: Time,
        /// Envelope of the last message accepted by the emitter.
        envelope: Option<Envelope>,
    },

    #[error(
        "Type mismatch: {emitter} carries {emitter_type}, {receiver} expects {receiver_type}"
    )]
    TypeMismatch {
        component: ComponentId,
        emitter: EmitterId,
        receiver: ReceiverId,
        emitter_type: &'static str,
        receiver_type: &'static str,
    },

    #[error("{emitter} is already connected to {receiver}")]
    AlreadyConnected {
        component: ComponentId,
        emitter: EmitterId,
        receiver: ReceiverId,
    },

    #[error("Pipeline is stopped; {component} cannot deliver")]
    PipelineStopped {
        component: ComponentId,
        envelope: Option<Envelope>,
    },

    #[error("Component {component} '{name}' failed in {stage}: {source}")]
    ComponentCallback {
        component: ComponentId,
        name: String,
        stage: CallbackStage,
        envelope: Option<Envelope>,
        #[source]
        source: BoxError,
    },

    #[error("Port {0} belongs to a different pipeline")]
    ForeignPort(String),

    #[error("Unknown port: {0}")]
    UnknownPort(String),

    #[error("Invalid lifecycle transition: expected {expected:?}, pipeline is {actual:?}")]
    InvalidLifecycle {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// The component the error is attributed to, if any.
    pub fn component(&self) -> Option<ComponentId> {
        match self {
            PipelineError::OriginatingTimeOrder { component, .. }
            | PipelineError::TypeMismatch { component, .. }
            | PipelineError::AlreadyConnected { component, .. }
            | PipelineError::PipelineStopped { component, .. }
            | PipelineError::ComponentCallback { component, .. } => Some(*component),
            _ => None,
        }
    }

    /// The offending envelope, where one applies.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            PipelineError::OriginatingTimeOrder { envelope, .. }
            | PipelineError::PipelineStopped { envelope, .. }
            | PipelineError::ComponentCallback { envelope, .. } => envelope.as_ref(),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineError::PipelineStopped { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
