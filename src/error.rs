//! Crate-level error handling for sensorflow-rs
//!
//! Runtime and graph errors are [`PipelineError`]s. This module wraps them
//! together with the errors of everything around the runtime (configuration
//! files, IO, serialization) into one type for applications.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for sensorflow-rs operations
#[derive(Error, Debug)]
pub enum SensorFlowError {
    /// Errors raised by the dataflow runtime
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed TOML configuration
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SensorFlowError>,
    },
}

impl SensorFlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SensorFlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost pipeline error, looking through context layers.
    pub fn pipeline_error(&self) -> Option<&PipelineError> {
        match self {
            SensorFlowError::Pipeline(e) => Some(e),
            SensorFlowError::WithContext { source, .. } => source.pipeline_error(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SensorFlowError {
    fn from(e: serde_json::Error) -> Self {
        SensorFlowError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for SensorFlowError {
    fn from(e: toml::ser::Error) -> Self {
        SensorFlowError::Serialization(e.to_string())
    }
}

/// Result type alias for sensorflow-rs operations
pub type Result<T> = std::result::Result<T, SensorFlowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SensorFlowError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SensorFlowError::from(e).with_context(f()))
    }
}
