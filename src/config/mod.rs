//! Configuration module for sensorflow-rs
//!
//! A pipeline is configured by a [`PipelineConfig`], usually loaded from a
//! TOML file:
//!
//! ```toml
//! name = "camera-rig"
//! worker_threads = 4
//! ordering = "originating_time"
//! error_policy = "isolate_subgraph"
//!
//! [clock]
//! mode = "replay"
//! speed = { multiplier = 4.0 }
//!
//! [default_delivery]
//! policy = "throttle"
//! max_queue_depth = 8
//! when_full = "drop_newest"
//!
//! [logging]
//! filter = "info,sensorflow_rs=debug"
//! directory = "logs"
//! ```
//!
//! Every field is optional; missing ones take the [`Default`] values.
//!
//! # Example
//!
//! ```ignore
//! use sensorflow_rs::config::PipelineConfig;
//! use sensorflow_rs::pipeline::Pipeline;
//!
//! let config = PipelineConfig::load("pipeline.toml")?;
//! let pipeline = Pipeline::new(config);
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, SensorFlowError};
use crate::pipeline::policy::DeliveryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default pipeline name
pub const DEFAULT_PIPELINE_NAME: &str = "pipeline";

/// Worker count used when the platform cannot report its parallelism
pub const FALLBACK_WORKER_THREADS: usize = 4;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "info,sensorflow_rs=debug";

/// Default worker count: one per available core.
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_THREADS)
}

/// Logging settings for applications embedding the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub filter: Option<String>,
    /// Directory for a daily rolling log file. Console only when unset.
    pub directory: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn filter_or_default(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name used in logs and worker thread names
    pub name: String,
    /// Scheduler pool size (1 = deterministic execution)
    pub worker_threads: usize,
    /// Envelope timestamp keying the scheduler heap
    pub ordering: OrderingMode,
    /// Reaction to component failures
    pub error_policy: ErrorPolicy,
    /// Live or replay clock
    pub clock: ClockMode,
    /// Delivery policy offered to receivers that do not choose one
    pub default_delivery: DeliveryPolicy,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_string(),
            worker_threads: default_worker_threads(),
            ordering: OrderingMode::default(),
            error_policy: ErrorPolicy::default(),
            clock: ClockMode::default(),
            default_delivery: DeliveryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Single worker, as-fast-as-possible replay: reproduces a recorded log
    /// in the same order on every run.
    pub fn deterministic() -> Self {
        Self {
            worker_threads: 1,
            clock: ClockMode::Replay {
                speed: ReplaySpeed::AsFastAsPossible,
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SensorFlowError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            e.with_context(format!("Failed to parse config file {:?}", path))
        })
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SensorFlowError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| {
            SensorFlowError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(SensorFlowError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if let ClockMode::Replay {
            speed: ReplaySpeed::Multiplier(m),
        } = self.clock
        {
            if !(MIN_REPLAY_MULTIPLIER..=MAX_REPLAY_MULTIPLIER).contains(&m) {
                return Err(SensorFlowError::Config(format!(
                    "replay multiplier {} outside [{}, {}]",
                    m, MIN_REPLAY_MULTIPLIER, MAX_REPLAY_MULTIPLIER
                )));
            }
        }
        Ok(())
    }
}
