//! Runtime settings enums shared by the configuration file and the pipeline.
//!
//! # Main Types
//!
//! - [`ClockMode`] - Live (wall clock) or replay (log driven) execution
//! - [`ReplaySpeed`] - Pacing of replay relative to the recorded timeline
//! - [`OrderingMode`] - Which envelope timestamp keys the scheduler heap
//! - [`ErrorPolicy`] - What a component failure does to the rest of the graph

use serde::{Deserialize, Serialize};

/// Lowest accepted replay multiplier.
pub const MIN_REPLAY_MULTIPLIER: f64 = 0.001;

/// Highest accepted replay multiplier.
pub const MAX_REPLAY_MULTIPLIER: f64 = 1_000_000.0;

/// How the pipeline clock derives "now".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClockMode {
    /// `now()` follows the wall clock.
    #[default]
    Live,
    /// `now()` follows originating times read from a persisted log.
    Replay { speed: ReplaySpeed },
}

impl ClockMode {
    pub fn is_replay(&self) -> bool {
        matches!(self, ClockMode::Replay { .. })
    }
}

/// Replay pacing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplaySpeed {
    /// Recorded gaps are reproduced as-is.
    #[default]
    RealTime,
    /// Recorded gaps are divided by the multiplier (2.0 = twice as fast).
    Multiplier(f64),
    /// No pacing; the next record is released as soon as the previous one is.
    AsFastAsPossible,
}

impl ReplaySpeed {
    /// Effective multiplier, or `None` when replay is unpaced.
    pub fn multiplier(&self) -> Option<f64> {
        match self {
            ReplaySpeed::RealTime => Some(1.0),
            ReplaySpeed::Multiplier(m) if m.is_finite() => {
                Some(m.clamp(MIN_REPLAY_MULTIPLIER, MAX_REPLAY_MULTIPLIER))
            }
            ReplaySpeed::Multiplier(_) => Some(1.0),
            ReplaySpeed::AsFastAsPossible => None,
        }
    }
}

/// Which envelope timestamp keys receiver dispatches in the scheduler heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    #[default]
    OriginatingTime,
    CreationTime,
}

/// What happens when a component callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The first unhandled component error stops the whole pipeline.
    #[default]
    FailFast,
    /// The failing component and everything downstream of it stop receiving
    /// messages; the rest of the graph keeps running.
    IsolateSubgraph,
}
