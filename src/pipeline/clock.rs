//! Pipeline clock.
//!
//! In live mode the clock is anchored to the wall clock when it is created and
//! `now()` tracks it directly. In replay mode the clock is driven by the
//! originating times of a persisted log: the first `advance_to_log` call anchors
//! the recorded timeline to the current wall-clock instant, and later times are
//! mapped through the replay multiplier. As-fast-as-possible replay has no
//! anchor at all; `now()` is simply the latest log time and every deadline is
//! immediate.

use crate::config::{ClockMode, ReplaySpeed};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::sync::lock;
use crate::pipeline::time::Time;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Deadlines further out than this are clamped (avoids `Instant` overflow).
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug, Clone, Copy)]
struct Anchor {
    wall: Instant,
    virtual_time: Time,
}

#[derive(Debug, Default)]
struct ClockState {
    anchor: Option<Anchor>,
    last_log_time: Option<Time>,
}

/// Owns the notion of "current pipeline time".
#[derive(Debug)]
pub struct Clock {
    mode: ClockMode,
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        let anchor = match mode {
            ClockMode::Live => Some(Anchor {
                wall: Instant::now(),
                virtual_time: Time::now(),
            }),
            ClockMode::Replay { .. } => None,
        };
        Self {
            mode,
            state: Mutex::new(ClockState {
                anchor,
                last_log_time: None,
            }),
        }
    }

    pub fn live() -> Self {
        Self::new(ClockMode::Live)
    }

    pub fn replay(speed: ReplaySpeed) -> Self {
        Self::new(ClockMode::Replay { speed })
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn is_replay(&self) -> bool {
        self.mode.is_replay()
    }

    fn multiplier(&self) -> Option<f64> {
        match self.mode {
            ClockMode::Live => Some(1.0),
            ClockMode::Replay { speed } => speed.multiplier(),
        }
    }

    /// Current pipeline time.
    pub fn now(&self) -> Time {
        self.to_virtual_time(Instant::now())
    }

    /// Map a wall-clock instant onto the pipeline timeline.
    pub fn to_virtual_time(&self, wall: Instant) -> Time {
        let state = lock(&self.state);
        match (self.multiplier(), state.anchor) {
            (Some(speed), Some(anchor)) => {
                if wall >= anchor.wall {
                    anchor.virtual_time + (wall - anchor.wall).mul_f64(speed)
                } else {
                    anchor.virtual_time - (anchor.wall - wall).mul_f64(speed)
                }
            }
            _ => state.last_log_time.unwrap_or(Time::EPOCH),
        }
    }

    /// Wall-clock instant at which `time` is due, or `None` if it is due now.
    pub fn wall_deadline(&self, time: Time) -> Option<Instant> {
        let state = lock(&self.state);
        Self::deadline(self.multiplier(), state.anchor, time)
    }

    fn deadline(speed: Option<f64>, anchor: Option<Anchor>, time: Time) -> Option<Instant> {
        let speed = speed?;
        let anchor = anchor?;
        let delay = time.duration_since(anchor.virtual_time)?.div_f64(speed);
        Some(
            anchor
                .wall
                .checked_add(delay.min(FAR_FUTURE))
                .unwrap_or(anchor.wall),
        )
    }

    /// Advance the log-driven timeline to `originating_time`.
    ///
    /// Replay sources call this once per record, in record order. Returns the
    /// wall-clock instant the record should be released at.
    pub fn advance_to_log(&self, originating_time: Time) -> PipelineResult<Option<Instant>> {
        let mut state = lock(&self.state);
        if let Some(current) = state.last_log_time {
            if originating_time < current {
                return Err(PipelineError::ClockRegression {
                    requested: originating_time,
                    current,
                });
            }
        }
        state.last_log_time = Some(originating_time);

        if self.is_replay() && state.anchor.is_none() && self.multiplier().is_some() {
            state.anchor = Some(Anchor {
                wall: Instant::now(),
                virtual_time: originating_time,
            });
            tracing::debug!("Replay clock anchored at {}", originating_time);
        }

        Ok(Self::deadline(self.multiplier(), state.anchor, originating_time))
    }

    /// Latest time passed to `advance_to_log`.
    pub fn last_log_time(&self) -> Option<Time> {
        lock(&self.state).last_log_time
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::live()
    }
}
