//! Component abstraction for the pipeline.
//!
//! A component is whatever owns emitters and receivers: a camera driver, a
//! detector, a recorder. The runtime only needs two lifecycle hooks from it;
//! message handling is attached per receiver as a [`MessageHandler`], so a
//! component with several inputs registers one handler for each.

use crate::buffer::BufferPool;
use crate::pipeline::clock::Clock;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::{CallbackStage, PipelineError, PipelineResult};
use crate::pipeline::id::ComponentId;
use crate::pipeline::runtime::Runtime;
use crate::pipeline::scheduler::WorkKind;
use crate::pipeline::time::Time;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of a pipeline and of each of its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Started,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    /// Whether the pipeline is past start-up and not yet shutting down.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Started | LifecycleState::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lifecycle hooks of a pipeline component.
///
/// Both hooks default to doing nothing. `on_start` runs on a scheduler worker
/// before any of the component's timers; `on_stop` runs once, on the thread
/// that stops the pipeline, after all workers have drained.
pub trait Component: Send + 'static {
    fn on_start(&mut self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A component with no lifecycle behaviour of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passive;

impl Component for Passive {}

/// Consumer callback attached to a receiver.
pub trait MessageHandler<T>: Send + 'static {
    fn on_message(&mut self, data: T, envelope: &Envelope) -> anyhow::Result<()>;
}

impl<T, F> MessageHandler<T> for F
where
    F: FnMut(T, &Envelope) -> anyhow::Result<()> + Send + 'static,
{
    fn on_message(&mut self, data: T, envelope: &Envelope) -> anyhow::Result<()> {
        self(data, envelope)
    }
}

/// Per-component runtime bookkeeping, shared by its ports.
pub(crate) struct ComponentCell {
    pub(crate) id: ComponentId,
    pub(crate) name: String,
    pub(crate) is_source: bool,
    state: AtomicU8,
    isolated: AtomicBool,
    completed: AtomicBool,
}

impl ComponentCell {
    pub(crate) fn new(id: ComponentId, name: String, is_source: bool) -> Self {
        Self {
            id,
            name,
            is_source,
            state: AtomicU8::new(LifecycleState::Created as u8),
            isolated: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::Acquire)
    }

    /// Returns `true` if the component was not isolated before.
    pub(crate) fn isolate(&self) -> bool {
        !self.isolated.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Returns `true` on the first call.
    pub(crate) fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ComponentCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("isolated", &self.is_isolated())
            .finish()
    }
}

/// Handle passed to component hooks and timer callbacks.
#[derive(Clone)]
pub struct ComponentContext {
    pub(crate) cell: Arc<ComponentCell>,
    pub(crate) runtime: Arc<Runtime>,
}

impl ComponentContext {
    pub(crate) fn new(cell: Arc<ComponentCell>, runtime: Arc<Runtime>) -> Self {
        Self { cell, runtime }
    }

    pub fn id(&self) -> ComponentId {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Current pipeline time.
    pub fn now(&self) -> Time {
        self.runtime.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.runtime.clock
    }

    /// Buffer pool of the owning pipeline.
    pub fn pool(&self) -> &BufferPool {
        &self.runtime.pool
    }

    /// Whether the pipeline is shutting down (or this component is isolated).
    pub fn is_stopping(&self) -> bool {
        !self.runtime.is_accepting() || self.cell.is_isolated()
    }

    /// Run `callback` at pipeline time `time`.
    ///
    /// The callback is ordered against message dispatches by `time` and is
    /// not released before the clock reaches it.
    pub fn schedule_at<F>(&self, time: Time, callback: F) -> PipelineResult<()>
    where
        F: FnOnce(&ComponentContext) -> anyhow::Result<()> + Send + 'static,
    {
        let release = self.runtime.clock.wall_deadline(time);
        let ctx = self.clone();
        let accepted = self.runtime.scheduler.schedule(
            time,
            release,
            WorkKind::Timer,
            Box::new(move || ctx.fire_timer(callback)),
        );
        if accepted {
            Ok(())
        } else {
            Err(PipelineError::PipelineStopped {
                component: self.cell.id,
                envelope: None,
            })
        }
    }

    /// Run `callback` after `delay` of pipeline time.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> PipelineResult<()>
    where
        F: FnOnce(&ComponentContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_at(self.now() + delay, callback)
    }

    fn fire_timer<F>(&self, callback: F)
    where
        F: FnOnce(&ComponentContext) -> anyhow::Result<()>,
    {
        if self.is_stopping() {
            return;
        }
        self.runtime
            .invoke(&self.cell, CallbackStage::Timer, None, || callback(self));
    }

    /// Mark this source as finished producing. Has no effect on components
    /// not added as sources, or when called more than once.
    pub fn complete(&self) {
        self.runtime.source_completed(&self.cell);
    }

    /// Ask the pipeline to stop. Safe to call from any callback.
    pub fn request_stop(&self) {
        self.runtime.request_stop();
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("id", &self.cell.id)
            .field("name", &self.cell.name)
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wraps a callback failure, keeping the envelope that triggered it.
pub(crate) fn callback_error(
    cell: &ComponentCell,
    stage: CallbackStage,
    envelope: Option<Envelope>,
    source: crate::pipeline::error::BoxError,
) -> PipelineError {
    PipelineError::ComponentCallback {
        component: cell.id,
        name: cell.name.clone(),
        stage,
        envelope,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_round_trips_through_u8() {
        for state in [
            LifecycleState::Created,
            LifecycleState::Started,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ] {
            assert_eq!(LifecycleState::from_u8(state as u8), state);
        }
        assert!(LifecycleState::Running.is_active());
        assert!(!LifecycleState::Stopping.is_active());
    }

    #[test]
    fn test_cell_flags_fire_once() {
        let cell = ComponentCell::new(ComponentId(0), "cam".into(), true);
        assert!(cell.mark_completed());
        assert!(!cell.mark_completed());
        assert!(cell.isolate());
        assert!(!cell.isolate());
        assert!(cell.is_isolated());
    }

    #[test]
    fn test_closure_is_a_handler() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut handler = move |v: u32, env: &Envelope| -> anyhow::Result<()> {
            tx.send((v, env.sequence_id))?;
            Ok(())
        };
        let env = Envelope::new(ComponentId(0), 1, Time::EPOCH, Time::EPOCH);
        MessageHandler::on_message(&mut handler, 7, &env).unwrap();
        assert_eq!(rx.try_recv().unwrap(), (7, 1));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("sensor offline")).unwrap_err();
        assert_eq!(panic_message(&*payload), "sensor offline");
        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "code 7");
    }
}
