//! State shared between a pipeline handle and its ports.
//!
//! Emitters, receivers and component contexts all hold an `Arc<Runtime>`.
//! It owns the clock and scheduler, the lifecycle flag, the error channel and
//! event bus, and a copy of the component adjacency used to isolate the
//! downstream subgraph of a failing component. It never holds ports itself,
//! so ports can reference it freely.

use crate::buffer::BufferPool;
use crate::config::{ErrorPolicy, OrderingMode};
use crate::pipeline::clock::Clock;
use crate::pipeline::component::{callback_error, panic_message, ComponentCell, LifecycleState};
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::{BoxError, CallbackStage, PipelineError, PipelineResult};
use crate::pipeline::events::{EventBus, PipelineEvent};
use crate::pipeline::id::{ComponentId, PipelineId};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::sync::{lock, wait_timeout};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Errors kept for `Pipeline::errors()` before new ones are dropped.
pub const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Component adjacency, mirrored from the graph on every connect.
#[derive(Debug, Default)]
struct Topology {
    cells: Vec<Arc<ComponentCell>>,
    downstream: Vec<Vec<ComponentId>>,
}

impl Topology {
    /// `start` plus every component reachable from it along edges.
    fn reachable_from(&self, start: ComponentId) -> Vec<ComponentId> {
        let n = self.cells.len();
        if start.index() >= n {
            return Vec::new();
        }
        let mut visited = vec![false; n];
        let mut queue = VecDeque::new();
        let mut order = Vec::new();
        visited[start.index()] = true;
        queue.push_back(start);

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in &self.downstream[id.index()] {
                if next.index() < n && !visited[next.index()] {
                    visited[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }
        order
    }
}

pub(crate) struct Runtime {
    pub(crate) id: PipelineId,
    pub(crate) name: String,
    pub(crate) clock: Arc<Clock>,
    pub(crate) scheduler: Scheduler,
    pub(crate) pool: BufferPool,
    pub(crate) ordering: OrderingMode,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) events: EventBus,
    lifecycle: Mutex<LifecycleState>,
    lifecycle_changed: Condvar,
    accepting: AtomicBool,
    stop_requested: AtomicBool,
    topology: RwLock<Topology>,
    error_tx: Sender<PipelineError>,
    error_rx: Receiver<PipelineError>,
    error_count: AtomicU64,
}

impl Runtime {
    pub(crate) fn new(
        name: String,
        clock: Arc<Clock>,
        scheduler: Scheduler,
        pool: BufferPool,
        ordering: OrderingMode,
        error_policy: ErrorPolicy,
    ) -> Self {
        let (error_tx, error_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        Self {
            id: PipelineId::next(),
            name,
            clock,
            scheduler,
            pool,
            ordering,
            error_policy,
            events: EventBus::new(),
            lifecycle: Mutex::new(LifecycleState::Created),
            lifecycle_changed: Condvar::new(),
            accepting: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            topology: RwLock::new(Topology::default()),
            error_tx,
            error_rx,
            error_count: AtomicU64::new(0),
        }
    }

    // ── Lifecycle ──

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        *lock(&self.lifecycle)
    }

    /// Move from `expected` to `to`, or fail with `InvalidLifecycle`.
    pub(crate) fn transition(
        &self,
        expected: LifecycleState,
        to: LifecycleState,
    ) -> PipelineResult<()> {
        {
            let mut state = lock(&self.lifecycle);
            if *state != expected {
                return Err(PipelineError::InvalidLifecycle {
                    expected,
                    actual: *state,
                });
            }
            *state = to;
        }
        self.lifecycle_moved(expected, to);
        Ok(())
    }

    /// Unconditionally move to `to`. Returns the previous state.
    pub(crate) fn set_lifecycle(&self, to: LifecycleState) -> LifecycleState {
        let from = std::mem::replace(&mut *lock(&self.lifecycle), to);
        if from != to {
            self.lifecycle_moved(from, to);
        }
        from
    }

    fn lifecycle_moved(&self, from: LifecycleState, to: LifecycleState) {
        tracing::info!("Pipeline '{}': {} -> {}", self.name, from, to);
        self.lifecycle_changed.notify_all();
        self.events.publish(PipelineEvent::LifecycleChanged {
            pipeline: self.id,
            from,
            to,
        });
    }

    /// Block until the pipeline is stopped or `timeout` passes.
    pub(crate) fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.lifecycle);
        while *state != LifecycleState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = wait_timeout(&self.lifecycle_changed, state, deadline - now);
        }
        true
    }

    /// Sleep until something wakes the supervisor, or `timeout` passes.
    pub(crate) fn park(&self, timeout: Duration) {
        let state = lock(&self.lifecycle);
        let _state = wait_timeout(&self.lifecycle_changed, state, timeout);
    }

    /// Whether emitters still accept posts.
    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn close_intake(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            tracing::info!("Pipeline '{}': stop requested", self.name);
            // Take the lock so a supervisor between its check and its wait
            // cannot miss the notification.
            let _state = lock(&self.lifecycle);
            self.lifecycle_changed.notify_all();
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    // ── Topology ──

    pub(crate) fn register_component(&self, cell: Arc<ComponentCell>) {
        let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
        topology.cells.push(cell);
        topology.downstream.push(Vec::new());
    }

    pub(crate) fn register_edge(&self, from: ComponentId, to: ComponentId) {
        let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = topology.downstream.get_mut(from.index()) {
            if !next.contains(&to) {
                next.push(to);
            }
        }
    }

    pub(crate) fn cells(&self) -> Vec<Arc<ComponentCell>> {
        self.topology
            .read()
            .map(|t| t.cells.clone())
            .unwrap_or_default()
    }

    /// `(has sources, every source has completed)`.
    pub(crate) fn source_progress(&self) -> (bool, bool) {
        let topology = self.topology.read().unwrap_or_else(PoisonError::into_inner);
        let mut sources = topology.cells.iter().filter(|c| c.is_source).peekable();
        let has_sources = sources.peek().is_some();
        (has_sources, sources.all(|c| c.is_completed()))
    }

    pub(crate) fn source_completed(&self, cell: &ComponentCell) {
        if !cell.is_source || !cell.mark_completed() {
            return;
        }
        tracing::info!("Pipeline '{}': source '{}' completed", self.name, cell.name);
        self.events.publish(PipelineEvent::SourceCompleted {
            component: cell.id,
            name: cell.name.clone(),
        });
        let _state = lock(&self.lifecycle);
        self.lifecycle_changed.notify_all();
    }

    // ── Errors ──

    pub(crate) fn errors(&self) -> Receiver<PipelineError> {
        self.error_rx.clone()
    }

    pub(crate) fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Route a runtime error: log it, publish it, queue it on the error
    /// channel and apply the error policy.
    pub(crate) fn report(&self, error: PipelineError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let component = error.component();
        let live = self.is_accepting();
        if live {
            tracing::error!("Pipeline '{}': {}", self.name, error);
        } else {
            tracing::debug!("Pipeline '{}' (stopping): {}", self.name, error);
        }
        self.events.publish(PipelineEvent::ComponentFailed {
            component,
            message: error.to_string(),
        });
        match self.error_tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    "Pipeline '{}': error channel full, dropping: {}",
                    self.name,
                    dropped
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }

        if !live {
            return;
        }
        match (self.error_policy, component) {
            (ErrorPolicy::IsolateSubgraph, Some(component)) => self.isolate_downstream(component),
            _ => self.request_stop(),
        }
    }

    /// Run a component callback, converting an error or panic into a
    /// reported `ComponentCallback` error. Returns whether it succeeded.
    pub(crate) fn invoke<F>(
        &self,
        cell: &ComponentCell,
        stage: CallbackStage,
        envelope: Option<Envelope>,
        callback: F,
    ) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        match guarded(callback) {
            Ok(()) => true,
            Err(source) => {
                self.report(callback_error(cell, stage, envelope, source));
                false
            }
        }
    }

    fn isolate_downstream(&self, failed: ComponentId) {
        let affected: Vec<Arc<ComponentCell>> = {
            let topology = self.topology.read().unwrap_or_else(PoisonError::into_inner);
            topology
                .reachable_from(failed)
                .into_iter()
                .filter_map(|id| topology.cells.get(id.index()).cloned())
                .collect()
        };
        for cell in affected {
            if !cell.isolate() {
                continue;
            }
            tracing::warn!(
                "Pipeline '{}': isolating component '{}' ({})",
                self.name,
                cell.name,
                cell.id
            );
            self.events.publish(PipelineEvent::ComponentIsolated {
                component: cell.id,
                name: cell.name.clone(),
            });
            // An isolated source will never complete on its own.
            self.source_completed(&cell);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Run `callback`, turning an `Err` or a panic into a boxed error.
pub(crate) fn guarded<F>(callback: F) -> Result<(), BoxError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(payload) => Err(format!("panicked: {}", panic_message(&*payload)).into()),
    }
}
