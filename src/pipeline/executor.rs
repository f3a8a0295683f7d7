//! Pipeline handle: graph construction, lifecycle and supervision.
//!
//! A `Pipeline` is a cheap, cloneable handle. Building the graph happens
//! through it (`add_component`, `create_emitter`, `create_receiver`,
//! `connect`), and so does running it:
//!
//! 1. `run()` / `run_async()` start the scheduler's workers and queue every
//!    component's `on_start` as a lifecycle work item.
//! 2. A supervisor (the calling thread for `run()`, a dedicated thread for
//!    `run_async()`) waits until a stop is requested, or until every source
//!    has completed and the scheduler has drained.
//! 3. Shutdown closes all receivers, stops the scheduler, then calls
//!    `on_stop` once for every started component.
//!
//! Calling `stop()` from inside a callback only requests the stop; the
//! supervisor performs it once the callback has returned.

use crate::buffer::BufferPool;
use crate::config::{ClockMode, ErrorPolicy, OrderingMode, PipelineConfig};
use crate::pipeline::clock::Clock;
use crate::pipeline::component::{
    Component, ComponentCell, ComponentContext, LifecycleState, MessageHandler, Passive,
};
use crate::pipeline::diagnostics::{SchedulerSnapshot, TopologySnapshot};
use crate::pipeline::emitter::{Emitter, EmitterInner};
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::{CallbackStage, PipelineError, PipelineResult};
use crate::pipeline::events::PipelineEvent;
use crate::pipeline::graph::{
    reset_components, ComponentSlot, EmitterSlot, ErasedEmitter, ErasedReceiver, Graph,
    ReceiverSlot,
};
use crate::pipeline::id::{ComponentId, EdgeId, EmitterId, PipelineId, ReceiverId};
use crate::pipeline::policy::DeliveryPolicy;
use crate::pipeline::port::PayloadType;
use crate::pipeline::receiver::{Receiver, ReceiverInner};
use crate::pipeline::runtime::Runtime;
use crate::pipeline::scheduler::WorkKind;
use crate::pipeline::sync::lock;
use crate::pipeline::time::Time;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// How often an idle supervisor re-checks for completion.
const SUPERVISOR_POLL: Duration = Duration::from_millis(5);

struct PipelineInner {
    runtime: Arc<Runtime>,
    graph: Mutex<Graph>,
    config: PipelineConfig,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_gate: Mutex<()>,
    shutdown_thread: Mutex<Option<ThreadId>>,
}

impl PipelineInner {
    fn shutdown(&self) {
        let me = thread::current().id();
        if *lock(&self.shutdown_thread) == Some(me) {
            // Re-entered from an `on_stop` hook.
            return;
        }
        let _gate = lock(&self.shutdown_gate);
        let rt = &self.runtime;
        if rt.lifecycle() == LifecycleState::Stopped {
            return;
        }
        *lock(&self.shutdown_thread) = Some(me);

        rt.set_lifecycle(LifecycleState::Stopping);
        rt.close_intake();
        rt.request_stop();

        let receivers = lock(&self.graph).receiver_ports();
        for receiver in &receivers {
            receiver.close();
        }
        let discarded = rt.scheduler.stop();

        let components: Vec<_> = lock(&self.graph)
            .components()
            .iter()
            .map(|slot| (Arc::clone(&slot.cell), Arc::clone(&slot.component)))
            .collect();
        for (cell, component) in components {
            if !cell.state().is_active() {
                continue;
            }
            cell.set_state(LifecycleState::Stopping);
            let ctx = ComponentContext::new(Arc::clone(&cell), Arc::clone(rt));
            rt.invoke(&cell, CallbackStage::Stop, None, || {
                lock(&component).on_stop(&ctx)
            });
            cell.set_state(LifecycleState::Stopped);
            rt.events.publish(PipelineEvent::ComponentStopped {
                component: cell.id,
                name: cell.name.clone(),
            });
        }

        rt.set_lifecycle(LifecycleState::Stopped);
        *lock(&self.shutdown_thread) = None;
        tracing::info!(
            "Pipeline '{}' stopped ({} queued items discarded, {} errors)",
            rt.name,
            discarded,
            rt.error_count()
        );
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        if self.runtime.lifecycle() != LifecycleState::Stopped
            && !self.runtime.scheduler.in_callback()
        {
            self.shutdown();
        }
        let components = self
            .graph
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown();
        reset_components(components);
    }
}

/// A dataflow graph and the machinery that runs it.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder::from_config(config).build()
    }

    fn runtime(&self) -> &Arc<Runtime> {
        &self.inner.runtime
    }

    // ── Accessors ──

    pub fn id(&self) -> PipelineId {
        self.runtime().id
    }

    pub fn name(&self) -> &str {
        &self.runtime().name
    }

    pub fn state(&self) -> LifecycleState {
        self.runtime().lifecycle()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.runtime().clock)
    }

    pub fn now(&self) -> Time {
        self.runtime().clock.now()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.runtime().pool
    }

    /// Delivery policy from the configuration, for receivers that do not
    /// need a specific one.
    pub fn default_policy(&self) -> DeliveryPolicy {
        self.inner.config.default_delivery
    }

    /// No queued or executing work.
    pub fn is_idle(&self) -> bool {
        self.runtime().scheduler.is_idle()
    }

    /// Subscribe to lifecycle, failure and isolation events.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<PipelineEvent> {
        self.runtime().events.subscribe()
    }

    /// Runtime errors, oldest first. All clones share one queue.
    pub fn errors(&self) -> crossbeam_channel::Receiver<PipelineError> {
        self.runtime().errors()
    }

    pub fn topology(&self) -> TopologySnapshot {
        let rt = self.runtime();
        let graph = lock(&self.inner.graph);
        TopologySnapshot {
            pipeline: rt.id,
            name: rt.name.clone(),
            state: rt.lifecycle(),
            components: graph.component_snapshots(),
            emitters: graph.emitter_snapshots(),
            receivers: graph.receiver_snapshots(),
            edges: graph.edges().to_vec(),
            scheduler: SchedulerSnapshot {
                configured_workers: rt.scheduler.configured_workers(),
                live_workers: rt.scheduler.worker_count(),
                pending: rt.scheduler.pending(),
                executed: rt.scheduler.executed(),
            },
            errors: rt.error_count(),
        }
    }

    // ── Graph building ──

    /// Add a component. Components added while the pipeline runs are started
    /// immediately.
    pub fn add_component(&self, name: impl Into<String>, component: impl Component) -> ComponentId {
        self.add(name.into(), Box::new(component), false)
    }

    /// Add a component whose `ComponentContext::complete` call signals that
    /// it has nothing more to produce. `run()` returns once every source has
    /// completed and all resulting work has drained.
    pub fn add_source(&self, name: impl Into<String>, component: impl Component) -> ComponentId {
        self.add(name.into(), Box::new(component), true)
    }

    /// Add a component built from its own id, so it can own ports created
    /// on this pipeline. Besides the component, `build` returns whatever
    /// handles the caller wants to keep:
    ///
    /// ```ignore
    /// let (id, frames) = pipeline.add_component_with("camera", |id| {
    ///     let frames = pipeline.create_emitter(id, "frames")?;
    ///     Ok((Camera { frames: frames.clone() }, frames))
    /// })?;
    /// ```
    pub fn add_component_with<C, P, F>(
        &self,
        name: impl Into<String>,
        build: F,
    ) -> PipelineResult<(ComponentId, P)>
    where
        C: Component,
        F: FnOnce(ComponentId) -> PipelineResult<(C, P)>,
    {
        self.add_built(name.into(), false, build)
    }

    /// [`Pipeline::add_component_with`] for sources.
    pub fn add_source_with<C, P, F>(
        &self,
        name: impl Into<String>,
        build: F,
    ) -> PipelineResult<(ComponentId, P)>
    where
        C: Component,
        F: FnOnce(ComponentId) -> PipelineResult<(C, P)>,
    {
        self.add_built(name.into(), true, build)
    }

    fn add_built<C, P, F>(
        &self,
        name: String,
        is_source: bool,
        build: F,
    ) -> PipelineResult<(ComponentId, P)>
    where
        C: Component,
        F: FnOnce(ComponentId) -> PipelineResult<(C, P)>,
    {
        let (cell, slot, active) = self.register(name, Box::new(Passive), is_source);
        // Held until the real component is installed, so a concurrent start
        // waits for it instead of starting the placeholder.
        let mut installed = lock(&slot);
        match build(cell.id) {
            Ok((component, ports)) => {
                *installed = Box::new(component);
                drop(installed);
                if active {
                    self.queue_start(Arc::clone(&cell), slot);
                }
                Ok((cell.id, ports))
            }
            Err(e) => {
                drop(installed);
                // Left in the graph as an inert, finished component.
                self.runtime().source_completed(&cell);
                Err(e)
            }
        }
    }

    fn add(&self, name: String, component: Box<dyn Component>, is_source: bool) -> ComponentId {
        let (cell, component, active) = self.register(name, component, is_source);
        let id = cell.id;
        if active {
            self.queue_start(cell, component);
        }
        id
    }

    /// Returns the new cell and slot, and whether the pipeline was already
    /// started (in which case the caller queues the start itself).
    fn register(
        &self,
        name: String,
        component: Box<dyn Component>,
        is_source: bool,
    ) -> (Arc<ComponentCell>, Arc<Mutex<Box<dyn Component>>>, bool) {
        let rt = self.runtime();
        let (cell, component, active) = {
            let mut graph = lock(&self.inner.graph);
            let id = graph.next_component_id();
            let cell = Arc::new(ComponentCell::new(id, name, is_source));
            let component = Arc::new(Mutex::new(component));
            rt.register_component(Arc::clone(&cell));
            graph.add_component(ComponentSlot {
                cell: Arc::clone(&cell),
                component: Arc::clone(&component),
            });
            (cell, component, rt.lifecycle().is_active())
        };
        tracing::debug!(
            "Pipeline '{}': added {} '{}' ({})",
            rt.name,
            if is_source { "source" } else { "component" },
            cell.name,
            cell.id
        );
        (cell, component, active)
    }

    fn queue_start(&self, cell: Arc<ComponentCell>, component: Arc<Mutex<Box<dyn Component>>>) {
        let rt = self.runtime();
        let ctx = ComponentContext::new(cell, Arc::clone(rt));
        let job = Box::new(move || {
            if !ctx.runtime.is_accepting() {
                return;
            }
            let cell = &ctx.cell;
            cell.set_state(LifecycleState::Started);
            let started = ctx.runtime.invoke(cell, CallbackStage::Start, None, || {
                lock(&component).on_start(&ctx)
            });
            if started {
                cell.set_state(LifecycleState::Running);
                ctx.runtime.events.publish(PipelineEvent::ComponentStarted {
                    component: cell.id,
                    name: cell.name.clone(),
                });
            }
        });
        rt.scheduler
            .schedule(Time::MIN, None, WorkKind::Lifecycle, job);
    }

    fn owner_cell(graph: &Graph, owner: ComponentId) -> PipelineResult<Arc<ComponentCell>> {
        graph.component(owner).map(|slot| Arc::clone(&slot.cell))
    }

    /// Create an emitter that enforces non-decreasing originating times.
    pub fn create_emitter<T: Clone + Send + 'static>(
        &self,
        owner: ComponentId,
        name: impl Into<String>,
    ) -> PipelineResult<Emitter<T>> {
        self.new_emitter(owner, name.into(), true)
    }

    /// Create an emitter that accepts originating times in any order.
    pub fn create_unordered_emitter<T: Clone + Send + 'static>(
        &self,
        owner: ComponentId,
        name: impl Into<String>,
    ) -> PipelineResult<Emitter<T>> {
        self.new_emitter(owner, name.into(), false)
    }

    fn new_emitter<T: Clone + Send + 'static>(
        &self,
        owner: ComponentId,
        name: String,
        ordered: bool,
    ) -> PipelineResult<Emitter<T>> {
        let mut graph = lock(&self.inner.graph);
        let cell = Self::owner_cell(&graph, owner)?;
        let id = graph.next_emitter_id();
        let inner = EmitterInner::<T>::new(id, name, cell, ordered, Arc::clone(self.runtime()));
        let port: Arc<dyn ErasedEmitter> = inner.clone();
        graph.add_emitter(EmitterSlot {
            owner,
            payload: PayloadType::of::<T>(),
            port,
        });
        Ok(Emitter { inner })
    }

    /// Create a receiver whose dispatches are ordered by envelope time.
    pub fn create_receiver<T, F>(
        &self,
        owner: ComponentId,
        name: impl Into<String>,
        policy: DeliveryPolicy,
        handler: F,
    ) -> PipelineResult<Receiver<T>>
    where
        T: Send + 'static,
        F: FnMut(T, &Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        self.new_receiver(owner, name.into(), policy, false, Box::new(handler))
    }

    /// Like `create_receiver`, with a handler type implementing
    /// [`MessageHandler`] directly.
    pub fn create_receiver_with<T, H>(
        &self,
        owner: ComponentId,
        name: impl Into<String>,
        policy: DeliveryPolicy,
        handler: H,
    ) -> PipelineResult<Receiver<T>>
    where
        T: Send + 'static,
        H: MessageHandler<T>,
    {
        self.new_receiver(owner, name.into(), policy, false, Box::new(handler))
    }

    /// Create a receiver whose dispatches are ordered by wall-clock arrival
    /// rather than envelope time.
    pub fn create_arrival_receiver<T, F>(
        &self,
        owner: ComponentId,
        name: impl Into<String>,
        policy: DeliveryPolicy,
        handler: F,
    ) -> PipelineResult<Receiver<T>>
    where
        T: Send + 'static,
        F: FnMut(T, &Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        self.new_receiver(owner, name.into(), policy, true, Box::new(handler))
    }

    fn new_receiver<T: Send + 'static>(
        &self,
        owner: ComponentId,
        name: String,
        policy: DeliveryPolicy,
        arrival_ordered: bool,
        handler: Box<dyn MessageHandler<T>>,
    ) -> PipelineResult<Receiver<T>> {
        let mut graph = lock(&self.inner.graph);
        let cell = Self::owner_cell(&graph, owner)?;
        let id = graph.next_receiver_id();
        let inner = ReceiverInner::new(
            id,
            name,
            cell,
            policy,
            arrival_ordered,
            Arc::clone(self.runtime()),
            handler,
        );
        let port: Arc<dyn ErasedReceiver> = inner.clone();
        let any: Arc<dyn Any + Send + Sync> = inner.clone();
        graph.add_receiver(ReceiverSlot {
            owner,
            payload: PayloadType::of::<T>(),
            port,
            any,
        });
        Ok(Receiver { inner })
    }

    /// Connect two typed ports of this pipeline.
    pub fn connect<T: Clone + Send + 'static>(
        &self,
        emitter: &Emitter<T>,
        receiver: &Receiver<T>,
    ) -> PipelineResult<EdgeId> {
        if emitter.pipeline_id() != self.id() {
            return Err(PipelineError::ForeignPort(format!(
                "emitter '{}' ({})",
                emitter.name(),
                emitter.id()
            )));
        }
        if receiver.pipeline_id() != self.id() {
            return Err(PipelineError::ForeignPort(format!(
                "receiver '{}' ({})",
                receiver.name(),
                receiver.id()
            )));
        }
        self.connect_ports(emitter.id(), receiver.id())
    }

    /// Connect two ports by id. The payload types are checked at runtime.
    pub fn connect_ports(&self, emitter: EmitterId, receiver: ReceiverId) -> PipelineResult<EdgeId> {
        let edge = lock(&self.inner.graph).connect(emitter, receiver)?;
        self.runtime()
            .register_edge(edge.from_component, edge.to_component);
        tracing::debug!(
            "Pipeline '{}': connected {} ({}) -> {} ({})",
            self.name(),
            emitter,
            edge.from_component,
            receiver,
            edge.to_component
        );
        Ok(edge.id)
    }

    // ── Lifecycle ──

    fn start(&self) -> PipelineResult<()> {
        let rt = self.runtime();
        let components: Vec<_> = {
            let graph = lock(&self.inner.graph);
            rt.transition(LifecycleState::Created, LifecycleState::Started)?;
            graph
                .components()
                .iter()
                .map(|slot| (Arc::clone(&slot.cell), Arc::clone(&slot.component)))
                .collect()
        };

        if let Err(e) = rt.scheduler.start() {
            self.inner.shutdown();
            return Err(PipelineError::WorkerSpawn(e));
        }
        for (cell, component) in components {
            self.queue_start(cell, component);
        }
        rt.set_lifecycle(LifecycleState::Running);
        Ok(())
    }

    /// Run until a stop is requested, or until every source has completed
    /// and the resulting work has drained. Stops the pipeline before
    /// returning.
    pub fn run(&self) -> PipelineResult<()> {
        self.start()?;
        self.supervise();
        Ok(())
    }

    /// Start the pipeline and return once it is running. A background
    /// supervisor stops it under the same conditions as [`Pipeline::run`].
    pub fn run_async(&self) -> PipelineResult<()> {
        self.start()?;
        let pipeline = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-supervisor", self.name()))
            .spawn(move || pipeline.supervise());
        match spawned {
            Ok(handle) => {
                *lock(&self.inner.supervisor) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.shutdown();
                Err(PipelineError::WorkerSpawn(e))
            }
        }
    }

    fn supervise(&self) {
        let rt = self.runtime();
        loop {
            if rt.stop_requested() {
                break;
            }
            let (has_sources, all_complete) = rt.source_progress();
            if has_sources && all_complete && rt.scheduler.is_idle() {
                tracing::info!(
                    "Pipeline '{}': all sources completed and work drained",
                    rt.name
                );
                break;
            }
            rt.park(SUPERVISOR_POLL);
        }
        self.inner.shutdown();
    }

    /// Stop the pipeline. Idempotent.
    ///
    /// From inside a handler or timer, whether on a worker or delivered
    /// inline on the posting thread, this only requests the stop and returns
    /// immediately.
    pub fn stop(&self) {
        let rt = self.runtime();
        if rt.scheduler.in_callback() {
            rt.request_stop();
            return;
        }
        self.inner.shutdown();
        self.join_supervisor();
    }

    /// Block until the pipeline has stopped, or `timeout` passes.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.runtime().wait_stopped(timeout)
    }

    fn join_supervisor(&self) {
        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("Pipeline '{}': supervisor panicked", self.name());
            }
        }
    }

    /// Stop the pipeline and release everything the graph holds: pending
    /// messages and their pooled payloads, handlers, components and fan-out
    /// lists. Ports remain valid handles but no longer deliver anything.
    pub fn dispose(&self) {
        if self.runtime().scheduler.in_callback() {
            self.runtime().request_stop();
            return;
        }
        self.stop();
        let components = lock(&self.inner.graph).teardown();
        reset_components(components);
        tracing::debug!("Pipeline '{}' disposed", self.name());
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        PipelineBuilder::new().build()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<Clock>>,
    pool: Option<BufferPool>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.worker_threads = workers;
        self
    }

    pub fn ordering(mut self, ordering: OrderingMode) -> Self {
        self.config.ordering = ordering;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    pub fn clock_mode(mut self, mode: ClockMode) -> Self {
        self.config.clock = mode;
        self
    }

    /// Share an existing clock, e.g. between pipelines bridged by a
    /// `Connector`. Overrides the configured clock mode.
    pub fn clock(mut self, clock: Arc<Clock>) -> Self {
        self.config.clock = clock.mode();
        self.clock = Some(clock);
        self
    }

    /// Use a dedicated pool instead of the process-wide one.
    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn default_delivery(mut self, policy: DeliveryPolicy) -> Self {
        self.config.default_delivery = policy;
        self
    }

    pub fn build(self) -> Pipeline {
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(Clock::new(config.clock)));
        let pool = self.pool.unwrap_or_else(|| BufferPool::global().clone());
        let scheduler =
            crate::pipeline::scheduler::Scheduler::new(config.name.clone(), config.worker_threads);
        let runtime = Arc::new(Runtime::new(
            config.name.clone(),
            clock,
            scheduler,
            pool,
            config.ordering,
            config.error_policy,
        ));
        tracing::debug!(
            "Pipeline '{}' built: {} workers, {:?} clock, {:?} ordering, {:?}",
            config.name,
            config.worker_threads.max(1),
            config.clock,
            config.ordering,
            config.error_policy
        );
        Pipeline {
            inner: Arc::new(PipelineInner {
                runtime,
                graph: Mutex::new(Graph::default()),
                config,
                supervisor: Mutex::new(None),
                shutdown_gate: Mutex::new(()),
                shutdown_thread: Mutex::new(None),
            }),
        }
    }
}
