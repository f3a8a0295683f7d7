//! Time-ordered work scheduler.
//!
//! All work in a pipeline (receiver dispatches, timer callbacks, component
//! start-up) is pushed onto one min-heap keyed by `(time, insertion seq)` and
//! drained by a fixed pool of worker threads. With one worker the drain order
//! is fully deterministic. An item may carry a wall-clock release instant;
//! workers leave it at the top of the heap until that instant passes.
//!
//! A worker that has to park inside a job (a producer blocked on a full
//! `Throttle` receiver) calls [`block_in_place`], which spawns a compensating
//! worker so the number of threads draining the heap stays at the configured
//! size. Surplus workers retire once the blocked ones resume.

use crate::pipeline::sync::{lock, wait, wait_timeout};
use crate::pipeline::time::Time;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a queued work item does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Dispatch,
    Timer,
    Lifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Accepting work, not draining it yet.
    Paused,
    Running,
    /// Stopped; new work is refused.
    Closed,
}

struct WorkItem {
    key: Time,
    seq: u64,
    release: Option<Instant>,
    kind: WorkKind,
    job: Job,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest item.
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<WorkItem>,
    next_seq: u64,
    status: SchedulerStatus,
    /// Items currently executing.
    running: usize,
    /// Handlers running on a posting thread, outside the heap.
    inline: usize,
    /// Workers parked in `block_in_place`.
    blocked: usize,
    /// Worker threads alive (including blocked ones).
    live: usize,
    spawned: usize,
}

struct Shared {
    name: String,
    target: usize,
    state: Mutex<State>,
    work_ready: Condvar,
    drained: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
    executed: AtomicU64,
}

thread_local! {
    static CURRENT: RefCell<Option<Weak<Shared>>> = const { RefCell::new(None) };
    /// Schedulers whose inline work is running on this thread, innermost last.
    static INLINE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a handler running on a non-scheduler path as in flight until dropped.
pub(crate) struct InlineGuard {
    shared: Arc<Shared>,
}

impl Drop for InlineGuard {
    fn drop(&mut self) {
        let key = Arc::as_ptr(&self.shared) as usize;
        INLINE.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(at) = stack.iter().rposition(|k| *k == key) {
                stack.remove(at);
            }
        });
        let mut state = lock(&self.shared.state);
        state.inline -= 1;
        if state.inline == 0 || state.status == SchedulerStatus::Closed {
            self.shared.drained.notify_all();
        }
    }
}

/// Heap plus worker pool. Cheap to clone; clones share the same heap.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                target: workers.max(1),
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    status: SchedulerStatus::Paused,
                    running: 0,
                    inline: 0,
                    blocked: 0,
                    live: 0,
                    spawned: 0,
                }),
                work_ready: Condvar::new(),
                drained: Condvar::new(),
                handles: Mutex::new(Vec::new()),
                executed: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the worker pool and begin draining the heap.
    pub fn start(&self) -> std::io::Result<()> {
        self.start_with(spawn_worker)
    }

    fn start_with(
        &self,
        mut spawn: impl FnMut(&Arc<Shared>) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let count = {
            let mut state = lock(&self.shared.state);
            if state.status != SchedulerStatus::Paused {
                return Ok(());
            }
            state.status = SchedulerStatus::Running;
            state.live += self.shared.target;
            self.shared.target
        };
        for spawned in 0..count {
            if let Err(e) = spawn(&self.shared) {
                // Workers already running account for themselves.
                lock(&self.shared.state).live -= count - spawned;
                return Err(e);
            }
        }
        tracing::debug!(
            "Scheduler '{}' started with {} workers",
            self.shared.name,
            count
        );
        Ok(())
    }

    /// Queue `job` at `key`. Returns `false` if the scheduler is closed.
    pub(crate) fn schedule(
        &self,
        key: Time,
        release: Option<Instant>,
        kind: WorkKind,
        job: Job,
    ) -> bool {
        let mut state = lock(&self.shared.state);
        if state.status == SchedulerStatus::Closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(WorkItem {
            key,
            seq,
            release,
            kind,
            job,
        });
        self.shared.work_ready.notify_one();
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.shared.state).status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SchedulerStatus::Running
    }

    /// No queued items and nothing executing, on a worker or inline.
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.shared.state);
        state.heap.is_empty() && state.running == 0 && state.inline == 0
    }

    /// Number of queued items.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).heap.len()
    }

    /// Live worker threads, including compensating ones.
    pub fn worker_count(&self) -> usize {
        lock(&self.shared.state).live
    }

    pub fn configured_workers(&self) -> usize {
        self.shared.target
    }

    /// Total items executed since start.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(AtomicOrdering::Relaxed)
    }

    /// Whether the calling thread is one of this scheduler's workers.
    pub fn is_current_worker(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.shared)))
        })
    }

    /// Whether the calling thread is running inline work for this scheduler.
    fn inline_depth_here(&self) -> usize {
        let key = Arc::as_ptr(&self.shared) as usize;
        INLINE.with(|stack| stack.borrow().iter().filter(|k| **k == key).count())
    }

    /// Whether the calling thread is inside work this scheduler is
    /// responsible for: a worker, or a handler delivered inline.
    pub fn in_callback(&self) -> bool {
        self.is_current_worker() || self.inline_depth_here() > 0
    }

    /// Count a handler that runs on the posting thread as in flight until
    /// the returned guard drops.
    pub(crate) fn enter_inline(&self) -> InlineGuard {
        lock(&self.shared.state).inline += 1;
        let key = Arc::as_ptr(&self.shared) as usize;
        INLINE.with(|stack| stack.borrow_mut().push(key));
        InlineGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the heap, discard queued work, wait for in-flight items (worker
    /// and inline) and join the workers. Returns the number of discarded
    /// items.
    ///
    /// Work the calling thread itself is running (its current worker item,
    /// inline handlers further up its stack) is not waited for, and its own
    /// thread is not joined.
    pub fn stop(&self) -> usize {
        let discarded = {
            let mut state = lock(&self.shared.state);
            if state.status == SchedulerStatus::Closed {
                return 0;
            }
            state.status = SchedulerStatus::Closed;
            std::mem::take(&mut state.heap)
        };
        self.shared.work_ready.notify_all();
        let count = discarded.len();
        // Dropping queued jobs releases whatever they captured.
        drop(discarded);

        let own = usize::from(self.is_current_worker()) + self.inline_depth_here();
        {
            let mut state = lock(&self.shared.state);
            while state.running + state.inline > own {
                state = wait(&self.shared.drained, state);
            }
        }

        let me = thread::current().id();
        let handles = std::mem::take(&mut *lock(&self.shared.handles));
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("Scheduler '{}': worker exited by panic", self.shared.name);
            }
        }

        tracing::debug!(
            "Scheduler '{}' stopped ({} queued items discarded)",
            self.shared.name,
            count
        );
        count
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("status", &state.status)
            .field("pending", &state.heap.len())
            .field("running", &state.running)
            .field("inline", &state.inline)
            .field("live", &state.live)
            .finish()
    }
}

/// Run `f`, which may park the calling thread, without starving the pool.
///
/// On a scheduler worker, a compensating worker is spawned for the duration
/// of `f` if the active pool would otherwise drop below its configured size.
/// On any other thread `f` simply runs.
pub(crate) fn block_in_place<R>(f: impl FnOnce() -> R) -> R {
    let shared = CURRENT.with(|current| current.borrow().as_ref().and_then(Weak::upgrade));
    let Some(shared) = shared else {
        return f();
    };

    let compensate = {
        let mut state = lock(&shared.state);
        state.blocked += 1;
        let active = state.live - state.blocked;
        if state.status == SchedulerStatus::Running && active < shared.target {
            state.live += 1;
            true
        } else {
            false
        }
    };
    if compensate {
        if let Err(e) = spawn_worker(&shared) {
            tracing::error!(
                "Scheduler '{}': failed to spawn compensating worker: {}",
                shared.name,
                e
            );
            lock(&shared.state).live -= 1;
        }
    }

    let result = f();

    lock(&shared.state).blocked -= 1;
    // Let a surplus worker notice it can retire.
    shared.work_ready.notify_one();
    result
}

fn spawn_worker(shared: &Arc<Shared>) -> std::io::Result<()> {
    let index = {
        let mut state = lock(&shared.state);
        state.spawned += 1;
        state.spawned
    };
    let worker = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("{}-worker-{}", shared.name, index))
        .spawn(move || worker_loop(worker))?;
    let mut handles = lock(&shared.handles);
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
    Ok(())
}

fn worker_loop(shared: Arc<Shared>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(Arc::downgrade(&shared)));

    loop {
        let item = {
            let mut state = lock(&shared.state);
            loop {
                if state.status == SchedulerStatus::Closed {
                    state.live -= 1;
                    return;
                }
                if state.live - state.blocked > shared.target {
                    state.live -= 1;
                    tracing::trace!("Scheduler '{}': surplus worker retiring", shared.name);
                    return;
                }
                if state.status == SchedulerStatus::Paused {
                    state = wait(&shared.work_ready, state);
                    continue;
                }

                let now = Instant::now();
                let next_release = match state.heap.peek() {
                    None => {
                        state = wait(&shared.work_ready, state);
                        continue;
                    }
                    Some(item) => item.release.filter(|at| *at > now),
                };
                if let Some(at) = next_release {
                    state = wait_timeout(&shared.work_ready, state, at - now);
                    continue;
                }
                if let Some(item) = state.heap.pop() {
                    state.running += 1;
                    break item;
                }
            }
        };

        let kind = item.kind;
        let key = item.key;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item.job)) {
            tracing::error!(
                "Scheduler '{}': {:?} item at {} panicked: {}",
                shared.name,
                kind,
                key,
                crate::pipeline::component::panic_message(&*payload)
            );
        }
        shared.executed.fetch_add(1, AtomicOrdering::Relaxed);

        let mut state = lock(&shared.state);
        state.running -= 1;
        if state.running == 0 || state.status == SchedulerStatus::Closed {
            shared.drained.notify_all();
        }
    }
}
