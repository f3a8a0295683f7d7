//! Typed inbound port.
//!
//! A receiver buffers incoming messages according to its
//! [`DeliveryPolicy`] and keeps at most one dispatch outstanding in the
//! scheduler. The dispatch pops the next message, runs the handler on a
//! worker, and schedules the following dispatch if anything is left, so a
//! receiver's handler never runs concurrently with itself and messages are
//! handed out in policy order.
//!
//! Lock order is emitter sequencer, receiver queue, then scheduler. Producers
//! park only in [`ReceiverInner::reserve`], before taking an emitter lock.

use crate::pipeline::component::{callback_error, ComponentCell, MessageHandler};
use crate::pipeline::envelope::{Envelope, Message};
use crate::pipeline::error::{CallbackStage, PipelineError, PipelineResult};
use crate::pipeline::graph::ErasedReceiver;
use crate::pipeline::id::{ComponentId, PipelineId, ReceiverId};
use crate::pipeline::policy::{DeliveryPolicy, ThrottleMode};
use crate::pipeline::port::{PayloadType, PortDescriptor};
use crate::pipeline::runtime::{guarded, Runtime};
use crate::pipeline::scheduler::{block_in_place, InlineGuard, WorkKind};
use crate::pipeline::sync::{lock, wait};
use crate::config::OrderingMode;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// Nesting limit for synchronous delivery; deeper posts are queued instead.
pub const MAX_SYNC_DEPTH: usize = 16;

thread_local! {
    static SYNC_DEPTH: Cell<usize> = const { Cell::new(0) };
    /// Receivers whose handler is running on this thread, innermost last.
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Receiver counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReceiverStats {
    /// Messages handed to the receiver by emitters.
    pub received: u64,
    /// Messages whose handler has run.
    pub dispatched: u64,
    /// Messages discarded by the policy, isolation or shutdown.
    pub dropped: u64,
    /// Messages waiting for dispatch.
    pub pending: usize,
}

struct QueueState<T> {
    pending: VecDeque<Message<T>>,
    /// A dispatch for this receiver sits in the scheduler heap.
    scheduled: bool,
    /// A handler call is running.
    in_flight: bool,
    /// Places held by producers that have not stamped their message yet.
    reserved: usize,
    closed: bool,
}

/// A place in a bounded receiver, held between [`ReceiverInner::reserve`]
/// and [`ReceiverInner::deliver`]. Dropped unused, it frees the place.
pub(crate) struct Reservation<'a, T> {
    receiver: &'a ReceiverInner<T>,
    held: bool,
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.held {
            lock(&self.receiver.queue).reserved -= 1;
            self.receiver.slot_freed.notify_all();
        }
    }
}

/// A message to be handled on the posting thread.
pub(crate) struct InlineDelivery<T> {
    message: Message<T>,
    _in_flight: InlineGuard,
}

pub(crate) struct ReceiverInner<T> {
    id: ReceiverId,
    name: String,
    owner: Arc<ComponentCell>,
    policy: DeliveryPolicy,
    arrival_ordered: bool,
    runtime: Arc<Runtime>,
    queue: Mutex<QueueState<T>>,
    slot_freed: Condvar,
    handler: Mutex<Box<dyn MessageHandler<T>>>,
    received: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    this: Weak<ReceiverInner<T>>,
}

impl<T: Send + 'static> ReceiverInner<T> {
    pub(crate) fn new(
        id: ReceiverId,
        name: String,
        owner: Arc<ComponentCell>,
        policy: DeliveryPolicy,
        arrival_ordered: bool,
        runtime: Arc<Runtime>,
        handler: Box<dyn MessageHandler<T>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            name,
            owner,
            policy,
            arrival_ordered,
            runtime,
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                scheduled: false,
                in_flight: false,
                reserved: 0,
                closed: false,
            }),
            slot_freed: Condvar::new(),
            handler: Mutex::new(handler),
            received: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    fn stopped(&self, envelope: Envelope) -> PipelineError {
        PipelineError::PipelineStopped {
            component: self.owner.id,
            envelope: Some(envelope),
        }
    }

    fn is_dispatching_here(&self) -> bool {
        let key = self as *const Self as usize;
        DISPATCHING.with(|stack| stack.borrow().contains(&key))
    }

    /// Messages waiting, being processed or reserved for. A handler posting
    /// back into its own receiver does not count its own in-flight message.
    fn occupancy(&self, queue: &QueueState<T>) -> usize {
        let in_flight = queue.in_flight && !self.is_dispatching_here();
        queue.pending.len() + usize::from(in_flight) + queue.reserved
    }

    fn count_dropped(&self, n: usize) {
        if n > 0 {
            self.dropped.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Wait until a bounded, blocking policy has room for one more message
    /// and hold that place for the caller.
    ///
    /// Returns `None` for policies that never park a producer, and when the
    /// receiver is closed or isolated; [`deliver`](Self::deliver) then
    /// reports or discards the message itself.
    pub(crate) fn reserve(&self) -> Option<Reservation<'_, T>> {
        if !self.policy.may_block() || self.owner.is_isolated() {
            return None;
        }
        let capacity = self.policy.capacity().unwrap_or(usize::MAX);
        let mut queue = lock(&self.queue);
        if self.is_dispatching_here() {
            // The slot would only be freed by this thread's own handler:
            // queue past the bound instead of waiting.
            if self.occupancy(&queue) >= capacity {
                tracing::trace!(
                    "Receiver '{}' over capacity from its own handler ({} waiting)",
                    self.name,
                    queue.pending.len()
                );
            }
        } else {
            while !queue.closed && self.occupancy(&queue) >= capacity {
                queue = block_in_place(|| wait(&self.slot_freed, queue));
            }
        }
        if queue.closed {
            return None;
        }
        queue.reserved += 1;
        Some(Reservation {
            receiver: self,
            held: true,
        })
    }

    /// Accept a stamped message, applying the delivery policy. Never parks:
    /// blocking policies wait in [`reserve`](Self::reserve) beforehand.
    ///
    /// Returns the message back when it is to be handled on the posting
    /// thread; the caller passes it to [`run_inline`](Self::run_inline).
    pub(crate) fn deliver(
        &self,
        message: Message<T>,
        reservation: Option<Reservation<'_, T>>,
    ) -> PipelineResult<Option<InlineDelivery<T>>> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let mut queue = lock(&self.queue);
        let reserved = match reservation {
            Some(mut reservation) => {
                reservation.held = false;
                queue.reserved -= 1;
                true
            }
            None => false,
        };
        if self.owner.is_isolated() {
            drop(queue);
            if reserved {
                self.slot_freed.notify_all();
            }
            self.count_dropped(1);
            return Ok(None);
        }
        if queue.closed {
            return Err(self.stopped(message.envelope));
        }

        let mut displaced = VecDeque::new();
        match self.policy {
            DeliveryPolicy::Unlimited => {}
            DeliveryPolicy::LatestMessage => {
                displaced = std::mem::take(&mut queue.pending);
                self.count_dropped(displaced.len());
            }
            DeliveryPolicy::Throttle {
                when_full: ThrottleMode::DropNewest,
                ..
            } => {
                let capacity = self.policy.capacity().unwrap_or(usize::MAX);
                if self.occupancy(&queue) >= capacity {
                    self.count_dropped(1);
                    tracing::trace!(
                        "Receiver '{}' full, dropping seq {}",
                        self.name,
                        message.envelope.sequence_id
                    );
                    return Ok(None);
                }
            }
            DeliveryPolicy::SynchronousOrThrottle { .. } if self.can_deliver_inline(&queue) => {
                queue.in_flight = true;
                return Ok(Some(InlineDelivery {
                    message,
                    _in_flight: self.runtime.scheduler.enter_inline(),
                }));
            }
            DeliveryPolicy::Throttle { .. } | DeliveryPolicy::SynchronousOrThrottle { .. } => {}
        }

        queue.pending.push_back(message);
        self.schedule_next(&mut queue);
        drop(queue);
        // Replaced messages (and any pooled handles they carry) go here,
        // outside the lock.
        drop(displaced);
        Ok(None)
    }

    fn can_deliver_inline(&self, queue: &QueueState<T>) -> bool {
        !queue.in_flight
            && !queue.scheduled
            && queue.pending.is_empty()
            && SYNC_DEPTH.with(Cell::get) < MAX_SYNC_DEPTH
            && self.runtime.scheduler.is_running()
    }

    /// Handle a message claimed by [`deliver`](Self::deliver) on the calling
    /// thread. The scheduler counts it as in flight until it returns.
    pub(crate) fn run_inline(&self, delivery: InlineDelivery<T>) {
        let InlineDelivery {
            message,
            _in_flight: in_flight,
        } = delivery;
        SYNC_DEPTH.with(|depth| depth.set(depth.get() + 1));
        self.process(message);
        SYNC_DEPTH.with(|depth| depth.set(depth.get() - 1));
        self.finish();
        drop(in_flight);
    }

    fn dispatch_key(&self, envelope: &Envelope) -> crate::pipeline::time::Time {
        if self.arrival_ordered {
            return self.runtime.clock.now();
        }
        match self.runtime.ordering {
            OrderingMode::OriginatingTime => envelope.originating_time,
            OrderingMode::CreationTime => envelope.creation_time,
        }
    }

    /// Put one dispatch in the heap if none is outstanding and work is waiting.
    fn schedule_next(&self, queue: &mut QueueState<T>) {
        if queue.scheduled || queue.in_flight || queue.closed {
            return;
        }
        let Some(front) = queue.pending.front() else {
            return;
        };
        let key = self.dispatch_key(&front.envelope);
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let accepted = self.runtime.scheduler.schedule(
            key,
            None,
            WorkKind::Dispatch,
            Box::new(move || this.dispatch()),
        );
        queue.scheduled = accepted;
    }

    /// Scheduler entry point: handle the next pending message.
    fn dispatch(&self) {
        let message = {
            let mut queue = lock(&self.queue);
            queue.scheduled = false;
            if queue.closed || queue.in_flight {
                return;
            }
            match queue.pending.pop_front() {
                Some(message) => {
                    queue.in_flight = true;
                    message
                }
                None => return,
            }
        };
        self.process(message);
        self.finish();
    }

    fn process(&self, message: Message<T>) {
        if self.owner.is_isolated() {
            self.count_dropped(1);
            return;
        }
        let (data, envelope) = message.into_parts();

        let key = self as *const Self as usize;
        DISPATCHING.with(|stack| stack.borrow_mut().push(key));
        let outcome = guarded(|| lock(&self.handler).on_message(data, &envelope));
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Err(source) = outcome {
            let stage = CallbackStage::Message {
                receiver: self.name.clone(),
            };
            self.runtime
                .report(callback_error(&self.owner, stage, Some(envelope), source));
        }
    }

    fn finish(&self) {
        let mut queue = lock(&self.queue);
        queue.in_flight = false;
        self.slot_freed.notify_all();
        self.schedule_next(&mut queue);
    }

    pub(crate) fn pipeline_id(&self) -> PipelineId {
        self.runtime.id
    }
}

impl<T: Send + 'static> ErasedReceiver for ReceiverInner<T> {
    fn descriptor(&self) -> PortDescriptor {
        PortDescriptor::input(
            self.name.clone(),
            self.owner.id,
            PayloadType::of::<T>(),
            self.policy,
            !self.arrival_ordered,
        )
    }

    fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: lock(&self.queue).pending.len(),
        }
    }

    fn close(&self) {
        let drained = {
            let mut queue = lock(&self.queue);
            queue.closed = true;
            queue.scheduled = false;
            std::mem::take(&mut queue.pending)
        };
        self.slot_freed.notify_all();
        self.count_dropped(drained.len());
    }

    fn clear_handler(&self) {
        let discard: Box<dyn MessageHandler<T>> = Box::new(|_: T, _: &Envelope| Ok(()));
        let previous = std::mem::replace(&mut *lock(&self.handler), discard);
        drop(previous);
    }
}

/// Handle to a receiver. Cheap to clone.
pub struct Receiver<T> {
    pub(crate) inner: Arc<ReceiverInner<T>>,
}

impl<T: Send + 'static> Receiver<T> {
    pub fn id(&self) -> ReceiverId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner(&self) -> ComponentId {
        self.inner.owner.id
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.inner.policy
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.inner.pipeline_id()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.inner.stats()
    }

    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).pending.len()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner.id)
            .field("policy", &self.inner.policy)
            .finish()
    }
}
