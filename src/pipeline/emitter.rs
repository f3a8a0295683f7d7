//! Typed broadcast point owned by one component.

use crate::pipeline::component::ComponentCell;
use crate::pipeline::envelope::{Envelope, Message};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::ErasedEmitter;
use crate::pipeline::id::{ComponentId, EmitterId, PipelineId};
use crate::pipeline::port::{PayloadType, PortDescriptor};
use crate::pipeline::receiver::{InlineDelivery, ReceiverInner};
use crate::pipeline::runtime::Runtime;
use crate::pipeline::sync::lock;
use crate::pipeline::time::Time;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Sequencer {
    next_seq: u64,
    last: Option<Envelope>,
}

pub(crate) struct EmitterInner<T> {
    id: EmitterId,
    name: String,
    owner: Arc<ComponentCell>,
    ordered: bool,
    runtime: Arc<Runtime>,
    sequencer: Mutex<Sequencer>,
    /// Replaced wholesale on connect so posts can iterate without the lock.
    targets: Mutex<Arc<Vec<Arc<ReceiverInner<T>>>>>,
    posted: AtomicU64,
}

impl<T: Clone + Send + 'static> EmitterInner<T> {
    pub(crate) fn new(
        id: EmitterId,
        name: String,
        owner: Arc<ComponentCell>,
        ordered: bool,
        runtime: Arc<Runtime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            owner,
            ordered,
            runtime,
            sequencer: Mutex::new(Sequencer {
                next_seq: 1,
                last: None,
            }),
            targets: Mutex::new(Arc::new(Vec::new())),
            posted: AtomicU64::new(0),
        })
    }

    fn post(&self, data: T, originating_time: Time) -> PipelineResult<Envelope> {
        if !self.runtime.is_accepting() {
            return Err(PipelineError::PipelineStopped {
                component: self.owner.id,
                envelope: None,
            });
        }

        let targets = if self.owner.is_isolated() {
            Arc::new(Vec::new())
        } else {
            Arc::clone(&*lock(&self.targets))
        };
        // Bounded receivers are waited on before the sequence lock is taken,
        // so a parked producer does not hold up other posts on this emitter.
        let reservations: Vec<_> = targets.iter().map(|target| target.reserve()).collect();

        let mut first_error = None;
        let mut inline = Vec::new();
        let envelope = {
            let mut seq = lock(&self.sequencer);
            if let Some(last) = seq.last.filter(|_| self.ordered) {
                if originating_time < last.originating_time {
                    return Err(PipelineError::OriginatingTimeOrder {
                        component: self.owner.id,
                        emitter: self.name.clone(),
                        attempted: originating_time,
                        last: last.originating_time,
                        envelope: Some(last),
                    });
                }
            }
            let envelope = Envelope::new(
                self.owner.id,
                seq.next_seq,
                originating_time,
                self.runtime.clock.now(),
            );
            seq.next_seq += 1;
            seq.last = Some(envelope);
            self.posted.fetch_add(1, Ordering::Relaxed);

            // Enqueueing under the sequence lock keeps every receiver's queue
            // in sequence order. Every target gets its own logical copy; the
            // last one takes the original so a single-target post never
            // clones.
            let mut reservations = reservations.into_iter();
            let mut record = |target, outcome: PipelineResult<Option<InlineDelivery<T>>>| {
                match outcome {
                    Ok(Some(delivery)) => inline.push((target, delivery)),
                    Ok(None) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            };
            if let Some((last, rest)) = targets.split_last() {
                for target in rest {
                    let reservation = reservations.next().flatten();
                    record(
                        target,
                        target.deliver(Message::new(data.clone(), envelope), reservation),
                    );
                }
                let reservation = reservations.next().flatten();
                record(last, last.deliver(Message::new(data, envelope), reservation));
            }
            envelope
        };

        // Synchronous receivers run after the lock is released so their
        // handlers can post on this emitter again.
        for (target, delivery) in inline {
            target.run_inline(delivery);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(envelope),
        }
    }

    fn add_target(&self, target: Arc<ReceiverInner<T>>) {
        let mut targets = lock(&self.targets);
        let mut next = Vec::with_capacity(targets.len() + 1);
        next.extend(targets.iter().cloned());
        next.push(target);
        *targets = Arc::new(next);
    }
}

impl<T: Clone + Send + 'static> ErasedEmitter for EmitterInner<T> {
    fn descriptor(&self) -> PortDescriptor {
        PortDescriptor::output(
            self.name.clone(),
            self.owner.id,
            PayloadType::of::<T>(),
            self.ordered,
        )
    }

    fn attach(&self, receiver: &Arc<dyn Any + Send + Sync>) -> bool {
        match Arc::clone(receiver).downcast::<ReceiverInner<T>>() {
            Ok(target) => {
                self.add_target(target);
                true
            }
            Err(_) => false,
        }
    }

    fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    fn target_count(&self) -> usize {
        lock(&self.targets).len()
    }

    fn clear_targets(&self) {
        let previous = std::mem::take(&mut *lock(&self.targets));
        drop(previous);
    }
}

/// Handle to an emitter. Cheap to clone; all clones post on the same
/// sequence, and each receiver sees their posts in sequence order.
pub struct Emitter<T> {
    pub(crate) inner: Arc<EmitterInner<T>>,
}

impl<T: Clone + Send + 'static> Emitter<T> {
    /// Broadcast `data` stamped with `originating_time` to every connected
    /// receiver. Returns the envelope the message was sent with.
    ///
    /// Ordered emitters reject an originating time earlier than the previous
    /// post's. After the pipeline starts stopping every post fails with
    /// `PipelineStopped`. If some targets refuse the message the others
    /// still receive it and the first refusal is returned.
    ///
    /// A full `Throttle { when_full: Block }` target parks the caller before
    /// the message is stamped. Posts from different threads are stamped and
    /// enqueued one at a time.
    pub fn post(&self, data: T, originating_time: Time) -> PipelineResult<Envelope> {
        self.inner.post(data, originating_time)
    }

    pub fn id(&self) -> EmitterId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner(&self) -> ComponentId {
        self.inner.owner.id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.inner.runtime.id
    }

    pub fn is_ordered(&self) -> bool {
        self.inner.ordered
    }

    pub fn posted(&self) -> u64 {
        self.inner.posted.load(Ordering::Relaxed)
    }

    pub fn last_envelope(&self) -> Option<Envelope> {
        lock(&self.inner.sequencer).last
    }

    pub fn target_count(&self) -> usize {
        lock(&self.inner.targets).len()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner.id)
            .field("ordered", &self.inner.ordered)
            .finish()
    }
}
