//! Replay source: re-posts persisted records on the pipeline timeline.
//!
//! Records are read one at a time. Each one advances the pipeline clock's
//! log timeline to its originating time and is posted from a timer scheduled
//! at that time, so:
//!
//! - with a replay clock the records are released at the recorded pace
//!   (scaled by the replay speed, or immediately when unpaced);
//! - on the scheduler heap each record is ordered against the dispatches it
//!   caused, so a single-worker pipeline replays in exactly the logged order.
//!
//! The source completes once the reader is exhausted.

use super::{Serializer, StoreReader};
use crate::pipeline::component::{Component, ComponentContext};
use crate::pipeline::emitter::Emitter;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::ComponentId;
use crate::pipeline::sync::lock;
use crate::pipeline::time::Time;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Replayer<T> {
    reader: Box<dyn StoreReader>,
    serializer: Box<dyn Serializer<T>>,
    output: Emitter<T>,
    replayed: Arc<AtomicU64>,
}

type SharedReplayer<T> = Arc<Mutex<Replayer<T>>>;

/// Read the next record and schedule its release, or complete the source.
fn schedule_next<T: Clone + Send + 'static>(
    replayer: &SharedReplayer<T>,
    ctx: &ComponentContext,
) -> anyhow::Result<()> {
    let next = lock(replayer).reader.next_record()?;
    let Some((time, bytes)) = next else {
        tracing::info!(
            "Replay '{}' finished after {} records",
            ctx.name(),
            lock(replayer).replayed.load(Ordering::Relaxed)
        );
        ctx.complete();
        return Ok(());
    };

    ctx.clock().advance_to_log(time)?;
    let replayer = Arc::clone(replayer);
    ctx.schedule_at(time, move |ctx| release(&replayer, ctx, time, &bytes))?;
    Ok(())
}

fn release<T: Clone + Send + 'static>(
    replayer: &SharedReplayer<T>,
    ctx: &ComponentContext,
    time: Time,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let (data, output, replayed) = {
        let r = lock(replayer);
        let data = r.serializer.from_bytes(bytes)?;
        (data, r.output.clone(), Arc::clone(&r.replayed))
    };
    output.post(data, time)?;
    replayed.fetch_add(1, Ordering::Relaxed);
    schedule_next(replayer, ctx)
}

struct ReplayComponent<T> {
    replayer: SharedReplayer<T>,
}

impl<T: Clone + Send + 'static> Component for ReplayComponent<T> {
    fn on_start(&mut self, ctx: &ComponentContext) -> anyhow::Result<()> {
        tracing::info!("Replay '{}' starting", ctx.name());
        schedule_next(&self.replayer, ctx)
    }
}

/// Source component replaying a store through an emitter.
pub struct ReplaySource<T> {
    id: ComponentId,
    output: Emitter<T>,
    replayed: Arc<AtomicU64>,
}

impl<T: Clone + Send + 'static> ReplaySource<T> {
    /// Add a replay source to `pipeline`. The output emitter is ordered, so a
    /// store whose records go back in time fails with a clock regression.
    pub fn new<R, S>(
        pipeline: &Pipeline,
        name: impl Into<String>,
        reader: R,
        serializer: S,
    ) -> PipelineResult<Self>
    where
        R: StoreReader + 'static,
        S: Serializer<T> + 'static,
    {
        let replayed = Arc::new(AtomicU64::new(0));
        let (id, output) = pipeline.add_source_with(name, |id| {
            let output = pipeline.create_emitter::<T>(id, "out")?;
            let component = ReplayComponent {
                replayer: Arc::new(Mutex::new(Replayer {
                    reader: Box::new(reader),
                    serializer: Box::new(serializer),
                    output: output.clone(),
                    replayed: Arc::clone(&replayed),
                })),
            };
            Ok((component, output))
        })?;

        Ok(Self {
            id,
            output,
            replayed,
        })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn output(&self) -> &Emitter<T> {
        &self.output
    }

    /// Records posted so far.
    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }
}
