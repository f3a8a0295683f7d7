//! Exporter: persists every message reaching one receiver.
//!
//! Each message is encoded with the configured [`Serializer`] and appended to
//! the [`StoreWriter`] under its originating time. The writer is flushed when
//! the pipeline stops.

use super::{Serializer, StoreWriter};
use crate::pipeline::component::{Component, ComponentContext};
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::ComponentId;
use crate::pipeline::policy::DeliveryPolicy;
use crate::pipeline::receiver::Receiver;
use crate::pipeline::sync::lock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type SharedWriter = Arc<Mutex<Box<dyn StoreWriter>>>;

struct ExporterComponent {
    writer: SharedWriter,
    written: Arc<AtomicU64>,
}

impl Component for ExporterComponent {
    fn on_stop(&mut self, ctx: &ComponentContext) -> anyhow::Result<()> {
        lock(&self.writer).flush()?;
        tracing::debug!(
            "Exporter '{}' flushed after {} records",
            ctx.name(),
            self.written.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

pub struct Exporter<T> {
    id: ComponentId,
    input: Receiver<T>,
    written: Arc<AtomicU64>,
}

impl<T: Send + 'static> Exporter<T> {
    /// Add an exporter to `pipeline`. Connect upstream emitters to
    /// [`Exporter::input`].
    pub fn new<W, S>(
        pipeline: &Pipeline,
        name: impl Into<String>,
        writer: W,
        serializer: S,
        policy: DeliveryPolicy,
    ) -> PipelineResult<Self>
    where
        W: StoreWriter + 'static,
        S: Serializer<T> + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let written = Arc::new(AtomicU64::new(0));
        let id = pipeline.add_component(
            name,
            ExporterComponent {
                writer: Arc::clone(&writer),
                written: Arc::clone(&written),
            },
        );

        let counter = Arc::clone(&written);
        let mut buf = Vec::new();
        let input = pipeline.create_receiver(id, "in", policy, move |data: T, env: &Envelope| {
            buf.clear();
            serializer.serialize(&data, &mut buf)?;
            lock(&writer).append_record(env.originating_time, &buf)?;
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })?;

        Ok(Self { id, input, written })
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn input(&self) -> &Receiver<T> {
        &self.input
    }

    /// Records appended so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}
