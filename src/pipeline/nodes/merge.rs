//! Merge: interleaves several same-typed streams in arrival order.
//!
//! Every upstream emitter connects to the single input receiver. The input is
//! ordered by wall-clock arrival rather than envelope time, and each message
//! is re-posted unchanged (same originating time) on an unordered output.

use crate::pipeline::component::Passive;
use crate::pipeline::emitter::Emitter;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::{ComponentId, EdgeId};
use crate::pipeline::policy::DeliveryPolicy;
use crate::pipeline::receiver::Receiver;

pub struct Merge<T> {
    id: ComponentId,
    input: Receiver<T>,
    output: Emitter<T>,
}

impl<T: Clone + Send + 'static> Merge<T> {
    pub fn new(pipeline: &Pipeline, name: impl Into<String>) -> PipelineResult<Self> {
        Self::with_policy(pipeline, name, DeliveryPolicy::Unlimited)
    }

    pub fn with_policy(
        pipeline: &Pipeline,
        name: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> PipelineResult<Self> {
        let id = pipeline.add_component(name, Passive);
        let output = pipeline.create_unordered_emitter::<T>(id, "out")?;
        let relay = output.clone();
        let input = pipeline.create_arrival_receiver(id, "in", policy, move |data: T, env: &Envelope| {
            relay.post(data, env.originating_time)?;
            Ok(())
        })?;
        Ok(Self { id, input, output })
    }

    /// Connect another upstream stream.
    pub fn add_input(&self, pipeline: &Pipeline, upstream: &Emitter<T>) -> PipelineResult<EdgeId> {
        pipeline.connect(upstream, &self.input)
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn input(&self) -> &Receiver<T> {
        &self.input
    }

    pub fn output(&self) -> &Emitter<T> {
        &self.output
    }
}
