//! Connector: relays one stream from a pipeline into another.
//!
//! The input receiver lives in the upstream pipeline and hands each message,
//! with its originating time, to an emitter owned by the downstream one. The
//! downstream emitter is unordered: it forwards whatever order the input
//! dispatches in, and the downstream receivers apply their own policies.
//!
//! Both pipelines should share a clock (`PipelineBuilder::clock`) so
//! originating times mean the same thing on both sides. If the downstream
//! pipeline has stopped, relaying fails and the error is reported in the
//! upstream pipeline.

use crate::pipeline::component::Passive;
use crate::pipeline::emitter::Emitter;
use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::ComponentId;
use crate::pipeline::policy::DeliveryPolicy;
use crate::pipeline::receiver::Receiver;

pub struct Connector<T> {
    upstream_id: ComponentId,
    downstream_id: ComponentId,
    input: Receiver<T>,
    output: Emitter<T>,
}

impl<T: Clone + Send + 'static> Connector<T> {
    pub fn new(
        upstream: &Pipeline,
        downstream: &Pipeline,
        name: impl Into<String>,
    ) -> PipelineResult<Self> {
        Self::with_policy(upstream, downstream, name, DeliveryPolicy::Unlimited)
    }

    /// `policy` applies to the upstream side, where messages wait to be
    /// relayed.
    pub fn with_policy(
        upstream: &Pipeline,
        downstream: &Pipeline,
        name: impl Into<String>,
        policy: DeliveryPolicy,
    ) -> PipelineResult<Self> {
        let name = name.into();
        let downstream_id = downstream.add_component(format!("{name}.out"), Passive);
        let output = downstream.create_unordered_emitter::<T>(downstream_id, "out")?;

        let upstream_id = upstream.add_component(format!("{name}.in"), Passive);
        let relay = output.clone();
        let input = upstream.create_receiver(upstream_id, "in", policy, move |data: T, env: &Envelope| {
            relay.post(data, env.originating_time)?;
            Ok(())
        })?;

        tracing::debug!(
            "Connector '{}': '{}' -> '{}'",
            name,
            upstream.name(),
            downstream.name()
        );
        Ok(Self {
            upstream_id,
            downstream_id,
            input,
            output,
        })
    }

    /// Receiver to connect upstream emitters to.
    pub fn input(&self) -> &Receiver<T> {
        &self.input
    }

    /// Emitter to connect downstream receivers to.
    pub fn output(&self) -> &Emitter<T> {
        &self.output
    }

    pub fn upstream_id(&self) -> ComponentId {
        self.upstream_id
    }

    pub fn downstream_id(&self) -> ComponentId {
        self.downstream_id
    }
}
