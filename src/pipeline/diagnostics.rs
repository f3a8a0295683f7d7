//! Point-in-time view of a pipeline's graph and counters.

use crate::pipeline::component::LifecycleState;
use crate::pipeline::graph::Edge;
use crate::pipeline::id::{ComponentId, EmitterId, PipelineId, ReceiverId};
use crate::pipeline::port::PortDescriptor;
use crate::pipeline::receiver::ReceiverStats;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentSnapshot {
    pub id: ComponentId,
    pub name: String,
    pub state: LifecycleState,
    pub is_source: bool,
    pub completed: bool,
    pub isolated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmitterSnapshot {
    pub id: EmitterId,
    pub port: PortDescriptor,
    pub posted: u64,
    pub targets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiverSnapshot {
    pub id: ReceiverId,
    pub port: PortDescriptor,
    pub stats: ReceiverStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub configured_workers: usize,
    pub live_workers: usize,
    pub pending: usize,
    pub executed: u64,
}

/// Serializable snapshot of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub pipeline: PipelineId,
    pub name: String,
    pub state: LifecycleState,
    pub components: Vec<ComponentSnapshot>,
    pub emitters: Vec<EmitterSnapshot>,
    pub receivers: Vec<ReceiverSnapshot>,
    pub edges: Vec<Edge>,
    pub scheduler: SchedulerSnapshot,
    /// Errors reported since the pipeline was built.
    pub errors: u64,
}

impl TopologySnapshot {
    pub fn component(&self, id: ComponentId) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn component_by_name(&self, name: &str) -> Option<&ComponentSnapshot> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn receiver(&self, id: ReceiverId) -> Option<&ReceiverSnapshot> {
        self.receivers.iter().find(|r| r.id == id)
    }

    /// Sum of dropped messages over all receivers.
    pub fn total_dropped(&self) -> u64 {
        self.receivers.iter().map(|r| r.stats.dropped).sum()
    }

    pub fn isolated(&self) -> impl Iterator<Item = &ComponentSnapshot> {
        self.components.iter().filter(|c| c.isolated)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
