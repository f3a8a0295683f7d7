//! Graph storage: components, type-erased ports and edges.
//!
//! Ports are stored behind small object-safe traits so that the graph can
//! connect, inspect and tear them down without knowing their payload types.
//! IDs are indices into the respective vectors.

use crate::pipeline::component::{Component, ComponentCell, Passive};
use crate::pipeline::diagnostics::{ComponentSnapshot, EmitterSnapshot, ReceiverSnapshot};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{ComponentId, EdgeId, EmitterId, ReceiverId};
use crate::pipeline::port::{PayloadType, PortDescriptor};
use crate::pipeline::receiver::ReceiverStats;
use crate::pipeline::sync::lock;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Emitter operations that do not depend on the payload type.
pub(crate) trait ErasedEmitter: Send + Sync {
    fn descriptor(&self) -> PortDescriptor;
    /// Append `receiver` to the fan-out if it carries the same payload type.
    fn attach(&self, receiver: &Arc<dyn Any + Send + Sync>) -> bool;
    fn posted(&self) -> u64;
    fn target_count(&self) -> usize;
    fn clear_targets(&self);
}

/// Receiver operations that do not depend on the payload type.
pub(crate) trait ErasedReceiver: Send + Sync {
    fn descriptor(&self) -> PortDescriptor;
    fn stats(&self) -> ReceiverStats;
    /// Refuse further messages, drop pending ones and wake blocked producers.
    fn close(&self);
    /// Replace the handler with a no-op, releasing whatever it captured.
    fn clear_handler(&self);
}

/// An edge from an emitter to a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub id: EdgeId,
    pub emitter: EmitterId,
    pub receiver: ReceiverId,
    pub from_component: ComponentId,
    pub to_component: ComponentId,
}

pub(crate) struct ComponentSlot {
    pub(crate) cell: Arc<ComponentCell>,
    pub(crate) component: Arc<Mutex<Box<dyn Component>>>,
}

pub(crate) struct EmitterSlot {
    pub(crate) owner: ComponentId,
    pub(crate) payload: PayloadType,
    pub(crate) port: Arc<dyn ErasedEmitter>,
}

pub(crate) struct ReceiverSlot {
    pub(crate) owner: ComponentId,
    pub(crate) payload: PayloadType,
    pub(crate) port: Arc<dyn ErasedReceiver>,
    /// Same allocation as `port`, for downcasting in `attach`.
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub(crate) struct Graph {
    components: Vec<ComponentSlot>,
    emitters: Vec<EmitterSlot>,
    receivers: Vec<ReceiverSlot>,
    edges: Vec<Edge>,
    edge_set: HashSet<(EmitterId, ReceiverId)>,
}

impl Graph {
    pub(crate) fn next_component_id(&self) -> ComponentId {
        ComponentId(self.components.len() as u32)
    }

    pub(crate) fn next_emitter_id(&self) -> EmitterId {
        EmitterId(self.emitters.len() as u32)
    }

    pub(crate) fn next_receiver_id(&self) -> ReceiverId {
        ReceiverId(self.receivers.len() as u32)
    }

    pub(crate) fn add_component(&mut self, slot: ComponentSlot) {
        self.components.push(slot);
    }

    pub(crate) fn add_emitter(&mut self, slot: EmitterSlot) {
        self.emitters.push(slot);
    }

    pub(crate) fn add_receiver(&mut self, slot: ReceiverSlot) {
        self.receivers.push(slot);
    }

    pub(crate) fn component(&self, id: ComponentId) -> PipelineResult<&ComponentSlot> {
        self.components
            .get(id.index())
            .ok_or_else(|| PipelineError::UnknownPort(format!("component {id}")))
    }

    pub(crate) fn components(&self) -> &[ComponentSlot] {
        &self.components
    }

    pub(crate) fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub(crate) fn receiver_ports(&self) -> Vec<Arc<dyn ErasedReceiver>> {
        self.receivers.iter().map(|r| Arc::clone(&r.port)).collect()
    }

    /// Add an edge after checking both ends exist, carry the same payload
    /// type and are not already connected.
    pub(crate) fn connect(
        &mut self,
        emitter: EmitterId,
        receiver: ReceiverId,
    ) -> PipelineResult<Edge> {
        let e = self
            .emitters
            .get(emitter.index())
            .ok_or_else(|| PipelineError::UnknownPort(emitter.to_string()))?;
        let r = self
            .receivers
            .get(receiver.index())
            .ok_or_else(|| PipelineError::UnknownPort(receiver.to_string()))?;

        if e.payload != r.payload {
            return Err(PipelineError::TypeMismatch {
                component: e.owner,
                emitter,
                receiver,
                emitter_type: e.payload.name(),
                receiver_type: r.payload.name(),
            });
        }
        if self.edge_set.contains(&(emitter, receiver)) {
            return Err(PipelineError::AlreadyConnected {
                component: e.owner,
                emitter,
                receiver,
            });
        }
        if !e.port.attach(&r.any) {
            return Err(PipelineError::TypeMismatch {
                component: e.owner,
                emitter,
                receiver,
                emitter_type: e.payload.name(),
                receiver_type: r.payload.name(),
            });
        }

        let edge = Edge {
            id: EdgeId(self.edges.len() as u32),
            emitter,
            receiver,
            from_component: e.owner,
            to_component: r.owner,
        };
        self.edge_set.insert((emitter, receiver));
        self.edges.push(edge.clone());
        Ok(edge)
    }

    pub(crate) fn component_snapshots(&self) -> Vec<ComponentSnapshot> {
        self.components
            .iter()
            .map(|slot| ComponentSnapshot {
                id: slot.cell.id,
                name: slot.cell.name.clone(),
                state: slot.cell.state(),
                is_source: slot.cell.is_source,
                completed: slot.cell.is_completed(),
                isolated: slot.cell.is_isolated(),
            })
            .collect()
    }

    pub(crate) fn emitter_snapshots(&self) -> Vec<EmitterSnapshot> {
        self.emitters
            .iter()
            .enumerate()
            .map(|(index, slot)| EmitterSnapshot {
                id: EmitterId(index as u32),
                port: slot.port.descriptor(),
                posted: slot.port.posted(),
                targets: slot.port.target_count(),
            })
            .collect()
    }

    pub(crate) fn receiver_snapshots(&self) -> Vec<ReceiverSnapshot> {
        self.receivers
            .iter()
            .enumerate()
            .map(|(index, slot)| ReceiverSnapshot {
                id: ReceiverId(index as u32),
                port: slot.port.descriptor(),
                stats: slot.port.stats(),
            })
            .collect()
    }

    /// Break every reference cycle through handlers and fan-out lists.
    /// Slots stay in place so ids remain valid for diagnostics.
    ///
    /// Returns the component slots; the caller resets them with
    /// [`reset_components`] once the graph lock is released.
    pub(crate) fn teardown(&mut self) -> Vec<Arc<Mutex<Box<dyn Component>>>> {
        for emitter in &self.emitters {
            emitter.port.clear_targets();
        }
        for receiver in &self.receivers {
            receiver.port.close();
            receiver.port.clear_handler();
        }
        self.edges.clear();
        self.edge_set.clear();
        self.components
            .iter()
            .map(|slot| Arc::clone(&slot.component))
            .collect()
    }
}

/// Replace each component with [`Passive`], dropping whatever it captured.
pub(crate) fn reset_components(components: Vec<Arc<Mutex<Box<dyn Component>>>>) {
    for component in components {
        *lock(&component) = Box::new(Passive);
    }
}
