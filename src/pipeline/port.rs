//! Port descriptors.
//!
//! Emitters and receivers are stored type-erased in the graph; each carries a
//! [`PayloadType`] so that connections made by id can still be checked, and
//! a [`PortDescriptor`] used by topology snapshots.

use crate::pipeline::id::ComponentId;
use crate::pipeline::policy::DeliveryPolicy;
use serde::Serialize;
use std::any::TypeId;

/// Runtime identity of a port's payload type.
#[derive(Debug, Clone, Copy)]
pub struct PayloadType {
    id: TypeId,
    name: &'static str,
}

impl PayloadType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for PayloadType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PayloadType {}

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Static description of an emitter or receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub name: String,
    pub owner: ComponentId,
    pub direction: PortDirection,
    pub payload_type: &'static str,
    /// Delivery policy, for receivers.
    pub policy: Option<DeliveryPolicy>,
    /// Originating-time monotonicity is enforced (emitters) or dispatch is
    /// keyed by envelope time rather than arrival (receivers).
    pub ordered: bool,
}

impl PortDescriptor {
    pub fn output(name: impl Into<String>, owner: ComponentId, payload: PayloadType, ordered: bool) -> Self {
        Self {
            name: name.into(),
            owner,
            direction: PortDirection::Output,
            payload_type: payload.name(),
            policy: None,
            ordered,
        }
    }

    pub fn input(
        name: impl Into<String>,
        owner: ComponentId,
        payload: PayloadType,
        policy: DeliveryPolicy,
        ordered: bool,
    ) -> Self {
        Self {
            name: name.into(),
            owner,
            direction: PortDirection::Input,
            payload_type: payload.name(),
            policy: Some(policy),
            ordered,
        }
    }
}
