//! Delivery policies.
//!
//! A receiver's policy decides what happens to a message that arrives while
//! earlier messages are still waiting or being processed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a full `Throttle` receiver does with the next message. There is no
/// default: every throttled receiver names its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// The producer parks until a slot frees (lossless backpressure).
    Block,
    /// The incoming message is discarded.
    DropNewest,
}

/// How a receiver buffers and hands out messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Every message is queued.
    #[default]
    Unlimited,
    /// At most one message waits; a newer one replaces it.
    LatestMessage,
    /// At most `max_queue_depth` messages are waiting or in flight.
    Throttle {
        max_queue_depth: usize,
        when_full: ThrottleMode,
    },
    /// Delivered on the posting thread when the receiver is idle, otherwise
    /// queued like `Throttle { when_full: Block }`.
    SynchronousOrThrottle { max_queue_depth: usize },
}

impl DeliveryPolicy {
    pub const fn throttle(max_queue_depth: usize, when_full: ThrottleMode) -> Self {
        DeliveryPolicy::Throttle {
            max_queue_depth,
            when_full,
        }
    }

    pub const fn throttle_blocking(max_queue_depth: usize) -> Self {
        Self::throttle(max_queue_depth, ThrottleMode::Block)
    }

    pub const fn throttle_dropping(max_queue_depth: usize) -> Self {
        Self::throttle(max_queue_depth, ThrottleMode::DropNewest)
    }

    /// Queue bound, if the policy has one. A configured depth of zero is
    /// treated as one.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            DeliveryPolicy::Unlimited => None,
            DeliveryPolicy::LatestMessage => Some(1),
            DeliveryPolicy::Throttle {
                max_queue_depth, ..
            }
            | DeliveryPolicy::SynchronousOrThrottle { max_queue_depth } => {
                Some((*max_queue_depth).max(1))
            }
        }
    }

    /// Whether a producer may be parked by this policy.
    pub fn may_block(&self) -> bool {
        matches!(
            self,
            DeliveryPolicy::Throttle {
                when_full: ThrottleMode::Block,
                ..
            } | DeliveryPolicy::SynchronousOrThrottle { .. }
        )
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPolicy::Unlimited => write!(f, "unlimited"),
            DeliveryPolicy::LatestMessage => write!(f, "latest"),
            DeliveryPolicy::Throttle {
                max_queue_depth,
                when_full: ThrottleMode::Block,
            } => write!(f, "throttle({max_queue_depth}, block)"),
            DeliveryPolicy::Throttle {
                max_queue_depth,
                when_full: ThrottleMode::DropNewest,
            } => write!(f, "throttle({max_queue_depth}, drop)"),
            DeliveryPolicy::SynchronousOrThrottle { max_queue_depth } => {
                write!(f, "sync-or-throttle({max_queue_depth})")
            }
        }
    }
}
