//! Relay event types for embedders
//!
//! These events flow from the relay registry to whoever created the relay with
//! an event sender (the server binary, tests, an admin surface). Delivery is
//! best-effort: a full event queue drops the event with a warning.

use crate::protocol::{Handle, MessageKind};
use serde::{Deserialize, Serialize};

/// Events emitted by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A channel claimed a handle
    Registered {
        /// Claimed handle
        handle: Handle,
        /// Registered handles after the claim
        online: usize,
    },

    /// A registered channel closed and its handle was freed
    Unregistered {
        /// Freed handle
        handle: Handle,
        /// Registered handles after the removal
        online: usize,
    },

    /// A relayed message was delivered to its recipient's queue
    Forwarded {
        /// Relayed kind
        kind: MessageKind,
        /// Sender handle (as stamped)
        from: Handle,
        /// Recipient handle
        to: Handle,
    },

    /// A relayed message could not be delivered
    ForwardFailed {
        /// Relayed kind
        kind: MessageKind,
        /// Sender handle, if the channel was registered
        from: Option<Handle>,
        /// Intended recipient
        to: Handle,
        /// Why delivery failed
        reason: String,
    },
}

impl RelayEvent {
    /// Create a registered event
    pub fn registered(handle: &str, online: usize) -> Self {
        Self::Registered {
            handle: handle.to_string(),
            online,
        }
    }

    /// Create an unregistered event
    pub fn unregistered(handle: &str, online: usize) -> Self {
        Self::Unregistered {
            handle: handle.to_string(),
            online,
        }
    }

    /// Create a forwarded event
    pub fn forwarded(kind: MessageKind, from: &str, to: &str) -> Self {
        Self::Forwarded {
            kind,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a forward-failed event
    pub fn forward_failed(kind: MessageKind, from: Option<&str>, to: &str, reason: &str) -> Self {
        Self::ForwardFailed {
            kind,
            from: from.map(str::to_string),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Handle the event is about (the sender, for forwards)
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Registered { handle, .. } | Self::Unregistered { handle, .. } => Some(handle),
            Self::Forwarded { from, .. } => Some(from),
            Self::ForwardFailed { from, .. } => from.as_deref(),
        }
    }
}
