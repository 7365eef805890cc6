//! Peer Link: one negotiated transport per remote handle

use super::transport::{LinkId, PeerTransport, Role};
use crate::protocol::Handle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Negotiation progress of a link
///
/// A link that is not in the table is `absent`; `Closed` is terminal and is
/// only reported in events, since closing removes the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Negotiating,
    Established,
    Closed,
}

/// Client-side state for one remote handle
pub struct PeerLink {
    remote: Handle,
    role: Role,
    state: NegotiationState,
    transport: Arc<dyn PeerTransport>,
    id: LinkId,
    interrupted: bool,
    created_at: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(remote: &str, role: Role, id: LinkId, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            remote: remote.to_string(),
            role,
            state: NegotiationState::Negotiating,
            transport,
            id,
            interrupted: false,
            created_at: Utc::now(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }

    /// Our offer is outstanding and no connection exists yet
    pub fn is_pending_offer(&self) -> bool {
        self.role == Role::Initiator && self.state == NegotiationState::Negotiating
    }

    /// Move to `Established`; false if it already was
    pub fn mark_established(&mut self) -> bool {
        if self.state == NegotiationState::Negotiating {
            self.state = NegotiationState::Established;
            true
        } else {
            false
        }
    }

    /// An established link lost connectivity; false if not established or
    /// already interrupted
    pub fn mark_interrupted(&mut self) -> bool {
        if self.is_established() && !self.interrupted {
            self.interrupted = true;
            true
        } else {
            false
        }
    }

    /// Connectivity came back after an interruption
    pub fn mark_restored(&mut self) -> bool {
        std::mem::replace(&mut self.interrupted, false)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Summary for snapshots
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            interrupted: self.interrupted,
            data_channel_open: self.transport.is_data_channel_open(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("id", &self.id)
            .finish()
    }
}

/// Read-only view of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub remote: Handle,
    pub role: Role,
    pub state: NegotiationState,
    pub interrupted: bool,
    pub data_channel_open: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::TransportEventSender;
    use crate::testing::FakeTransport;
    use tokio::sync::mpsc;

    fn link(role: Role) -> PeerLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        let events = TransportEventSender::new("Bob0002", LinkId(1), tx);
        let transport = Arc::new(FakeTransport::new("Bob0002", role, events));
        PeerLink::new("Bob0002", role, LinkId(1), transport)
    }

    #[test]
    fn test_new_link_is_negotiating() {
        let link = link(Role::Initiator);
        assert_eq!(link.state(), NegotiationState::Negotiating);
        assert!(link.is_pending_offer());
        assert!(!link.is_established());
    }

    #[test]
    fn test_mark_established_once() {
        let mut link = link(Role::Responder);
        assert!(!link.is_pending_offer());
        assert!(link.mark_established());
        assert!(!link.mark_established());
        assert!(link.is_established());
        assert_eq!(link.info().state, NegotiationState::Established);
    }

    #[test]
    fn test_interruption_requires_established_link() {
        let mut link = link(Role::Initiator);
        assert!(!link.mark_interrupted());

        link.mark_established();
        assert!(link.mark_interrupted());
        assert!(!link.mark_interrupted());
        assert!(link.info().interrupted);

        assert!(link.mark_restored());
        assert!(!link.mark_restored());
        assert!(!link.is_interrupted());
    }
}
