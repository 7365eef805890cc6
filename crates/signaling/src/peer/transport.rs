//! Peer-connection primitive seam
//!
//! The negotiation state machine drives an external peer-connection
//! implementation through [`PeerTransport`]. Offer, answer and candidate
//! payloads are opaque JSON values; the transport reports what happens on its
//! side (candidates, connection state, data sub-channel, remote media) through
//! a [`TransportEventSender`] tagged with the link it belongs to.

use crate::call::media::MediaTrack;
use crate::protocol::Handle;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the data sub-channel the initiator opens
pub const DATA_CHANNEL_LABEL: &str = "messages";

/// Which side started the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sent the offer
    Initiator,
    /// Answered an inbound offer
    Responder,
}

/// Connection condition reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Temporarily unreachable; may recover
    Disconnected,
    Failed,
    Closed,
}

/// Generation tag distinguishing successive links to the same remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Something the transport observed
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local connectivity candidate to trickle to the remote
    LocalCandidate(Value),
    /// Connection condition changed
    StateChanged(TransportState),
    /// Tracks were added or removed and a fresh offer is required
    NegotiationNeeded,
    /// Data sub-channel is open
    DataChannelOpen,
    /// Data sub-channel closed
    DataChannelClosed,
    /// Message received on the data sub-channel
    DataMessage(Value),
    /// Remote media arrived
    RemoteTrack(Arc<dyn MediaTrack>),
}

/// A transport event tagged with its origin
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    pub remote: Handle,
    pub link: LinkId,
    pub event: TransportEvent,
}

/// Sender handed to a transport at creation
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    remote: Handle,
    link: LinkId,
    tx: mpsc::UnboundedSender<TransportEnvelope>,
}

impl TransportEventSender {
    pub fn new(remote: &str, link: LinkId, tx: mpsc::UnboundedSender<TransportEnvelope>) -> Self {
        Self {
            remote: remote.to_string(),
            link,
            tx,
        }
    }

    /// Report an event; false once the owning client is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportEnvelope {
                remote: self.remote.clone(),
                link: self.link,
                event,
            })
            .is_ok()
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn link(&self) -> LinkId {
        self.link
    }
}

/// One underlying peer connection
///
/// Implementations wrap a real peer-connection stack. Initiator-side
/// transports open the [`DATA_CHANNEL_LABEL`] sub-channel themselves;
/// responder-side transports adopt the one the remote opened.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create and apply a local offer
    async fn create_offer(&self) -> Result<Value>;

    /// Apply a remote offer and return the local answer
    async fn accept_offer(&self, offer: Value) -> Result<Value>;

    /// Apply the remote answer to our offer
    async fn apply_answer(&self, answer: Value) -> Result<()>;

    /// Apply a remote connectivity candidate
    async fn add_ice_candidate(&self, candidate: Value) -> Result<()>;

    /// Start sending a local track
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;

    /// Stop sending a local track
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    /// Send a message on the data sub-channel
    async fn send_data(&self, message: &Value) -> Result<()>;

    fn is_data_channel_open(&self) -> bool;

    /// Release the connection and its data sub-channel
    async fn close(&self) -> Result<()>;
}

/// Creates transports for new links
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &str,
        role: Role,
        ice_servers: &[String],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = TransportEventSender::new("Bob0002", LinkId(3), tx);
        assert!(sender.send(TransportEvent::DataChannelOpen));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.remote, "Bob0002");
        assert_eq!(envelope.link, LinkId(3));
        assert!(matches!(envelope.event, TransportEvent::DataChannelOpen));

        drop(rx);
        assert!(!sender.send(TransportEvent::DataChannelClosed));
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
        assert_eq!(LinkId(7).to_string(), "link-7");
    }
}
