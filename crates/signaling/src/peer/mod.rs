//! Session negotiation (client side)
//!
//! One [`PeerLink`] per remote handle, driven by local connect requests and
//! relayed offer / answer / candidate payloads.

pub mod link;
pub mod manager;
pub mod transport;

pub use link::{LinkInfo, NegotiationState, PeerLink};
pub use manager::{LinkManager, LinkOutcome};
pub use transport::{
    LinkId, PeerTransport, PeerTransportFactory, Role, TransportEnvelope, TransportEvent,
    TransportEventSender, TransportState, DATA_CHANNEL_LABEL,
};
