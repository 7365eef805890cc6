//! Handle registry relay and peer-session state machines
//!
//! Participants connect to a relay over WebSocket, claim a unique handle and
//! exchange negotiation and call-control messages addressed by handle. The
//! relay forwards those messages without looking inside them; everything
//! above forwarding runs on the clients.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  relay (server)                                          │
//! │  RelayServer → handle_connection (one task per channel)  │
//! │              → Relay { Mutex<Registry> }                 │
//! └──────────────────────────────────────────────────────────┘
//!              ↑ JSON envelopes over WebSocket ↓
//! ┌──────────────────────────────────────────────────────────┐
//! │  client                                                  │
//! │  PeerClient ──commands──→ actor ──owns──→ ClientCore     │
//! │  SignalingClient (register/search, reconnection)         │
//! │  ClientCore ├─ LinkManager  (one PeerLink per remote)    │
//! │             └─ CallManager  (single CallSession)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The peer-connection and media-capture stacks are seams
//! ([`PeerTransportFactory`], [`MediaDevices`]) supplied by the embedder.
//!
//! # Example
//!
//! ```ignore
//! use peerline_signaling::{ClientConfig, PeerClient, RelayConfig, RelayServer};
//!
//! let server = RelayServer::new(RelayConfig::default())?.start().await?;
//!
//! let config = ClientConfig::new(&server.url());
//! let (client, mut events) = PeerClient::connect(config, transports, devices).await?;
//! client.register("Alice01").await?;
//! let matches = client.search("bo").await?;
//! client.initiate_call(&matches[0]).await?;
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod relay;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use call::{CallSession, CallStatus, MediaDevices, MediaStream, MediaTrack, TrackKind};
pub use client::{CallEndReason, ClientEvent, ClientSnapshot, PeerClient, SignalingClient};
pub use config::{ClientConfig, RelayConfig};
pub use error::{Error, Result};
pub use peer::{LinkInfo, NegotiationState, PeerTransport, PeerTransportFactory, Role};
pub use protocol::{Envelope, Handle, MessageKind};
pub use relay::{Relay, RelayEvent, RelayServer, RelayServerHandle};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
