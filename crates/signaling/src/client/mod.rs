//! Client side: relay connection, reconnection and the state-owning actor

pub mod core;
pub mod events;
pub mod runtime;
pub mod signaling;

pub use self::core::{ClientCore, ClientSnapshot};
pub use events::{CallEndReason, ClientEvent, EventSink};
pub use runtime::PeerClient;
pub use signaling::{SignalSender, SignalingClient, SignalingEvent};
