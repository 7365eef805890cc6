//! User registry and relay (server side)
//!
//! Tracks which handle is held by which connected channel, forwards relayed
//! messages between handles and broadcasts presence.

pub mod events;
pub mod handler;
pub mod registry;
pub mod server;

pub use events::RelayEvent;
pub use handler::handle_connection;
pub use registry::{ChannelId, Relay};
pub use server::{RelayServer, RelayServerHandle};
