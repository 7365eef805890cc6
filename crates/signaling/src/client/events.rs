//! Typed client events
//!
//! Everything observable that the client does on its own (inbound calls,
//! link state, presence, reconnection) is reported as a [`ClientEvent`] on a
//! single unbounded channel, in the order the state owner produced them.

use crate::call::media::MediaTrack;
use crate::call::session::CallStatus;
use crate::peer::link::NegotiationState;
use crate::protocol::Handle;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Why a call session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    /// We hung up
    LocalHangup,
    /// The remote hung up
    RemoteHangup,
    /// We declined the ringing call
    LocalReject,
    /// The remote declined our call
    RemoteReject,
    /// Microphone could not be acquired while accepting
    MediaFailure,
    /// The underlying peer link broke or was closed
    TransportFailure,
    /// The relay connection was re-established and stale state dropped
    RelayReconnected,
    /// The client is shutting down
    Shutdown,
}

/// Events emitted by a running client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Our handle was accepted by the relay
    Registered { handle: Handle },
    /// Another participant came online
    UserOnline { handle: Handle },
    /// Another participant went offline
    UserOffline { handle: Handle },
    /// The relay refused a forward (recipient offline, not registered, ...)
    RelayError { message: String },

    /// Relay connection lost
    Disconnected,
    /// Reconnection attempt scheduled
    Reconnecting { attempt: u32 },
    /// Relay connection re-established (and our handle re-claimed, if any)
    Reconnected { handle: Option<Handle> },
    /// Reconnection abandoned after the configured number of attempts
    ReconnectFailed { attempts: u32 },
    /// The handle could not be re-claimed after reconnecting
    RegistrationLost { reason: String },

    /// Peer link changed state
    LinkStateChanged {
        remote: Handle,
        state: NegotiationState,
    },
    /// Established link lost connectivity; it may still recover
    LinkDisconnected { remote: Handle },
    /// Connectivity of an interrupted link came back
    LinkRestored { remote: Handle },
    /// Peer link broke
    LinkFailed { remote: Handle, reason: String },
    /// Data sub-channel opened
    DataChannelOpen { remote: Handle },
    /// Message received on a data sub-channel
    DataMessage { from: Handle, message: Value },

    /// Someone is calling us
    IncomingCall { from: Handle },
    /// A second call arrived while busy and was declined
    CallBusyRejected { from: Handle },
    /// Call session changed status
    CallStateChanged { remote: Handle, status: CallStatus },
    /// Call session ended and was cleared
    CallEnded {
        remote: Handle,
        reason: CallEndReason,
    },
    /// Remote media arrived during the call
    RemoteTrack {
        from: Handle,
        track: Arc<dyn MediaTrack>,
    },
    /// Microphone muted or unmuted
    MicrophoneToggled { enabled: bool },
    /// We started sharing our screen
    ScreenShareStarted,
    /// We stopped sharing our screen
    ScreenShareStopped,
    /// The remote started sharing its screen
    RemoteScreenShareStarted { from: Handle },
    /// The remote stopped sharing its screen
    RemoteScreenShareStopped { from: Handle },
}

/// Cloneable emitter for [`ClientEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the embedder reads from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event; dropped silently once the receiver is gone
    pub fn emit(&self, event: ClientEvent) {
        trace!(?event, "Client event");
        let _ = self.tx.send(event);
    }
}
