//! Client-side state owner
//!
//! [`ClientCore`] holds the link table and the call session and is the only
//! place either is mutated. Relay messages, transport events, media events and
//! local commands all arrive here one at a time (see `client::runtime`), so no
//! two transitions ever race on the same link or session.

use super::events::{CallEndReason, ClientEvent, EventSink};
use super::signaling::{SignalSender, SignalingEvent};
use crate::call::manager::CallManager;
use crate::call::media::{MediaDevices, MediaEvent, MediaEventSender};
use crate::call::session::CallSession;
use crate::peer::link::LinkInfo;
use crate::peer::manager::{LinkManager, LinkOutcome};
use crate::peer::transport::{PeerTransportFactory, TransportEnvelope};
use crate::protocol::{Envelope, Handle, MessageKind};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Point-in-time view of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub handle: Option<Handle>,
    pub links: Vec<LinkInfo>,
    pub call: Option<CallSession>,
}

pub struct ClientCore {
    signals: Arc<dyn SignalSender>,
    events: EventSink,
    links: LinkManager,
    calls: CallManager,
}

impl ClientCore {
    pub fn new(
        signals: Arc<dyn SignalSender>,
        factory: Arc<dyn PeerTransportFactory>,
        media: Arc<dyn MediaDevices>,
        ice_servers: Vec<String>,
        events: EventSink,
        transport_tx: mpsc::UnboundedSender<TransportEnvelope>,
        media_events: MediaEventSender,
    ) -> Self {
        let links = LinkManager::new(
            factory,
            ice_servers,
            Arc::clone(&signals),
            events.clone(),
            transport_tx,
        );
        let calls = CallManager::new(media, media_events, Arc::clone(&signals), events.clone());
        Self {
            signals,
            events,
            links,
            calls,
        }
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            handle: self.signals.local_handle(),
            links: self.links.infos(),
            call: self.calls.session().cloned(),
        }
    }

    fn require_peer(&self, remote: &str) -> Result<()> {
        match self.signals.local_handle() {
            None => Err(Error::NotRegistered(format!(
                "register before contacting {}",
                remote
            ))),
            Some(local) if local == remote => Err(Error::InvalidHandle(format!(
                "{} is our own handle",
                remote
            ))),
            Some(_) => Ok(()),
        }
    }

    // ---- relay side ----

    pub async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(envelope) => self.on_relay_message(envelope).await,
            SignalingEvent::Registered(handle) => {
                self.events.emit(ClientEvent::Registered { handle });
            }
            SignalingEvent::Disconnected => self.events.emit(ClientEvent::Disconnected),
            SignalingEvent::Reconnecting { attempt } => {
                self.events.emit(ClientEvent::Reconnecting { attempt });
            }
            SignalingEvent::Reconnected { handle } => {
                self.reset(CallEndReason::RelayReconnected).await;
                self.events.emit(ClientEvent::Reconnected { handle });
            }
            SignalingEvent::ReconnectFailed { attempts } => {
                self.events.emit(ClientEvent::ReconnectFailed { attempts });
            }
            SignalingEvent::RegistrationLost { reason } => {
                self.reset(CallEndReason::RelayReconnected).await;
                self.events.emit(ClientEvent::RegistrationLost { reason });
            }
        }
    }

    // Remote state is unknown after a relay outage; drop everything
    async fn reset(&mut self, reason: CallEndReason) {
        self.calls.force_end(&self.links, reason).await;
        let closed = self.links.close_all().await;
        if !closed.is_empty() {
            info!(links = closed.len(), "Dropped peer links after relay reconnection");
        }
    }

    async fn on_relay_message(&mut self, envelope: Envelope) {
        let kind = envelope.kind;
        match kind {
            MessageKind::UserOnline | MessageKind::UserOffline => {
                let Some(handle) = envelope.username else {
                    warn!(%kind, "Presence message without a handle");
                    return;
                };
                debug!(%kind, handle = %handle, "Presence");
                self.events.emit(if kind == MessageKind::UserOnline {
                    ClientEvent::UserOnline { handle }
                } else {
                    ClientEvent::UserOffline { handle }
                });
            }
            MessageKind::Error => {
                let message = envelope.message.unwrap_or_default();
                warn!("Relay error: {}", message);
                self.events.emit(ClientEvent::RelayError { message });
            }
            kind if kind.is_relayed() => {
                let Some(from) = envelope.from else {
                    warn!(%kind, "Relayed message without sender dropped");
                    return;
                };
                if let Err(e) = self.on_relayed(kind, &from, envelope.payload).await {
                    warn!(%kind, from = %from, "Failed to handle relayed message: {}", e);
                }
            }
            kind => debug!(%kind, "Unexpected relay message ignored"),
        }
    }

    async fn on_relayed(&mut self, kind: MessageKind, from: &str, payload: Option<Value>) -> Result<()> {
        if kind.is_negotiation() {
            let payload = payload.ok_or_else(|| {
                Error::MalformedMessage(format!("{} from {} without payload", kind, from))
            })?;
            let result = match kind {
                MessageKind::Offer => self.links.handle_offer(from, payload).await,
                MessageKind::Answer => self.links.handle_answer(from, payload).await,
                _ => self.links.handle_candidate(from, payload).await,
            };
            if result.is_err() && self.links.get(from).is_none() {
                self.calls.on_link_closed(&self.links, from).await;
            }
            return result;
        }

        match kind {
            MessageKind::CallOffer => self.calls.on_call_offer(&self.links, from).await,
            MessageKind::CallAnswer => self.calls.on_call_answer(from),
            MessageKind::CallReject => self.calls.on_call_reject(&self.links, from).await,
            MessageKind::CallEnd => self.calls.on_call_end(&self.links, from).await,
            MessageKind::ScreenShareStart => self.calls.on_remote_screen_share(from, true),
            MessageKind::ScreenShareStop => self.calls.on_remote_screen_share(from, false),
            _ => debug!(%kind, from, "Unhandled relayed message"),
        }
        Ok(())
    }

    // ---- transport and media side ----

    pub async fn on_transport_event(&mut self, envelope: TransportEnvelope) {
        match self.links.on_transport_event(envelope).await {
            Some(LinkOutcome::Closed { remote, failed }) => {
                debug!(remote = %remote, failed, "Link gone");
                self.calls.on_link_closed(&self.links, &remote).await;
            }
            Some(LinkOutcome::RemoteTrack { remote, track }) => {
                self.calls.on_remote_track(&remote, track);
            }
            None => {}
        }
    }

    pub async fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::CaptureEnded { stream_id } => {
                if let Err(e) = self.calls.on_capture_ended(&self.links, &stream_id).await {
                    warn!(stream_id = %stream_id, "Failed to stop screen share: {}", e);
                }
            }
        }
    }

    // ---- local commands ----

    /// Negotiate a link to `remote` (idempotent)
    pub async fn connect_peer(&mut self, remote: &str) -> Result<()> {
        self.require_peer(remote)?;
        self.links.connect(remote).await.map(|_| ())
    }

    /// Tear down the link to `remote`, hanging up any call with them first
    pub async fn disconnect_peer(&mut self, remote: &str) -> bool {
        if self.calls.session().is_some_and(|s| s.is_with(remote)) {
            if let Err(e) = self.calls.end(&self.links).await {
                debug!(remote, "Failed to end call before disconnect: {}", e);
            }
        }
        self.links.close(remote).await
    }

    pub async fn send_data(&self, remote: &str, message: &Value) -> Result<()> {
        self.links.send_data(remote, message).await
    }

    pub async fn initiate(&mut self, remote: &str) -> Result<()> {
        self.require_peer(remote)?;
        self.calls.initiate(&mut self.links, remote).await
    }

    pub async fn accept(&mut self, remote: &str) -> Result<()> {
        self.calls.accept(&mut self.links, remote).await
    }

    pub async fn reject(&mut self, remote: &str) -> Result<()> {
        self.calls.reject(&self.links, remote).await
    }

    pub async fn end(&mut self) -> Result<()> {
        self.calls.end(&self.links).await
    }

    pub fn toggle_microphone(&mut self) -> Result<bool> {
        self.calls.toggle_microphone()
    }

    pub async fn start_screen_share(&mut self) -> Result<()> {
        self.calls.start_screen_share(&self.links).await
    }

    pub async fn stop_screen_share(&mut self) -> Result<()> {
        self.calls.stop_screen_share(&self.links).await
    }

    /// Hang up and close every link
    pub async fn shutdown(&mut self) {
        self.calls.shutdown(&self.links).await;
        self.links.close_all().await;
        info!("Client state released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::session::CallStatus;
    use crate::peer::link::NegotiationState;
    use crate::testing::{FakeMediaDevices, FakeTransportFactory, RecordingSignals};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        core: ClientCore,
        factory: Arc<FakeTransportFactory>,
        media: Arc<FakeMediaDevices>,
        signals: Arc<RecordingSignals>,
        events: UnboundedReceiver<ClientEvent>,
        transport_rx: UnboundedReceiver<TransportEnvelope>,
        _media_rx: UnboundedReceiver<MediaEvent>,
    }

    fn fixture(local: &str) -> Fixture {
        let factory = Arc::new(FakeTransportFactory::new());
        let media = Arc::new(FakeMediaDevices::new());
        let signals = Arc::new(RecordingSignals::registered(local));
        let (sink, events) = EventSink::channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let core = ClientCore::new(
            signals.clone(),
            factory.clone(),
            media.clone(),
            vec![],
            sink,
            transport_tx,
            MediaEventSender::new(media_tx),
        );
        Fixture {
            core,
            factory,
            media,
            signals,
            events,
            transport_rx,
            _media_rx: media_rx,
        }
    }

    impl Fixture {
        async fn relay(&mut self, kind: MessageKind, from: &str, payload: Option<Value>) {
            let envelope = Envelope::relayed(kind, "local", payload).stamped(from);
            self.core
                .on_signaling_event(SignalingEvent::Message(envelope))
                .await;
        }

        async fn pump(&mut self) {
            while let Ok(envelope) = self.transport_rx.try_recv() {
                self.core.on_transport_event(envelope).await;
            }
        }

        fn drain_events(&mut self) -> Vec<ClientEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }
    }

    #[tokio::test]
    async fn test_inbound_offer_and_call_offer() {
        let mut f = fixture("Bob0002");
        f.relay(MessageKind::Offer, "Alice01", Some(json!({"sdp": "P"})))
            .await;
        f.pump().await;
        assert!(f.core.links().get("Alice01").unwrap().is_established());

        f.relay(MessageKind::CallOffer, "Alice01", Some(json!({})))
            .await;
        assert_eq!(f.core.calls().status(), CallStatus::Incoming);
        assert!(f
            .drain_events()
            .iter()
            .any(|e| matches!(e, ClientEvent::IncomingCall { from } if from == "Alice01")));

        f.core.accept("Alice01").await.unwrap();
        assert_eq!(f.core.calls().status(), CallStatus::Active);
        assert_eq!(
            f.signals.kinds(),
            vec![MessageKind::Answer, MessageKind::CallAnswer]
        );
    }

    #[tokio::test]
    async fn test_negotiation_without_payload_is_dropped() {
        let mut f = fixture("Bob0002");
        f.relay(MessageKind::Offer, "Alice01", None).await;
        assert!(f.core.links().is_empty());
        assert!(f.signals.sent().is_empty());
    }

    #[tokio::test]
    async fn test_presence_and_relay_errors_surface() {
        let mut f = fixture("Alice01");
        f.core
            .on_signaling_event(SignalingEvent::Message(Envelope::user_online("Bob0002")))
            .await;
        f.core
            .on_signaling_event(SignalingEvent::Message(Envelope::error("not found or offline")))
            .await;

        let events = f.drain_events();
        assert!(matches!(&events[0], ClientEvent::UserOnline { handle } if handle == "Bob0002"));
        assert!(matches!(&events[1], ClientEvent::RelayError { message } if message == "not found or offline"));
    }

    #[tokio::test]
    async fn test_transport_failure_ends_call() {
        let mut f = fixture("Alice01");
        f.core.initiate("Bob0002").await.unwrap();
        f.relay(MessageKind::Answer, "Bob0002", Some(json!({"sdp": "A"})))
            .await;
        f.relay(MessageKind::CallAnswer, "Bob0002", Some(json!({})))
            .await;
        f.pump().await;
        assert_eq!(f.core.calls().status(), CallStatus::Active);

        f.factory.transport("Bob0002").unwrap().fail();
        f.pump().await;

        assert_eq!(f.core.calls().status(), CallStatus::None);
        assert!(f.core.links().is_empty());
        assert_eq!(f.media.microphones()[0].stop_count(), 1);
        assert!(f.drain_events().iter().any(|e| matches!(
            e,
            ClientEvent::CallEnded {
                reason: CallEndReason::TransportFailure,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_reconnect_drops_links_and_call() {
        let mut f = fixture("Alice01");
        f.core.initiate("Bob0002").await.unwrap();
        f.signals.clear();
        f.drain_events();

        f.core
            .on_signaling_event(SignalingEvent::Reconnected {
                handle: Some("Alice01".to_string()),
            })
            .await;

        assert!(f.core.links().is_empty());
        assert!(f.core.calls().session().is_none());
        assert!(f.signals.sent().is_empty());
        let events = f.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::CallEnded {
                reason: CallEndReason::RelayReconnected,
                ..
            }
        )));
        assert!(matches!(events.last(), Some(ClientEvent::Reconnected { .. })));
    }

    #[tokio::test]
    async fn test_commands_require_registration() {
        let mut f = fixture("Alice01");
        assert!(matches!(
            f.core.connect_peer("Alice01").await,
            Err(Error::InvalidHandle(_))
        ));

        let factory = Arc::new(FakeTransportFactory::new());
        let (sink, _events) = EventSink::channel();
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        let (media_tx, _media_rx) = mpsc::unbounded_channel();
        let mut unregistered = ClientCore::new(
            Arc::new(RecordingSignals::new()),
            factory.clone(),
            Arc::new(FakeMediaDevices::new()),
            vec![],
            sink,
            transport_tx,
            MediaEventSender::new(media_tx),
        );
        assert!(matches!(
            unregistered.initiate("Bob0002").await,
            Err(Error::NotRegistered(_))
        ));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_peer_hangs_up_first() {
        let mut f = fixture("Alice01");
        f.core.initiate("Bob0002").await.unwrap();
        f.signals.clear();

        assert!(f.core.disconnect_peer("Bob0002").await);
        assert_eq!(f.signals.kinds(), vec![MessageKind::CallEnd]);
        assert!(f.core.snapshot().links.is_empty());
        assert!(f.core.snapshot().call.is_none());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let mut f = fixture("Alice01");
        f.core.connect_peer("Bob0002").await.unwrap();
        let snapshot = f.core.snapshot();
        assert_eq!(snapshot.handle.as_deref(), Some("Alice01"));
        assert_eq!(snapshot.links.len(), 1);
        assert_eq!(snapshot.links[0].state, NegotiationState::Negotiating);
        assert!(snapshot.call.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_signals_call_end() {
        let mut f = fixture("Alice01");
        f.core.initiate("Bob0002").await.unwrap();
        f.signals.clear();

        f.core.shutdown().await;
        assert_eq!(f.signals.kinds(), vec![MessageKind::CallEnd]);
        assert!(f.core.links().is_empty());
        assert!(f.drain_events().iter().any(|e| matches!(
            e,
            ClientEvent::CallEnded {
                reason: CallEndReason::Shutdown,
                ..
            }
        )));
    }
}
