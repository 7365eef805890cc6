//! Per-remote-handle link table
//!
//! [`LinkManager`] turns local connect requests and inbound offer / answer /
//! candidate payloads into at most one [`PeerLink`] per remote handle. It is
//! owned by the client's state owner and is never shared, so every method
//! takes `&mut self`.

use super::link::{LinkInfo, NegotiationState, PeerLink};
use super::transport::{
    LinkId, PeerTransport, PeerTransportFactory, Role, TransportEnvelope, TransportEvent,
    TransportEventSender, TransportState,
};
use crate::call::media::MediaTrack;
use crate::client::events::{ClientEvent, EventSink};
use crate::client::signaling::SignalSender;
use crate::protocol::{Envelope, Handle, MessageKind};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// What a transport event means for layers above the link table
#[derive(Debug)]
pub enum LinkOutcome {
    /// The link is gone; `failed` distinguishes a broken transport from a
    /// clean close
    Closed { remote: Handle, failed: bool },
    /// Remote media arrived on the link
    RemoteTrack {
        remote: Handle,
        track: Arc<dyn MediaTrack>,
    },
}

/// Owner of every Peer Link of one client
pub struct LinkManager {
    factory: Arc<dyn PeerTransportFactory>,
    ice_servers: Vec<String>,
    signals: Arc<dyn SignalSender>,
    events: EventSink,
    transport_tx: mpsc::UnboundedSender<TransportEnvelope>,
    links: HashMap<Handle, PeerLink>,
    next_id: u64,
}

impl LinkManager {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        ice_servers: Vec<String>,
        signals: Arc<dyn SignalSender>,
        events: EventSink,
        transport_tx: mpsc::UnboundedSender<TransportEnvelope>,
    ) -> Self {
        Self {
            factory,
            ice_servers,
            signals,
            events,
            transport_tx,
            links: HashMap::new(),
            next_id: 0,
        }
    }

    async fn create_link(
        &mut self,
        remote: &str,
        role: Role,
    ) -> Result<(LinkId, Arc<dyn PeerTransport>)> {
        self.next_id += 1;
        let id = LinkId(self.next_id);
        let sender = TransportEventSender::new(remote, id, self.transport_tx.clone());
        let transport = self
            .factory
            .create(remote, role, &self.ice_servers, sender)
            .await?;

        self.links.insert(
            remote.to_string(),
            PeerLink::new(remote, role, id, Arc::clone(&transport)),
        );
        debug!(remote, ?role, link = %id, "Peer link created");
        self.events.emit(ClientEvent::LinkStateChanged {
            remote: remote.to_string(),
            state: NegotiationState::Negotiating,
        });
        Ok((id, transport))
    }

    /// Start negotiating with `remote`, or return the link that already exists
    pub async fn connect(&mut self, remote: &str) -> Result<LinkId> {
        if let Some(link) = self.links.get(remote) {
            debug!(remote, state = ?link.state(), "Link already exists");
            return Ok(link.id());
        }

        info!(remote, "Starting negotiation");
        let (id, transport) = self.create_link(remote, Role::Initiator).await?;

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(remote, &e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .signals
            .send(Envelope::relayed(MessageKind::Offer, remote, Some(offer)))
        {
            self.fail(remote, &e.to_string()).await;
            return Err(e);
        }
        Ok(id)
    }

    /// Apply an inbound offer and answer it
    ///
    /// When both sides offered at once, the side whose handle sorts lower keeps
    /// its own offer and ignores the inbound one; the other side drops its
    /// pending link and answers.
    pub async fn handle_offer(&mut self, from: &str, offer: Value) -> Result<()> {
        let local = self.signals.local_handle();
        let existing = self
            .links
            .get(from)
            .map(|l| (l.is_pending_offer(), l.transport()));

        let transport = match existing {
            Some((true, _)) if local.as_deref().is_some_and(|local| local < from) => {
                info!(remote = from, "Simultaneous offers, keeping ours");
                return Ok(());
            }
            Some((true, _)) => {
                info!(remote = from, "Simultaneous offers, answering theirs");
                self.discard(from).await;
                self.create_link(from, Role::Responder).await?.1
            }
            Some((false, transport)) => {
                debug!(remote = from, "Offer on existing link, renegotiating");
                transport
            }
            None => {
                info!(remote = from, "Inbound negotiation");
                self.create_link(from, Role::Responder).await?.1
            }
        };

        let answer = match transport.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(remote = from, "Failed to apply offer: {}", e);
                self.fail(from, &e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .signals
            .send(Envelope::relayed(MessageKind::Answer, from, Some(answer)))
        {
            self.fail(from, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Apply the remote answer to our offer
    pub async fn handle_answer(&mut self, from: &str, answer: Value) -> Result<()> {
        let Some(transport) = self.links.get(from).map(|l| l.transport()) else {
            return Err(Error::NegotiationError(format!(
                "answer from {} without a pending offer",
                from
            )));
        };

        if let Err(e) = transport.apply_answer(answer).await {
            warn!(remote = from, "Failed to apply answer: {}", e);
            self.fail(from, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Apply a remote connectivity candidate
    ///
    /// Candidates for a link that no longer exists are ignored.
    pub async fn handle_candidate(&mut self, from: &str, candidate: Value) -> Result<()> {
        let Some(transport) = self.links.get(from).map(|l| l.transport()) else {
            debug!(remote = from, "Candidate for unknown link ignored");
            return Ok(());
        };

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!(remote = from, "Failed to apply candidate: {}", e);
            self.fail(from, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Fold a transport event into link state
    ///
    /// Events from a link generation that has since been replaced are dropped.
    pub async fn on_transport_event(&mut self, envelope: TransportEnvelope) -> Option<LinkOutcome> {
        let TransportEnvelope {
            remote,
            link,
            event,
        } = envelope;

        if self.links.get(&remote).map(|l| l.id()) != Some(link) {
            trace!(remote = %remote, link = %link, "Stale transport event dropped");
            return None;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signals.send(Envelope::relayed(
                    MessageKind::IceCandidate,
                    &remote,
                    Some(candidate),
                )) {
                    debug!(remote = %remote, "Failed to relay local candidate: {}", e);
                }
                None
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if let Some(link) = self.links.get_mut(&remote) {
                    if link.mark_established() {
                        info!(remote = %remote, role = ?link.role(), "Peer link established");
                        self.events.emit(ClientEvent::LinkStateChanged {
                            remote: remote.clone(),
                            state: NegotiationState::Established,
                        });
                    } else if link.mark_restored() {
                        info!(remote = %remote, "Peer link restored");
                        self.events.emit(ClientEvent::LinkRestored { remote });
                    }
                }
                None
            }
            TransportEvent::StateChanged(TransportState::Disconnected) => {
                if let Some(link) = self.links.get_mut(&remote) {
                    if link.mark_interrupted() {
                        warn!(remote = %remote, "Peer link interrupted");
                        self.events.emit(ClientEvent::LinkDisconnected { remote });
                    }
                }
                None
            }
            TransportEvent::StateChanged(TransportState::Failed) => {
                self.fail(&remote, "transport failed").await;
                Some(LinkOutcome::Closed {
                    remote,
                    failed: true,
                })
            }
            TransportEvent::StateChanged(TransportState::Closed) => {
                self.close(&remote).await;
                Some(LinkOutcome::Closed {
                    remote,
                    failed: false,
                })
            }
            TransportEvent::StateChanged(state) => {
                debug!(remote = %remote, ?state, "Transport state");
                None
            }
            TransportEvent::NegotiationNeeded => {
                self.renegotiate(&remote).await;
                None
            }
            TransportEvent::DataChannelOpen => {
                debug!(remote = %remote, "Data channel open");
                self.events.emit(ClientEvent::DataChannelOpen { remote });
                None
            }
            TransportEvent::DataChannelClosed => {
                debug!(remote = %remote, "Data channel closed");
                None
            }
            TransportEvent::DataMessage(message) => {
                self.events.emit(ClientEvent::DataMessage {
                    from: remote,
                    message,
                });
                None
            }
            TransportEvent::RemoteTrack(track) => Some(LinkOutcome::RemoteTrack { remote, track }),
        }
    }

    async fn renegotiate(&mut self, remote: &str) {
        let Some(transport) = self
            .links
            .get(remote)
            .filter(|l| l.is_established())
            .map(|l| l.transport())
        else {
            return;
        };

        debug!(remote, "Renegotiating");
        let result = match transport.create_offer().await {
            Ok(offer) => self
                .signals
                .send(Envelope::relayed(MessageKind::Offer, remote, Some(offer))),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(remote, "Renegotiation failed: {}", e);
            self.fail(remote, &e.to_string()).await;
        }
    }

    /// Send a message on the link's data sub-channel
    pub async fn send_data(&self, remote: &str, message: &Value) -> Result<()> {
        let Some(link) = self.links.get(remote) else {
            return Err(Error::TransportFailure(format!("no link to {}", remote)));
        };
        let transport = link.transport();
        if !transport.is_data_channel_open() {
            return Err(Error::TransportFailure(format!(
                "data channel to {} is not open",
                remote
            )));
        }
        transport.send_data(message).await
    }

    /// Tear down the link to `remote`; false if there was none
    pub async fn close(&mut self, remote: &str) -> bool {
        let Some(link) = self.links.remove(remote) else {
            return false;
        };

        info!(remote, link = %link.id(), "Closing peer link");
        if let Err(e) = link.transport().close().await {
            warn!(remote, "Error closing transport: {}", e);
        }
        self.events.emit(ClientEvent::LinkStateChanged {
            remote: remote.to_string(),
            state: NegotiationState::Closed,
        });
        true
    }

    /// Close every link, returning the remotes that had one
    pub async fn close_all(&mut self) -> Vec<Handle> {
        let remotes: Vec<Handle> = self.links.keys().cloned().collect();
        for remote in &remotes {
            self.close(remote).await;
        }
        remotes
    }

    async fn fail(&mut self, remote: &str, reason: &str) {
        if self.links.contains_key(remote) {
            warn!(remote, reason, "Peer link failed");
            self.events.emit(ClientEvent::LinkFailed {
                remote: remote.to_string(),
                reason: reason.to_string(),
            });
            self.close(remote).await;
        }
    }

    // Drop a pending link without reporting it closed
    async fn discard(&mut self, remote: &str) {
        if let Some(link) = self.links.remove(remote) {
            if let Err(e) = link.transport().close().await {
                debug!(remote, "Error closing discarded transport: {}", e);
            }
        }
    }

    pub fn get(&self, remote: &str) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn transport(&self, remote: &str) -> Option<Arc<dyn PeerTransport>> {
        self.links.get(remote).map(|l| l.transport())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Link summaries sorted by remote handle
    pub fn infos(&self) -> Vec<LinkInfo> {
        let mut infos: Vec<LinkInfo> = self.links.values().map(|l| l.info()).collect();
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransportFactory, RecordingSignals};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        manager: LinkManager,
        factory: Arc<FakeTransportFactory>,
        signals: Arc<RecordingSignals>,
        transport_rx: UnboundedReceiver<TransportEnvelope>,
        events: UnboundedReceiver<ClientEvent>,
    }

    fn fixture(local: &str) -> Fixture {
        let factory = Arc::new(FakeTransportFactory::new());
        let signals = Arc::new(RecordingSignals::registered(local));
        let (sink, events) = EventSink::channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let manager = LinkManager::new(
            factory.clone(),
            vec![],
            signals.clone(),
            sink,
            transport_tx,
        );
        Fixture {
            manager,
            factory,
            signals,
            transport_rx,
            events,
        }
    }

    impl Fixture {
        async fn pump(&mut self) -> Vec<LinkOutcome> {
            let mut outcomes = Vec::new();
            while let Ok(envelope) = self.transport_rx.try_recv() {
                if let Some(outcome) = self.manager.on_transport_event(envelope).await {
                    outcomes.push(outcome);
                }
            }
            outcomes
        }
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut f = fixture("Alice01");
        let first = f.manager.connect("Bob0002").await.unwrap();
        let second = f.manager.connect("Bob0002").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.factory.created(), 1);
        assert_eq!(f.signals.kinds(), vec![MessageKind::Offer]);
        assert_eq!(f.signals.sent()[0].to.as_deref(), Some("Bob0002"));
    }

    #[tokio::test]
    async fn test_inbound_offer_answers_as_responder() {
        let mut f = fixture("Bob0002");
        f.manager
            .handle_offer("Alice01", json!({"sdp": "P"}))
            .await
            .unwrap();

        let link = f.manager.get("Alice01").unwrap();
        assert_eq!(link.role(), Role::Responder);
        assert_eq!(f.signals.kinds(), vec![MessageKind::Answer]);

        f.pump().await;
        assert!(f.manager.get("Alice01").unwrap().is_established());
    }

    #[tokio::test]
    async fn test_answer_establishes_initiator() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        f.manager
            .handle_answer("Bob0002", json!({"sdp": "A"}))
            .await
            .unwrap();
        f.pump().await;

        assert!(f.manager.get("Bob0002").unwrap().is_established());
        let states: Vec<NegotiationState> = std::iter::from_fn(|| f.events.try_recv().ok())
            .filter_map(|e| match e {
                ClientEvent::LinkStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![NegotiationState::Negotiating, NegotiationState::Established]
        );
    }

    #[tokio::test]
    async fn test_glare_lower_handle_keeps_its_offer() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        f.manager
            .handle_offer("Bob0002", json!({"sdp": "B"}))
            .await
            .unwrap();

        assert_eq!(f.manager.get("Bob0002").unwrap().role(), Role::Initiator);
        assert_eq!(f.signals.kinds(), vec![MessageKind::Offer]);
        assert_eq!(f.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_glare_higher_handle_yields() {
        let mut f = fixture("Bob0002");
        f.manager.connect("Alice01").await.unwrap();
        let pending = f.factory.transport("Alice01").unwrap();

        f.manager
            .handle_offer("Alice01", json!({"sdp": "A"}))
            .await
            .unwrap();

        assert!(pending.is_closed());
        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.manager.get("Alice01").unwrap().role(), Role::Responder);
        assert_eq!(
            f.signals.kinds(),
            vec![MessageKind::Offer, MessageKind::Answer]
        );
    }

    #[tokio::test]
    async fn test_failed_offer_application_closes_link() {
        let mut f = fixture("Bob0002");
        f.factory.fail_negotiation(true);
        let err = f
            .manager
            .handle_offer("Alice01", json!({"sdp": "bad"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NegotiationError(_)));
        assert!(f.manager.get("Alice01").is_none());
        assert!(f.signals.sent().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_are_relayed() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        f.factory
            .transport("Bob0002")
            .unwrap()
            .emit_candidate(json!({"candidate": "c1"}));
        f.pump().await;

        let sent = f.signals.sent();
        assert_eq!(sent[1].kind, MessageKind::IceCandidate);
        assert_eq!(sent[1].payload, Some(json!({"candidate": "c1"})));
    }

    #[tokio::test]
    async fn test_transport_failure_removes_link() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        f.manager
            .handle_answer("Bob0002", json!({"sdp": "A"}))
            .await
            .unwrap();
        f.pump().await;

        let transport = f.factory.transport("Bob0002").unwrap();
        transport.fail();
        let outcomes = f.pump().await;

        assert!(matches!(
            outcomes.as_slice(),
            [LinkOutcome::Closed { failed: true, .. }]
        ));
        assert!(f.manager.get("Bob0002").is_none());
        assert!(transport.is_closed());

        // a fresh negotiation starts clean
        f.manager.connect("Bob0002").await.unwrap();
        assert_eq!(f.factory.created(), 2);
    }

    #[tokio::test]
    async fn test_transient_disconnect_is_reported_and_restored() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        f.manager
            .handle_answer("Bob0002", json!({"sdp": "A"}))
            .await
            .unwrap();
        f.pump().await;
        while f.events.try_recv().is_ok() {}

        let transport = f.factory.transport("Bob0002").unwrap();
        transport.interrupt();
        transport.interrupt();
        assert!(f.pump().await.is_empty());
        assert!(f.manager.get("Bob0002").unwrap().is_interrupted());

        transport.restore();
        assert!(f.pump().await.is_empty());

        let events: Vec<ClientEvent> = std::iter::from_fn(|| f.events.try_recv().ok()).collect();
        assert!(matches!(
            events.as_slice(),
            [
                ClientEvent::LinkDisconnected { remote: a },
                ClientEvent::LinkRestored { remote: b },
            ] if a == "Bob0002" && b == "Bob0002"
        ));
        let link = f.manager.get("Bob0002").unwrap();
        assert!(link.is_established());
        assert!(!link.is_interrupted());
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        let old = f.factory.transport("Bob0002").unwrap();
        f.manager.close("Bob0002").await;
        f.manager.connect("Bob0002").await.unwrap();
        f.pump().await;

        old.fail();
        assert!(f.pump().await.is_empty());
        assert!(f.manager.get("Bob0002").is_some());
    }

    #[tokio::test]
    async fn test_send_data_requires_open_channel() {
        let mut f = fixture("Alice01");
        let err = f.manager.send_data("Bob0002", &json!("hi")).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailure(_)));

        f.manager.connect("Bob0002").await.unwrap();
        let err = f.manager.send_data("Bob0002", &json!("hi")).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailure(_)));

        f.manager
            .handle_answer("Bob0002", json!({"sdp": "A"}))
            .await
            .unwrap();
        f.pump().await;
        f.manager.send_data("Bob0002", &json!("hi")).await.unwrap();
        assert_eq!(
            f.factory.transport("Bob0002").unwrap().sent_data(),
            vec![json!("hi")]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut f = fixture("Alice01");
        f.manager.connect("Bob0002").await.unwrap();
        assert!(f.manager.close("Bob0002").await);
        assert!(!f.manager.close("Bob0002").await);
        assert!(f.manager.is_empty());
    }
}
