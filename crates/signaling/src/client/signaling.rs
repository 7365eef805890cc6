//! Relay connection (client side)
//!
//! [`SignalingClient`] keeps one WebSocket connection to the relay, matches
//! `registered` / `search-results` replies to the requests waiting for them and
//! hands every other inbound envelope to the state owner as a
//! [`SignalingEvent`].
//!
//! When the connection drops without [`SignalingClient::disconnect`] having
//! been called, one reconnection attempt is scheduled after the configured
//! fixed delay. A failed attempt counts as another loss and schedules the
//! next one, up to `max_reconnect_attempts`. Once reconnected, the handle we
//! held is registered again.

use crate::config::ClientConfig;
use crate::error::{ALREADY_REGISTERED_MESSAGE, HANDLE_TAKEN_MESSAGE, INVALID_HANDLE_MESSAGE};
use crate::protocol::{Envelope, Handle, MessageKind};
use crate::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound side of the relay channel as the state machines see it
pub trait SignalSender: Send + Sync {
    /// Queue an envelope for the relay
    fn send(&self, envelope: Envelope) -> Result<()>;

    /// Handle we are registered under, if any
    fn local_handle(&self) -> Option<Handle>;
}

/// What the relay connection reports to the state owner
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Relayed, presence or unsolicited error envelope
    Message(Envelope),
    /// Our registration was acknowledged
    Registered(Handle),
    /// Connection lost
    Disconnected,
    /// Reconnection attempt scheduled
    Reconnecting { attempt: u32 },
    /// Connection re-established; `handle` is set once it was re-claimed
    Reconnected { handle: Option<Handle> },
    /// Gave up reconnecting
    ReconnectFailed { attempts: u32 },
    /// The relay refused our handle after reconnecting
    RegistrationLost { reason: String },
}

struct PendingRegister {
    handle: Handle,
    reply: oneshot::Sender<Result<()>>,
}

struct PendingSearch {
    id: u64,
    reply: oneshot::Sender<Vec<Handle>>,
}

struct Shared {
    config: ClientConfig,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handle: Mutex<Option<Handle>>,
    pending_register: Mutex<Option<PendingRegister>>,
    pending_searches: Mutex<VecDeque<PendingSearch>>,
    next_search: AtomicU64,
    rejoining: Mutex<Option<Handle>>,
    closing: AtomicBool,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl Shared {
    fn new(config: ClientConfig, events: mpsc::UnboundedSender<SignalingEvent>) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            handle: Mutex::new(None),
            pending_register: Mutex::new(None),
            pending_searches: Mutex::new(VecDeque::new()),
            next_search: AtomicU64::new(0),
            rejoining: Mutex::new(None),
            closing: AtomicBool::new(false),
            events,
        }
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("Signaling event dropped, state owner gone");
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn send_frame(&self, msg: Message) -> Result<()> {
        match self.writer.lock().as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| Error::SignalingError("relay connection closed".to_string())),
            None => Err(Error::SignalingError("not connected to relay".to_string())),
        }
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send_frame(Message::Text(envelope.to_json()?))
    }

    /// Start the sender task for a fresh connection and return its read half
    fn install(&self, ws: WsStream) -> SplitStream<WsStream> {
        let (write, read) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(sender_task(write, rx));
        *self.writer.lock() = Some(tx);

        let rejoin = self.rejoining.lock().clone();
        if let Some(handle) = rejoin {
            if let Err(e) = self.send_envelope(&Envelope::register(&handle)) {
                warn!(handle = %handle, "Failed to queue re-registration: {}", e);
            }
        }
        read
    }

    fn connection_lost(&self) {
        *self.writer.lock() = None;
        // Dropping the reply senders fails the waiting requests
        self.pending_register.lock().take();
        self.pending_searches.lock().clear();
        self.rejoining.lock().take();
    }

    fn forget_search(&self, id: u64) {
        self.pending_searches.lock().retain(|search| search.id != id);
    }

    fn route(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed relay frame: {}", e);
                return;
            }
        };

        match envelope.kind {
            MessageKind::Registered => self.on_registered(envelope),
            MessageKind::SearchResults => {
                let mut results = envelope.results.unwrap_or_default();
                let mut pending = self.pending_searches.lock();
                // Skip requests whose caller already gave up
                loop {
                    let Some(search) = pending.pop_front() else {
                        debug!("Unsolicited search results ignored");
                        break;
                    };
                    match search.reply.send(results) {
                        Ok(()) => break,
                        Err(unclaimed) => results = unclaimed,
                    }
                }
            }
            MessageKind::Error => self.on_error(envelope),
            _ => self.emit(SignalingEvent::Message(envelope)),
        }
    }

    fn on_registered(&self, envelope: Envelope) {
        let Some(handle) = envelope.username else {
            warn!("registered ack without a handle");
            return;
        };

        let pending = {
            let mut slot = self.pending_register.lock();
            if slot.as_ref().is_some_and(|p| p.handle == handle) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(pending) = pending {
            info!(handle = %handle, "Registered with relay");
            *self.handle.lock() = Some(handle.clone());
            self.emit(SignalingEvent::Registered(handle));
            let _ = pending.reply.send(Ok(()));
            return;
        }

        let rejoined = {
            let mut slot = self.rejoining.lock();
            if slot.as_deref() == Some(handle.as_str()) {
                slot.take()
            } else {
                None
            }
        };
        if rejoined.is_some() {
            info!(handle = %handle, "Re-registered after reconnection");
            self.emit(SignalingEvent::Reconnected {
                handle: Some(handle),
            });
        } else {
            debug!(handle = %handle, "Unsolicited registered ack ignored");
        }
    }

    fn on_error(&self, envelope: Envelope) {
        let message = envelope.message.clone().unwrap_or_default();
        let about_registration = matches!(
            message.as_str(),
            HANDLE_TAKEN_MESSAGE | INVALID_HANDLE_MESSAGE | ALREADY_REGISTERED_MESSAGE
        );

        if about_registration {
            let pending = self.pending_register.lock().take();
            if let Some(pending) = pending {
                let err = match Error::from_relay_message(&message) {
                    Error::HandleTaken(_) => Error::HandleTaken(pending.handle.clone()),
                    other => other,
                };
                let _ = pending.reply.send(Err(err));
                return;
            }

            let rejoin = self.rejoining.lock().take();
            if let Some(handle) = rejoin {
                warn!(handle = %handle, "Could not re-claim handle: {}", message);
                *self.handle.lock() = None;
                self.emit(SignalingEvent::RegistrationLost { reason: message });
                return;
            }
        }

        self.emit(SignalingEvent::Message(envelope));
    }
}

/// Sender task: drains the outgoing queue into the socket
async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!("Failed to send relay frame: {}", e);
            break;
        }
        if closing {
            break;
        }
    }

    debug!("Sender task terminated");
}

async fn receive(shared: &Shared, mut read: SplitStream<WsStream>) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => shared.route(&text),
            Ok(Message::Ping(data)) => {
                let _ = shared.send_frame(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                info!("Relay closed the connection");
                break;
            }
            Err(e) => {
                error!("Relay connection error: {}", e);
                break;
            }
            _ => {}
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut read: SplitStream<WsStream>) {
    loop {
        receive(&shared, read).await;
        shared.connection_lost();

        if shared.is_closing() {
            debug!("Relay connection closed locally");
            break;
        }

        warn!("Relay connection lost");
        shared.emit(SignalingEvent::Disconnected);

        match reconnect(&shared).await {
            Some(next) => read = next,
            None => break,
        }
    }

    debug!("Signaling supervisor terminated");
}

async fn reconnect(shared: &Shared) -> Option<SplitStream<WsStream>> {
    let mut attempt: u32 = 0;
    loop {
        if let Some(max) = shared.config.max_reconnect_attempts {
            if attempt >= max {
                error!(attempts = attempt, "Giving up on relay reconnection");
                shared.emit(SignalingEvent::ReconnectFailed { attempts: attempt });
                return None;
            }
        }
        attempt += 1;

        info!(
            attempt,
            delay_ms = shared.config.reconnect_delay_ms,
            "Scheduling relay reconnection"
        );
        shared.emit(SignalingEvent::Reconnecting { attempt });
        tokio::time::sleep(shared.config.reconnect_delay()).await;
        if shared.is_closing() {
            return None;
        }

        match connect_async(shared.config.signaling_url.as_str()).await {
            Ok((ws, _)) => {
                let handle = shared.handle.lock().clone();
                *shared.rejoining.lock() = handle.clone();
                let read = shared.install(ws);
                match handle {
                    Some(handle) => info!(handle = %handle, "Reconnected, re-registering"),
                    None => {
                        info!("Reconnected to relay");
                        shared.emit(SignalingEvent::Reconnected { handle: None });
                    }
                }
                return Some(read);
            }
            Err(e) => warn!(attempt, "Relay reconnection failed: {}", e),
        }
    }
}

/// Client-side connection to the relay
#[derive(Clone)]
pub struct SignalingClient {
    shared: Arc<Shared>,
}

impl SignalingClient {
    /// Connect to the relay and start the background tasks
    ///
    /// Inbound traffic and connection changes are reported on `events`.
    pub async fn connect(
        config: ClientConfig,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Connecting to relay: {}", config.signaling_url);

        let (ws, _) = connect_async(config.signaling_url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;
        info!("Connected to relay");

        let shared = Arc::new(Shared::new(config, events));
        let read = shared.install(ws);
        tokio::spawn(supervise(Arc::clone(&shared), read));

        Ok(Self { shared })
    }

    /// Claim `handle`; resolves once the relay acknowledges it
    ///
    /// # Errors
    ///
    /// - [`Error::HandleTaken`] if another live channel holds the handle
    /// - [`Error::InvalidHandle`] if the relay rejects its shape
    /// - [`Error::AlreadyRegistered`] if this connection already holds another handle
    /// - [`Error::OperationTimeout`] if no reply arrives in time
    pub async fn register(&self, handle: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending_register.lock();
            if pending.is_some() {
                return Err(Error::SignalingError(
                    "registration already in progress".to_string(),
                ));
            }
            *pending = Some(PendingRegister {
                handle: handle.to_string(),
                reply,
            });
        }

        if let Err(e) = self.shared.send_envelope(&Envelope::register(handle)) {
            self.shared.pending_register.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.shared.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SignalingError(
                "relay connection lost during registration".to_string(),
            )),
            Err(_) => {
                self.shared.pending_register.lock().take();
                Err(Error::OperationTimeout(format!("register {}", handle)))
            }
        }
    }

    /// Handles currently online whose name contains `query`, ignoring case
    pub async fn search(&self, query: &str) -> Result<Vec<Handle>> {
        let (reply, rx) = oneshot::channel();
        let id = self.shared.next_search.fetch_add(1, Ordering::Relaxed);
        self.shared
            .pending_searches
            .lock()
            .push_back(PendingSearch { id, reply });

        if let Err(e) = self.shared.send_envelope(&Envelope::search(query)) {
            self.shared.forget_search(id);
            return Err(e);
        }

        match tokio::time::timeout(self.shared.config.request_timeout(), rx).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(_)) => Err(Error::SignalingError(
                "relay connection lost during search".to_string(),
            )),
            Err(_) => {
                self.shared.forget_search(id);
                Err(Error::OperationTimeout(format!("search {}", query)))
            }
        }
    }

    /// Handle we are registered under
    pub fn handle(&self) -> Option<Handle> {
        self.shared.handle.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.writer.lock().is_some()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Close the connection without scheduling a reconnection
    pub fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting from relay");
        let _ = self.shared.send_frame(Message::Close(None));
    }
}

impl SignalSender for SignalingClient {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.shared.send_envelope(&envelope)
    }

    fn local_handle(&self) -> Option<Handle> {
        self.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RECIPIENT_UNAVAILABLE_MESSAGE;

    struct Harness {
        client: SignalingClient,
        frames: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    }

    // A client wired to in-memory channels instead of a socket
    fn harness() -> Harness {
        harness_with(ClientConfig::default())
    }

    fn harness_with(config: ClientConfig) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(config, events_tx));
        let (tx, frames) = mpsc::unbounded_channel();
        *shared.writer.lock() = Some(tx);
        Harness {
            client: SignalingClient { shared },
            frames,
            events,
        }
    }

    impl Harness {
        fn route(&self, envelope: Envelope) {
            self.client.shared.route(&envelope.to_json().unwrap());
        }

        async fn next_frame(&mut self) -> Envelope {
            match self.frames.recv().await {
                Some(Message::Text(text)) => Envelope::parse(&text).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_register_resolves_on_ack() {
        let mut h = harness();
        let client = h.client.clone();
        let task = tokio::spawn(async move { client.register("Alice01").await });

        assert_eq!(h.next_frame().await, Envelope::register("Alice01"));
        h.route(Envelope::registered("Alice01"));

        task.await.unwrap().unwrap();
        assert_eq!(h.client.handle().as_deref(), Some("Alice01"));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            SignalingEvent::Registered(handle) if handle == "Alice01"
        ));
    }

    #[tokio::test]
    async fn test_register_handle_taken() {
        let mut h = harness();
        let client = h.client.clone();
        let task = tokio::spawn(async move { client.register("Alice01").await });

        h.next_frame().await;
        h.route(Envelope::error(HANDLE_TAKEN_MESSAGE));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::HandleTaken(handle) if handle == "Alice01"));
        assert_eq!(h.client.handle(), None);
    }

    #[tokio::test]
    async fn test_register_second_handle_is_refused() {
        let mut h = harness();
        let client = h.client.clone();
        let task = tokio::spawn(async move { client.register("Alice02").await });

        h.next_frame().await;
        h.route(Envelope::error(ALREADY_REGISTERED_MESSAGE));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_searches_resolve_in_order() {
        let mut h = harness();
        let first = {
            let client = h.client.clone();
            tokio::spawn(async move { client.search("bo").await })
        };
        assert_eq!(h.next_frame().await.query.as_deref(), Some("bo"));
        let second = {
            let client = h.client.clone();
            tokio::spawn(async move { client.search("zz").await })
        };
        assert_eq!(h.next_frame().await.query.as_deref(), Some("zz"));

        h.route(Envelope::search_results(vec!["Bob0002".to_string()]));
        h.route(Envelope::search_results(vec![]));

        assert_eq!(first.await.unwrap().unwrap(), vec!["Bob0002".to_string()]);
        assert!(second.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_search_does_not_swallow_next_results() {
        let mut h = harness_with(ClientConfig::default().with_request_timeout_ms(50));

        // the relay never answers the first search
        let err = h.client.search("aa").await.unwrap_err();
        assert!(matches!(err, Error::OperationTimeout(_)));
        assert_eq!(h.next_frame().await.query.as_deref(), Some("aa"));
        assert!(h.client.shared.pending_searches.lock().is_empty());

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.search("bo").await });
        assert_eq!(h.next_frame().await.query.as_deref(), Some("bo"));
        h.route(Envelope::search_results(vec!["Bob0002".to_string()]));

        assert_eq!(task.await.unwrap().unwrap(), vec!["Bob0002".to_string()]);
    }

    #[tokio::test]
    async fn test_results_skip_abandoned_search() {
        let mut h = harness();
        let (stale, stale_rx) = oneshot::channel();
        drop(stale_rx);
        h.client
            .shared
            .pending_searches
            .lock()
            .push_back(PendingSearch { id: 99, reply: stale });

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.search("bo").await });
        h.next_frame().await;
        h.route(Envelope::search_results(vec!["Bob0002".to_string()]));

        assert_eq!(task.await.unwrap().unwrap(), vec!["Bob0002".to_string()]);
        assert!(h.client.shared.pending_searches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_register_timeout_allows_retry() {
        let mut h = harness_with(ClientConfig::default().with_request_timeout_ms(50));

        let err = h.client.register("Alice01").await.unwrap_err();
        assert!(matches!(err, Error::OperationTimeout(_)));
        assert!(h.client.shared.pending_register.lock().is_none());
        h.next_frame().await;

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.register("Alice01").await });
        assert_eq!(h.next_frame().await, Envelope::register("Alice01"));
        h.route(Envelope::registered("Alice01"));

        task.await.unwrap().unwrap();
        assert_eq!(h.client.handle().as_deref(), Some("Alice01"));
    }

    #[tokio::test]
    async fn test_forward_error_is_reported_as_message() {
        let mut h = harness();
        h.route(Envelope::error(RECIPIENT_UNAVAILABLE_MESSAGE));
        match h.events.try_recv().unwrap() {
            SignalingEvent::Message(envelope) => {
                assert_eq!(envelope.kind, MessageKind::Error);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relayed_messages_pass_through() {
        let mut h = harness();
        let offer = Envelope::relayed(MessageKind::Offer, "Bob0002", None).stamped("Alice01");
        h.route(offer.clone());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            SignalingEvent::Message(envelope) if envelope == offer
        ));
    }

    #[tokio::test]
    async fn test_rejoin_ack_reports_reconnected() {
        let mut h = harness();
        *h.client.shared.rejoining.lock() = Some("Alice01".to_string());
        h.route(Envelope::registered("Alice01"));
        assert!(matches!(
            h.events.try_recv().unwrap(),
            SignalingEvent::Reconnected { handle: Some(handle) } if handle == "Alice01"
        ));
    }

    #[tokio::test]
    async fn test_rejoin_refused_clears_handle() {
        let mut h = harness();
        *h.client.shared.handle.lock() = Some("Alice01".to_string());
        *h.client.shared.rejoining.lock() = Some("Alice01".to_string());
        h.route(Envelope::error(HANDLE_TAKEN_MESSAGE));

        assert_eq!(h.client.handle(), None);
        assert!(matches!(
            h.events.try_recv().unwrap(),
            SignalingEvent::RegistrationLost { .. }
        ));
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending_requests() {
        let mut h = harness();
        let client = h.client.clone();
        let task = tokio::spawn(async move { client.search("bo").await });
        h.next_frame().await;

        h.client.shared.connection_lost();
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::SignalingError(_))
        ));
        assert!(!h.client.is_connected());
        assert!(h.client.send(Envelope::search("x")).is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = SignalingClient::connect(ClientConfig::new("http://nope"), tx).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
