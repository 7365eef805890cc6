//! In-memory fakes for the external collaborators
//!
//! Compiled for unit tests and, behind the `test-util` feature, for
//! integration tests and embedders that want to exercise the state machines
//! without a real peer-connection or capture stack.
//!
//! - [`RecordingSignals`] records every envelope instead of sending it.
//! - [`FakeTransport`] reports `Connected` plus an open data sub-channel as
//!   soon as an offer or answer is applied.
//! - [`FakeMediaDevices`] hands out single-track streams and can be told to
//!   refuse with a DOM-style error name.

use crate::call::media::{
    capture_error, MediaDevices, MediaEventSender, MediaStream, MediaTrack, TrackKind,
};
use crate::client::signaling::SignalSender;
use crate::peer::transport::{
    PeerTransport, PeerTransportFactory, Role, TransportEvent, TransportEventSender,
    TransportState,
};
use crate::protocol::{Envelope, Handle, MessageKind};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Signal sender that keeps what it was asked to send
#[derive(Debug, Default)]
pub struct RecordingSignals {
    handle: Mutex<Option<Handle>>,
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSignals {
    /// Not registered under any handle
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(handle: &str) -> Self {
        let signals = Self::default();
        *signals.handle.lock() = Some(handle.to_string());
        signals
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.sent.lock().iter().map(|e| e.kind).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl SignalSender for RecordingSignals {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.sent.lock().push(envelope);
        Ok(())
    }

    fn local_handle(&self) -> Option<Handle> {
        self.handle.lock().clone()
    }
}

/// Peer transport that connects instantly
pub struct FakeTransport {
    remote: Handle,
    role: Role,
    events: TransportEventSender,
    fail_negotiation: Arc<AtomicBool>,
    data_open: AtomicBool,
    closed: AtomicBool,
    candidates: Mutex<Vec<Value>>,
    tracks: Mutex<Vec<String>>,
    sent_data: Mutex<Vec<Value>>,
}

impl FakeTransport {
    pub fn new(remote: &str, role: Role, events: TransportEventSender) -> Self {
        Self::with_failure_flag(remote, role, events, Arc::new(AtomicBool::new(false)))
    }

    fn with_failure_flag(
        remote: &str,
        role: Role,
        events: TransportEventSender,
        fail_negotiation: Arc<AtomicBool>,
    ) -> Self {
        Self {
            remote: remote.to_string(),
            role,
            events,
            fail_negotiation,
            data_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            sent_data: Mutex::new(Vec::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Candidates applied from the remote
    pub fn candidates(&self) -> Vec<Value> {
        self.candidates.lock().clone()
    }

    /// Ids of the local tracks currently being sent
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn sent_data(&self) -> Vec<Value> {
        self.sent_data.lock().clone()
    }

    /// Report a locally gathered candidate
    pub fn emit_candidate(&self, candidate: Value) {
        self.events.send(TransportEvent::LocalCandidate(candidate));
    }

    /// Report an inbound data sub-channel message
    pub fn deliver_data(&self, message: Value) {
        self.events.send(TransportEvent::DataMessage(message));
    }

    /// Report remote media
    pub fn deliver_track(&self, track: Arc<dyn MediaTrack>) {
        self.events.send(TransportEvent::RemoteTrack(track));
    }

    /// Ask for a fresh offer/answer round
    pub fn request_renegotiation(&self) {
        self.events.send(TransportEvent::NegotiationNeeded);
    }

    /// Lose connectivity without failing; [`restore`](Self::restore) brings it back
    pub fn interrupt(&self) {
        self.events
            .send(TransportEvent::StateChanged(TransportState::Disconnected));
    }

    pub fn restore(&self) {
        self.events
            .send(TransportEvent::StateChanged(TransportState::Connected));
    }

    /// Break the connection
    pub fn fail(&self) {
        self.data_open.store(false, Ordering::SeqCst);
        self.events
            .send(TransportEvent::StateChanged(TransportState::Failed));
    }

    fn check_negotiation(&self, what: &str) -> Result<()> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(Error::NegotiationError(format!(
                "fake {} refused for {}",
                what, self.remote
            )));
        }
        if self.is_closed() {
            return Err(Error::TransportFailure(format!(
                "transport to {} is closed",
                self.remote
            )));
        }
        Ok(())
    }

    fn connect(&self) {
        self.data_open.store(true, Ordering::SeqCst);
        self.events
            .send(TransportEvent::StateChanged(TransportState::Connected));
        self.events.send(TransportEvent::DataChannelOpen);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<Value> {
        self.check_negotiation("offer")?;
        Ok(json!({ "type": "offer", "sdp": format!("fake-offer-{}", self.remote) }))
    }

    async fn accept_offer(&self, _offer: Value) -> Result<Value> {
        self.check_negotiation("answer")?;
        self.connect();
        Ok(json!({ "type": "answer", "sdp": format!("fake-answer-{}", self.remote) }))
    }

    async fn apply_answer(&self, _answer: Value) -> Result<()> {
        self.check_negotiation("answer")?;
        self.connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        self.tracks.lock().push(track.id().to_string());
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.tracks.lock().retain(|id| id != track_id);
        Ok(())
    }

    async fn send_data(&self, message: &Value) -> Result<()> {
        if !self.is_data_channel_open() {
            return Err(Error::TransportFailure(format!(
                "data channel to {} is not open",
                self.remote
            )));
        }
        self.sent_data.lock().push(message.clone());
        Ok(())
    }

    fn is_data_channel_open(&self) -> bool {
        self.data_open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.data_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that keeps every transport it created
#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<(Handle, Arc<FakeTransport>)>>,
    fail_negotiation: Arc<AtomicBool>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every offer/answer step fail with a negotiation error
    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Number of transports created so far
    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recent transport created for `remote`
    pub fn transport(&self, remote: &str) -> Option<Arc<FakeTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(r, _)| r == remote)
            .map(|(_, t)| Arc::clone(t))
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        remote: &str,
        role: Role,
        _ice_servers: &[String],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport::with_failure_flag(
            remote,
            role,
            events,
            Arc::clone(&self.fail_negotiation),
        ));
        self.created
            .lock()
            .push((remote.to_string(), Arc::clone(&transport)));
        Ok(transport)
    }
}

/// Track with observable enabled/stopped flags
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Single-track stream that counts how often it was stopped
#[derive(Debug)]
pub struct FakeStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
    stops: AtomicUsize,
    events: Option<MediaEventSender>,
}

impl FakeStream {
    fn new(id: String, kind: TrackKind, events: Option<MediaEventSender>) -> Self {
        let track: Arc<dyn MediaTrack> = Arc::new(FakeTrack::new(&format!("{}-track", id), kind));
        Self {
            id,
            tracks: vec![track],
            stops: AtomicUsize::new(0),
            events,
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Simulate the user ending the capture from outside the client
    pub fn end_capture(&self) -> bool {
        match &self.events {
            Some(events) => events.capture_ended(&self.id),
            None => false,
        }
    }
}

impl MediaStream for FakeStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.clone()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture devices that grant or refuse on demand
#[derive(Default)]
pub struct FakeMediaDevices {
    microphone_failure: Mutex<Option<String>>,
    screen_failure: Mutex<Option<String>>,
    microphones: Mutex<Vec<Arc<FakeStream>>>,
    screens: Mutex<Vec<Arc<FakeStream>>>,
    microphone_requests: AtomicUsize,
    screen_requests: AtomicUsize,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse microphone requests with the given error name (`None` grants)
    pub fn fail_microphone(&self, name: Option<&str>) {
        *self.microphone_failure.lock() = name.map(str::to_string);
    }

    /// Refuse screen requests with the given error name (`None` grants)
    pub fn fail_screen(&self, name: Option<&str>) {
        *self.screen_failure.lock() = name.map(str::to_string);
    }

    pub fn microphone_requests(&self) -> usize {
        self.microphone_requests.load(Ordering::SeqCst)
    }

    pub fn screen_requests(&self) -> usize {
        self.screen_requests.load(Ordering::SeqCst)
    }

    /// Granted microphone streams, oldest first
    pub fn microphones(&self) -> Vec<Arc<FakeStream>> {
        self.microphones.lock().clone()
    }

    /// Granted screen streams, oldest first
    pub fn screens(&self) -> Vec<Arc<FakeStream>> {
        self.screens.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire_microphone(&self) -> Result<Arc<dyn MediaStream>> {
        let n = self.microphone_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(name) = self.microphone_failure.lock().clone() {
            return Err(capture_error(&name, "fake microphone refused"));
        }
        let stream = Arc::new(FakeStream::new(format!("mic-{}", n), TrackKind::Audio, None));
        self.microphones.lock().push(Arc::clone(&stream));
        Ok(stream)
    }

    async fn acquire_screen(&self, events: MediaEventSender) -> Result<Arc<dyn MediaStream>> {
        let n = self.screen_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(name) = self.screen_failure.lock().clone() {
            return Err(capture_error(&name, "fake screen capture refused"));
        }
        let stream = Arc::new(FakeStream::new(
            format!("screen-{}", n),
            TrackKind::Video,
            Some(events),
        ));
        self.screens.lock().push(Arc::clone(&stream));
        Ok(stream)
    }
}
