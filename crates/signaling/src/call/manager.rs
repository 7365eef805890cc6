//! Call lifecycle state machine
//!
//! Transitions (local action or inbound signal):
//!
//! ```text
//! none      initiate(remote)      -> calling   acquire mic, send call-offer
//! none      call-offer(from)      -> incoming
//! calling   call-answer(from)     -> active    record start time
//! calling   call-reject(from)     -> none      release mic
//! incoming  accept(remote)        -> active    acquire mic, send call-answer
//! incoming  reject(remote)        -> none      send call-reject
//! active    end() / call-end      -> none      send call-end if local, release
//! active    link failure          -> none      release
//! any       call-end(from)        -> none      release
//! calling   call-offer(remote)    -> active    only on the higher handle:
//!                                              send call-answer
//! ```
//!
//! When both sides call each other at once, the lower handle keeps its
//! outgoing call and waits for the answer; the higher handle answers the
//! inbound offer with the microphone it already holds.
//!
//! Captured streams are held in `Option`s and released with `take()`, so a
//! local end racing an inbound call-end releases once and signals once.

use super::media::{MediaDevices, MediaEventSender, MediaStream, MediaTrack};
use super::session::{CallSession, CallStatus};
use crate::client::events::{CallEndReason, ClientEvent, EventSink};
use crate::client::signaling::SignalSender;
use crate::peer::manager::LinkManager;
use crate::peer::transport::LinkId;
use crate::protocol::{Envelope, MessageKind};
use crate::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owner of the client's single call session
pub struct CallManager {
    media: Arc<dyn MediaDevices>,
    media_events: MediaEventSender,
    signals: Arc<dyn SignalSender>,
    events: EventSink,
    session: Option<CallSession>,
    microphone: Option<Arc<dyn MediaStream>>,
    // link generation the microphone tracks were added to
    microphone_link: Option<LinkId>,
    screen: Option<Arc<dyn MediaStream>>,
    // remote media that arrived before the call went active
    pending_tracks: Vec<Arc<dyn MediaTrack>>,
}

impl CallManager {
    pub fn new(
        media: Arc<dyn MediaDevices>,
        media_events: MediaEventSender,
        signals: Arc<dyn SignalSender>,
        events: EventSink,
    ) -> Self {
        Self {
            media,
            media_events,
            signals,
            events,
            session: None,
            microphone: None,
            microphone_link: None,
            screen: None,
            pending_tracks: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(CallStatus::None)
    }

    fn signal(&self, kind: MessageKind, remote: &str) -> Result<()> {
        let payload = match kind {
            MessageKind::CallOffer | MessageKind::CallAnswer => Some(json!({})),
            _ => None,
        };
        self.signals.send(Envelope::relayed(kind, remote, payload))
    }

    fn state_changed(&self) {
        if let Some(session) = &self.session {
            self.events.emit(ClientEvent::CallStateChanged {
                remote: session.remote.clone(),
                status: session.status,
            });
        }
    }

    async fn attach(
        &self,
        links: &LinkManager,
        remote: &str,
        tracks: Vec<Arc<dyn MediaTrack>>,
    ) -> Result<LinkId> {
        let Some((id, transport)) = links.get(remote).map(|l| (l.id(), l.transport())) else {
            return Err(Error::TransportFailure(format!("no link to {}", remote)));
        };
        for track in tracks {
            transport.add_track(track).await?;
        }
        Ok(id)
    }

    /// Call `remote`
    ///
    /// Makes sure a link exists, acquires the microphone and sends
    /// `call-offer`. Any failure leaves the status at `none`.
    pub async fn initiate(&mut self, links: &mut LinkManager, remote: &str) -> Result<()> {
        if let Some(session) = &self.session {
            return Err(Error::CallInProgress(session.remote.clone()));
        }

        links.connect(remote).await?;
        self.session = Some(CallSession::calling(remote));

        let stream = match self.media.acquire_microphone().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(remote, "Microphone unavailable, call aborted: {}", e);
                self.session = None;
                return Err(e);
            }
        };
        self.microphone = Some(Arc::clone(&stream));

        let sent = match self.attach(links, remote, stream.audio_tracks()).await {
            Ok(link) => {
                self.microphone_link = Some(link);
                self.signal(MessageKind::CallOffer, remote)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(remote, "Call setup failed: {}", e);
            self.release(links).await;
            self.session = None;
            return Err(e);
        }

        info!(remote, "Calling");
        self.state_changed();
        Ok(())
    }

    /// Inbound `call-offer`
    pub async fn on_call_offer(&mut self, links: &LinkManager, from: &str) {
        let crossed = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_with(from) && s.status == CallStatus::Calling);
        if crossed {
            self.on_crossed_offer(links, from).await;
            return;
        }

        match &self.session {
            Some(session) if session.is_with(from) => {
                debug!(from, status = ?session.status, "Repeated call-offer ignored");
            }
            Some(session) => {
                info!(from, current = %session.remote, "Busy, declining call");
                if let Err(e) = self.signal(MessageKind::CallReject, from) {
                    warn!(from, "Failed to send busy reject: {}", e);
                }
                self.events.emit(ClientEvent::CallBusyRejected {
                    from: from.to_string(),
                });
            }
            None => {
                info!(from, "Incoming call");
                self.session = Some(CallSession::incoming(from));
                self.events.emit(ClientEvent::IncomingCall {
                    from: from.to_string(),
                });
                self.state_changed();
            }
        }
    }

    // Both sides are calling each other
    async fn on_crossed_offer(&mut self, links: &LinkManager, from: &str) {
        let keeps_own = self
            .signals
            .local_handle()
            .map_or(true, |local| local.as_str() < from);
        if keeps_own {
            info!(from, "Simultaneous calls, keeping ours");
            return;
        }

        info!(from, "Simultaneous calls, answering theirs");
        // a negotiation crossing ours may have replaced the link the
        // microphone was added to
        let current = links.get(from).map(|l| l.id());
        if current != self.microphone_link {
            let tracks = self
                .microphone
                .as_ref()
                .map(|m| m.audio_tracks())
                .unwrap_or_default();
            match self.attach(links, from, tracks).await {
                Ok(link) => self.microphone_link = Some(link),
                Err(e) => {
                    warn!(from, "Cannot move microphone to the new link: {}", e);
                    if let Err(send_err) = self.signal(MessageKind::CallEnd, from) {
                        debug!(from, "Failed to send call-end: {}", send_err);
                    }
                    self.finish(links, CallEndReason::TransportFailure).await;
                    return;
                }
            }
        }

        if let Err(e) = self.signal(MessageKind::CallAnswer, from) {
            warn!(from, "Failed to answer crossed call: {}", e);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.activate();
        }
        self.state_changed();
        self.flush_remote_tracks();
    }

    /// Inbound `call-answer`
    pub fn on_call_answer(&mut self, from: &str) {
        let answered = match self.session.as_mut() {
            Some(session) if session.is_with(from) && session.status == CallStatus::Calling => {
                session.activate();
                true
            }
            _ => false,
        };

        if answered {
            info!(from, "Call answered");
            self.state_changed();
            self.flush_remote_tracks();
        } else {
            debug!(from, status = ?self.status(), "Unexpected call-answer ignored");
        }
    }

    /// Inbound `call-reject`
    pub async fn on_call_reject(&mut self, links: &LinkManager, from: &str) {
        match &self.session {
            Some(session) if session.is_with(from) && session.status == CallStatus::Calling => {
                info!(from, "Call declined by remote");
                self.finish(links, CallEndReason::RemoteReject).await;
            }
            _ => debug!(from, status = ?self.status(), "Unexpected call-reject ignored"),
        }
    }

    /// Inbound `call-end`: clears the session whatever its status
    pub async fn on_call_end(&mut self, links: &LinkManager, from: &str) {
        match &self.session {
            Some(session) if session.is_with(from) => {
                info!(from, "Call ended by remote");
                self.finish(links, CallEndReason::RemoteHangup).await;
            }
            _ => debug!(from, "call-end for no current call ignored"),
        }
    }

    /// Accept the ringing call from `remote`
    pub async fn accept(&mut self, links: &mut LinkManager, remote: &str) -> Result<()> {
        match &self.session {
            Some(session) if session.is_with(remote) && session.status == CallStatus::Incoming => {}
            Some(session) => {
                return Err(Error::InvalidCallState(format!(
                    "cannot accept {} while {:?} with {}",
                    remote, session.status, session.remote
                )))
            }
            None => {
                return Err(Error::InvalidCallState(format!(
                    "no incoming call from {}",
                    remote
                )))
            }
        }

        if let Err(e) = self.try_accept(links, remote).await {
            warn!(remote, "Accept failed, declining: {}", e);
            if let Err(send_err) = self.signal(MessageKind::CallReject, remote) {
                debug!(remote, "Failed to send call-reject: {}", send_err);
            }
            let reason = if e.is_media_error() {
                CallEndReason::MediaFailure
            } else {
                CallEndReason::TransportFailure
            };
            self.finish(links, reason).await;
            return Err(e);
        }

        if let Some(session) = self.session.as_mut() {
            session.activate();
        }
        info!(remote, "Call accepted");
        self.state_changed();
        self.flush_remote_tracks();
        Ok(())
    }

    async fn try_accept(&mut self, links: &mut LinkManager, remote: &str) -> Result<()> {
        links.connect(remote).await?;
        let stream = self.media.acquire_microphone().await?;
        self.microphone = Some(Arc::clone(&stream));
        self.microphone_link = Some(self.attach(links, remote, stream.audio_tracks()).await?);
        self.signal(MessageKind::CallAnswer, remote)
    }

    /// Decline the ringing call from `remote`
    pub async fn reject(&mut self, links: &LinkManager, remote: &str) -> Result<()> {
        match &self.session {
            Some(session) if session.is_with(remote) && session.status == CallStatus::Incoming => {}
            _ => {
                return Err(Error::InvalidCallState(format!(
                    "no incoming call from {}",
                    remote
                )))
            }
        }

        if let Err(e) = self.signal(MessageKind::CallReject, remote) {
            warn!(remote, "Failed to send call-reject: {}", e);
        }
        self.finish(links, CallEndReason::LocalReject).await;
        Ok(())
    }

    /// Hang up; a no-op when there is no call
    ///
    /// A ringing inbound call is declined instead.
    pub async fn end(&mut self, links: &LinkManager) -> Result<()> {
        let Some(session) = &self.session else {
            debug!("End requested with no call");
            return Ok(());
        };

        let (kind, reason) = if session.status == CallStatus::Incoming {
            (MessageKind::CallReject, CallEndReason::LocalReject)
        } else {
            (MessageKind::CallEnd, CallEndReason::LocalHangup)
        };
        let remote = session.remote.clone();
        if let Err(e) = self.signal(kind, &remote) {
            warn!(remote = %remote, "Failed to send {}: {}", kind, e);
        }
        self.finish(links, reason).await;
        Ok(())
    }

    /// Hang up because the client is going away
    pub async fn shutdown(&mut self, links: &LinkManager) {
        let Some(session) = &self.session else {
            return;
        };
        let kind = if session.status == CallStatus::Incoming {
            MessageKind::CallReject
        } else {
            MessageKind::CallEnd
        };
        let remote = session.remote.clone();
        if let Err(e) = self.signal(kind, &remote) {
            debug!(remote = %remote, "Failed to send {} on shutdown: {}", kind, e);
        }
        self.finish(links, CallEndReason::Shutdown).await;
    }

    /// The link to `remote` broke or was closed
    pub async fn on_link_closed(&mut self, links: &LinkManager, remote: &str) {
        if self.session.as_ref().is_some_and(|s| s.is_with(remote)) {
            warn!(remote, "Link lost, ending call");
            self.finish(links, CallEndReason::TransportFailure).await;
        }
    }

    /// End the call without signaling the remote
    pub async fn force_end(&mut self, links: &LinkManager, reason: CallEndReason) {
        if self.session.is_some() {
            self.finish(links, reason).await;
        }
    }

    /// Mute or unmute the outgoing audio; returns the new state
    pub fn toggle_microphone(&mut self) -> Result<bool> {
        let (Some(session), Some(microphone)) = (
            self.session.as_mut().filter(|s| s.is_active()),
            self.microphone.as_ref(),
        ) else {
            return Err(Error::NoActiveCall);
        };

        let enabled = !session.microphone_enabled;
        for track in microphone.audio_tracks() {
            track.set_enabled(enabled);
        }
        session.microphone_enabled = enabled;

        debug!(enabled, "Microphone toggled");
        self.events.emit(ClientEvent::MicrophoneToggled { enabled });
        Ok(enabled)
    }

    /// Share the screen with the active call's remote
    ///
    /// Fails with [`Error::NoActiveCall`] before acquiring anything when no
    /// call is active. A refused capture leaves the call untouched.
    pub async fn start_screen_share(&mut self, links: &LinkManager) -> Result<()> {
        let remote = match &self.session {
            Some(session) if session.is_active() => session.remote.clone(),
            _ => return Err(Error::NoActiveCall),
        };
        if self.screen.is_some() {
            return Ok(());
        }
        if links.transport(&remote).is_none() {
            return Err(Error::TransportFailure(format!("no link to {}", remote)));
        }

        let stream = self.media.acquire_screen(self.media_events.clone()).await?;
        if let Err(e) = self.attach(links, &remote, stream.video_tracks()).await.map(|_| ()) {
            stream.stop();
            return Err(e);
        }

        self.screen = Some(stream);
        if let Some(session) = self.session.as_mut() {
            session.screen_sharing = true;
        }
        if let Err(e) = self.signal(MessageKind::ScreenShareStart, &remote) {
            warn!(remote = %remote, "Failed to send screen-share-start: {}", e);
        }
        info!(remote = %remote, "Screen share started");
        self.events.emit(ClientEvent::ScreenShareStarted);
        Ok(())
    }

    /// Stop sharing; a no-op when not sharing
    pub async fn stop_screen_share(&mut self, links: &LinkManager) -> Result<()> {
        let Some(stream) = self.screen.take() else {
            return Ok(());
        };
        stream.stop();

        if let Some(session) = self.session.as_mut() {
            session.screen_sharing = false;
            let remote = session.remote.clone();
            if let Some(transport) = links.transport(&remote) {
                for track in stream.video_tracks() {
                    if let Err(e) = transport.remove_track(track.id()).await {
                        debug!(remote = %remote, "Failed to remove screen track: {}", e);
                    }
                }
            }
            if let Err(e) = self.signal(MessageKind::ScreenShareStop, &remote) {
                warn!(remote = %remote, "Failed to send screen-share-stop: {}", e);
            }
        }

        info!("Screen share stopped");
        self.events.emit(ClientEvent::ScreenShareStopped);
        Ok(())
    }

    /// A capture stream ended on its own
    pub async fn on_capture_ended(&mut self, links: &LinkManager, stream_id: &str) -> Result<()> {
        if self.screen.as_ref().is_some_and(|s| s.id() == stream_id) {
            info!(stream_id, "Screen capture ended by user");
            self.stop_screen_share(links).await
        } else {
            debug!(stream_id, "Capture end for inactive stream ignored");
            Ok(())
        }
    }

    /// Inbound `screen-share-start` / `screen-share-stop`
    pub fn on_remote_screen_share(&mut self, from: &str, started: bool) {
        if !self
            .session
            .as_ref()
            .is_some_and(|s| s.is_active() && s.is_with(from))
        {
            debug!(from, started, "Screen-share signal outside the active call ignored");
            return;
        }
        let from = from.to_string();
        self.events.emit(if started {
            ClientEvent::RemoteScreenShareStarted { from }
        } else {
            ClientEvent::RemoteScreenShareStopped { from }
        });
    }

    /// Remote media arrived on the link to `from`
    pub fn on_remote_track(&mut self, from: &str, track: Arc<dyn MediaTrack>) {
        match &self.session {
            Some(session) if session.is_with(from) && session.is_active() => {
                self.events.emit(ClientEvent::RemoteTrack {
                    from: from.to_string(),
                    track,
                });
            }
            Some(session) if session.is_with(from) => self.pending_tracks.push(track),
            _ => debug!(from, "Remote track outside a call ignored"),
        }
    }

    fn flush_remote_tracks(&mut self) {
        let Some(remote) = self.session.as_ref().map(|s| s.remote.clone()) else {
            return;
        };
        for track in self.pending_tracks.drain(..) {
            self.events.emit(ClientEvent::RemoteTrack {
                from: remote.clone(),
                track,
            });
        }
    }

    async fn release(&mut self, links: &LinkManager) {
        let transport = self
            .session
            .as_ref()
            .and_then(|s| links.transport(&s.remote));

        for stream in [self.microphone.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            stream.stop();
            if let Some(transport) = &transport {
                for track in stream.tracks() {
                    if let Err(e) = transport.remove_track(track.id()).await {
                        debug!("Failed to remove track {}: {}", track.id(), e);
                    }
                }
            }
        }
        self.microphone_link = None;
        self.pending_tracks.clear();
    }

    async fn finish(&mut self, links: &LinkManager, reason: CallEndReason) {
        self.release(links).await;
        if let Some(session) = self.session.take() {
            info!(remote = %session.remote, ?reason, duration = ?session.duration(), "Call ended");
            self.events.emit(ClientEvent::CallEnded {
                remote: session.remote,
                reason,
            });
        }
    }
}
