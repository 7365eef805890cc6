//! Handle registry and forwarding
//!
//! The [`Relay`] owns every piece of server-side state: the connected channels,
//! the handle → channel map and the insertion order used for search results.
//! All of it lives behind one `parking_lot::Mutex`, and every operation runs to
//! completion under that lock without awaiting. Delivery into a channel's
//! outbound queue is a non-blocking `try_send`; a full or closed queue drops the
//! frame.

use super::events::RelayEvent;
use crate::config::RelayConfig;
use crate::error::{
    ALREADY_REGISTERED_MESSAGE, HANDLE_TAKEN_MESSAGE, INVALID_HANDLE_MESSAGE,
    NOT_REGISTERED_MESSAGE, RECIPIENT_UNAVAILABLE_MESSAGE,
};
use crate::protocol::{Envelope, Handle, MessageKind};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of one connected relay channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Channel {
    tx: mpsc::Sender<String>,
    handle: Option<Handle>,
}

struct Entry {
    channel: ChannelId,
    seq: u64,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelId, Channel>,
    handles: HashMap<Handle, Entry>,
    next_seq: u64,
}

impl Registry {
    fn handle_of(&self, channel: ChannelId) -> Option<&Handle> {
        self.channels.get(&channel).and_then(|c| c.handle.as_ref())
    }

    /// Push a frame into a channel's outbound queue; false if it was dropped
    fn deliver(&self, channel: ChannelId, text: String) -> bool {
        let Some(target) = self.channels.get(&channel) else {
            return false;
        };
        match target.tx.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(channel = %channel, "Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(channel = %channel, "Outbound queue closed, dropping frame");
                false
            }
        }
    }

    fn reply(&self, channel: ChannelId, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(text) => self.deliver(channel, text),
            Err(e) => {
                warn!("Failed to serialize {} reply: {}", envelope.kind, e);
                false
            }
        }
    }

    /// Send to every registered channel except `exclude`
    fn broadcast(&self, envelope: &Envelope, exclude: Option<ChannelId>) {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} broadcast: {}", envelope.kind, e);
                return;
            }
        };
        for entry in self.handles.values() {
            if Some(entry.channel) != exclude {
                self.deliver(entry.channel, text.clone());
            }
        }
    }
}

/// Live handle registry and message relay
pub struct Relay {
    config: RelayConfig,
    registry: Mutex<Registry>,
    event_tx: Option<mpsc::Sender<RelayEvent>>,
}

impl Relay {
    /// Create a relay without event forwarding
    pub fn new(config: RelayConfig) -> Self {
        Self::new_with_events(config, None)
    }

    /// Create a relay that reports registrations and forwards on `event_tx`
    pub fn new_with_events(config: RelayConfig, event_tx: Option<mpsc::Sender<RelayEvent>>) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
            event_tx,
        }
    }

    /// Relay configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(ref tx) = self.event_tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to emit relay event: {}", e);
            }
        }
    }

    /// Add a connected channel whose outbound frames go to `tx`
    pub fn attach(&self, tx: mpsc::Sender<String>) -> ChannelId {
        let id = ChannelId::new();
        self.registry
            .lock()
            .channels
            .insert(id, Channel { tx, handle: None });
        debug!(channel = %id, "Channel attached");
        id
    }

    /// Claim `handle` for `channel`
    ///
    /// Replies `registered` and broadcasts `user-online` to every other
    /// registered channel on success; replies `error` otherwise.
    pub fn register(&self, channel: ChannelId, handle: &str) -> Result<()> {
        let online = {
            let mut registry = self.registry.lock();

            let Some(current) = registry.channels.get(&channel) else {
                return Err(Error::SignalingError(format!("unknown channel {}", channel)));
            };

            if handle.is_empty() || handle.len() > self.config.max_handle_len {
                registry.reply(channel, &Envelope::error(INVALID_HANDLE_MESSAGE));
                return Err(Error::InvalidHandle(handle.to_string()));
            }

            match current.handle.as_deref() {
                Some(existing) if existing == handle => {
                    debug!(channel = %channel, handle, "Repeated registration acknowledged");
                    registry.reply(channel, &Envelope::registered(handle));
                    return Ok(());
                }
                Some(existing) => {
                    warn!(channel = %channel, existing, requested = handle, "Channel already holds a handle");
                    registry.reply(channel, &Envelope::error(ALREADY_REGISTERED_MESSAGE));
                    return Err(Error::AlreadyRegistered(handle.to_string()));
                }
                None => {}
            }

            if registry.handles.contains_key(handle) {
                info!(channel = %channel, handle, "Registration refused, handle taken");
                registry.reply(channel, &Envelope::error(HANDLE_TAKEN_MESSAGE));
                return Err(Error::HandleTaken(handle.to_string()));
            }

            let seq = registry.next_seq;
            registry.next_seq += 1;
            registry
                .handles
                .insert(handle.to_string(), Entry { channel, seq });
            if let Some(c) = registry.channels.get_mut(&channel) {
                c.handle = Some(handle.to_string());
            }

            registry.reply(channel, &Envelope::registered(handle));
            registry.broadcast(&Envelope::user_online(handle), Some(channel));
            registry.handles.len()
        };

        info!(channel = %channel, handle, online, "Handle registered");
        self.emit(RelayEvent::registered(handle, online));
        Ok(())
    }

    /// Case-insensitive substring lookup, excluding the caller's own handle
    ///
    /// Results are in registration order. The caller also receives them as a
    /// `search-results` frame.
    pub fn search(&self, channel: ChannelId, query: &str) -> Vec<Handle> {
        let registry = self.registry.lock();
        let own = registry.handle_of(channel);
        let needle = query.to_lowercase();

        let mut matches: Vec<(&Handle, u64)> = if needle.is_empty() {
            Vec::new()
        } else {
            registry
                .handles
                .iter()
                .filter(|(handle, _)| Some(*handle) != own)
                .filter(|(handle, _)| handle.to_lowercase().contains(&needle))
                .map(|(handle, entry)| (handle, entry.seq))
                .collect()
        };
        matches.sort_by_key(|(_, seq)| *seq);
        let results: Vec<Handle> = matches.into_iter().map(|(h, _)| h.clone()).collect();

        debug!(channel = %channel, query, count = results.len(), "Search");
        registry.reply(channel, &Envelope::search_results(results.clone()));
        results
    }

    /// Forward a relayed message to its `to` handle, stamping `from`
    ///
    /// The message is dropped (and the sender told so) when the sender is not
    /// registered or the recipient is not online.
    pub fn forward(&self, channel: ChannelId, envelope: Envelope) -> Result<()> {
        let kind = envelope.kind;
        let Some(to) = envelope.to.clone() else {
            return Err(Error::MalformedMessage(format!("{} without recipient", kind)));
        };

        let event = {
            let registry = self.registry.lock();

            let Some(from) = registry.handle_of(channel).cloned() else {
                registry.reply(channel, &Envelope::error(NOT_REGISTERED_MESSAGE));
                drop(registry);
                self.emit(RelayEvent::forward_failed(kind, None, &to, NOT_REGISTERED_MESSAGE));
                return Err(Error::NotRegistered(format!("{} to {}", kind, to)));
            };

            let Some(target) = registry.handles.get(&to).map(|e| e.channel) else {
                debug!(%kind, from = %from, to = %to, "Recipient offline");
                registry.reply(channel, &Envelope::error(RECIPIENT_UNAVAILABLE_MESSAGE));
                drop(registry);
                self.emit(RelayEvent::forward_failed(
                    kind,
                    Some(&from),
                    &to,
                    RECIPIENT_UNAVAILABLE_MESSAGE,
                ));
                return Err(Error::RecipientUnavailable(to));
            };

            let text = envelope.stamped(&from).to_json()?;
            if registry.deliver(target, text) {
                debug!(%kind, from = %from, to = %to, "Forwarded");
                RelayEvent::forwarded(kind, &from, &to)
            } else {
                RelayEvent::forward_failed(kind, Some(&from), &to, "recipient queue unavailable")
            }
        };

        self.emit(event);
        Ok(())
    }

    /// Remove a channel, freeing its handle
    ///
    /// Broadcasts `user-offline` to the remaining registered channels when the
    /// channel held a handle. Calling this again for the same channel is a
    /// no-op.
    pub fn disconnect(&self, channel: ChannelId) -> Option<Handle> {
        let (handle, online) = {
            let mut registry = self.registry.lock();
            let handle = registry.channels.remove(&channel)?.handle?;
            registry.handles.remove(&handle);
            registry.broadcast(&Envelope::user_offline(&handle), None);
            (handle, registry.handles.len())
        };

        info!(channel = %channel, handle = %handle, online, "Handle released");
        self.emit(RelayEvent::unregistered(&handle, online));
        Some(handle)
    }

    /// Parse one inbound text frame and route it
    pub fn dispatch(&self, channel: ChannelId, text: &str) -> Result<()> {
        let envelope = Envelope::parse(text)?;
        match envelope.kind {
            MessageKind::Register => {
                let handle = envelope.username.ok_or_else(|| {
                    Error::MalformedMessage("register without username".to_string())
                })?;
                self.register(channel, &handle)
            }
            MessageKind::Search => {
                self.search(channel, envelope.query.as_deref().unwrap_or(""));
                Ok(())
            }
            kind if kind.is_relayed() => self.forward(channel, envelope),
            other => Err(Error::MalformedMessage(format!(
                "unexpected {} from client",
                other
            ))),
        }
    }

    /// Handle held by `channel`, if registered
    pub fn handle_of(&self, channel: ChannelId) -> Option<Handle> {
        self.registry.lock().handle_of(channel).cloned()
    }

    /// Registered handles in registration order
    pub fn online(&self) -> Vec<Handle> {
        let registry = self.registry.lock();
        let mut handles: Vec<(&Handle, u64)> =
            registry.handles.iter().map(|(h, e)| (h, e.seq)).collect();
        handles.sort_by_key(|(_, seq)| *seq);
        handles.into_iter().map(|(h, _)| h.clone()).collect()
    }

    /// Number of attached channels, registered or not
    pub fn channel_count(&self) -> usize {
        self.registry.lock().channels.len()
    }
}
