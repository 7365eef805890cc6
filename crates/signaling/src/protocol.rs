//! Wire envelope for the relay channel
//!
//! Every frame on the relay channel is one JSON object:
//!
//! ```text
//! { type, to?, from?, username?, query?, payload?, results?, message? }
//! ```
//!
//! Relayed kinds (negotiation, call control, screen-share) are forwarded
//! verbatim: fields this module does not know are kept in [`Envelope::extra`]
//! and written back out unchanged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Participant identifier, unique among connected channels
pub type Handle = String;

/// Message kinds carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Claim a handle
    Register,
    /// Registration ack
    Registered,
    /// Substring lookup
    Search,
    /// Lookup matches
    SearchResults,
    /// Negotiation offer
    Offer,
    /// Negotiation answer
    Answer,
    /// Connectivity candidate
    IceCandidate,
    /// Ring the remote
    CallOffer,
    /// Accept a ringing call
    CallAnswer,
    /// Decline a ringing call
    CallReject,
    /// Hang up
    CallEnd,
    /// Sender started sharing its screen
    ScreenShareStart,
    /// Sender stopped sharing its screen
    ScreenShareStop,
    /// Presence: handle came online
    UserOnline,
    /// Presence: handle went offline
    UserOffline,
    /// Registration or forward failure
    Error,
}

impl MessageKind {
    /// Kinds the relay forwards to the `to` handle without interpretation
    pub fn is_relayed(&self) -> bool {
        self.is_negotiation() || self.is_call_control() || self.is_screen_share()
    }

    /// Offer / answer / ice-candidate
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            MessageKind::Offer | MessageKind::Answer | MessageKind::IceCandidate
        )
    }

    /// call-offer / call-answer / call-reject / call-end
    pub fn is_call_control(&self) -> bool {
        matches!(
            self,
            MessageKind::CallOffer
                | MessageKind::CallAnswer
                | MessageKind::CallReject
                | MessageKind::CallEnd
        )
    }

    /// screen-share-start / screen-share-stop
    pub fn is_screen_share(&self) -> bool {
        matches!(
            self,
            MessageKind::ScreenShareStart | MessageKind::ScreenShareStop
        )
    }

    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Registered => "registered",
            MessageKind::Search => "search",
            MessageKind::SearchResults => "search-results",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::CallOffer => "call-offer",
            MessageKind::CallAnswer => "call-answer",
            MessageKind::CallReject => "call-reject",
            MessageKind::CallEnd => "call-end",
            MessageKind::ScreenShareStart => "screen-share-start",
            MessageKind::ScreenShareStop => "screen-share-stop",
            MessageKind::UserOnline => "user-online",
            MessageKind::UserOffline => "user-offline",
            MessageKind::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relay frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Recipient handle (client → relay)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Handle>,

    /// Sender handle, stamped by the relay on delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Handle>,

    /// Handle for register / registered / presence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Handle>,

    /// Search query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Opaque negotiation or call payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Search matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Handle>>,

    /// Error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Fields not listed above, preserved for verbatim forwarding
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an empty envelope of the given kind
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            to: None,
            from: None,
            username: None,
            query: None,
            payload: None,
            results: None,
            message: None,
            extra: Map::new(),
        }
    }

    /// `register { username }`
    pub fn register(handle: &str) -> Self {
        Self {
            username: Some(handle.to_string()),
            ..Self::new(MessageKind::Register)
        }
    }

    /// `registered { username }`
    pub fn registered(handle: &str) -> Self {
        Self {
            username: Some(handle.to_string()),
            ..Self::new(MessageKind::Registered)
        }
    }

    /// `search { query }`
    pub fn search(query: &str) -> Self {
        Self {
            query: Some(query.to_string()),
            ..Self::new(MessageKind::Search)
        }
    }

    /// `search-results { results }`
    pub fn search_results(results: Vec<Handle>) -> Self {
        Self {
            results: Some(results),
            ..Self::new(MessageKind::SearchResults)
        }
    }

    /// A relayed message addressed to `to`
    pub fn relayed(kind: MessageKind, to: &str, payload: Option<Value>) -> Self {
        Self {
            to: Some(to.to_string()),
            payload,
            ..Self::new(kind)
        }
    }

    /// `user-online { username }`
    pub fn user_online(handle: &str) -> Self {
        Self {
            username: Some(handle.to_string()),
            ..Self::new(MessageKind::UserOnline)
        }
    }

    /// `user-offline { username }`
    pub fn user_offline(handle: &str) -> Self {
        Self {
            username: Some(handle.to_string()),
            ..Self::new(MessageKind::UserOffline)
        }
    }

    /// `error { message }`
    pub fn error(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::new(MessageKind::Error)
        }
    }

    /// Parse a text frame
    ///
    /// Anything that is not a JSON object with a known `type` is reported as
    /// [`Error::MalformedMessage`].
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Overwrite the sender field
    pub fn stamped(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }
}
