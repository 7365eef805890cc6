//! Call Session state

use crate::protocol::Handle;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Status of the client's call
///
/// `None` means no session exists. `Ended` is reported on the way out; the
/// session is cleared immediately after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    None,
    Calling,
    Incoming,
    Active,
    Ended,
}

/// The single call a client may have at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub remote: Handle,
    pub status: CallStatus,
    /// Meaningful only while active
    pub microphone_enabled: bool,
    /// Meaningful only while active
    pub screen_sharing: bool,
    pub start_time: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Outgoing call waiting for an answer
    pub fn calling(remote: &str) -> Self {
        Self::with_status(remote, CallStatus::Calling)
    }

    /// Inbound call waiting for a local decision
    pub fn incoming(remote: &str) -> Self {
        Self::with_status(remote, CallStatus::Incoming)
    }

    fn with_status(remote: &str, status: CallStatus) -> Self {
        Self {
            remote: remote.to_string(),
            status,
            microphone_enabled: true,
            screen_sharing: false,
            start_time: None,
        }
    }

    /// Mark active and record the start time
    pub fn activate(&mut self) {
        self.status = CallStatus::Active;
        self.start_time = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status == CallStatus::Active
    }

    /// Whether `handle` is the other party of this call
    pub fn is_with(&self, handle: &str) -> bool {
        self.remote == handle
    }

    /// Time since the call became active
    pub fn duration(&self) -> Option<Duration> {
        self.start_time.map(|start| Utc::now() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sessions() {
        let session = CallSession::calling("Bob0002");
        assert_eq!(session.status, CallStatus::Calling);
        assert!(session.microphone_enabled);
        assert!(!session.screen_sharing);
        assert!(session.duration().is_none());
        assert!(session.is_with("Bob0002"));
        assert!(!session.is_with("Carol03"));

        assert_eq!(CallSession::incoming("Alice01").status, CallStatus::Incoming);
    }

    #[test]
    fn test_activate_records_start() {
        let mut session = CallSession::incoming("Alice01");
        session.activate();
        assert!(session.is_active());
        assert!(session.start_time.is_some());
        assert!(session.duration().unwrap() >= Duration::zero());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&CallStatus::Active).unwrap(), "\"active\"");
    }
}
