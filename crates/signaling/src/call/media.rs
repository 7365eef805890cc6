//! Media-capture primitive seam
//!
//! Microphone and screen capture are provided by the embedder through
//! [`MediaDevices`]. Acquisition is slow and may be refused; failures come
//! back already categorized ([`Error::PermissionDenied`],
//! [`Error::DeviceNotFound`], [`Error::MediaError`]).

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single local or remote media track
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// Enable or mute the track without renegotiating
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Stop capturing; the track cannot be restarted
    fn stop(&self);
}

/// A captured stream (microphone or screen)
pub trait MediaStream: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// Stop every track in the stream
    fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .collect()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .collect()
    }
}

/// Notifications from capture devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Capture ended outside our control (e.g. the user stopped sharing)
    CaptureEnded { stream_id: String },
}

/// Sender a capture stream uses to report that it ended
#[derive(Debug, Clone)]
pub struct MediaEventSender(mpsc::UnboundedSender<MediaEvent>);

impl MediaEventSender {
    pub fn new(tx: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self(tx)
    }

    pub fn capture_ended(&self, stream_id: &str) -> bool {
        self.0
            .send(MediaEvent::CaptureEnded {
                stream_id: stream_id.to_string(),
            })
            .is_ok()
    }
}

/// Capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire an audio-only microphone stream
    async fn acquire_microphone(&self) -> Result<Arc<dyn MediaStream>>;

    /// Acquire a screen capture stream
    ///
    /// The stream reports through `events` when capture ends on its own.
    async fn acquire_screen(&self, events: MediaEventSender) -> Result<Arc<dyn MediaStream>>;
}

/// Map a capture failure name onto the error taxonomy
///
/// Accepts the DOM-style names capture stacks commonly report
/// (`NotAllowedError`, `NotFoundError`, ...).
pub fn capture_error(name: &str, detail: &str) -> Error {
    match name {
        "NotAllowedError" | "PermissionDeniedError" | "SecurityError" | "AbortError" => {
            Error::PermissionDenied(detail.to_string())
        }
        "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
            Error::DeviceNotFound(detail.to_string())
        }
        _ => Error::MediaError(format!("{}: {}", name, detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_error_categories() {
        assert!(matches!(
            capture_error("NotAllowedError", "microphone"),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            capture_error("NotFoundError", "microphone"),
            Error::DeviceNotFound(_)
        ));
        let err = capture_error("NotReadableError", "busy");
        assert!(matches!(err, Error::MediaError(_)));
        assert!(err.is_media_error());
    }

    #[test]
    fn test_media_event_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = MediaEventSender::new(tx);
        assert!(sender.capture_ended("screen-1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaEvent::CaptureEnded {
                stream_id: "screen-1".to_string()
            }
        );
    }
}
