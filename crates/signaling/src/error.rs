//! Error types for the relay and the client state machines

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error text the relay sends when a handle is already held by a live channel
pub const HANDLE_TAKEN_MESSAGE: &str = "handle already taken";

/// Error text the relay sends when a forward target is not registered
pub const RECIPIENT_UNAVAILABLE_MESSAGE: &str = "not found or offline";

/// Error text the relay sends when an unregistered channel tries to forward
pub const NOT_REGISTERED_MESSAGE: &str = "register before sending";

/// Error text the relay sends when a handle is empty or too long
pub const INVALID_HANDLE_MESSAGE: &str = "invalid handle";

/// Error text the relay sends when a channel tries to claim a second handle
pub const ALREADY_REGISTERED_MESSAGE: &str = "channel already registered";

/// Errors that can occur in relay and client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Handle already held by another live channel
    #[error("Handle taken: {0}")]
    HandleTaken(String),

    /// Forward target is not registered (offline or unknown)
    #[error("Recipient unavailable: {0}")]
    RecipientUnavailable(String),

    /// Inbound message could not be parsed
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Microphone or screen capture permission was refused
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Requested capture device does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Any other capture failure
    #[error("Media error: {0}")]
    MediaError(String),

    /// Underlying peer transport broke or is not usable
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Screen-share or mute requested without an active call
    #[error("No active call")]
    NoActiveCall,

    /// A call session already exists
    #[error("Call already in progress with {0}")]
    CallInProgress(String),

    /// Trigger not valid for the current call status
    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    /// Handle is empty or too long
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Channel already holds a different handle
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Channel tried to forward before registering
    #[error("Not registered: {0}")]
    NotRegistered(String),

    /// Offer/answer/candidate could not be applied
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Map an `error` envelope from the relay back onto the taxonomy
    pub fn from_relay_message(message: &str) -> Self {
        match message {
            HANDLE_TAKEN_MESSAGE => Error::HandleTaken(message.to_string()),
            RECIPIENT_UNAVAILABLE_MESSAGE => Error::RecipientUnavailable(message.to_string()),
            NOT_REGISTERED_MESSAGE => Error::NotRegistered(message.to_string()),
            INVALID_HANDLE_MESSAGE => Error::InvalidHandle(message.to_string()),
            ALREADY_REGISTERED_MESSAGE => Error::AlreadyRegistered(message.to_string()),
            other => Error::SignalingError(other.to_string()),
        }
    }

    /// Check if the caller can recover by retrying or picking another input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::HandleTaken(_)
                | Error::RecipientUnavailable(_)
                | Error::PermissionDenied(_)
                | Error::DeviceNotFound(_)
                | Error::MediaError(_)
                | Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error came from media acquisition
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DeviceNotFound(_) | Error::MediaError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::HandleTaken("Alice01".to_string());
        assert_eq!(err.to_string(), "Handle taken: Alice01");
        assert_eq!(Error::NoActiveCall.to_string(), "No active call");
    }

    #[test]
    fn test_relay_message_mapping() {
        assert!(matches!(
            Error::from_relay_message(HANDLE_TAKEN_MESSAGE),
            Error::HandleTaken(_)
        ));
        assert!(matches!(
            Error::from_relay_message(RECIPIENT_UNAVAILABLE_MESSAGE),
            Error::RecipientUnavailable(_)
        ));
        assert!(matches!(
            Error::from_relay_message(ALREADY_REGISTERED_MESSAGE),
            Error::AlreadyRegistered(_)
        ));
        assert!(matches!(
            Error::from_relay_message("something else"),
            Error::SignalingError(_)
        ));
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::HandleTaken("x".to_string()).is_recoverable());
        assert!(Error::PermissionDenied("mic".to_string()).is_recoverable());
        assert!(!Error::NoActiveCall.is_recoverable());
        assert!(!Error::TransportFailure("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_is_media_error() {
        assert!(Error::DeviceNotFound("mic".to_string()).is_media_error());
        assert!(!Error::NegotiationError("sdp".to_string()).is_media_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
