//! Call lifecycle (client side)
//!
//! Layers ring / accept / reject / end and screen-share on top of a Peer Link.

pub mod manager;
pub mod media;
pub mod session;

pub use manager::CallManager;
pub use media::{
    capture_error, MediaDevices, MediaEvent, MediaEventSender, MediaStream, MediaTrack, TrackKind,
};
pub use session::{CallSession, CallStatus};
