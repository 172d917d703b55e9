//! Call Handling
//!
//! Client-side call state machine and the controller the presentation
//! layer drives it through.

mod controller;
mod session;

pub use controller::{CallController, ControllerOptions};
pub use session::{CallSession, CallState, IceCandidateBuffer};

/// Errors returned to the caller of a controller operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Another call is already in progress")]
    Busy,
    #[error("No incoming call to answer")]
    NoIncomingCall,
    #[error("Cannot call {0}")]
    InvalidTarget(String),
    #[error("Media acquisition denied: {0}")]
    MediaAcquisitionDenied(String),
    #[error("Call controller is shut down")]
    ShutDown,
}

/// Failures the presentation layer should show to the user. Everything
/// else is recovered by returning the session to idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    TargetOffline { peer_id: String },
    MediaAcquisitionDenied { reason: String },
}

/// Details of a call waiting to be answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from_user_id: String,
    pub from_name: Option<String>,
}

/// Notifications published by a [`CallController`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        state: CallState,
        peer_id: Option<String>,
    },
    IncomingCall(IncomingCall),
    RemoteTrack {
        peer_id: String,
        kind: crate::media::TrackKind,
    },
    Presence(Vec<String>),
    Failed(CallFailure),
}
