//! Duocall - One-to-One Call Signaling
//!
//! A relay that forwards offer/answer/candidate/end-call envelopes between
//! connected users, and the client-side controller that runs a single
//! audio/video call on top of it.

pub mod call;
pub mod config;
pub mod media;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod tls;

pub use call::{CallController, CallError, CallEvent, CallState, ControllerOptions};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Envelope, SignalingMessage};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use relay::SignalingRelay;
