//! Media Handling
//!
//! The seam between call negotiation and whatever engine actually captures
//! and transports audio/video. The call layer only drives the offer/answer
//! and candidate exchange through these traits.

pub mod simulated;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::MediaConfig;
use crate::protocol::{IceCandidate, SessionDescription};

pub use simulated::{SimulatedMediaEngine, SimulatedPeerConnection, SimulatedTrack};

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Connection closed")]
    Closed,
}

/// Media types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to capture for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl From<MediaConfig> for MediaConstraints {
    fn from(config: MediaConfig) -> Self {
        Self {
            audio: config.audio,
            video: config.video,
        }
    }
}

/// Parameters for a new negotiation context
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// A single captured or received track owned by the engine
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<Arc<dyn MediaTrack>>>,
    stopped: AtomicBool,
}

/// Shared handle to a group of tracks. Stopping it stops every track it
/// holds, once; tracks added afterwards are stopped on arrival.
#[derive(Clone)]
pub struct MediaStreamHandle {
    inner: Arc<StreamInner>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_tracks(id, Vec::new())
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: Mutex::new(tracks),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn add_track(&self, track: Arc<dyn MediaTrack>) {
        let mut tracks = self.inner.tracks.lock();
        if self.is_stopped() {
            track.stop();
            return;
        }
        tracks.push(track);
    }

    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.inner.tracks.lock().clone()
    }

    pub fn has_video(&self) -> bool {
        self.inner
            .tracks
            .lock()
            .iter()
            .any(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track. Returns false if the stream was already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in self.inner.tracks.lock().iter() {
            track.stop();
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.lock().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Events a negotiation context reports back to its session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate to advertise to the peer
    LocalCandidate(IceCandidate),
    /// A track arrived from the peer
    RemoteTrack(Arc<dyn MediaTrack>),
    /// The transport failed after negotiation
    Failed(String),
}

/// Callback through which an engine reports [`PeerEvent`]s for one session
#[derive(Clone)]
pub struct PeerEventSink {
    handler: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEventSink {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(PeerEvent) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.handler)(event)
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerEventSink")
    }
}

/// Negotiation context for one call
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach local tracks so they are offered to the peer
    fn add_stream(&self, stream: &MediaStreamHandle) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Release the context. Calling it more than once has no effect.
    fn close(&self);
}

/// Capture devices plus the factory for negotiation contexts
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError>;

    fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_stops_tracks_once() {
        let audio = Arc::new(SimulatedTrack::new(TrackKind::Audio));
        let video = Arc::new(SimulatedTrack::new(TrackKind::Video));
        let stream = MediaStreamHandle::with_tracks(
            "local",
            vec![
                audio.clone() as Arc<dyn MediaTrack>,
                video.clone() as Arc<dyn MediaTrack>,
            ],
        );
        assert!(stream.has_video());

        assert!(stream.stop());
        assert!(!stream.stop());
        assert_eq!(audio.stop_count(), 1);
        assert_eq!(video.stop_count(), 1);
    }

    #[test]
    fn test_track_added_after_stop_is_stopped() {
        let stream = MediaStreamHandle::new("remote");
        stream.stop();

        let late = Arc::new(SimulatedTrack::new(TrackKind::Audio));
        stream.add_track(late.clone());
        assert!(late.is_stopped());
        assert!(stream.tracks().is_empty());
    }

    #[test]
    fn test_constraints_from_config() {
        let constraints = MediaConstraints::from(MediaConfig {
            audio: true,
            video: true,
        });
        assert_eq!(constraints, MediaConstraints::audio_video());
    }
}
