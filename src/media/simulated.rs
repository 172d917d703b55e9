//! Simulated media engine
//!
//! In-process stand-in for a real capture/transport stack. Produces
//! synthetic session descriptions and host candidates, and records what
//! the call layer did with them. Used by the terminal client and by tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    MediaConstraints, MediaEngine, MediaError, MediaStreamHandle, MediaTrack, PeerConfig,
    PeerConnection, PeerEvent, PeerEventSink, TrackKind,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Track that only counts how often it was stopped
#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    kind: TrackKind,
    stop_count: AtomicUsize,
}

impl SimulatedTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            stop_count: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }
}

impl MediaTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }
}

#[derive(Debug, Clone)]
struct Behavior {
    deny_media: Option<MediaError>,
    fail_remote_description: bool,
    fail_candidates: bool,
    local_candidates: usize,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            deny_media: None,
            fail_remote_description: false,
            fail_candidates: false,
            local_candidates: 2,
        }
    }
}

/// Engine producing synthetic media. Every knob applies to calls made
/// after it is set.
#[derive(Default)]
pub struct SimulatedMediaEngine {
    behavior: Mutex<Behavior>,
    media_gate: Mutex<Option<Arc<Notify>>>,
    acquisitions: AtomicUsize,
    local_tracks: Mutex<Vec<Arc<SimulatedTrack>>>,
    connections: Mutex<Vec<Arc<SimulatedPeerConnection>>>,
}

impl SimulatedMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make capture fail as if the user refused the permission prompt
    pub fn deny_media(&self, reason: &str) {
        self.behavior.lock().deny_media = Some(MediaError::PermissionDenied(reason.to_string()));
    }

    pub fn allow_media(&self) {
        self.behavior.lock().deny_media = None;
    }

    pub fn fail_remote_description(&self, fail: bool) {
        self.behavior.lock().fail_remote_description = fail;
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.behavior.lock().fail_candidates = fail;
    }

    /// Number of host candidates each connection gathers
    pub fn set_local_candidates(&self, count: usize) {
        self.behavior.lock().local_candidates = count;
    }

    /// Keep capture pending until the returned handle is notified, like an
    /// unanswered permission prompt.
    pub fn hold_media(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.media_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn release_media(&self) {
        if let Some(gate) = self.media_gate.lock().take() {
            gate.notify_waiters();
        }
    }

    /// Capture requests started so far, including pending ones
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn local_tracks(&self) -> Vec<Arc<SimulatedTrack>> {
        self.local_tracks.lock().clone()
    }

    /// Captured tracks that were never stopped
    pub fn open_tracks(&self) -> usize {
        self.local_tracks
            .lock()
            .iter()
            .filter(|t| !t.is_stopped())
            .count()
    }

    pub fn connections(&self) -> Vec<Arc<SimulatedPeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<SimulatedPeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl MediaEngine for SimulatedMediaEngine {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStreamHandle, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let gate = self.media_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(err) = self.behavior.lock().deny_media.clone() {
            return Err(err);
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable("no media requested".to_string()));
        }

        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        let mut recorded = self.local_tracks.lock();
        for (wanted, kind) in [(constraints.audio, TrackKind::Audio), (constraints.video, TrackKind::Video)] {
            if wanted {
                let track = Arc::new(SimulatedTrack::new(kind));
                recorded.push(track.clone());
                tracks.push(track);
            }
        }

        Ok(MediaStreamHandle::with_tracks(Uuid::new_v4().to_string(), tracks))
    }

    fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let behavior = self.behavior.lock().clone();
        let connection = Arc::new(SimulatedPeerConnection {
            id: Uuid::new_v4().simple().to_string(),
            ice_servers: config.ice_servers.clone(),
            events,
            behavior,
            state: Mutex::new(ConnectionState::default()),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct ConnectionState {
    local_streams: Vec<MediaStreamHandle>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    remote_tracks: Vec<Arc<SimulatedTrack>>,
    close_count: usize,
}

/// Negotiation context that answers everything locally
pub struct SimulatedPeerConnection {
    id: String,
    ice_servers: Vec<String>,
    events: PeerEventSink,
    behavior: Behavior,
    state: Mutex<ConnectionState>,
}

impl SimulatedPeerConnection {
    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    /// Remote candidates in the order they were applied
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<SimulatedTrack>> {
        self.state.lock().remote_tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed);
        }
        Ok(())
    }

    fn sends_video(&self) -> bool {
        self.state.lock().local_streams.iter().any(|s| s.has_video())
    }

    fn describe(&self, version: u32, video: bool) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.id, version
        );
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn gathered_candidates(&self) -> Vec<IceCandidate> {
        (0..self.behavior.local_candidates)
            .map(|i| IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp {} 192.168.1.{} {} typ host",
                    i + 1,
                    2122260223u32 - i as u32,
                    10 + i,
                    50000 + i
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })
            .collect()
    }
}

#[async_trait]
impl PeerConnection for SimulatedPeerConnection {
    fn add_stream(&self, stream: &MediaStreamHandle) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.state.lock().local_streams.push(stream.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.describe(1, self.sends_video())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        let offered_video = match self.remote_description() {
            Some(desc) if desc.kind == SdpKind::Offer => desc.sdp.contains("m=video"),
            _ => return Err(MediaError::Negotiation("no remote offer to answer".to_string())),
        };
        Ok(SessionDescription::answer(
            self.describe(2, offered_video && self.sends_video()),
        ))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        self.state.lock().local = Some(description);

        for candidate in self.gathered_candidates() {
            self.events.emit(PeerEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        if self.behavior.fail_remote_description {
            return Err(MediaError::Negotiation("remote description rejected".to_string()));
        }

        let mut kinds = vec![TrackKind::Audio];
        if description.sdp.contains("m=video") {
            kinds.push(TrackKind::Video);
        }
        let tracks: Vec<Arc<SimulatedTrack>> = kinds
            .into_iter()
            .map(|kind| Arc::new(SimulatedTrack::new(kind)))
            .collect();
        {
            let mut state = self.state.lock();
            state.remote = Some(description);
            state.remote_tracks.extend(tracks.iter().cloned());
        }

        for track in tracks {
            self.events.emit(PeerEvent::RemoteTrack(track));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        if self.behavior.fail_candidates {
            return Err(MediaError::Negotiation("candidate rejected".to_string()));
        }
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(MediaError::Negotiation("remote description not set".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.close_count += 1;
        if state.close_count == 1 {
            log::debug!("Simulated connection {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(events: Arc<Mutex<Vec<PeerEvent>>>) -> PeerEventSink {
        PeerEventSink::new(move |event| events.lock().push(event))
    }

    #[tokio::test]
    async fn test_denied_media() {
        let engine = SimulatedMediaEngine::new();
        engine.deny_media("blocked");

        let result = engine.get_user_media(MediaConstraints::audio_only()).await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert_eq!(engine.acquisitions(), 1);
        assert!(engine.local_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let engine = SimulatedMediaEngine::new();
        let caller_events = Arc::new(Mutex::new(Vec::new()));
        let callee_events = Arc::new(Mutex::new(Vec::new()));

        let caller = engine
            .create_peer_connection(&PeerConfig::default(), sink(caller_events.clone()))
            .unwrap();
        let callee = engine
            .create_peer_connection(&PeerConfig::default(), sink(callee_events.clone()))
            .unwrap();

        let stream = engine.get_user_media(MediaConstraints::audio_video()).await.unwrap();
        caller.add_stream(&stream).unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        caller.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(caller_events.lock().len(), 2);

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        // The callee attached nothing, so it answers audio only
        assert!(!answer.sdp.contains("m=video"));

        let remote_tracks = callee_events
            .lock()
            .iter()
            .filter(|e| matches!(e, PeerEvent::RemoteTrack(_)))
            .count();
        assert_eq!(remote_tracks, 2);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let engine = SimulatedMediaEngine::new();
        let pc = engine
            .create_peer_connection(&PeerConfig::default(), sink(Arc::new(Mutex::new(Vec::new()))))
            .unwrap();

        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 4000 typ host");
        assert!(pc.add_ice_candidate(candidate.clone()).await.is_err());

        pc.set_remote_description(SessionDescription::offer("v=0\r\n")).await.unwrap();
        pc.add_ice_candidate(candidate.clone()).await.unwrap();

        let recorded = engine.last_connection().unwrap();
        assert_eq!(recorded.applied_candidates(), vec![candidate]);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_work() {
        let engine = SimulatedMediaEngine::new();
        let pc = engine
            .create_peer_connection(&PeerConfig::default(), sink(Arc::new(Mutex::new(Vec::new()))))
            .unwrap();
        pc.close();
        pc.close();

        assert_eq!(pc.create_offer().await, Err(MediaError::Closed));
        assert_eq!(engine.last_connection().unwrap().close_count(), 2);
    }
}
