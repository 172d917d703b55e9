//! Call Session
//!
//! State for exactly one call. A session is created when a call starts
//! ringing and consumed by [`CallSession::into_teardown`] when it ends; it
//! is never reused.

use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use super::CallError;
use crate::media::{MediaConstraints, MediaStreamHandle, MediaTrack, PeerConnection};
use crate::protocol::{IceCandidate, SessionDescription};

/// One side's view of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    RingingOutgoing,
    RingingIncoming,
    Active,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::RingingOutgoing => "ringing (outgoing)",
            CallState::RingingIncoming => "ringing (incoming)",
            CallState::Active => "active",
        };
        f.write_str(name)
    }
}

/// Remote candidates that arrived before the remote description was set
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_ready: bool,
}

impl IceCandidateBuffer {
    /// Hand the candidate back if it can be applied right away, otherwise
    /// queue it behind the ones already waiting.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Take everything queued so far. Once the queue is found empty the
    /// buffer switches to pass-through, so later arrivals cannot overtake
    /// a batch that is still being applied.
    pub fn drain_or_ready(&mut self) -> Vec<IceCandidate> {
        if self.pending.is_empty() {
            self.remote_ready = true;
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Per-call state machine data
pub struct CallSession {
    id: u64,
    /// Shared with the peer; tells this call's envelopes from stale ones
    call_id: Uuid,
    peer_id: String,
    peer_name: Option<String>,
    state: CallState,
    constraints: Option<MediaConstraints>,
    pending_offer: Option<SessionDescription>,
    accepting: bool,
    /// Whether the peer has seen anything from this session
    peer_contacted: bool,
    /// Local candidates gathered before our offer went out
    unsent_candidates: Vec<IceCandidate>,
    local_stream: Option<MediaStreamHandle>,
    remote_stream: Option<MediaStreamHandle>,
    connection: Option<Arc<dyn PeerConnection>>,
    candidates: IceCandidateBuffer,
}

impl CallSession {
    pub(crate) fn outgoing(id: u64, peer_id: &str, constraints: MediaConstraints) -> Self {
        Self::new(
            id,
            Uuid::new_v4(),
            peer_id,
            None,
            CallState::RingingOutgoing,
            Some(constraints),
            None,
        )
    }

    pub(crate) fn incoming(
        id: u64,
        call_id: Uuid,
        peer_id: &str,
        peer_name: Option<String>,
        offer: SessionDescription,
    ) -> Self {
        let mut session = Self::new(
            id,
            call_id,
            peer_id,
            peer_name,
            CallState::RingingIncoming,
            None,
            Some(offer),
        );
        session.peer_contacted = true;
        session
    }

    fn new(
        id: u64,
        call_id: Uuid,
        peer_id: &str,
        peer_name: Option<String>,
        state: CallState,
        constraints: Option<MediaConstraints>,
        pending_offer: Option<SessionDescription>,
    ) -> Self {
        Self {
            id,
            call_id,
            peer_id: peer_id.to_string(),
            peer_name,
            state,
            constraints,
            pending_offer,
            accepting: false,
            peer_contacted: false,
            unsent_candidates: Vec::new(),
            local_stream: None,
            remote_stream: None,
            connection: None,
            candidates: IceCandidateBuffer::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn constraints(&self) -> Option<MediaConstraints> {
        self.constraints
    }

    pub fn is_peer(&self, user_id: &str) -> bool {
        self.peer_id == user_id
    }

    /// Whether an envelope from `user_id` for `call_id` belongs to this call
    pub fn is_call(&self, user_id: &str, call_id: Uuid) -> bool {
        self.call_id == call_id && self.is_peer(user_id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn peer_contacted(&self) -> bool {
        self.peer_contacted
    }

    pub fn local_stream(&self) -> Option<&MediaStreamHandle> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStreamHandle> {
        self.remote_stream.as_ref()
    }

    pub fn connection(&self) -> Option<&Arc<dyn PeerConnection>> {
        self.connection.as_ref()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Claim the pending offer for an accept. Only the first accept of an
    /// untouched incoming call gets it.
    pub(crate) fn begin_accept(&mut self, constraints: MediaConstraints) -> Result<SessionDescription, CallError> {
        if self.state != CallState::RingingIncoming || self.accepting {
            return Err(CallError::Busy);
        }
        let offer = self.pending_offer.clone().ok_or(CallError::NoIncomingCall)?;
        self.accepting = true;
        self.constraints = Some(constraints);
        Ok(offer)
    }

    pub(crate) fn attach_local(&mut self, stream: MediaStreamHandle) {
        self.local_stream = Some(stream);
    }

    /// Attach the negotiation context together with an empty remote stream
    /// that incoming tracks are composed into.
    pub(crate) fn attach_connection(&mut self, connection: Arc<dyn PeerConnection>) {
        self.remote_stream = Some(MediaStreamHandle::new(format!("remote-{}", self.id)));
        self.connection = Some(connection);
    }

    pub(crate) fn add_remote_track(&mut self, track: Arc<dyn MediaTrack>) -> bool {
        match &self.remote_stream {
            Some(stream) => {
                stream.add_track(track);
                true
            }
            None => {
                track.stop();
                false
            }
        }
    }

    /// Record that the offer is on its way. Returns local candidates that
    /// were held back until now.
    pub(crate) fn mark_offer_sent(&mut self) -> Vec<IceCandidate> {
        self.peer_contacted = true;
        std::mem::take(&mut self.unsent_candidates)
    }

    /// Route a locally gathered candidate: `Some` means send it now
    pub(crate) fn outbound_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.peer_contacted {
            Some(candidate)
        } else {
            self.unsent_candidates.push(candidate);
            None
        }
    }

    pub(crate) fn inbound_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        self.candidates.push(candidate)
    }

    pub(crate) fn drain_candidates(&mut self) -> Vec<IceCandidate> {
        self.candidates.drain_or_ready()
    }

    pub(crate) fn activate(&mut self) {
        self.state = CallState::Active;
        self.pending_offer = None;
        self.accepting = false;
    }

    pub(crate) fn into_teardown(self) -> Teardown {
        if !self.candidates.is_empty() {
            debug!(
                "Discarding {} buffered candidates from {}",
                self.candidates.len(),
                self.peer_id
            );
        }
        Teardown {
            session_id: self.id,
            call_id: self.call_id,
            peer_id: self.peer_id,
            from_state: self.state,
            peer_contacted: self.peer_contacted,
            local_stream: self.local_stream,
            remote_stream: self.remote_stream,
            connection: self.connection,
        }
    }
}

/// Resources taken out of a finished session, released outside any lock
pub(crate) struct Teardown {
    pub session_id: u64,
    pub call_id: Uuid,
    pub peer_id: String,
    pub from_state: CallState,
    pub peer_contacted: bool,
    local_stream: Option<MediaStreamHandle>,
    remote_stream: Option<MediaStreamHandle>,
    connection: Option<Arc<dyn PeerConnection>>,
}

impl Teardown {
    /// Stop every track and close the negotiation context
    pub fn release(self) {
        if let Some(stream) = self.local_stream {
            stream.stop();
        }
        if let Some(stream) = self.remote_stream {
            stream.stop();
        }
        if let Some(connection) = self.connection {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n))
    }

    #[test]
    fn test_buffer_holds_until_ready() {
        let mut buffer = IceCandidateBuffer::default();
        assert!(buffer.push(candidate(1)).is_none());
        assert!(buffer.push(candidate(2)).is_none());

        assert_eq!(buffer.drain_or_ready(), vec![candidate(1), candidate(2)]);
        assert!(!buffer.is_remote_ready());

        // Arrival while the first batch is being applied
        assert!(buffer.push(candidate(3)).is_none());
        assert_eq!(buffer.drain_or_ready(), vec![candidate(3)]);

        assert!(buffer.drain_or_ready().is_empty());
        assert!(buffer.is_remote_ready());
        assert_eq!(buffer.push(candidate(4)), Some(candidate(4)));
    }

    #[test]
    fn test_accept_claims_offer_once() {
        let call_id = Uuid::new_v4();
        let mut session =
            CallSession::incoming(1, call_id, "alice", None, SessionDescription::offer("v=0"));
        assert!(session.peer_contacted());
        assert!(session.is_call("alice", call_id));
        assert!(!session.is_call("alice", Uuid::new_v4()));
        assert!(!session.is_call("carol", call_id));

        let offer = session.begin_accept(MediaConstraints::audio_only()).unwrap();
        assert_eq!(offer.sdp, "v=0");
        assert_eq!(
            session.begin_accept(MediaConstraints::audio_only()),
            Err(CallError::Busy)
        );

        session.activate();
        assert_eq!(session.state(), CallState::Active);
        assert!(!session.is_accepting());
    }

    #[test]
    fn test_outgoing_holds_candidates_until_offer_sent() {
        let mut session = CallSession::outgoing(7, "bob", MediaConstraints::audio_only());
        assert!(session.outbound_candidate(candidate(1)).is_none());
        assert!(session.outbound_candidate(candidate(2)).is_none());

        assert_eq!(session.mark_offer_sent(), vec![candidate(1), candidate(2)]);
        assert_eq!(session.outbound_candidate(candidate(3)), Some(candidate(3)));
    }

    #[test]
    fn test_session_buffers_remote_candidates() {
        let mut session =
            CallSession::incoming(3, Uuid::new_v4(), "alice", None, SessionDescription::offer("v=0"));
        assert!(session.inbound_candidate(candidate(1)).is_none());
        assert!(session.inbound_candidate(candidate(2)).is_none());
        assert_eq!(session.buffered_candidates(), 2);

        assert_eq!(session.drain_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(session.buffered_candidates(), 0);
        assert!(session.drain_candidates().is_empty());
        assert_eq!(session.inbound_candidate(candidate(3)), Some(candidate(3)));
    }

    #[test]
    fn test_outgoing_calls_get_fresh_ids() {
        let first = CallSession::outgoing(1, "bob", MediaConstraints::audio_only());
        let second = CallSession::outgoing(2, "bob", MediaConstraints::audio_only());
        assert_ne!(first.call_id(), second.call_id());
    }

    #[test]
    fn test_outgoing_cannot_accept() {
        let mut session = CallSession::outgoing(7, "bob", MediaConstraints::audio_only());
        assert_eq!(
            session.begin_accept(MediaConstraints::audio_only()),
            Err(CallError::Busy)
        );
        assert!(!session.is_accepting());
    }
}
