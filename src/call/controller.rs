//! Call Controller
//!
//! Owns at most one [`CallSession`] at a time and drives it from user
//! actions and from envelopes delivered by the relay.
//!
//! No lock is held across an await. Every step that resumes after a
//! suspension re-checks that its session is still the current one and
//! releases whatever it acquired when it is not.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::session::{CallSession, CallState};
use super::{CallError, CallEvent, CallFailure, IncomingCall};
use crate::config::ClientConfig;
use crate::media::{
    MediaConstraints, MediaEngine, MediaError, MediaStreamHandle, PeerConfig, PeerConnection,
    PeerEvent, PeerEventSink,
};
use crate::protocol::{Envelope, FailureReason, IceCandidate, SessionDescription, SignalingMessage};

const EVENT_CAPACITY: usize = 64;

/// Controller behaviour supplied by the presentation layer
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Name shown to the callee
    pub display_name: Option<String>,
    pub peer_config: PeerConfig,
    /// Capture used by `start` and `accept`
    pub default_constraints: MediaConstraints,
    /// How long a call may ring before it is dropped
    pub ring_timeout: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            display_name: None,
            peer_config: PeerConfig::default(),
            default_constraints: MediaConstraints::audio_only(),
            ring_timeout: None,
        }
    }
}

impl ControllerOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            display_name: config.display_name.clone(),
            peer_config: PeerConfig {
                ice_servers: config.ice_servers.clone(),
            },
            default_constraints: config.media.into(),
            ring_timeout: config.ring_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Hangup,
    RemoteHangup,
    Declined,
    RingTimeout,
    TargetOffline,
    MediaFailure,
    NegotiationFailure,
    Disconnected,
}

impl EndReason {
    fn notifies_peer(self) -> bool {
        !matches!(
            self,
            EndReason::Declined | EndReason::TargetOffline | EndReason::Disconnected
        )
    }
}

struct Inner {
    session: Option<CallSession>,
    next_session_id: u64,
    online_users: Vec<String>,
    shut_down: bool,
}

struct Shared {
    user_id: String,
    engine: Arc<dyn MediaEngine>,
    outbound: mpsc::UnboundedSender<Envelope>,
    options: ControllerOptions,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CallEvent>,
}

/// Entry point for the presentation layer.
///
/// The inbound subscription lives exactly as long as the controller:
/// dropping it (or calling [`CallController::shutdown`]) ends any call and
/// stops envelope dispatch.
pub struct CallController {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    /// Create a controller for `user_id` and start consuming `inbound`.
    /// Must be called from within a tokio runtime.
    pub fn new(
        user_id: &str,
        engine: Arc<dyn MediaEngine>,
        options: ControllerOptions,
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            user_id: user_id.to_string(),
            engine,
            outbound,
            options,
            inner: Mutex::new(Inner {
                session: None,
                next_session_id: 1,
                online_users: Vec::new(),
                shut_down: false,
            }),
            events,
        });

        let dispatcher = tokio::spawn(run_dispatcher(shared.clone(), inbound));

        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Call `callee_id` with the default capture constraints
    pub async fn start(&self, callee_id: &str) -> Result<(), CallError> {
        self.start_with(callee_id, self.shared.options.default_constraints)
            .await
    }

    /// Call `callee_id`: capture media, produce an offer, send it
    pub async fn start_with(
        &self,
        callee_id: &str,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        let shared = &self.shared;
        if callee_id.is_empty() || callee_id == shared.user_id {
            return Err(CallError::InvalidTarget(callee_id.to_string()));
        }

        let session_id = {
            let mut inner = shared.inner.lock();
            if inner.shut_down {
                return Err(CallError::ShutDown);
            }
            if inner.session.is_some() {
                return Err(CallError::Busy);
            }
            let id = inner.next_session_id;
            inner.next_session_id += 1;
            inner.session = Some(CallSession::outgoing(id, callee_id, constraints));
            id
        };

        info!("Calling {} (session {})", callee_id, session_id);
        shared.emit(CallEvent::StateChanged {
            state: CallState::RingingOutgoing,
            peer_id: Some(callee_id.to_string()),
        });
        shared.arm_ring_timeout(session_id);

        let stream = match shared.engine.get_user_media(constraints).await {
            Ok(stream) => stream,
            Err(e) => return shared.media_failed(session_id, e),
        };
        let Some(connection) = shared.prepare_connection(session_id, stream) else {
            return Ok(());
        };

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                shared.negotiation_failed(session_id, e);
                return Ok(());
            }
        };
        if let Err(e) = connection.set_local_description(offer.clone()).await {
            shared.negotiation_failed(session_id, e);
            return Ok(());
        }

        let mut inner = shared.inner.lock();
        let Some(session) = inner
            .session
            .as_mut()
            .filter(|s| s.id() == session_id && s.state() == CallState::RingingOutgoing)
        else {
            debug!("Call to {} ended before the offer was sent", callee_id);
            return Ok(());
        };

        // Sent under the lock so no gathered candidate can overtake the offer
        let call_id = session.call_id();
        let held = session.mark_offer_sent();
        shared.send(Envelope::Offer {
            from_user_id: shared.user_id.clone(),
            to_user_id: callee_id.to_string(),
            call_id,
            from_name: shared.options.display_name.clone(),
            session_description: offer,
        });
        for candidate in held {
            shared.send(shared.candidate_envelope(callee_id, call_id, candidate));
        }
        Ok(())
    }

    /// Answer the ringing incoming call with the default constraints
    pub async fn accept(&self) -> Result<(), CallError> {
        self.accept_with(self.shared.options.default_constraints)
            .await
    }

    pub async fn accept_with(&self, constraints: MediaConstraints) -> Result<(), CallError> {
        let shared = &self.shared;
        let (session_id, peer_id, offer) = {
            let mut inner = shared.inner.lock();
            if inner.shut_down {
                return Err(CallError::ShutDown);
            }
            let session = inner.session.as_mut().ok_or(CallError::NoIncomingCall)?;
            let offer = session.begin_accept(constraints)?;
            (session.id(), session.peer_id().to_string(), offer)
        };

        info!("Accepting call from {} (session {})", peer_id, session_id);

        let stream = match shared.engine.get_user_media(constraints).await {
            Ok(stream) => stream,
            Err(e) => return shared.media_failed(session_id, e),
        };
        let Some(connection) = shared.prepare_connection(session_id, stream) else {
            return Ok(());
        };

        if let Err(e) = connection.set_remote_description(offer).await {
            shared.negotiation_failed(session_id, e);
            return Ok(());
        }
        if !shared.is_current(session_id) {
            return Ok(());
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                shared.negotiation_failed(session_id, e);
                return Ok(());
            }
        };
        if let Err(e) = connection.set_local_description(answer.clone()).await {
            shared.negotiation_failed(session_id, e);
            return Ok(());
        }

        {
            let mut inner = shared.inner.lock();
            let Some(session) = inner.session.as_mut().filter(|s| {
                s.id() == session_id && s.state() == CallState::RingingIncoming && s.is_accepting()
            }) else {
                debug!("Call from {} ended before the answer was sent", peer_id);
                return Ok(());
            };
            session.activate();
            shared.send(Envelope::Answer {
                from_user_id: shared.user_id.clone(),
                to_user_id: peer_id.clone(),
                call_id: session.call_id(),
                session_description: answer,
            });
        }

        info!("Call with {} is active", peer_id);
        shared.emit_state();
        shared.flush_candidates(session_id, connection).await;
        Ok(())
    }

    /// Reject the ringing incoming call. The caller is not told.
    pub fn decline(&self) -> Result<(), CallError> {
        let session_id = {
            let inner = self.shared.inner.lock();
            match &inner.session {
                Some(s) if s.state() == CallState::RingingIncoming => s.id(),
                _ => return Err(CallError::NoIncomingCall),
            }
        };
        self.shared.teardown(Some(session_id), EndReason::Declined);
        Ok(())
    }

    /// Hang up whatever call is in progress. Returns false when idle.
    pub fn end(&self) -> bool {
        self.shared.teardown(None, EndReason::Hangup)
    }

    /// End any call and stop consuming envelopes
    pub fn shutdown(&self) {
        self.shared.inner.lock().shut_down = true;
        self.end();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }

    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.peer_id().to_string())
    }

    /// The call waiting to be answered, if any
    pub fn incoming_call(&self) -> Option<IncomingCall> {
        let inner = self.shared.inner.lock();
        inner
            .session
            .as_ref()
            .filter(|s| s.state() == CallState::RingingIncoming && !s.is_accepting())
            .map(|s| IncomingCall {
                from_user_id: s.peer_id().to_string(),
                from_name: s.peer_name().map(str::to_string),
            })
    }

    pub fn is_calling(&self) -> bool {
        self.state() == CallState::RingingOutgoing
    }

    pub fn in_call(&self) -> bool {
        self.state() == CallState::Active
    }

    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        let inner = self.shared.inner.lock();
        inner.session.as_ref().and_then(|s| s.local_stream().cloned())
    }

    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        let inner = self.shared.inner.lock();
        inner.session.as_ref().and_then(|s| s.remote_stream().cloned())
    }

    /// Users the relay last reported as online
    pub fn online_users(&self) -> Vec<String> {
        self.shared.inner.lock().online_users.clone()
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_dispatcher(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = inbound.recv().await {
        shared.dispatch(message).await;
    }
    info!("Signaling channel closed for {}", shared.user_id);
    shared.teardown(None, EndReason::Disconnected);
}

impl Shared {
    fn state(&self) -> CallState {
        self.inner
            .lock()
            .session
            .as_ref()
            .map_or(CallState::Idle, |s| s.state())
    }

    fn is_current(&self, session_id: u64) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.id() == session_id)
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self) {
        let (state, peer_id) = {
            let inner = self.inner.lock();
            match &inner.session {
                Some(s) => (s.state(), Some(s.peer_id().to_string())),
                None => (CallState::Idle, None),
            }
        };
        self.emit(CallEvent::StateChanged { state, peer_id });
    }

    fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            warn!("Signaling channel closed, envelope dropped");
        }
    }

    fn candidate_envelope(&self, peer_id: &str, call_id: Uuid, candidate: IceCandidate) -> Envelope {
        Envelope::IceCandidate {
            from_user_id: self.user_id.clone(),
            to_user_id: peer_id.to_string(),
            call_id,
            candidate,
        }
    }

    /// Attach freshly captured media and a new negotiation context to the
    /// session. Returns `None` (with everything released) if the session
    /// ended meanwhile or the context could not be created.
    fn prepare_connection(
        self: &Arc<Self>,
        session_id: u64,
        stream: MediaStreamHandle,
    ) -> Option<Arc<dyn PeerConnection>> {
        let attached = {
            let mut inner = self.inner.lock();
            match inner.session.as_mut().filter(|s| s.id() == session_id) {
                Some(session) => {
                    session.attach_local(stream.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            debug!("Session {} ended during media acquisition", session_id);
            stream.stop();
            return None;
        }

        let connection = match self
            .engine
            .create_peer_connection(&self.options.peer_config, self.event_sink(session_id))
        {
            Ok(connection) => connection,
            Err(e) => {
                self.negotiation_failed(session_id, e);
                return None;
            }
        };
        if let Err(e) = connection.add_stream(&stream) {
            connection.close();
            self.negotiation_failed(session_id, e);
            return None;
        }

        let attached = {
            let mut inner = self.inner.lock();
            match inner.session.as_mut().filter(|s| s.id() == session_id) {
                Some(session) => {
                    session.attach_connection(connection.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            connection.close();
            return None;
        }
        Some(connection)
    }

    fn event_sink(self: &Arc<Self>, session_id: u64) -> PeerEventSink {
        let weak: Weak<Shared> = Arc::downgrade(self);
        PeerEventSink::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_peer_event(session_id, event);
            }
        })
    }

    fn on_peer_event(&self, session_id: u64, event: PeerEvent) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.session.as_mut().filter(|s| s.id() == session_id) else {
            debug!("Ignoring engine event for finished session {}", session_id);
            if let PeerEvent::RemoteTrack(track) = event {
                track.stop();
            }
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.outbound_candidate(candidate) {
                    self.send(self.candidate_envelope(session.peer_id(), session.call_id(), candidate));
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let kind = track.kind();
                let peer_id = session.peer_id().to_string();
                session.add_remote_track(track);
                drop(inner);
                self.emit(CallEvent::RemoteTrack { peer_id, kind });
            }
            PeerEvent::Failed(reason) => {
                drop(inner);
                warn!("Media transport failed: {}", reason);
                self.teardown(Some(session_id), EndReason::NegotiationFailure);
            }
        }
    }

    fn media_failed(&self, session_id: u64, error: MediaError) -> Result<(), CallError> {
        if !self.teardown(Some(session_id), EndReason::MediaFailure) {
            // Already hung up while the prompt was open
            return Ok(());
        }
        warn!("Media acquisition failed: {}", error);
        let reason = error.to_string();
        self.emit(CallEvent::Failed(CallFailure::MediaAcquisitionDenied {
            reason: reason.clone(),
        }));
        Err(CallError::MediaAcquisitionDenied(reason))
    }

    fn negotiation_failed(&self, session_id: u64, error: MediaError) {
        if self.teardown(Some(session_id), EndReason::NegotiationFailure) {
            warn!("Negotiation failed for session {}: {}", session_id, error);
        }
    }

    /// End the session (the current one, or `expected` only). Resources are
    /// released exactly once; later calls find nothing to do.
    fn teardown(&self, expected: Option<u64>, reason: EndReason) -> bool {
        let teardown = {
            let mut inner = self.inner.lock();
            let matches = inner
                .session
                .as_ref()
                .is_some_and(|s| expected.map_or(true, |id| id == s.id()));
            if !matches {
                return false;
            }
            match inner.session.take() {
                Some(session) => session.into_teardown(),
                None => return false,
            }
        };

        info!(
            "Call with {} ended from {} ({:?})",
            teardown.peer_id, teardown.from_state, reason
        );
        if teardown.peer_contacted && reason.notifies_peer() {
            self.send(Envelope::EndCall {
                from_user_id: self.user_id.clone(),
                to_user_id: teardown.peer_id.clone(),
                call_id: teardown.call_id,
            });
        }
        teardown.release();

        self.emit(CallEvent::StateChanged {
            state: CallState::Idle,
            peer_id: None,
        });
        true
    }

    /// Apply candidates that were waiting for the remote description, in
    /// arrival order, until the buffer switches to pass-through.
    async fn flush_candidates(&self, session_id: u64, connection: Arc<dyn PeerConnection>) {
        loop {
            let batch = {
                let mut inner = self.inner.lock();
                match inner.session.as_mut().filter(|s| s.id() == session_id) {
                    Some(session) => session.drain_candidates(),
                    None => return,
                }
            };
            if batch.is_empty() {
                return;
            }

            debug!("Applying {} buffered candidates", batch.len());
            for candidate in batch {
                if !self.is_current(session_id) {
                    return;
                }
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    self.negotiation_failed(session_id, e);
                    return;
                }
            }
        }
    }

    fn arm_ring_timeout(self: &Arc<Self>, session_id: u64) {
        let Some(timeout) = self.options.ring_timeout else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire_ringing(session_id);
            }
        });
    }

    fn expire_ringing(&self, session_id: u64) {
        let state = {
            let inner = self.inner.lock();
            match inner.session.as_ref().filter(|s| s.id() == session_id) {
                Some(s) if !s.is_accepting() => s.state(),
                _ => return,
            }
        };

        match state {
            CallState::RingingOutgoing => {
                info!("No answer, giving up on session {}", session_id);
                self.teardown(Some(session_id), EndReason::RingTimeout);
            }
            CallState::RingingIncoming => {
                info!("Incoming call went unanswered (session {})", session_id);
                self.teardown(Some(session_id), EndReason::Declined);
            }
            _ => {}
        }
    }

    async fn dispatch(self: &Arc<Self>, message: SignalingMessage) {
        match message {
            SignalingMessage::Signal(envelope) => {
                if let Err(e) = envelope.validate() {
                    warn!("Dropping invalid envelope: {}", e);
                    return;
                }
                if envelope.to_user_id() != self.user_id {
                    warn!("Dropping envelope addressed to {}", envelope.to_user_id());
                    return;
                }
                self.handle_envelope(envelope).await;
            }
            SignalingMessage::CallFailed {
                reason,
                to_user_id,
                call_id,
            } => {
                self.handle_call_failed(reason, &to_user_id, call_id);
            }
            SignalingMessage::OnlineUsers { user_ids } => {
                self.inner.lock().online_users = user_ids.clone();
                self.emit(CallEvent::Presence(user_ids));
            }
            SignalingMessage::Error { message } => {
                warn!("Relay error: {}", message);
            }
            other => {
                debug!("Ignoring {:?}", other);
            }
        }
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Offer {
                from_user_id,
                call_id,
                from_name,
                session_description,
                ..
            } => self.handle_offer(&from_user_id, call_id, from_name, session_description),
            Envelope::Answer {
                from_user_id,
                call_id,
                session_description,
                ..
            } => {
                self.handle_answer(&from_user_id, call_id, session_description)
                    .await
            }
            Envelope::IceCandidate {
                from_user_id,
                call_id,
                candidate,
                ..
            } => {
                self.handle_remote_candidate(&from_user_id, call_id, candidate)
                    .await
            }
            Envelope::EndCall {
                from_user_id,
                call_id,
                ..
            } => {
                let session_id = {
                    let inner = self.inner.lock();
                    inner
                        .session
                        .as_ref()
                        .filter(|s| s.is_call(&from_user_id, call_id))
                        .map(|s| s.id())
                };
                match session_id {
                    Some(id) => {
                        self.teardown(Some(id), EndReason::RemoteHangup);
                    }
                    None => debug!("Stale end-call from {} (call {})", from_user_id, call_id),
                }
            }
        }
    }

    fn handle_offer(
        self: &Arc<Self>,
        from_user_id: &str,
        call_id: Uuid,
        from_name: Option<String>,
        offer: SessionDescription,
    ) {
        enum Outcome {
            Ringing(u64),
            Duplicate,
            Busy,
        }

        let outcome = {
            let mut inner = self.inner.lock();
            let duplicate = inner.session.as_ref().is_some_and(|s| {
                s.is_call(from_user_id, call_id) && s.state() == CallState::RingingIncoming
            });
            if inner.session.is_none() && !inner.shut_down {
                let id = inner.next_session_id;
                inner.next_session_id += 1;
                inner.session = Some(CallSession::incoming(
                    id,
                    call_id,
                    from_user_id,
                    from_name.clone(),
                    offer,
                ));
                Outcome::Ringing(id)
            } else if duplicate {
                Outcome::Duplicate
            } else {
                Outcome::Busy
            }
        };

        match outcome {
            Outcome::Ringing(id) => {
                info!("Incoming call from {} (session {})", from_user_id, id);
                self.emit(CallEvent::StateChanged {
                    state: CallState::RingingIncoming,
                    peer_id: Some(from_user_id.to_string()),
                });
                self.emit(CallEvent::IncomingCall(IncomingCall {
                    from_user_id: from_user_id.to_string(),
                    from_name,
                }));
                self.arm_ring_timeout(id);
            }
            Outcome::Duplicate => debug!("Duplicate offer from {}", from_user_id),
            Outcome::Busy => {
                info!("Busy, turning away call from {}", from_user_id);
                self.send(Envelope::EndCall {
                    from_user_id: self.user_id.clone(),
                    to_user_id: from_user_id.to_string(),
                    call_id,
                });
            }
        }
    }

    async fn handle_answer(&self, from_user_id: &str, call_id: Uuid, answer: SessionDescription) {
        let target = {
            let inner = self.inner.lock();
            inner
                .session
                .as_ref()
                .filter(|s| {
                    s.is_call(from_user_id, call_id)
                        && s.state() == CallState::RingingOutgoing
                        && s.peer_contacted()
                })
                .and_then(|s| s.connection().cloned().map(|c| (s.id(), c)))
        };
        let Some((session_id, connection)) = target else {
            debug!("Stale answer from {} (call {})", from_user_id, call_id);
            return;
        };

        if let Err(e) = connection.set_remote_description(answer).await {
            self.negotiation_failed(session_id, e);
            return;
        }

        {
            let mut inner = self.inner.lock();
            match inner
                .session
                .as_mut()
                .filter(|s| s.id() == session_id && s.state() == CallState::RingingOutgoing)
            {
                Some(session) => session.activate(),
                None => return,
            }
        }

        info!("Call with {} is active", from_user_id);
        self.emit_state();
        self.flush_candidates(session_id, connection).await;
    }

    async fn handle_remote_candidate(
        &self,
        from_user_id: &str,
        call_id: Uuid,
        candidate: IceCandidate,
    ) {
        let ready = {
            let mut inner = self.inner.lock();
            let Some(session) = inner
                .session
                .as_mut()
                .filter(|s| s.is_call(from_user_id, call_id))
            else {
                debug!("Stale candidate from {} (call {})", from_user_id, call_id);
                return;
            };
            match session.inbound_candidate(candidate) {
                Some(candidate) => session
                    .connection()
                    .cloned()
                    .map(|c| (session.id(), c, candidate)),
                None => None,
            }
        };

        if let Some((session_id, connection, candidate)) = ready {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                self.negotiation_failed(session_id, e);
            }
        }
    }

    fn handle_call_failed(&self, reason: FailureReason, to_user_id: &str, call_id: Uuid) {
        let session_id = {
            let inner = self.inner.lock();
            inner
                .session
                .as_ref()
                .filter(|s| s.is_call(to_user_id, call_id) && s.state() == CallState::RingingOutgoing)
                .map(|s| s.id())
        };
        let Some(session_id) = session_id else {
            debug!("Stale call failure for {} (call {})", to_user_id, call_id);
            return;
        };

        match reason {
            FailureReason::TargetOffline => {
                info!("{} is offline", to_user_id);
                if self.teardown(Some(session_id), EndReason::TargetOffline) {
                    self.emit(CallEvent::Failed(CallFailure::TargetOffline {
                        peer_id: to_user_id.to_string(),
                    }));
                }
            }
        }
    }
}
