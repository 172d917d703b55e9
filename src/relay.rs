//! Signaling Relay
//!
//! Forwards call envelopes between connected users without looking inside
//! them, and keeps every connection informed about who is online.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::protocol::{Envelope, EnvelopeKind, FailureReason, ProtocolError, SignalingMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Outcome of routing one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the recipient's connection
    Forwarded(ConnectionId),
    /// Call initiation to an offline user; the sender was told
    TargetOffline,
    /// Recipient offline and the envelope needs no reply
    Dropped,
}

/// Routing rejections
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Connection bound to {bound} sent an envelope as {claimed}")]
    SpoofedSender { bound: String, claimed: String },
    #[error("Connection {0} was replaced by a newer one")]
    Replaced(ConnectionId),
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
    #[error("Unexpected message after connect")]
    UnexpectedMessage,
}

/// One live client connection
struct ConnectionState {
    user_id: String,
    message_tx: mpsc::UnboundedSender<SignalingMessage>,
}

/// Server-side relay state. Constructed once per server and shared by all
/// connection tasks.
pub struct SignalingRelay {
    registry: ConnectionRegistry,
    connections: RwLock<HashMap<ConnectionId, ConnectionState>>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bind a new connection to `user_id` and announce the new online set
    pub fn on_connect(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        message_tx: mpsc::UnboundedSender<SignalingMessage>,
    ) {
        self.connections.write().insert(
            connection_id,
            ConnectionState {
                user_id: user_id.to_string(),
                message_tx,
            },
        );

        if let Some(displaced) = self.registry.register(user_id, connection_id) {
            info!("User {} reconnected, replacing connection {}", user_id, displaced);
        }

        info!("User {} connected ({})", user_id, connection_id);
        self.broadcast_online_users();
    }

    /// Forget a closed connection and announce the new online set
    pub fn on_disconnect(&self, connection_id: ConnectionId) -> Option<String> {
        let removed = self.connections.write().remove(&connection_id);
        let unregistered = self.registry.unregister_connection(connection_id);

        if let Some(user_id) = &unregistered {
            info!("User {} disconnected ({})", user_id, connection_id);
            self.broadcast_online_users();
        } else if let Some(state) = &removed {
            debug!(
                "Replaced connection {} for {} closed",
                connection_id, state.user_id
            );
        }

        removed.map(|state| state.user_id)
    }

    /// Handle a frame received from `connection_id` after its handshake
    pub fn handle_message(&self, connection_id: ConnectionId, message: SignalingMessage) {
        let result = match message {
            SignalingMessage::Signal(envelope) => self.route(connection_id, envelope).map(|_| ()),
            _ => Err(RelayError::UnexpectedMessage),
        };

        if let Err(e) = result {
            warn!("Rejected message from {}: {}", connection_id, e);
            self.send_to(
                connection_id,
                SignalingMessage::Error {
                    message: e.to_string(),
                },
            );
        }
    }

    /// Route one envelope from `connection_id` to its recipient
    pub fn route(
        &self,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<RouteOutcome, RelayError> {
        let bound_user = self
            .connections
            .read()
            .get(&connection_id)
            .map(|c| c.user_id.clone())
            .ok_or(RelayError::UnknownConnection(connection_id))?;

        if envelope.from_user_id() != bound_user {
            return Err(RelayError::SpoofedSender {
                bound: bound_user,
                claimed: envelope.from_user_id().to_string(),
            });
        }
        // Only the newest connection speaks for its user
        if self.registry.lookup(&bound_user) != Some(connection_id) {
            return Err(RelayError::Replaced(connection_id));
        }
        envelope.validate()?;

        let kind = envelope.kind();
        let to_user_id = envelope.to_user_id().to_string();
        let call_id = envelope.call_id();

        if let Some(target) = self.registry.lookup(&to_user_id) {
            if self.send_to(target, SignalingMessage::Signal(envelope)) {
                debug!("Forwarded {:?} {} -> {}", kind, bound_user, to_user_id);
                return Ok(RouteOutcome::Forwarded(target));
            }
        }

        if kind == EnvelopeKind::Offer {
            info!("Call from {} failed: {} is offline", bound_user, to_user_id);
            self.send_to(
                connection_id,
                SignalingMessage::CallFailed {
                    reason: FailureReason::TargetOffline,
                    to_user_id,
                    call_id,
                },
            );
            Ok(RouteOutcome::TargetOffline)
        } else {
            debug!("Dropped {:?} for offline user {}", kind, to_user_id);
            Ok(RouteOutcome::Dropped)
        }
    }

    /// Send the full online-user set to every connection
    pub fn broadcast_online_users(&self) {
        let user_ids = self.registry.online_users();
        let connections = self.connections.read();
        debug!("Broadcasting {} online users to {} connections", user_ids.len(), connections.len());

        for (connection_id, state) in connections.iter() {
            let message = SignalingMessage::OnlineUsers {
                user_ids: user_ids.clone(),
            };
            if state.message_tx.send(message).is_err() {
                debug!("Connection {} is closing, skipped presence update", connection_id);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Queue a message for one connection. Returns false if it is gone.
    pub fn send_to(&self, connection_id: ConnectionId, message: SignalingMessage) -> bool {
        match self.connections.read().get(&connection_id) {
            Some(state) => state.message_tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new()
    }
}
