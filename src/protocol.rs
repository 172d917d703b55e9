//! Signaling Protocol
//!
//! Defines the frames exchanged between clients and the relay, and the
//! call envelopes the relay forwards between two users.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Default upper bound for a single frame (JSON signaling stays small)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid message format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// Frames exchanged between a client and the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignalingMessage {
    // Client -> Server
    /// First frame on every connection; binds the identity for its lifetime.
    Connect {
        user_id: String,
    },

    // Both directions
    Signal(Envelope),

    // Server -> Client
    Connected {
        connection_id: Uuid,
    },
    CallFailed {
        reason: FailureReason,
        to_user_id: String,
        call_id: Uuid,
    },
    OnlineUsers {
        user_ids: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Why the relay refused to start a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    TargetOffline,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::TargetOffline => write!(f, "target offline"),
        }
    }
}

/// Call negotiation envelope routed peer to peer. `call_id` is minted by
/// the caller and shared by every envelope of that call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Offer {
        from_user_id: String,
        to_user_id: String,
        call_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        session_description: SessionDescription,
    },
    Answer {
        from_user_id: String,
        to_user_id: String,
        call_id: Uuid,
        session_description: SessionDescription,
    },
    IceCandidate {
        from_user_id: String,
        to_user_id: String,
        call_id: Uuid,
        candidate: IceCandidate,
    },
    EndCall {
        from_user_id: String,
        to_user_id: String,
        call_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer describing one side's proposed media session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network path a peer advertises for the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Offer { .. } => EnvelopeKind::Offer,
            Envelope::Answer { .. } => EnvelopeKind::Answer,
            Envelope::IceCandidate { .. } => EnvelopeKind::IceCandidate,
            Envelope::EndCall { .. } => EnvelopeKind::EndCall,
        }
    }

    pub fn from_user_id(&self) -> &str {
        match self {
            Envelope::Offer { from_user_id, .. }
            | Envelope::Answer { from_user_id, .. }
            | Envelope::IceCandidate { from_user_id, .. }
            | Envelope::EndCall { from_user_id, .. } => from_user_id,
        }
    }

    pub fn to_user_id(&self) -> &str {
        match self {
            Envelope::Offer { to_user_id, .. }
            | Envelope::Answer { to_user_id, .. }
            | Envelope::IceCandidate { to_user_id, .. }
            | Envelope::EndCall { to_user_id, .. } => to_user_id,
        }
    }

    pub fn call_id(&self) -> Uuid {
        match self {
            Envelope::Offer { call_id, .. }
            | Envelope::Answer { call_id, .. }
            | Envelope::IceCandidate { call_id, .. }
            | Envelope::EndCall { call_id, .. } => *call_id,
        }
    }

    /// Structural checks applied on ingress, before routing or dispatch
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.from_user_id().is_empty() || self.to_user_id().is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty user id"));
        }
        if self.from_user_id() == self.to_user_id() {
            return Err(ProtocolError::InvalidEnvelope("sender and recipient are the same user"));
        }
        match self {
            Envelope::Offer { session_description, .. } => {
                check_description(session_description, SdpKind::Offer)
            }
            Envelope::Answer { session_description, .. } => {
                check_description(session_description, SdpKind::Answer)
            }
            Envelope::IceCandidate { candidate, .. } if candidate.candidate.is_empty() => {
                Err(ProtocolError::InvalidEnvelope("empty candidate"))
            }
            _ => Ok(()),
        }
    }
}

fn check_description(desc: &SessionDescription, expected: SdpKind) -> Result<(), ProtocolError> {
    if desc.kind != expected {
        return Err(ProtocolError::InvalidEnvelope("session description kind mismatch"));
    }
    if desc.sdp.is_empty() {
        return Err(ProtocolError::InvalidEnvelope("empty session description"));
    }
    Ok(())
}

impl SignalingMessage {
    /// Serialize the message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed message with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = self.to_bytes()?;
        let len = (data.len() as u32).to_be_bytes();
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&data);
        Ok(framed)
    }
}

/// Write one framed message
pub async fn write_message<W>(stream: &mut W, message: &SignalingMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = message.to_framed()?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `Ok(None)` when the peer closed the
/// stream cleanly between frames.
pub async fn read_message<R>(
    stream: &mut R,
    max_len: usize,
) -> Result<Option<SignalingMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > max_len {
        return Err(ProtocolError::TooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(Some(SignalingMessage::from_bytes(&msg_buf)?))
}
