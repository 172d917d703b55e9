//! Signaling client transport
//!
//! Connects to a relay, performs the connect handshake and exposes the
//! connection as a pair of channels a [`crate::CallController`] plugs into.

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::{read_message, write_message, Envelope, ProtocolError, SignalingMessage};
use crate::registry::ConnectionId;
use crate::tls::{self, TlsError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// An identified connection to the relay
pub struct SignalingConnection {
    pub connection_id: ConnectionId,
    /// Envelopes to send; each is wrapped in a signal frame
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Every frame the relay sends after the handshake
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    pub tasks: ConnectionTasks,
}

/// Reader and writer tasks of a connection. Dropping this closes it.
pub struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionTasks {
    /// Resolves once the relay side of the connection is gone. Returns
    /// immediately on every call after that.
    pub async fn closed(&mut self) {
        if self.reader.is_finished() {
            return;
        }
        let _ = (&mut self.reader).await;
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for ConnectionTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Connect to the relay named in `config` as `config.user_id`
pub async fn connect(config: &ClientConfig) -> Result<SignalingConnection, ClientError> {
    let addr = format!("{}:{}", config.server_host, config.signaling_port);
    let stream = TcpStream::connect(&addr).await?;
    info!("Connected to relay at {}", addr);

    if !config.tls {
        return open(stream, &config.user_id, config.max_message_bytes).await;
    }

    let connector = tls::client_connector(config.ca_certfile.as_deref())?;
    let name = config
        .server_name
        .clone()
        .unwrap_or_else(|| config.server_host.clone());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| ClientError::InvalidServerName(name))?;
    let tls_stream = connector.connect(server_name, stream).await?;
    debug!("TLS session established");

    open(tls_stream, &config.user_id, config.max_message_bytes).await
}

/// Run the handshake over an established stream and start the I/O tasks
pub async fn open<S>(
    stream: S,
    user_id: &str,
    max_message_bytes: usize,
) -> Result<SignalingConnection, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    write_message(
        &mut write_half,
        &SignalingMessage::Connect {
            user_id: user_id.to_string(),
        },
    )
    .await?;

    let connection_id: Uuid = match read_message(&mut read_half, max_message_bytes).await? {
        Some(SignalingMessage::Connected { connection_id }) => connection_id,
        Some(SignalingMessage::Error { message }) => return Err(ClientError::Handshake(message)),
        Some(other) => {
            return Err(ClientError::Handshake(format!(
                "unexpected reply {:?}",
                other
            )))
        }
        None => {
            return Err(ClientError::Handshake(
                "relay closed the connection".to_string(),
            ))
        }
    };
    info!("Signed in as {} ({})", user_id, connection_id);

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        loop {
            match read_message(&mut read_half, max_message_bytes).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Relay closed the connection");
                    break;
                }
                Err(ProtocolError::Json(e)) => {
                    warn!("Skipping malformed frame: {}", e);
                }
                Err(e) => {
                    warn!("Signaling connection failed: {}", e);
                    break;
                }
            }
        }
    });

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &SignalingMessage::Signal(envelope)).await {
                warn!("Failed to send envelope: {}", e);
                break;
            }
        }
    });

    Ok(SignalingConnection {
        connection_id,
        outbound,
        inbound,
        tasks: ConnectionTasks { reader, writer },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_and_framing() {
        let (client_side, relay_side) = duplex(64 * 1024);
        let (mut relay_read, mut relay_write) = tokio::io::split(relay_side);
        let assigned = Uuid::new_v4();

        let relay = tokio::spawn(async move {
            let hello = read_message(&mut relay_read, 1024).await.unwrap();
            assert_eq!(
                hello,
                Some(SignalingMessage::Connect {
                    user_id: "alice".to_string(),
                })
            );
            write_message(
                &mut relay_write,
                &SignalingMessage::Connected {
                    connection_id: assigned,
                },
            )
            .await
            .unwrap();
            write_message(
                &mut relay_write,
                &SignalingMessage::OnlineUsers {
                    user_ids: vec!["alice".to_string()],
                },
            )
            .await
            .unwrap();

            read_message(&mut relay_read, 1024).await.unwrap()
        });

        let mut connection = open(client_side, "alice", 64 * 1024).await.unwrap();
        assert_eq!(connection.connection_id, assigned);
        assert_eq!(
            connection.inbound.recv().await,
            Some(SignalingMessage::OnlineUsers {
                user_ids: vec!["alice".to_string()],
            })
        );

        let envelope = Envelope::EndCall {
            from_user_id: "alice".to_string(),
            to_user_id: "bob".to_string(),
            call_id: Uuid::new_v4(),
        };
        connection.outbound.send(envelope.clone()).unwrap();
        assert_eq!(relay.await.unwrap(), Some(SignalingMessage::Signal(envelope)));
    }

    #[tokio::test]
    async fn test_closed_can_be_awaited_again() {
        let (client_side, relay_side) = duplex(1024);
        let (mut relay_read, mut relay_write) = tokio::io::split(relay_side);

        tokio::spawn(async move {
            let _ = read_message(&mut relay_read, 1024).await;
            write_message(
                &mut relay_write,
                &SignalingMessage::Connected {
                    connection_id: Uuid::new_v4(),
                },
            )
            .await
            .unwrap();
            // Both halves drop here and the relay side hangs up
        });

        let mut connection = open(client_side, "alice", 1024).await.unwrap();
        connection.tasks.closed().await;
        assert!(connection.tasks.is_closed());

        // A second select loop over the same tasks must not panic
        connection.tasks.closed().await;
        assert!(connection.tasks.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (client_side, relay_side) = duplex(1024);
        let (mut relay_read, mut relay_write) = tokio::io::split(relay_side);

        tokio::spawn(async move {
            let _ = read_message(&mut relay_read, 1024).await;
            write_message(
                &mut relay_write,
                &SignalingMessage::Error {
                    message: "user id must not be empty".to_string(),
                },
            )
            .await
            .unwrap();
        });

        let result = open(client_side, "", 1024).await;
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }
}
