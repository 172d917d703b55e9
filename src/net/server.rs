//! Relay Server
//!
//! Accepts signaling connections (plain TCP or TLS), runs the connect
//! handshake and then hands every frame to the shared [`SignalingRelay`].

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::protocol::{read_message, write_message, ProtocolError, SignalingMessage};
use crate::relay::SignalingRelay;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Client did not identify itself in time")]
    HandshakeTimeout,
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

pub struct RelayServer {
    relay: Arc<SignalingRelay>,
    config: ServerConfig,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            relay: Arc::new(SignalingRelay::new()),
            config,
        }
    }

    pub fn relay(&self) -> Arc<SignalingRelay> {
        self.relay.clone()
    }

    /// Accept connections until the listener fails
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();
            let tls = tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            info!("New TLS connection from {}", peer_addr);
                            server.run_connection(tls_stream, peer_addr).await;
                        }
                        Err(e) => {
                            error!("TLS handshake failed for {}: {}", peer_addr, e);
                        }
                    },
                    None => {
                        info!("New connection from {}", peer_addr);
                        server.run_connection(stream, peer_addr).await;
                    }
                }
            });
        }
    }

    async fn run_connection<S>(&self, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = self.handle_connection(stream, peer_addr).await {
            error!("Client {} error: {}", peer_addr, e);
        }
    }

    /// Serve one client connection to completion
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let max_len = self.config.max_message_bytes;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // The first frame must name the user this connection speaks for
        let first = tokio::time::timeout(
            self.config.handshake_timeout(),
            read_message(&mut read_half, max_len),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;

        let user_id = match first {
            Some(SignalingMessage::Connect { user_id }) if !user_id.trim().is_empty() => user_id,
            Some(other) => {
                let reason = match other {
                    SignalingMessage::Connect { .. } => "user id must not be empty".to_string(),
                    _ => "expected connect".to_string(),
                };
                write_message(
                    &mut write_half,
                    &SignalingMessage::Error {
                        message: reason.clone(),
                    },
                )
                .await?;
                return Err(ServerError::Handshake(reason));
            }
            None => {
                debug!("Client {} closed before identifying", peer_addr);
                return Ok(());
            }
        };

        let connection_id = Uuid::new_v4();
        write_message(&mut write_half, &SignalingMessage::Connected { connection_id }).await?;

        // Everything after the handshake goes through the relay's queue
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                if let Err(e) = write_message(&mut write_half, &message).await {
                    debug!("Write to {} failed: {}", connection_id, e);
                    break;
                }
            }
        });

        self.relay.on_connect(&user_id, connection_id, message_tx);

        let result = loop {
            match read_message(&mut read_half, max_len).await {
                Ok(Some(message)) => self.relay.handle_message(connection_id, message),
                Ok(None) => break Ok(()),
                Err(ProtocolError::Json(e)) => {
                    warn!("Malformed frame from {}: {}", user_id, e);
                    self.relay.send_to(
                        connection_id,
                        SignalingMessage::Error {
                            message: format!("Malformed message: {}", e),
                        },
                    );
                }
                Err(e) => break Err(e.into()),
            }
        };

        self.relay.on_disconnect(connection_id);
        writer_task.abort();
        info!("Client {} ({}) disconnected", peer_addr, user_id);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_assigns_connection() {
        let server = Arc::new(RelayServer::new(ServerConfig::default()));
        let (client, remote) = duplex(64 * 1024);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_connection(remote, test_addr()).await })
        };

        let (mut reader, mut writer) = tokio::io::split(client);
        write_message(
            &mut writer,
            &SignalingMessage::Connect {
                user_id: "alice".to_string(),
            },
        )
        .await
        .unwrap();

        let reply = read_message(&mut reader, 64 * 1024).await.unwrap();
        assert!(matches!(reply, Some(SignalingMessage::Connected { .. })));
        let presence = read_message(&mut reader, 64 * 1024).await.unwrap();
        assert_eq!(
            presence,
            Some(SignalingMessage::OnlineUsers {
                user_ids: vec!["alice".to_string()],
            })
        );
        assert!(server.relay().registry().lookup("alice").is_some());

        writer.shutdown().await.unwrap();
        drop(writer);
        drop(reader);
        task.await.unwrap().unwrap();
        assert!(server.relay().registry().lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_first_frame() {
        let server = RelayServer::new(ServerConfig::default());
        let (client, remote) = duplex(64 * 1024);
        let (mut reader, mut writer) = tokio::io::split(client);

        write_message(
            &mut writer,
            &SignalingMessage::OnlineUsers { user_ids: vec![] },
        )
        .await
        .unwrap();

        let result = server.handle_connection(remote, test_addr()).await;
        assert!(matches!(result, Err(ServerError::Handshake(_))));
        let reply = read_message(&mut reader, 64 * 1024).await.unwrap();
        assert!(matches!(reply, Some(SignalingMessage::Error { .. })));
        assert_eq!(server.relay().connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let server = RelayServer::new(ServerConfig::default());
        let (_client, remote) = duplex(1024);

        let result = server.handle_connection(remote, test_addr()).await;
        assert!(matches!(result, Err(ServerError::HandshakeTimeout)));
    }
}
