//! Configuration
//!
//! Configuration structures for the relay server and the call client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_MESSAGE_BYTES;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub signaling_host: String,
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    /// Serve signaling over TLS when present
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Seconds a new connection has to send its `connect` frame
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Certificate and key used by the TLS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_signaling_port() -> u16 {
    5000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_host: default_host(),
            signaling_port: default_signaling_port(),
            tls: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Call client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Extra CA trusted on top of the bundled web roots
    #[serde(default)]
    pub ca_certfile: Option<PathBuf>,
    /// Name to verify the server certificate against (defaults to `server_host`)
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Seconds a call may ring before it is dropped; 0 disables the timeout
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_user_id() -> String {
    "user".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_ring_timeout_secs() -> u64 {
    45
}

/// Local capture configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            signaling_port: default_signaling_port(),
            tls: false,
            ca_certfile: None,
            server_name: None,
            user_id: default_user_id(),
            display_name: None,
            media: MediaConfig::default(),
            ice_servers: default_ice_servers(),
            ring_timeout_secs: default_ring_timeout_secs(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}
