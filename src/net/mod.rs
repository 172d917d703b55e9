//! Network transport for the signaling channel

pub mod client;
pub mod server;

pub use client::{connect, ClientError, ConnectionTasks, SignalingConnection};
pub use server::{RelayServer, ServerError};
