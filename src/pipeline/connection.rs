//! Transport contract between a session and its client.
//!
//! The WebSocket actor implements this for real connections; tests use a
//! scripted in-memory version. A session is the only reader and writer of
//! its connection.

use crate::error::TransportError;
use async_trait::async_trait;

/// What a receive produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One complete client audio buffer
    Audio(Vec<u8>),
    /// The client is gone. Takes priority over any audio still queued.
    Closed,
}

/// How the server ends a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Client left or the conversation ended cleanly
    Normal,
    /// The session failed
    Error,
    /// The server is going away
    Shutdown,
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn receive(&mut self) -> Result<Inbound, TransportError>;

    async fn send_audio(&mut self, audio: Vec<u8>) -> Result<(), TransportError>;

    /// Deliver the structured error notification.
    async fn send_error(&mut self, message: &str) -> Result<(), TransportError>;

    /// Close the transport. Closing an already-closed connection is a no-op.
    async fn close(&mut self, closure: Closure);

    /// Resolves once the peer has disconnected.
    async fn closed(&self);
}
