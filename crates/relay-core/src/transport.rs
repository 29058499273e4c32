//! Transport traits the session reads from and writes to.
//!
//! A transport is split into a [`PayloadSource`] and a [`PayloadSink`] so the
//! session can wait on inbound payloads and its outbound queue at the same
//! time. Encoding is the transport's business: the source yields opaque
//! payloads and the sink decides how an [`Outbound`] looks on the wire.

use crate::connection::Outbound;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Wire encoding error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The receiving half of a connection.
#[async_trait]
pub trait PayloadSource: Send {
    /// Receive the next update payload.
    ///
    /// Returns `None` if the connection is closed cleanly. Implementations
    /// must be cancel safe: the session races this call against its
    /// outbound queue.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// The sending half of a connection.
#[async_trait]
pub trait PayloadSink: Send {
    /// Write one message to the peer.
    async fn send(&mut self, message: &Outbound) -> Result<(), TransportError>;

    /// Close the connection. Called exactly once, at teardown.
    async fn close(&mut self) -> Result<(), TransportError>;
}
