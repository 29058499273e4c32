//! Relay errors.
//!
//! None of these are fatal to the process. Each one is contained to the
//! connection or update that caused it.

use crate::connection::{ConnectionId, SendFailure};
use crate::merge::MergeError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the registry, engine and sessions.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection is already tracked under a topic.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// The merge function rejected a payload. Stored content is unchanged.
    #[error("Merge failed on topic {topic}: {source}")]
    MergeFailed {
        topic: String,
        #[source]
        source: MergeError,
    },

    /// A write to one connection failed. That connection has been dropped.
    #[error("Send to {connection} failed: {source}")]
    TransportSendFailed {
        connection: ConnectionId,
        #[source]
        source: SendFailure,
    },

    /// Reading from a connection failed.
    #[error("Read from {connection} failed: {source}")]
    TransportReadFailed {
        connection: ConnectionId,
        #[source]
        source: TransportError,
    },
}

impl RelayError {
    /// Short, stable name for logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::AlreadyRegistered(_) => "already_registered",
            RelayError::InvalidTopic(_) => "invalid_topic",
            RelayError::MergeFailed { .. } => "merge_failed",
            RelayError::TransportSendFailed { .. } => "send_failed",
            RelayError::TransportReadFailed { .. } => "read_failed",
        }
    }
}
