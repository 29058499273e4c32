//! Frame types for the live-relay protocol.
//!
//! Each frame is serialized using MessagePack with named fields.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod error_codes {
    /// The merge function rejected the update.
    pub const MERGE_REJECTED: u16 = 1001;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Update payload from a client. The topic is fixed by the connection.
    #[serde(rename = "update")]
    Update {
        /// Opaque payload handed to the merge function.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Content of the topic at the moment the client joined.
    #[serde(rename = "snapshot")]
    Snapshot {
        /// Topic name.
        topic: String,
        /// Version of the content.
        version: u64,
        /// Full content.
        content: String,
    },

    /// Content after an accepted update.
    #[serde(rename = "content")]
    Content {
        /// Topic name.
        topic: String,
        /// Version of the content.
        version: u64,
        /// Full content.
        content: String,
        /// Connection whose update produced this version.
        #[serde(skip_serializing_if = "Option::is_none")]
        origin: Option<u64>,
    },

    /// The client's update was accepted.
    #[serde(rename = "ack")]
    Ack {
        /// Version the update produced.
        version: u64,
    },

    /// The client's update or frame was refused.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl Frame {
    /// Get the frame name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Update { .. } => "update",
            Frame::Snapshot { .. } => "snapshot",
            Frame::Content { .. } => "content",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
        }
    }

    /// Create a new Update frame.
    #[must_use]
    pub fn update(payload: impl Into<Vec<u8>>) -> Self {
        Frame::Update {
            payload: payload.into(),
        }
    }

    /// Create a new Snapshot frame.
    #[must_use]
    pub fn snapshot(topic: impl Into<String>, version: u64, content: impl Into<String>) -> Self {
        Frame::Snapshot {
            topic: topic.into(),
            version,
            content: content.into(),
        }
    }

    /// Create a new Content frame.
    #[must_use]
    pub fn content(
        topic: impl Into<String>,
        version: u64,
        content: impl Into<String>,
        origin: Option<u64>,
    ) -> Self {
        Frame::Content {
            topic: topic.into(),
            version,
            content: content.into(),
            origin,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(version: u64) -> Self {
        Frame::Ack { version }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }
}
