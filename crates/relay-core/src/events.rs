//! Observability hooks.
//!
//! The engine reports what it does as [`RelayEvent`]s. Sinks must be cheap:
//! they are called on the update path.

use crate::connection::ConnectionId;
use tracing::{debug, trace, warn};

/// Something the engine did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A connection joined a topic.
    ConnectionRegistered {
        topic: String,
        connection: ConnectionId,
    },
    /// A connection left a topic.
    ConnectionUnregistered {
        topic: String,
        connection: ConnectionId,
    },
    /// A payload from `connection` was rejected; `version` is the unchanged
    /// version of the topic.
    MergeFailed {
        topic: String,
        connection: ConnectionId,
        version: u64,
        reason: String,
    },
    /// `version` was queued for `connection`.
    BroadcastSent {
        topic: String,
        connection: ConnectionId,
        version: u64,
    },
    /// `version` could not be queued for `connection`.
    BroadcastSendFailed {
        topic: String,
        connection: ConnectionId,
        version: u64,
        reason: String,
    },
}

impl RelayEvent {
    /// Get the event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::ConnectionRegistered { .. } => "connection_registered",
            RelayEvent::ConnectionUnregistered { .. } => "connection_unregistered",
            RelayEvent::MergeFailed { .. } => "merge_failed",
            RelayEvent::BroadcastSent { .. } => "broadcast_sent",
            RelayEvent::BroadcastSendFailed { .. } => "broadcast_send_failed",
        }
    }

    /// Get the topic the event concerns.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            RelayEvent::ConnectionRegistered { topic, .. }
            | RelayEvent::ConnectionUnregistered { topic, .. }
            | RelayEvent::MergeFailed { topic, .. }
            | RelayEvent::BroadcastSent { topic, .. }
            | RelayEvent::BroadcastSendFailed { topic, .. } => topic,
        }
    }

    /// Get the connection the event concerns.
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        match self {
            RelayEvent::ConnectionRegistered { connection, .. }
            | RelayEvent::ConnectionUnregistered { connection, .. }
            | RelayEvent::MergeFailed { connection, .. }
            | RelayEvent::BroadcastSent { connection, .. }
            | RelayEvent::BroadcastSendFailed { connection, .. } => *connection,
        }
    }
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &RelayEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &RelayEvent) {
        match event {
            RelayEvent::ConnectionRegistered { topic, connection } => {
                debug!(topic = %topic, connection = %connection, "Connection registered");
            }
            RelayEvent::ConnectionUnregistered { topic, connection } => {
                debug!(topic = %topic, connection = %connection, "Connection unregistered");
            }
            RelayEvent::MergeFailed {
                topic,
                connection,
                version,
                reason,
            } => {
                warn!(topic = %topic, connection = %connection, version, reason = %reason, "Merge failed");
            }
            RelayEvent::BroadcastSent {
                topic,
                connection,
                version,
            } => {
                trace!(topic = %topic, connection = %connection, version, "Broadcast sent");
            }
            RelayEvent::BroadcastSendFailed {
                topic,
                connection,
                version,
                reason,
            } => {
                warn!(topic = %topic, connection = %connection, version, reason = %reason, "Broadcast send failed");
            }
        }
    }
}
