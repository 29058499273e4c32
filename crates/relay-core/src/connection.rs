//! Connection identity and outbound message types.
//!
//! The registry never owns a transport. It holds a [`ConnectionHandle`], the
//! sending half of the connection's bounded outbound queue, and the session
//! that owns the transport drains the other half.

use crate::transport::TransportError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Source of connection IDs. Starts at 1 so that 0 never names a connection.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique, monotonically increasing identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw ID.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A merged content state ready for delivery.
///
/// One `Update` is shared by every recipient of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Topic the content belongs to.
    pub topic: String,
    /// Version produced by the merge.
    pub version: u64,
    /// Full content after the merge.
    pub content: Arc<str>,
    /// Connection whose payload produced this version, if any.
    pub origin: Option<ConnectionId>,
}

/// A message queued for a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Current content sent once when a connection joins a topic.
    Snapshot(Arc<Update>),
    /// Content produced by an accepted update.
    Update(Arc<Update>),
    /// The connection's own update was accepted as `version`.
    Ack { version: u64 },
    /// The connection's own update was rejected by the merge function.
    Rejected { reason: String },
}

impl Outbound {
    /// Get the message kind for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Snapshot(_) => "snapshot",
            Outbound::Update(_) => "update",
            Outbound::Ack { .. } => "ack",
            Outbound::Rejected { .. } => "rejected",
        }
    }

    /// Get the content version the message refers to, if any.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        match self {
            Outbound::Snapshot(update) | Outbound::Update(update) => Some(update.version),
            Outbound::Ack { version } => Some(*version),
            Outbound::Rejected { .. } => None,
        }
    }
}

/// Why a message could not be delivered to a connection.
#[derive(Debug, Error)]
pub enum SendFailure {
    /// The connection's outbound queue is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection is gone.
    #[error("Connection closed")]
    Closed,

    /// The transport did not accept the write in time.
    #[error("Write timed out")]
    Timeout,

    /// The transport rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Non-owning handle the registry keeps for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { id, sender }, receiver)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailure::QueueFull`] when the connection is not keeping
    /// up and [`SendFailure::Closed`] when its session has gone away.
    pub fn deliver(&self, message: Outbound) -> Result<(), SendFailure> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::QueueFull,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Check if the receiving session has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_increase() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::from_raw(7).to_string(), "conn-7");
    }

    #[test]
    fn test_deliver_reports_full_queue() {
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::from_raw(1), 1);

        handle.deliver(Outbound::Ack { version: 1 }).unwrap();
        assert!(matches!(
            handle.deliver(Outbound::Ack { version: 2 }),
            Err(SendFailure::QueueFull)
        ));

        assert_eq!(rx.try_recv().unwrap(), Outbound::Ack { version: 1 });
    }

    #[test]
    fn test_deliver_reports_closed_queue() {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::from_raw(1), 4);
        drop(rx);

        assert!(handle.is_closed());
        assert!(matches!(
            handle.deliver(Outbound::Ack { version: 1 }),
            Err(SendFailure::Closed)
        ));
    }
}
