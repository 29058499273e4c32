//! Connection registry.
//!
//! Tracks which connections are live on which topic. Both maps are sharded
//! (`DashMap`), so joins and leaves on unrelated topics rarely contend, and
//! [`ConnectionRegistry::snapshot`] hands out a copy so callers never do I/O
//! under a registry lock.
//!
//! Lock order is always `members` before `topics`.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::RelayError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic name cannot be empty");
    }
    Ok(())
}

/// Live connections grouped by topic.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// Topic -> connections on that topic.
    topics: DashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
    /// Connection -> the one topic it is on.
    members: DashMap<ConnectionId, String>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyRegistered`] if the connection is already
    /// tracked under any topic, or [`RelayError::InvalidTopic`] for an empty
    /// topic name.
    pub fn register(&self, topic: &str, handle: ConnectionHandle) -> Result<(), RelayError> {
        validate_topic(topic).map_err(RelayError::InvalidTopic)?;

        let id = handle.id();
        match self.members.entry(id) {
            Entry::Occupied(_) => Err(RelayError::AlreadyRegistered(id)),
            Entry::Vacant(member) => {
                let count = {
                    let mut set = self.topics.entry(topic.to_string()).or_default();
                    set.insert(id, handle);
                    set.len()
                };
                member.insert(topic.to_string());
                debug!(topic = %topic, connection = %id, connections = count, "Registered");
                Ok(())
            }
        }
    }

    /// Remove a connection from whatever topic it is on.
    ///
    /// Returns the topic it was removed from, or `None` if it was not
    /// registered. Calling this twice is harmless.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let (_, topic) = self.members.remove(&id)?;

        if let Some(mut set) = self.topics.get_mut(&topic) {
            set.remove(&id);
        }
        if self.topics.remove_if(&topic, |_, set| set.is_empty()).is_some() {
            debug!(topic = %topic, "Dropped empty topic");
        }

        debug!(topic = %topic, connection = %id, "Unregistered");
        Some(topic)
    }

    /// Point-in-time copy of a topic's connections, ordered by ID.
    #[must_use]
    pub fn snapshot(&self, topic: &str) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self
            .topics
            .get(topic)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        handles.sort_by_key(ConnectionHandle::id);
        handles
    }

    /// Get the topic a connection is registered under.
    #[must_use]
    pub fn topic_of(&self, id: ConnectionId) -> Option<String> {
        self.members.get(&id).map(|t| t.value().clone())
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    /// Get the number of connections on a topic.
    #[must_use]
    pub fn connection_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|set| set.len()).unwrap_or(0)
    }

    /// Get all topics with at least one connection.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.topics.len(),
            connection_count: self.members.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of topics with live connections.
    pub topic_count: usize,
    /// Number of live connections.
    pub connection_count: usize,
}
