//! Broadcast engine.
//!
//! The engine ties the store and the registry together: it merges an update,
//! then queues the result for every connection on the topic. The topic lock
//! is held from the merge until the last delivery is queued, and queueing
//! never waits, so recipients see versions in the order they were merged.

use crate::connection::{ConnectionHandle, ConnectionId, Outbound, SendFailure, Update};
use crate::error::RelayError;
use crate::events::{EventSink, RelayEvent, TracingSink};
use crate::merge::MergeFunction;
use crate::registry::{validate_topic, ConnectionRegistry};
use crate::store::{ContentState, ContentStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Who receives the result of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPolicy {
    /// Every connection on the topic, including the origin.
    All,
    /// Every connection on the topic except the origin.
    #[default]
    Others,
}

/// Outcome of one fan-out.
#[derive(Debug)]
pub struct BroadcastReport {
    /// Topic that was updated.
    pub topic: String,
    /// Version produced by the merge.
    pub version: u64,
    /// Connections the update was queued for.
    pub delivered: Vec<ConnectionId>,
    /// Connections that could not take the update. They have been
    /// unregistered.
    pub failed: Vec<(ConnectionId, SendFailure)>,
}

impl BroadcastReport {
    /// Check if every recipient took the update.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Topics holding content.
    pub content_topics: usize,
    /// Topics with live connections.
    pub connected_topics: usize,
    /// Live connections.
    pub connections: usize,
}

/// Merges updates and fans them out to connections on the same topic.
pub struct BroadcastEngine {
    store: ContentStore,
    registry: ConnectionRegistry,
    policy: BroadcastPolicy,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl BroadcastEngine {
    /// Create an engine with the default policy that logs its events.
    #[must_use]
    pub fn new(merge: Arc<dyn MergeFunction>) -> Self {
        Self {
            store: ContentStore::new(merge),
            registry: ConnectionRegistry::new(),
            policy: BroadcastPolicy::default(),
            sinks: vec![Arc::new(TracingSink)],
        }
    }

    /// Set the fan-out policy.
    #[must_use]
    pub fn with_policy(mut self, policy: BroadcastPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add an event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Get the fan-out policy.
    #[must_use]
    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Get the content store.
    #[must_use]
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a connection on a topic.
    ///
    /// If the topic already has content, a snapshot of it is queued for the
    /// new connection before any later update can be.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyRegistered`] or [`RelayError::InvalidTopic`]
    /// from the registry, or [`RelayError::TransportSendFailed`] if the
    /// snapshot could not be queued (the connection is then unregistered).
    pub fn join(&self, topic: &str, handle: ConnectionHandle) -> Result<(), RelayError> {
        validate_topic(topic).map_err(RelayError::InvalidTopic)?;
        let id = handle.id();

        let snapshot = self.store.with_state(topic, |state| -> Result<_, RelayError> {
            self.registry.register(topic, handle.clone())?;
            if state.version == 0 {
                return Ok(None);
            }
            let update = snapshot_update(topic, state);
            Ok(handle
                .deliver(Outbound::Snapshot(Arc::new(update)))
                .err()
                .map(|failure| (state.version, failure)))
        })?;

        self.emit(&RelayEvent::ConnectionRegistered {
            topic: topic.to_string(),
            connection: id,
        });

        if let Some((version, failure)) = snapshot {
            self.emit(&RelayEvent::BroadcastSendFailed {
                topic: topic.to_string(),
                connection: id,
                version,
                reason: failure.to_string(),
            });
            self.leave(id);
            return Err(RelayError::TransportSendFailed {
                connection: id,
                source: failure,
            });
        }

        Ok(())
    }

    /// Unregister a connection.
    ///
    /// Returns `false` if it was already gone.
    pub fn leave(&self, id: ConnectionId) -> bool {
        match self.registry.unregister(id) {
            Some(topic) => {
                self.emit(&RelayEvent::ConnectionUnregistered {
                    topic,
                    connection: id,
                });
                true
            }
            None => false,
        }
    }

    /// Merge a payload from `origin` into a topic and fan the result out.
    ///
    /// If `origin` is registered on the topic it is also queued an
    /// [`Outbound::Ack`] carrying the new version.
    ///
    /// Connections whose queue cannot take the update are unregistered and
    /// listed in the report; delivery to the rest is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MergeFailed`] if the merge function rejects the
    /// payload. Nothing is stored or sent in that case. An empty topic is
    /// [`RelayError::InvalidTopic`].
    pub fn on_update(
        &self,
        topic: &str,
        origin: ConnectionId,
        payload: &[u8],
    ) -> Result<BroadcastReport, RelayError> {
        validate_topic(topic).map_err(RelayError::InvalidTopic)?;

        let merged = self
            .store
            .merge_then(topic, payload, |state| self.fan_out(topic, origin, state));

        let (state, (delivered, failed)) = match merged {
            Ok(merged) => merged,
            Err(err) => {
                self.emit(&RelayEvent::MergeFailed {
                    topic: topic.to_string(),
                    connection: origin,
                    version: self.store.version(topic),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        for &connection in &delivered {
            self.emit(&RelayEvent::BroadcastSent {
                topic: topic.to_string(),
                connection,
                version: state.version,
            });
        }

        for (connection, failure) in &failed {
            self.emit(&RelayEvent::BroadcastSendFailed {
                topic: topic.to_string(),
                connection: *connection,
                version: state.version,
                reason: failure.to_string(),
            });
            self.leave(*connection);
        }

        debug!(
            topic = %topic,
            origin = %origin,
            version = state.version,
            recipients = delivered.len(),
            failures = failed.len(),
            "Broadcast"
        );

        Ok(BroadcastReport {
            topic: topic.to_string(),
            version: state.version,
            delivered,
            failed,
        })
    }

    /// Report that a queued message never reached a connection's transport.
    ///
    /// The session that owns the transport calls this before tearing down.
    pub fn write_failed(
        &self,
        topic: &str,
        connection: ConnectionId,
        message: &Outbound,
        failure: &SendFailure,
    ) {
        let version = message
            .version()
            .unwrap_or_else(|| self.store.version(topic));
        self.emit(&RelayEvent::BroadcastSendFailed {
            topic: topic.to_string(),
            connection,
            version,
            reason: failure.to_string(),
        });
    }

    /// Get engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let registry = self.registry.stats();
        EngineStats {
            content_topics: self.store.topics().len(),
            connected_topics: registry.topic_count,
            connections: registry.connection_count,
        }
    }

    /// Queue `state` for every recipient, and the ack for the origin if it
    /// is registered on the topic. Runs under the topic lock.
    fn fan_out(
        &self,
        topic: &str,
        origin: ConnectionId,
        state: &ContentState,
    ) -> (Vec<ConnectionId>, Vec<(ConnectionId, SendFailure)>) {
        let update = Arc::new(Update {
            topic: topic.to_string(),
            version: state.version,
            content: Arc::clone(&state.content),
            origin: Some(origin),
        });

        let mut delivered = Vec::new();
        let mut failed = Vec::new();

        for handle in self.registry.snapshot(topic) {
            let is_origin = handle.id() == origin;
            if self.policy == BroadcastPolicy::All || !is_origin {
                if let Err(failure) = handle.deliver(Outbound::Update(Arc::clone(&update))) {
                    failed.push((handle.id(), failure));
                    continue;
                }
                delivered.push(handle.id());
            }
            // Queued behind every earlier version so the origin never sees
            // an ack ahead of an older update.
            if is_origin {
                if let Err(failure) = handle.deliver(Outbound::Ack {
                    version: state.version,
                }) {
                    failed.push((handle.id(), failure));
                }
            }
        }

        (delivered, failed)
    }

    fn emit(&self, event: &RelayEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("policy", &self.policy)
            .field("merge", &self.store.merge_name())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

fn snapshot_update(topic: &str, state: &ContentState) -> Update {
    Update {
        topic: topic.to_string(),
        version: state.version,
        content: Arc::clone(&state.content),
        origin: None,
    }
}
