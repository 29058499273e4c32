//! Per-topic content store.
//!
//! Each topic has its own lock, so merges on one topic are serialized while
//! merges on different topics proceed independently.

use crate::error::RelayError;
use crate::merge::MergeFunction;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Content and version of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentState {
    /// Last accepted content.
    pub content: Arc<str>,
    /// Number of successful merges so far.
    pub version: u64,
}

impl Default for ContentState {
    fn default() -> Self {
        Self {
            content: Arc::from(""),
            version: 0,
        }
    }
}

type Slot = Arc<Mutex<ContentState>>;

/// Authoritative content for every topic.
pub struct ContentStore {
    topics: DashMap<String, Slot>,
    merge: Arc<dyn MergeFunction>,
}

impl ContentStore {
    /// Create an empty store using the given merge function.
    #[must_use]
    pub fn new(merge: Arc<dyn MergeFunction>) -> Self {
        debug!(merge = merge.name(), "Creating content store");
        Self {
            topics: DashMap::new(),
            merge,
        }
    }

    /// Get the content of a topic, or an empty string if it was never updated.
    #[must_use]
    pub fn get(&self, topic: &str) -> String {
        self.state(topic).content.to_string()
    }

    /// Get the content and version of a topic.
    #[must_use]
    pub fn state(&self, topic: &str) -> ContentState {
        // Clone the slot out so the shard lock is released before locking it.
        let slot = self.topics.get(topic).map(|s| Arc::clone(s.value()));
        slot.map(|s| s.lock().clone()).unwrap_or_default()
    }

    /// Get the version of a topic (0 if never updated).
    #[must_use]
    pub fn version(&self, topic: &str) -> u64 {
        self.state(topic).version
    }

    /// Apply a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MergeFailed`] if the merge function rejects the
    /// payload; the topic is left untouched.
    pub fn merge(&self, topic: &str, payload: &[u8]) -> Result<ContentState, RelayError> {
        self.merge_then(topic, payload, |_| ()).map(|(state, ())| state)
    }

    /// Apply a payload and run `then` on the new state before releasing the
    /// topic lock.
    ///
    /// Anything `then` does is ordered with respect to every other merge on
    /// the same topic. It must not block.
    pub(crate) fn merge_then<R>(
        &self,
        topic: &str,
        payload: &[u8],
        then: impl FnOnce(&ContentState) -> R,
    ) -> Result<(ContentState, R), RelayError> {
        let slot = self.slot(topic);
        let result = {
            let mut state = slot.lock();
            match self.merge.merge(&state.content, payload) {
                Ok(merged) => {
                    state.content = Arc::from(merged);
                    state.version += 1;
                    trace!(
                        topic = %topic,
                        version = state.version,
                        bytes = state.content.len(),
                        "Merged"
                    );

                    let snapshot = state.clone();
                    let output = then(&snapshot);
                    Ok((snapshot, output))
                }
                Err(source) => Err(RelayError::MergeFailed {
                    topic: topic.to_string(),
                    source,
                }),
            }
        };

        if result.is_err() {
            drop(slot);
            self.release_if_unused(topic);
        }
        result
    }

    /// Run `f` on a topic's state while holding its lock.
    ///
    /// A topic that has never accepted an update is not kept afterwards.
    pub(crate) fn with_state<R>(&self, topic: &str, f: impl FnOnce(&ContentState) -> R) -> R {
        let slot = self.slot(topic);
        let output = f(&slot.lock());
        drop(slot);
        self.release_if_unused(topic);
        output
    }

    /// Topics that have accepted at least one update.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .topics
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().version > 0)
            .map(|(topic, _)| topic)
            .collect()
    }

    /// Name of the merge function in use.
    #[must_use]
    pub fn merge_name(&self) -> &'static str {
        self.merge.name()
    }

    /// Drop a topic's slot if it holds no content and nobody else is using
    /// it, so that topics are only kept once an update is accepted.
    fn release_if_unused(&self, topic: &str) {
        // With the shard locked and no other clone alive, nobody can hold the
        // slot's lock.
        self.topics.remove_if(topic, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.lock().version == 0
        });
    }

    fn slot(&self, topic: &str) -> Slot {
        if let Some(slot) = self.topics.get(topic) {
            return Arc::clone(slot.value());
        }
        let entry = self.topics.entry(topic.to_string()).or_default();
        Arc::clone(entry.value())
    }
}
