//! Fixtures shared by the live-relay benchmarks.

use live_relay_core::{
    BroadcastEngine, BroadcastPolicy, ConnectionHandle, ConnectionId, MergeStrategy, Outbound,
};
use tokio::sync::mpsc::Receiver;

/// Topic every fixture uses.
pub const TOPIC: &str = "bench";

/// An engine with `members` connections joined on [`TOPIC`].
pub struct Fixture {
    /// The engine under test.
    pub engine: BroadcastEngine,
    /// Connection that sends updates. Not registered.
    pub origin: ConnectionId,
    receivers: Vec<Receiver<Outbound>>,
}

impl Fixture {
    /// Build an engine and join `members` connections, each with a queue of
    /// `capacity`.
    #[must_use]
    pub fn new(
        members: usize,
        capacity: usize,
        policy: BroadcastPolicy,
        merge: MergeStrategy,
    ) -> Self {
        let engine = BroadcastEngine::new(merge.build()).with_policy(policy);
        let receivers = (0..members)
            .map(|_| {
                let (handle, rx) = ConnectionHandle::channel(ConnectionId::next(), capacity);
                engine
                    .join(TOPIC, handle)
                    .expect("fresh connection joins");
                rx
            })
            .collect();

        Self {
            engine,
            origin: ConnectionId::next(),
            receivers,
        }
    }

    /// Empty every member's queue, returning how many messages were taken.
    pub fn drain(&mut self) -> usize {
        let mut taken = 0;
        for rx in &mut self.receivers {
            while rx.try_recv().is_ok() {
                taken += 1;
            }
        }
        taken
    }
}

/// A document of `lines` numbered lines.
#[must_use]
pub fn document(lines: usize) -> String {
    (0..lines).map(|i| format!("line {i}\n")).collect()
}

/// A line-patch payload adding `lines` numbered lines.
#[must_use]
pub fn append_patch(lines: usize) -> Vec<u8> {
    (0..lines)
        .map(|i| format!("+line {i}\n"))
        .collect::<String>()
        .into_bytes()
}
