//! Per-connection session.
//!
//! A session owns one transport. It joins its topic, then loops over three
//! inputs: inbound payloads (fed to the engine), its outbound queue (written
//! to the transport under a timeout) and the shutdown signal. Whatever ends
//! the loop, teardown unregisters the connection and closes the transport
//! exactly once.

use crate::connection::{ConnectionHandle, ConnectionId, Outbound, SendFailure};
use crate::engine::BroadcastEngine;
use crate::error::RelayError;
use crate::shutdown::ShutdownSignal;
use crate::transport::{PayloadSink, PayloadSource};
use bytes::Bytes;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default outbound queue capacity per connection.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time allowed for one transport write.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound messages buffered before the connection counts as stalled.
    pub queue_capacity: usize,
    /// Time allowed for one transport write.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The client closed the connection.
    ClientClosed,
    /// The engine dropped the connection after a failed delivery.
    Evicted,
    /// The process is shutting down.
    Shutdown,
    /// A transport read or write failed.
    Failed(RelayError),
}

impl SessionOutcome {
    /// Get the outcome name for metrics and logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SessionOutcome::ClientClosed => "client_closed",
            SessionOutcome::Evicted => "evicted",
            SessionOutcome::Shutdown => "shutdown",
            SessionOutcome::Failed(_) => "failed",
        }
    }
}

/// One client connection on one topic.
pub struct ConnectionSession<S, K> {
    id: ConnectionId,
    topic: String,
    engine: Arc<BroadcastEngine>,
    source: S,
    sink: K,
    shutdown: ShutdownSignal,
    config: SessionConfig,
    closed: bool,
}

impl<S, K> ConnectionSession<S, K>
where
    S: PayloadSource,
    K: PayloadSink,
{
    /// Create a session with a fresh connection ID.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        engine: Arc<BroadcastEngine>,
        source: S,
        sink: K,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            topic: topic.into(),
            engine,
            source,
            sink,
            shutdown,
            config: SessionConfig::default(),
            closed: false,
        }
    }

    /// Set the session tuning.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run the session until the connection ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not join its topic. Failures
    /// after that end the session normally and are reported in the outcome.
    pub async fn run(mut self) -> Result<SessionOutcome, RelayError> {
        let (handle, mut outbound) = ConnectionHandle::channel(self.id, self.config.queue_capacity);

        if let Err(err) = self.engine.join(&self.topic, handle) {
            // Never registered under this ID, so only the transport needs releasing.
            self.closed = true;
            drop(outbound);
            self.close_transport().await;
            return Err(err);
        }
        debug!(topic = %self.topic, connection = %self.id, "Session started");

        let outcome = self.pump(&mut outbound).await;

        debug!(topic = %self.topic, connection = %self.id, outcome = ?outcome, "Session ended");
        self.teardown(outbound).await;
        Ok(outcome)
    }

    async fn pump(&mut self, outbound: &mut mpsc::Receiver<Outbound>) -> SessionOutcome {
        loop {
            if self.closed {
                return SessionOutcome::Shutdown;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    return SessionOutcome::Shutdown;
                }

                message = outbound.recv() => {
                    let Some(message) = message else {
                        return SessionOutcome::Evicted;
                    };
                    if let Err(source) = self.write(&message).await {
                        return self.send_failed(&message, source);
                    }
                }

                inbound = self.source.recv() => {
                    match inbound {
                        Ok(Some(payload)) => {
                            if let ControlFlow::Break(outcome) = self.handle_payload(payload).await {
                                return outcome;
                            }
                        }
                        Ok(None) => return SessionOutcome::ClientClosed,
                        Err(source) => {
                            return SessionOutcome::Failed(RelayError::TransportReadFailed {
                                connection: self.id,
                                source,
                            });
                        }
                    }
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: Bytes) -> ControlFlow<SessionOutcome> {
        let reply = match self.engine.on_update(&self.topic, self.id, &payload) {
            // The ack is queued with the fan-out, behind any older update.
            Ok(_) => return ControlFlow::Continue(()),
            Err(err @ RelayError::MergeFailed { .. }) => Outbound::Rejected {
                reason: err.to_string(),
            },
            Err(err) => {
                warn!(topic = %self.topic, connection = %self.id, error = %err, "Update failed");
                return ControlFlow::Continue(());
            }
        };

        match self.write(&reply).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(source) => ControlFlow::Break(self.send_failed(&reply, source)),
        }
    }

    async fn write(&mut self, message: &Outbound) -> Result<(), SendFailure> {
        if self.closed {
            return Err(SendFailure::Closed);
        }
        match tokio::time::timeout(self.config.send_timeout, self.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendFailure::Transport(e)),
            Err(_) => Err(SendFailure::Timeout),
        }
    }

    fn send_failed(&self, message: &Outbound, source: SendFailure) -> SessionOutcome {
        self.engine.write_failed(&self.topic, self.id, message, &source);
        SessionOutcome::Failed(RelayError::TransportSendFailed {
            connection: self.id,
            source,
        })
    }

    async fn teardown(&mut self, outbound: mpsc::Receiver<Outbound>) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }

        self.engine.leave(self.id);
        drop(outbound);
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(connection = %self.id, error = %e, "Close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BroadcastPolicy;
    use crate::events::testing::RecordingSink;
    use crate::merge::{MergeError, ReplaceMerge};
    use crate::shutdown::{shutdown_channel, ShutdownTrigger};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct ChannelSource {
        rx: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
    }

    #[async_trait]
    impl PayloadSource for ChannelSource {
        async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
            self.rx.recv().await.transpose()
        }
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<Outbound>,
        fail_writes: bool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PayloadSink for ChannelSink {
        async fn send(&mut self, message: &Outbound) -> Result<(), TransportError> {
            if self.fail_writes {
                return Err(TransportError::SendFailed("broken pipe".into()));
            }
            self.tx
                .send(message.clone())
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// The client end of an in-memory connection.
    struct Client {
        inbound: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        closes: Arc<AtomicUsize>,
        task: JoinHandle<Result<SessionOutcome, RelayError>>,
        id: ConnectionId,
    }

    impl Client {
        fn send(&self, payload: &'static [u8]) {
            self.inbound.send(Ok(Bytes::from_static(payload))).unwrap();
        }

        async fn next(&mut self) -> Outbound {
            timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for message")
                .expect("sink dropped")
        }

        /// Wait for the session to end on its own.
        async fn finish(self) -> (SessionOutcome, usize) {
            let Client {
                inbound,
                outbound,
                closes,
                task,
                ..
            } = self;
            let outcome = timeout(WAIT, task)
                .await
                .expect("session did not end")
                .unwrap()
                .unwrap();
            drop((inbound, outbound));
            (outcome, closes.load(Ordering::SeqCst))
        }

        /// Close the client side and wait for the session to end.
        async fn hang_up(self) -> (SessionOutcome, usize) {
            let Client {
                inbound,
                outbound,
                closes,
                task,
                ..
            } = self;
            drop(inbound);
            let outcome = timeout(WAIT, task)
                .await
                .expect("session did not end")
                .unwrap()
                .unwrap();
            drop(outbound);
            (outcome, closes.load(Ordering::SeqCst))
        }
    }

    /// Lets another connection's update land while this one is in flight.
    struct InterleavingSource {
        engine: Arc<BroadcastEngine>,
        other: ConnectionId,
        delivered: bool,
    }

    #[async_trait]
    impl PayloadSource for InterleavingSource {
        async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
            if std::mem::replace(&mut self.delivered, true) {
                std::future::pending::<()>().await;
            }
            self.engine.on_update("code", self.other, b"from b").unwrap();
            Ok(Some(Bytes::from_static(b"from a")))
        }
    }

    struct StalledSink;

    #[async_trait]
    impl PayloadSink for StalledSink {
        async fn send(&mut self, _message: &Outbound) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn spawn_client(
        engine: &Arc<BroadcastEngine>,
        topic: &str,
        shutdown: &ShutdownTrigger,
        fail_writes: bool,
    ) -> Client {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));

        let session = ConnectionSession::new(
            topic,
            Arc::clone(engine),
            ChannelSource { rx: in_rx },
            ChannelSink {
                tx: out_tx,
                fail_writes,
                closes: Arc::clone(&closes),
            },
            shutdown.signal(),
        );
        let id = session.id();

        Client {
            inbound: in_tx,
            outbound: out_rx,
            closes,
            task: tokio::spawn(session.run()),
            id,
        }
    }

    async fn wait_for_connections(engine: &BroadcastEngine, topic: &str, count: usize) {
        timeout(WAIT, async {
            while engine.registry().connection_count(topic) != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("connections never registered");
    }

    fn engine() -> Arc<BroadcastEngine> {
        Arc::new(BroadcastEngine::new(Arc::new(ReplaceMerge)))
    }

    #[tokio::test]
    async fn test_update_reaches_peer_and_acks_origin() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let mut a = spawn_client(&engine, "code", &trigger, false);
        let mut b = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 2).await;

        a.send(b"x");

        match b.next().await {
            Outbound::Update(update) => {
                assert_eq!(&*update.content, "x");
                assert_eq!(update.version, 1);
                assert_eq!(update.origin, Some(a.id));
            }
            other => panic!("Expected update, got {:?}", other),
        }
        assert_eq!(a.next().await, Outbound::Ack { version: 1 });
        assert_eq!(engine.store().get("code"), "x");

        // The origin never sees its own update under the default policy.
        assert!(a.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_all_echoes_to_origin() {
        let engine = Arc::new(
            BroadcastEngine::new(Arc::new(ReplaceMerge)).with_policy(BroadcastPolicy::All),
        );
        let (trigger, _) = shutdown_channel();
        let mut a = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 1).await;

        a.send(b"echo");

        let mut seen_update = false;
        let mut seen_ack = false;
        for _ in 0..2 {
            match a.next().await {
                Outbound::Update(update) => {
                    assert_eq!(&*update.content, "echo");
                    seen_update = true;
                }
                Outbound::Ack { version } => {
                    assert_eq!(version, 1);
                    seen_ack = true;
                }
                other => panic!("Unexpected {:?}", other),
            }
        }
        assert!(seen_update && seen_ack);
    }

    #[tokio::test]
    async fn test_rejected_update_only_notifies_origin() {
        let failing = |_: &str, _: &[u8]| -> Result<String, MergeError> {
            Err(MergeError::Rejected("bad diff".into()))
        };
        let engine = Arc::new(BroadcastEngine::new(Arc::new(failing)));
        let (trigger, _) = shutdown_channel();
        let mut a = spawn_client(&engine, "code", &trigger, false);
        let mut b = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 2).await;

        a.send(b"x");

        match a.next().await {
            Outbound::Rejected { reason } => assert!(reason.contains("bad diff")),
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert_eq!(engine.store().version("code"), 0);
        assert!(b.outbound.try_recv().is_err());

        // The session survives a rejected payload.
        assert!(engine.registry().contains(a.id));
    }

    #[tokio::test]
    async fn test_client_close_tears_down_once() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let a = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 1).await;
        let id = a.id;

        let (outcome, closes) = a.hang_up().await;

        assert!(matches!(outcome, SessionOutcome::ClientClosed));
        assert_eq!(closes, 1);
        assert!(!engine.registry().contains(id));
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let a = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 1).await;
        let id = a.id;

        a.inbound
            .send(Err(TransportError::ReceiveFailed("reset by peer".into())))
            .unwrap();
        let (outcome, closes) = a.finish().await;

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(RelayError::TransportReadFailed { connection, .. }) if connection == id
        ));
        assert_eq!(closes, 1);
        assert!(!engine.registry().contains(id));
    }

    #[tokio::test]
    async fn test_write_failure_tears_down_and_others_continue() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(BroadcastEngine::new(Arc::new(ReplaceMerge)).with_sink(sink.clone()));
        let (trigger, _) = shutdown_channel();
        let a = spawn_client(&engine, "markdown", &trigger, false);
        let b = spawn_client(&engine, "markdown", &trigger, true);
        let mut c = spawn_client(&engine, "markdown", &trigger, false);
        wait_for_connections(&engine, "markdown", 3).await;
        let b_id = b.id;

        a.send(b"# one");

        assert!(matches!(c.next().await, Outbound::Update(_)));
        let (outcome, closes) = b.finish().await;
        assert!(matches!(
            outcome,
            SessionOutcome::Failed(RelayError::TransportSendFailed { .. })
        ));
        assert_eq!(closes, 1);
        assert!(!engine.registry().contains(b_id));

        let failures = sink.named("broadcast_send_failed");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].connection(), b_id);

        a.send(b"# two");
        match c.next().await {
            Outbound::Update(update) => assert_eq!(update.version, 2),
            other => panic!("Expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_every_session() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let a = spawn_client(&engine, "code", &trigger, false);
        let b = spawn_client(&engine, "markdown", &trigger, false);
        wait_for_connections(&engine, "code", 1).await;
        wait_for_connections(&engine, "markdown", 1).await;

        trigger.trigger();

        for client in [a, b] {
            let (outcome, closes) = client.finish().await;
            assert!(matches!(outcome, SessionOutcome::Shutdown));
            assert_eq!(closes, 1);
        }
        assert_eq!(engine.registry().stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_snapshot_first() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let a = spawn_client(&engine, "code", &trigger, false);
        wait_for_connections(&engine, "code", 1).await;
        a.send(b"fn main() {}");
        timeout(WAIT, async {
            while engine.store().version("code") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut late = spawn_client(&engine, "code", &trigger, false);
        match late.next().await {
            Outbound::Snapshot(update) => {
                assert_eq!(&*update.content, "fn main() {}");
                assert_eq!(update.version, 1);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_topic_fails_to_start() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let client = spawn_client(&engine, "", &trigger, false);

        let result = timeout(WAIT, client.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(RelayError::InvalidTopic(_))));
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ack_never_overtakes_older_update() {
        let engine = engine();
        let (trigger, _) = shutdown_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(
            "code",
            Arc::clone(&engine),
            InterleavingSource {
                engine: Arc::clone(&engine),
                other: ConnectionId::from_raw(9_999),
                delivered: false,
            },
            ChannelSink {
                tx: out_tx,
                fail_writes: false,
                closes: Arc::new(AtomicUsize::new(0)),
            },
            trigger.signal(),
        );
        let task = tokio::spawn(session.run());

        let first = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap();
        match first {
            Outbound::Update(update) => {
                assert_eq!(update.version, 1);
                assert_eq!(&*update.content, "from b");
            }
            other => panic!("Expected update, got {:?}", other),
        }
        assert_eq!(second, Outbound::Ack { version: 2 });

        trigger.trigger();
        let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert!(matches!(outcome, SessionOutcome::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(BroadcastEngine::new(Arc::new(ReplaceMerge)).with_sink(sink.clone()));
        engine
            .on_update("code", ConnectionId::from_raw(9_999), b"x")
            .unwrap();
        let (trigger, _) = shutdown_channel();
        let (_inbound, rx) = mpsc::unbounded_channel::<Result<Bytes, TransportError>>();

        // The snapshot queued on join is the write that stalls.
        let session = ConnectionSession::new(
            "code",
            Arc::clone(&engine),
            ChannelSource { rx },
            StalledSink,
            trigger.signal(),
        )
        .with_config(SessionConfig {
            queue_capacity: 8,
            send_timeout: Duration::from_secs(1),
        });
        let id = session.id();

        let outcome = session.run().await.unwrap();

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(RelayError::TransportSendFailed {
                connection,
                source: SendFailure::Timeout,
            }) if connection == id
        ));
        assert!(!engine.registry().contains(id));
        let failures = sink.named("broadcast_send_failed");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].connection(), id);
    }
}
