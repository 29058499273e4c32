//! HTTP and WebSocket handlers for the live-relay server.
//!
//! Each configured topic is mounted at `/<topic>`; with dynamic topics any
//! topic is reachable at `/ws/<topic>`. Every upgraded socket runs one
//! [`ConnectionSession`] until the client leaves or the server shuts down.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MetricsSink};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use live_relay_core::{
    shutdown_channel, BroadcastEngine, ConnectionSession, SessionOutcome, ShutdownTrigger,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The broadcast engine.
    pub engine: Arc<BroadcastEngine>,
    /// Server configuration.
    pub config: Config,
    shutdown: ShutdownTrigger,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = BroadcastEngine::new(config.relay.merge.build())
            .with_policy(config.relay.policy)
            .with_sink(Arc::new(MetricsSink));
        let (shutdown, _) = shutdown_channel();

        Self {
            engine: Arc::new(engine),
            config,
            shutdown,
        }
    }
}

/// Bind, report the bound port on stdout, and serve until `shutdown`
/// resolves.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;

    // Scripts starting the relay on port 0 read the port from here.
    println!("{}", addr.port());

    info!("live-relay listening on {}", addr);
    for topic in &config.transport.topics {
        info!("Topic endpoint: ws://{}/{}", addr, topic);
    }
    if config.transport.dynamic_topics {
        info!("Dynamic topic endpoint: ws://{}/ws/{{topic}}", addr);
    }

    serve(listener, Arc::new(AppState::new(config)), shutdown).await
}

/// Serve on an already bound listener.
///
/// When `shutdown` resolves the listener stops accepting and every session
/// is told to tear down.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing {} connections", state.engine.stats().connections);
            state.shutdown.trigger();
        })
        .await?;

    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().route("/health", get(health_handler));

    for topic in &state.config.transport.topics {
        let topic = topic.clone();
        app = app.route(
            &format!("/{topic}"),
            get(move |ws: WebSocketUpgrade, State(state): State<Arc<AppState>>| {
                let topic = topic.clone();
                async move { upgrade(ws, state, topic) }
            }),
        );
    }

    if state.config.transport.dynamic_topics {
        app = app.route("/ws/:topic", get(dynamic_topic_handler));
    }

    app.with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "policy": state.engine.policy(),
        "merge": state.engine.store().merge_name(),
        "format": state.config.transport.format,
        "stats": state.engine.stats(),
    }))
}

/// WebSocket upgrade handler for `/ws/:topic`.
async fn dynamic_topic_handler(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, state, topic)
}

fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>, topic: String) -> Response {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, topic))
}

/// Run one session over an upgraded socket.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, topic: String) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let transport = &state.config.transport;

    let (source, sink) =
        live_relay_transport::split(socket, transport.format, transport.max_message_size);
    let session = ConnectionSession::new(
        topic,
        state.engine.clone(),
        source,
        sink,
        state.shutdown.signal(),
    )
    .with_config(state.config.relay.session());
    let connection = session.id();

    debug!(
        connection = %connection,
        topic = %session.topic(),
        format = transport.format.as_str(),
        "WebSocket connected"
    );

    match session.run().await {
        Ok(outcome) => {
            metrics::record_session_end(outcome.kind());
            if let SessionOutcome::Failed(e) = &outcome {
                metrics::record_error(e.kind());
                warn!(connection = %connection, error = %e, "Session failed");
            }
            debug!(connection = %connection, outcome = outcome.kind(), "WebSocket disconnected");
        }
        Err(e) => {
            metrics::record_error(e.kind());
            warn!(connection = %connection, error = %e, "Session could not start");
        }
    }
}
