//! HTTP surface of the Switchboard server.
//!
//! This module upgrades WebSocket connections into hub sessions and serves
//! the health and stats endpoints.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{Bus, CancellationToken, Hub};
use switchboard_transport::{
    spawn_session, split_upgraded, BusForwarder, InboundHandler, SessionConfig,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Header carrying the principal authenticated by an upstream layer.
pub const PRINCIPAL_HEADER: &str = "x-principal";

/// Interval between metrics snapshots of the hub and bus.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Hub,
    /// The event bus.
    pub bus: Bus,
    /// Server configuration.
    pub config: Config,
    session: SessionConfig,
    inbound: Arc<dyn InboundHandler>,
}

impl AppState {
    /// Create new app state, starting the hub.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Hub::spawn(config.hub_config());
        let bus = Bus::with_config(config.bus_config());
        let inbound: Arc<dyn InboundHandler> = Arc::new(BusForwarder::new(bus.clone()));

        Self {
            hub,
            bus,
            session: config.session_config(),
            config,
            inbound,
        }
    }
}

/// Response body of `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Registered sessions.
    pub connected_clients: usize,
    /// Non-empty rooms.
    pub rooms: usize,
    /// Bus topics with subscribers.
    pub topics: usize,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    let reporter = CancellationToken::new();
    tokio::spawn(report_stats(Arc::clone(&state), reporter.clone()));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(addr = %addr, "Switchboard server listening");
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let hub = state.hub.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested, closing sessions");
            if let Err(e) = hub.shutdown().await {
                warn!(error = %e, "Hub already stopped");
            }
        })
        .await?;

    reporter.cancel();
    info!("Switchboard server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Periodically publish hub and bus statistics as metrics.
async fn report_stats(state: Arc<AppState>, token: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                metrics::record_hub_stats(&state.hub.stats());
                metrics::record_bus_stats(&state.bus.stats());
            }
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Stats handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connected_clients: state.hub.connected_count(),
        rooms: state.hub.rooms().len(),
        topics: state.bus.topics().len(),
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.hub.connected_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejection();
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let principal = headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            // Record connection metrics
            let _metrics_guard = ConnectionMetricsGuard::new();

            let (reader, writer) = split_upgraded(socket);
            let session = spawn_session(
                &state.hub,
                reader,
                writer,
                principal,
                state.session.clone(),
                Some(Arc::clone(&state.inbound)),
            )
            .await;

            match session {
                Ok(session) => {
                    debug!(session = %session.id(), "WebSocket connected");
                    session.join().await;
                }
                Err(e) => {
                    warn!(error = %e, "Hub unavailable, dropping connection");
                    metrics::record_error("hub_closed");
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use switchboard_protocol::{codec, kinds, Envelope};
    use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

    async fn serve(config: Config) -> (std::net::SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn next_envelope<S>(ws: &mut S) -> Envelope
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return codec::decode(text.as_bytes()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected websocket item: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = Arc::new(AppState::new(Config::default()));
        let _sub = state
            .bus
            .subscribe(&CancellationToken::new(), "audit", ["chat"]);

        let Json(stats) = stats_handler(State(state)).await;
        assert_eq!(stats.connected_clients, 0);
        assert_eq!(stats.rooms, 0);
        assert_eq!(stats.topics, 1);
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let (addr, state) = serve(Config::default()).await;

        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(PRINCIPAL_HEADER, "alice".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        let welcome = next_envelope(&mut ws).await;
        assert_eq!(welcome.kind, kinds::CONNECTED);
        assert_eq!(welcome.payload.unwrap()["user_id"], "alice");

        // Unrecognised types are forwarded to the bus.
        let mut sub = state
            .bus
            .subscribe(&CancellationToken::new(), "test", ["typing"]);
        ws.send(Message::Text(r#"{"type":"typing"}"#.to_string()))
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.topic(), "typing");

        ws.send(Message::Text(r#"{"type":"join","payload":{"room":"chat"}}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_envelope(&mut ws).await.kind, kinds::PONG);
        assert_eq!(state.hub.room_size("chat"), 1);

        state
            .hub
            .broadcast_to_user("alice", "notice", "hello")
            .await
            .unwrap();
        let notice = next_envelope(&mut ws).await;
        assert_eq!(notice.kind, "notice");
        assert_eq!(notice.payload, Some(serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 0;
        let (addr, _state) = serve(config).await;

        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
        assert!(result.is_err());
    }
}
