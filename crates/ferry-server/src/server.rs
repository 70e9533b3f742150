//! `BackendServer` — Axum HTTP + WebSocket server for directly-accepted
//! connections and observability endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::errors::BackendError;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::session::run_session;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::Transport;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Shared connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Handle rendering the `/metrics` exposition.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Outbound send period for sessions started here.
    pub hello_interval: Duration,
}

/// The public-facing server: `/ws` upgrades, `/metrics`, `/health`.
pub struct BackendServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl BackendServer {
    /// Create a new server over the shared registry.
    pub fn new(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            hello_interval: self.config.hello_interval(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Bind and serve. Returns the bound address (port `0` supported) and
    /// the serve task's handle; the task drains on the shutdown token.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), BackendError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| BackendError::TcpBind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server task failed");
            }
        });

        Ok((local_addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the shared registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

/// GET /ws — upgrade handshake, then the same session logic handed-off
/// connections get. Handshake failures are answered by axum and create no
/// connection.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::next_sentinel();
    let (reader, writer) = Transport::Direct(socket).split();
    let connection = Arc::new(Connection::new(id, writer));
    if let Err(e) = state.registry.insert(connection.clone()).await {
        error!(error = %e, "dropping direct connection");
        return;
    }
    run_session(connection, reader, state.registry.clone(), state.hello_interval).await;
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.count().await;
    Json(health::health_check(state.start_time, connections))
}
