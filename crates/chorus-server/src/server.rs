//! `ChorusServer`: axum HTTP + WebSocket surface over the broadcast core.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chorus_core::{ConnectionId, DedupScope, InstanceId};
use chorus_settings::ChorusSettings;
use chorus_store::LogStore;
use chorus_telemetry::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::fanout::{FanoutBus, Topology};
use crate::health;
use crate::ingest::IngestionGate;
use crate::recovery::RecoveryManager;
use crate::registry::{self, ConnectionRegistry};
use crate::session::{run_ws_session, ConnectParams, SessionContext, SessionOptions};
use crate::shutdown::ShutdownCoordinator;

/// Server configuration, derived from [`ChorusSettings`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest inbound WebSocket message accepted.
    pub max_message_size: usize,
    /// Serve files from this directory at `/` when set.
    pub static_dir: Option<PathBuf>,
    pub session: SessionOptions,
    pub replay_page_size: u32,
    pub dedup_scope: DedupScope,
    /// Broadcasts buffered per parked session before it is discarded.
    pub max_parked_events: usize,
    pub sweep_interval: Duration,
}

impl ServerConfig {
    pub fn from_settings(settings: &ChorusSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            static_dir: settings.server.static_dir.as_ref().map(PathBuf::from),
            session: SessionOptions {
                max_send_queue: settings.server.max_send_queue,
                heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs),
                heartbeat_timeout: Duration::from_secs(settings.server.heartbeat_timeout_secs),
                recovery_enabled: settings.recovery.enabled,
                max_disconnection: Duration::from_secs(settings.recovery.max_disconnection_secs),
            },
            replay_page_size: settings.storage.replay_page_size,
            dedup_scope: settings.storage.dedup_scope,
            max_parked_events: settings.recovery.max_buffered_events,
            sweep_interval: Duration::from_secs(settings.recovery.sweep_interval_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ChorusSettings::default())
    }
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SessionContext>,
    pub store: Arc<dyn LogStore>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
    pub max_message_size: usize,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));
    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Address and background tasks of a listening server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Tasks to await during graceful shutdown.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

/// The chorus broadcast server for one instance.
pub struct ChorusServer {
    config: ServerConfig,
    store: Arc<dyn LogStore>,
    registry: Arc<ConnectionRegistry>,
    bus: Arc<FanoutBus>,
    ctx: Arc<SessionContext>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ChorusServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn LogStore>,
        topology: Topology,
        instance_id: InstanceId,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_parked_events));
        let bus = Arc::new(FanoutBus::new(registry.clone(), topology, instance_id));
        let ctx = Arc::new(SessionContext::new(
            registry.clone(),
            Arc::new(IngestionGate::new(store.clone(), config.dedup_scope)),
            bus.clone(),
            Arc::new(RecoveryManager::new(store.clone(), config.replay_page_size)),
            config.session.clone(),
        ));
        let shutdown = Arc::new(ShutdownCoordinator::for_registry(registry.clone()));
        Self {
            config,
            store,
            registry,
            bus,
            ctx,
            shutdown,
            start_time: Instant::now(),
            metrics,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            ctx: self.ctx.clone(),
            store: self.store.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            max_message_size: self.config.max_message_size,
        };
        build_router(state, self.config.static_dir.clone())
    }

    /// Bind the listener and start serving, along with the relay listener and
    /// the parked-session sweeper. Everything stops when the shutdown token
    /// is cancelled.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let token = self.shutdown.token();

        let mut tasks = Vec::new();
        if let Some(relay_listener) = self.bus.start_relay_listener(token.clone()) {
            tasks.push(relay_listener);
        }
        if self.config.session.recovery_enabled {
            tasks.push(registry::start_sweeper(
                self.registry.clone(),
                self.config.sweep_interval,
                self.config.session.max_disconnection,
                token.clone(),
            ));
        }

        let router = self.router();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server stopped with error");
            }
        }));

        info!(
            addr = %local_addr,
            topology = self.bus.topology().name(),
            instance_id = %self.bus.instance_id(),
            "chorus server listening"
        );
        Ok(ServerHandle {
            addr: local_addr,
            tasks,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<FanoutBus> {
        &self.bus
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let client_id = ConnectionId::new();
    let ctx = state.ctx.clone();
    let shutdown = state.shutdown.token();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, client_id, params, ctx, shutdown))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    let head = match tokio::task::spawn_blocking(move || store.head()).await {
        Ok(Ok(head)) => Some(head),
        Ok(Err(e)) => {
            warn!(error = %e, "health check could not read log head");
            None
        }
        Err(e) => {
            warn!(error = %e, "health check task failed");
            None
        }
    };
    let registry = &state.ctx.registry;
    let resp = health::health_check(
        state.start_time,
        registry.connection_count(),
        registry.parked_count(),
        head,
        state.ctx.bus.instance_id().clone(),
    );
    let status = if head.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
