//! `ParleyServer`: wiring plus the Axum HTTP and WebSocket surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_cache::{CacheConfig, ListBackend, RecencyCache};
use parley_core::UserId;
use parley_settings::ParleySettings;
use parley_store::MessageStore;

use crate::backfill::BackfillQueue;
use crate::connection::ConnectionService;
use crate::dispatch::{ChatDispatcher, RoomDirectory};
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::hub::{Hub, HubHandle};
use crate::janitor::spawn_janitor;
use crate::pipeline::DeliveryPipeline;
use crate::pump::PumpConfig;
use crate::shutdown::{ShutdownCoordinator, Stage};
use crate::transport::split_websocket;

/// External collaborators the server is built around.
pub struct ServerDeps {
    pub store: Arc<dyn MessageStore>,
    pub backend: Arc<dyn ListBackend>,
    /// Group messages fan out to everyone when absent.
    pub rooms: Option<Arc<dyn RoomDirectory>>,
    /// Serves `/metrics` when present.
    pub metrics: Option<PrometheusHandle>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub connections: ConnectionService,
    pub pipeline: DeliveryPipeline,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

pub struct ParleyServer {
    settings: ParleySettings,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Mutex<Vec<(Stage, JoinHandle<()>)>>,
}

impl ParleyServer {
    /// Start the hub, the backfill worker and, when configured, the cache
    /// janitor. Must be called inside a Tokio runtime.
    pub fn start(settings: ParleySettings, deps: ServerDeps) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let mut tasks = Vec::new();

        let (hub, hub_task) = Hub::spawn(settings.hub.queue_depth, shutdown.stage_token(Stage::Hub));
        tasks.push((Stage::Hub, hub_task));

        let cache = RecencyCache::new(deps.backend, CacheConfig::from(&settings.cache));
        let (backfill, backfill_task) = BackfillQueue::spawn(
            cache.clone(),
            settings.cache.backfill_queue,
            settings.cache.backfill_timeout(),
            shutdown.stage_token(Stage::Backfill),
        );
        tasks.push((Stage::Backfill, backfill_task));

        if let Some(interval) = settings.cache.purge_interval() {
            let janitor = spawn_janitor(cache.clone(), interval, shutdown.stage_token(Stage::Janitor));
            tasks.push((Stage::Janitor, janitor));
        }

        let pipeline = DeliveryPipeline::new(deps.store, cache, backfill, settings.cache.op_timeout());
        let dispatcher = ChatDispatcher::new(hub.clone(), pipeline.clone(), deps.rooms);
        let connections = ConnectionService::new(
            hub,
            Arc::new(dispatcher),
            PumpConfig::from(&settings.hub),
            settings.hub.outbound_buffer,
        );

        let state = AppState {
            connections,
            pipeline,
            start_time: Instant::now(),
            metrics: deps.metrics,
        };
        Self {
            settings,
            state,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        Ok(TcpListener::bind(&addr).await?)
    }

    /// Serve on `listener` until shutdown begins.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let token = self.shutdown.token();
        info!(addr = ?listener.local_addr().ok(), "parley listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        Ok(())
    }

    /// Stop the listener, then the hub, backfill worker and janitor in turn,
    /// within the configured grace period.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let grace = Duration::from_secs(self.settings.server.shutdown_grace_secs);
        self.shutdown.graceful_shutdown(tasks, Some(grace)).await;
        info!("parley stopped");
    }

    pub fn connections(&self) -> &ConnectionService {
        &self.state.connections
    }

    pub fn pipeline(&self) -> &DeliveryPipeline {
        &self.state.pipeline
    }

    pub fn hub(&self) -> &HubHandle {
        self.state.connections.hub()
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn settings(&self) -> &ParleySettings {
        &self.settings
    }
}

#[derive(Deserialize)]
struct WsParams {
    user_id: u64,
}

impl WsParams {
    fn user(&self) -> Result<UserId, (StatusCode, &'static str)> {
        let user = UserId::new(self.user_id);
        if user.is_valid() {
            Ok(user)
        } else {
            Err((StatusCode::BAD_REQUEST, "user_id must be between 1 and 2^63-1"))
        }
    }
}

/// GET /ws?user_id=N
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match params.user() {
        Ok(user) => user,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split_websocket(socket);
        if let Err(e) = state.connections.connect(user, sink, stream).await {
            warn!(user_id = %user, error = %e, "failed to attach session");
        }
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.connections.hub().online_count();
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
