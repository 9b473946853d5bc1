use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use relay_core::ids::RoomId;
use relay_store::MessageStore;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::broadcast::{BroadcastEngine, EngineStats};
use crate::connection::{self, Connection, WsTransport};
use crate::error::ServerError;
use crate::ingress::{self, IngressContext};
use crate::persist;
use crate::queue::{BroadcastQueue, OverflowPolicy};
use crate::registry::RoomRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    /// Outbound frames buffered per connection before it counts as a slow
    /// consumer and is evicted.
    pub max_send_queue: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub persist_queue: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    /// Room used when a client connects without `?room=`.
    pub default_room: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            max_send_queue: 256,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            persist_queue: 1024,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            default_room: None,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<Option<RoomId>, ServerError> {
        if self.max_send_queue == 0 {
            return Err(ServerError::InvalidConfig("max_send_queue must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ServerError::InvalidConfig("heartbeat_interval must be non-zero".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(ServerError::InvalidConfig("idle_timeout must be non-zero".into()));
        }
        match &self.default_room {
            None => Ok(None),
            Some(raw) => RoomId::parse(raw.as_str())
                .map(Some)
                .ok_or_else(|| ServerError::InvalidConfig("default_room must not be empty".into())),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingress: IngressContext,
    pub stats: Arc<EngineStats>,
    pub shutdown: CancellationToken,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub default_room: Option<RoomId>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Bind, start the dispatcher (and the persistence worker when a store is
/// given), and serve until [`ServerHandle::shutdown`].
pub async fn start(
    config: ServerConfig,
    store: Option<Arc<dyn MessageStore>>,
) -> Result<ServerHandle, ServerError> {
    let default_room = config.validate()?;
    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(config.bind.clone()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    let registry = Arc::new(RoomRegistry::new());
    let queue = Arc::new(BroadcastQueue::new(config.queue_capacity, config.overflow_policy));

    let persist_stop = CancellationToken::new();
    let (persist, persist_worker) = match store {
        Some(store) => {
            let (handle, worker) =
                persist::spawn_worker(store, config.persist_queue, persist_stop.clone());
            (Some(handle), Some(worker))
        }
        None => (None, None),
    };

    let engine = BroadcastEngine::new(Arc::clone(&queue), Arc::clone(&registry), persist.clone());
    let stats = engine.stats();
    let dispatcher = engine.spawn();

    let shutdown = CancellationToken::new();
    let state = AppState {
        ingress: IngressContext {
            registry: Arc::clone(&registry),
            queue: Arc::clone(&queue),
            history: persist,
            idle_timeout: config.idle_timeout,
        },
        stats: Arc::clone(&stats),
        shutdown: shutdown.clone(),
        max_send_queue: config.max_send_queue,
        heartbeat_interval: config.heartbeat_interval,
        default_room,
    };
    let router = build_router(state);

    tracing::info!(
        addr = %local_addr,
        queue_capacity = queue.capacity(),
        overflow_policy = %queue.policy(),
        persistence = persist_worker.is_some(),
        "relay server started"
    );

    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "server error");
            }
        })
    };

    Ok(ServerHandle {
        local_addr,
        registry,
        stats,
        queue,
        shutdown,
        server,
        dispatcher,
        persist_stop,
        persist_worker,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<EngineStats>,
    queue: Arc<BroadcastQueue>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    persist_stop: CancellationToken,
    persist_worker: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Stop accepting, close every connection, drain the broadcast queue,
    /// then wait for pending history writes.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.server).await.is_err() {
            tracing::warn!("server did not stop within 5s");
        }

        self.queue.close();
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "dispatcher task failed");
        }
        self.persist_stop.cancel();
        if let Some(worker) = self.persist_worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "persist worker failed");
            }
        }
        tracing::info!("relay server stopped");
    }
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room: Option<String>,
}

/// WebSocket upgrade handler. The room is checked before the upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let room = query
        .room
        .and_then(RoomId::parse)
        .or_else(|| state.default_room.clone());
    let Some(room) = room else {
        return (StatusCode::BAD_REQUEST, "Room ID is required").into_response();
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, room, state))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Run one upgraded connection: writer task plus ingress loop.
async fn handle_socket(socket: WebSocket, room: RoomId, state: AppState) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.max_send_queue);
    let conn = Arc::new(Connection::new(tx, state.shutdown.child_token()));
    let span = tracing::info_span!("connection", room = %room, conn_id = %conn.id());

    async move {
        tracing::info!("WebSocket client connected");
        let writer =
            connection::spawn_writer(sink, rx, conn.cancel_token(), state.heartbeat_interval);
        ingress::run(conn, room, WsTransport::new(stream), state.ingress).await;
        if let Err(e) = writer.await {
            tracing::error!(error = %e, "writer task failed");
        }
    }
    .instrument(span)
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.stats.snapshot();
    let registry = &state.ingress.registry;
    Json(serde_json::json!({
        "status": "healthy",
        "rooms": registry.room_count(),
        "connections": registry.connection_count(),
        "queued": state.ingress.queue.len(),
        "dispatched": stats.dispatched,
        "delivered": stats.delivered,
        "evicted": stats.evicted,
        "persist_dropped": stats.persist_dropped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_listens_on_8080() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert!(config.validate().unwrap().is_none());
    }

    #[test]
    fn empty_default_room_is_rejected() {
        let config = ServerConfig {
            default_room: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[test]
    fn zero_send_queue_is_rejected() {
        let config = ServerConfig {
            max_send_queue: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn bad_bind_address_is_rejected() {
        let config = ServerConfig {
            bind: "not-an-address".into(),
            ..Default::default()
        };
        let result = start(config, None).await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(local_config(), None).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rooms"], 0);
        assert_eq!(body["queued"], 0);
        assert_eq!(body["dispatched"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_room_is_bad_request() {
        let handle = start(local_config(), None).await.unwrap();
        for query in ["", "?room="] {
            let url = format!("http://127.0.0.1:{}/ws{query}", handle.port());
            let resp = reqwest::get(&url).await.unwrap();
            assert_eq!(resp.status(), 400);
            assert_eq!(resp.text().await.unwrap(), "Room ID is required");
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn room_without_upgrade_is_rejected_by_axum() {
        let handle = start(local_config(), None).await.unwrap();
        let url = format!("http://127.0.0.1:{}/ws?room=lobby", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.status().is_client_error());
        assert_ne!(resp.status(), 404);
        handle.shutdown().await;
    }
}
