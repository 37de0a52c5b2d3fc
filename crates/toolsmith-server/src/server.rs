use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use toolsmith_core::{ConnectionId, UserId};

use crate::client::{self, ClientRegistry};
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat_interval: Duration,
}

impl AppState {
    fn registry(&self) -> &Arc<ClientRegistry> {
        &self.handler_state.registry
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/api/jobs/{job_id}", get(job_status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. The returned handle keeps the background tasks alive.
pub async fn start(config: ServerConfig, handler_state: Arc<HandlerState>) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::clone(&handler_state.registry);
    let cleanup = client::start_cleanup_task(Arc::clone(&registry), config.cleanup_interval);

    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let rpc = tokio::spawn(process_rpc_messages(msg_rx, Arc::clone(&handler_state)));

    let router = build_router(AppState {
        handler_state,
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "toolsmith server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
        rpc,
        cleanup,
    })
}

pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        self.server.abort();
        self.rpc.abort();
        self.cleanup.abort();
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    user_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = params.user_id.filter(|u| !u.trim().is_empty()).map(UserId::from_raw);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    let (connection_id, rx) = state.registry().register(user_id.clone());
    tracing::info!(connection = %connection_id, user_id = ?user_id, "websocket connected");

    client::handle_ws_connection(
        socket,
        connection_id,
        rx,
        Arc::clone(state.registry()),
        state.message_tx,
        state.heartbeat_interval,
    )
    .await;
}

async fn rpc_handler(State(state): State<AppState>, body: String) -> Json<RpcResponse> {
    let Ok(request) = serde_json::from_str::<RpcRequest>(&body) else {
        return Json(RpcResponse::parse_error());
    };
    let params = request.params.unwrap_or_else(|| serde_json::json!({}));
    Json(handlers::dispatch(&state.handler_state, None, &request.method, &params, request.id).await)
}

/// Status pull: the stored context is the source of truth for progress.
async fn job_status_handler(Path(job_id): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    let params = serde_json::json!({ "job_id": job_id });
    let resp = handlers::dispatch(&state.handler_state, None, "job.get", &params, None).await;
    let status = match resp.error_code() {
        None => StatusCode::OK,
        Some(crate::rpc::NOT_FOUND) => StatusCode::NOT_FOUND,
        Some(crate::rpc::INVALID_PARAMS) => StatusCode::BAD_REQUEST,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(resp))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, None, "health", &serde_json::json!({}), None).await;
    let body = resp.result.unwrap_or_default();
    let status = if body.get("status").and_then(|s| s.as_str()) == Some("healthy") {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Answer RPC frames arriving over WebSockets on the connection they came from.
async fn process_rpc_messages(mut rx: mpsc::Receiver<(ConnectionId, String)>, state: Arc<HandlerState>) {
    while let Some((connection_id, raw)) = rx.recv().await {
        let response = match serde_json::from_str::<RpcRequest>(&raw) {
            Ok(request) => {
                let params = request.params.unwrap_or_else(|| serde_json::json!({}));
                handlers::dispatch(&state, Some(&connection_id), &request.method, &params, request.id).await
            }
            Err(_) => RpcResponse::parse_error(),
        };

        match serde_json::to_string(&response) {
            Ok(json) => {
                if let Err(e) = state.registry.send_to(&connection_id, json) {
                    tracing::debug!(connection = %connection_id, error = %e, "rpc response not delivered");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize rpc response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::state;

    async fn serve() -> (ServerHandle, Arc<HandlerState>) {
        let handler_state = state();
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, Arc::clone(&handler_state)).await.unwrap();
        (handle, handler_state)
    }

    #[tokio::test]
    async fn health_endpoint_is_ok() {
        let (handle, _) = serve().await;
        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        handle.shutdown();
    }

    #[tokio::test]
    async fn rpc_over_http_creates_and_pulls_job() {
        let (handle, _) = serve().await;
        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let created: serde_json::Value = client
            .post(format!("{base}/rpc"))
            .body(
                serde_json::json!({
                    "method": "job.create",
                    "id": 1,
                    "params": {
                        "user_id": "user_1",
                        "start": false,
                        "request": {"name": "unit_converter", "description": "Convert units"},
                    },
                })
                .to_string(),
            )
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["success"], true);
        let job_id = created["result"]["job_id"].as_str().unwrap();

        let pulled = client.get(format!("{base}/api/jobs/{job_id}")).send().await.unwrap();
        assert_eq!(pulled.status(), 200);
        let body: serde_json::Value = pulled.json().await.unwrap();
        assert_eq!(body["result"]["context"]["status"], "pending");

        let missing = client.get(format!("{base}/api/jobs/job_nope")).send().await.unwrap();
        assert_eq!(missing.status(), 404);
        handle.shutdown();
    }

    #[tokio::test]
    async fn malformed_rpc_body_is_parse_error() {
        let (handle, _) = serve().await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/rpc", handle.port))
            .body("{not json")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["error"]["code"], "PARSE_ERROR");
        handle.shutdown();
    }

    #[tokio::test]
    async fn websocket_rpc_replies_on_same_connection() {
        let (_handle, handler_state) = serve().await;
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let worker = tokio::spawn(process_rpc_messages(msg_rx, Arc::clone(&handler_state)));

        let (connection, mut rx) = handler_state.registry.register(None);
        msg_tx
            .send((connection.clone(), r#"{"method":"connection.identify","id":5,"params":{"user_id":"user_3"}}"#.into()))
            .await
            .unwrap();

        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["success"], true);
        assert_eq!(
            handler_state.registry.user_connections(&UserId::from_raw("user_3")),
            vec![connection]
        );
        worker.abort();
    }
}
