use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use herald_core::ids::InstanceId;
use herald_core::transport::TransportEvent;
use herald_dispatch::MessagingService;
use herald_settings::ServerSettings;

use crate::bridge::{BridgeTransportFactory, DeliveryError};
use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::HandlerState;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.broadcast_capacity,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            client_timeout: Duration::from_millis(settings.client_timeout_ms),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub bridge: Option<Arc<BridgeTransportFactory>>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/transport/{instance_id}/events", post(transport_event_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. `bridge` receives sidecar callbacks when the HTTP
/// bridge transport is in use.
pub async fn start(
    config: ServerConfig,
    service: Arc<MessagingService>,
    bridge: Option<Arc<BridgeTransportFactory>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(
        config.max_send_queue,
        config.client_timeout,
    ));

    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), config.cleanup_interval);

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let handler_state = Arc::new(HandlerState::new(service));

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
        bridge,
        heartbeat_interval: config.heartbeat_interval,
    };

    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        handler_state,
        Arc::clone(&client_registry),
    ));

    let router = build_router(app_state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "herald server started");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        server,
        rpc,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps the background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    rpc: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the listener to close.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.server.await;
        self.rpc.abort();
        self.cleanup.abort();
        tracing::info!("herald server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Register the client, queue its snapshot, then start forwarding events.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    let (snapshot, events) = state.handler_state.service.observe();
    let forwarder = event_bridge::attach(
        Arc::clone(&state.client_registry),
        client_id.clone(),
        snapshot,
        events,
    );

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
        state.heartbeat_interval,
    )
    .await;

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::health(&state.handler_state, None);
    (StatusCode::OK, Json(resp.result.unwrap_or_default()))
}

/// Sidecar callback carrying one transport event.
async fn transport_event_handler(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(event): Json<TransportEvent>,
) -> StatusCode {
    let Some(bridge) = state.bridge.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    let instance_id = InstanceId::from_raw(instance_id);
    tracing::debug!(instance_id = %instance_id, event = event.name(), "transport callback");
    match bridge.deliver(&instance_id, event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(DeliveryError::UnknownInstance(_)) => StatusCode::NOT_FOUND,
        Err(DeliveryError::Closed(_)) => StatusCode::GONE,
    }
}

/// Answer RPC requests from WebSocket clients. Each request runs on its own
/// task so a send waiting on the queue doesn't hold up other calls.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            let response =
                crate::handlers::dispatch(&state, &request.method, &params, request.id).await;
            if let Ok(json) = serde_json::to_string(&response) {
                registry.send_to(&client_id, json);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_service;
    use herald_settings::TransportSettings;

    fn local() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn config_from_settings() {
        let config = ServerConfig::from_settings(&ServerSettings {
            heartbeat_interval_ms: 5_000,
            client_timeout_ms: 15_000,
            ..Default::default()
        });
        assert_eq!(config.port, 9091);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.client_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let t = test_service();
        t.service.register_instance("+15550001", "Desk").unwrap();
        let handle = start(local(), t.service, None).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instances"], 1);
        assert_eq!(body["queueDepth"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn transport_callback_reaches_instance_channel() {
        let t = test_service();
        let bridge = Arc::new(
            BridgeTransportFactory::new(&TransportSettings::default()).unwrap(),
        );
        let (tx, mut events) = mpsc::channel(4);
        herald_core::transport::TransportFactory::create(
            bridge.as_ref(),
            &InstanceId::from_raw("inst_1"),
            tx,
        );
        let handle = start(local(), t.service, Some(bridge)).await.unwrap();
        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{}", handle.port);

        let resp = client
            .post(format!("{base}/transport/inst_1/events"))
            .json(&serde_json::json!({"type": "qr", "qr": "2@abc"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Qr { qr: "2@abc".into() }
        );

        let resp = client
            .post(format!("{base}/transport/inst_missing/events"))
            .json(&serde_json::json!({"type": "ready"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("{base}/transport/inst_1/events"))
            .json(&serde_json::json!({"type": "teleport"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn transport_callback_without_bridge_is_not_found() {
        let t = test_service();
        let handle = start(local(), t.service, None).await.unwrap();
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/transport/inst_1/events", handle.port))
            .json(&serde_json::json!({"type": "ready"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_processor_answers_each_request() {
        let t = test_service();
        let registry = Arc::new(ClientRegistry::new(8, Duration::from_secs(90)));
        let (client_id, mut client_rx) = registry.register();
        let (tx, rx) = mpsc::channel(8);
        let processor = tokio::spawn(process_rpc_messages(
            rx,
            Arc::new(HandlerState::new(t.service)),
            Arc::clone(&registry),
        ));

        tx.send((client_id.clone(), "not json".into())).await.unwrap();
        let reply: serde_json::Value =
            serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], "PARSE_ERROR");

        tx.send((client_id, r#"{"method":"system.ping","id":"a"}"#.into()))
            .await
            .unwrap();
        let reply: serde_json::Value =
            serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], "a");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["result"]["pong"], true);

        processor.abort();
    }
}
