//! WebSocket transport server using Axum.
//!
//! Each socket on `/ws?app=<name>&tab=<id>` is one port: the first message
//! must be `add-chain` or `add-well-known-chain`, answered with exactly one
//! `chain-added-ok` / `chain-added-ko`. After that, `rpc` messages flow both
//! ways until the socket closes (the app is then detached) or the chain
//! crashes (`crash-error` is sent and the socket is closed).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use chainmux_protocol::{ToApp, ToManager};
use chainmux_server::{AppId, AttachRequest, ChainIdentity, ConnectionManager};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Allow cross-origin requests to the HTTP endpoints
    pub enable_cors: bool,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// How long a new socket may take to send its add-chain message
    pub handshake_timeout: Duration,
    /// Log every message
    pub verbose_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 9944,
            hostname: "127.0.0.1".into(),
            enable_cors: false,
            max_connections: Some(64),
            handshake_timeout: Duration::from_secs(10),
            verbose_logging: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state for the transport server.
struct AppState {
    manager: Arc<ConnectionManager>,
    config: TransportConfig,
    /// Connected client count (for health check)
    client_count: AtomicUsize,
    /// Tab ids handed to sockets that don't name one
    next_tab: AtomicU64,
}

/// Query string of `/ws`.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    app: Option<String>,
    tab: Option<u64>,
}

/// The transport server — accepts ports and wires them to the manager.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start serving `manager`.
    pub async fn start(config: TransportConfig, manager: Arc<ConnectionManager>) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            manager,
            config: config.clone(),
            client_count: AtomicUsize::new(0),
            next_tab: AtomicU64::new(1 << 32),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .route("/state", get(state_handler))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("chainmux transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("chainmux transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let app = AppId::new(
        params.app.unwrap_or_else(|| "anonymous".into()),
        params
            .tab
            .unwrap_or_else(|| state.next_tab.fetch_add(1, Ordering::Relaxed)),
    );
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, app))
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.state())
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, app: AppId) {
    state.client_count.fetch_add(1, Ordering::Relaxed);
    let port_id = uuid::Uuid::new_v4().to_string();
    info!("Port {port_id} opened by {app}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    if let Some((identity, outbound_rx)) = handshake(&state, &app, &port_id, &mut ws_tx, &mut ws_rx).await {
        serve_port(&state, &app, &port_id, identity, outbound_rx, &mut ws_tx, &mut ws_rx).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "Port {port_id} closed (total: {})",
        state.client_count.load(Ordering::Relaxed)
    );
}

/// Wait for the attach message and answer it with exactly one ok / ko.
async fn handshake(
    state: &AppState,
    app: &AppId,
    port_id: &str,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Option<(ChainIdentity, mpsc::UnboundedReceiver<ToApp>)> {
    let first = match tokio::time::timeout(state.config.handshake_timeout, next_text(ws_rx)).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            debug!("Port {port_id} closed before its handshake");
            return None;
        }
        Err(_) => {
            warn!("Handshake timeout for port {port_id}");
            send(ws_tx, &ToApp::ChainAddedKo("handshake timed out".into())).await;
            return None;
        }
    };

    let request = match serde_json::from_str::<ToManager>(&first) {
        Ok(message) => AttachRequest::from_message(message),
        Err(e) => {
            debug!("Port {port_id} sent a malformed handshake: {e}");
            None
        }
    };
    let Some(request) = request else {
        send(
            ws_tx,
            &ToApp::ChainAddedKo("expected add-chain or add-well-known-chain".into()),
        )
        .await;
        return None;
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    match state.manager.attach(app, request, outbound_tx).await {
        Ok(identity) => {
            debug!("Port {port_id} attached to {identity}");
            if send(ws_tx, &ToApp::ChainAddedOk).await {
                return Some((identity, outbound_rx));
            }
            warn!("Port {port_id} went away during its handshake");
            if let Err(e) = state.manager.detach(app, &identity).await {
                debug!("Port {port_id} detach after failed handshake: {e}");
            }
            None
        }
        Err(e) => {
            warn!("Port {port_id} failed to attach: {e}");
            send(ws_tx, &ToApp::ChainAddedKo(e.to_string())).await;
            None
        }
    }
}

async fn serve_port(
    state: &AppState,
    app: &AppId,
    port_id: &str,
    identity: ChainIdentity,
    mut outbound_rx: mpsc::UnboundedReceiver<ToApp>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    let mut crashed = false;
    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state.config.verbose_logging {
                            debug!("Port {port_id} → {}", text.as_str());
                        }
                        match serde_json::from_str::<ToManager>(text.as_str()) {
                            Ok(ToManager::Rpc(payload)) => {
                                if let Err(e) = state.manager.send_rpc(app, &identity, payload) {
                                    warn!("Port {port_id} lost its chain: {e}");
                                    break;
                                }
                            }
                            Ok(other) => {
                                warn!("Port {port_id} is already attached, ignoring {other:?}");
                            }
                            Err(e) => {
                                warn!("Port {port_id} sent a malformed message: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Port {port_id} closed by the app");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on port {port_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Responses, notifications and crashes for this port
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    debug!("Port {port_id} was dropped by the manager");
                    break;
                };
                if state.config.verbose_logging {
                    debug!("Port {port_id} ← {message:?}");
                }
                crashed = matches!(message, ToApp::CrashError(_));
                if !send(ws_tx, &message).await {
                    error!("Failed to send to port {port_id}");
                    break;
                }
                if crashed {
                    break;
                }
            }
        }
    }

    if !crashed {
        if let Err(e) = state.manager.detach(app, &identity).await {
            debug!("Port {port_id} detach: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Next text frame, skipping control frames. `None` once the socket is gone.
async fn next_text(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn send(ws_tx: &mut SplitSink<WebSocket, Message>, message: &ToApp) -> bool {
    ws_tx.send(Message::Text(message.to_json().into())).await.is_ok()
}
