//! HTTP / WebSocket transport
//!
//! - `GET {resource}`: WebSocket endpoint, one `ChannelConnection` per socket
//! - `POST /api/publish`: server-side publish of a single envelope
//! - `GET /health`: liveness and engine counters

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::auth::{Authorizer, RequestMeta};
use crate::connection::{ChannelConnection, Connection};
use crate::dispatch::DispatchError;
use crate::envelope;
use crate::handler::Handler;
use crate::hub::Hub;

/// Outbound frames buffered per socket before sends start to wait
const OUTBOUND_CAPACITY: usize = 256;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<Handler>,
    pub authorizer: Arc<dyn Authorizer>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(handler: Arc<Handler>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            handler,
            authorizer,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_key(&self) -> String {
        format!("ws-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn authorize(&self, headers: &HeaderMap) -> bool {
        let request = request_meta(headers);
        let allowed = self.authorizer.is_authorized(&request);
        if !allowed {
            warn!(host = %request.host, origin = ?request.origin, "request not authorized");
        }
        allowed
    }
}

/// Build the router; the WebSocket endpoint is mounted at `resource`
pub fn router(state: AppState, resource: &str) -> Router {
    Router::new()
        .route(resource, get(websocket_handler))
        .route("/api/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve `app` until `signal` resolves.
///
/// The engine starts refusing messages and draining its queues as soon as
/// the signal fires, while the server is still closing its connections.
pub async fn serve<F>(
    listener: TcpListener,
    app: Router,
    hub: Arc<Hub>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let draining = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            draining.shutdown().await;
        })
        .await?;
    hub.shutdown().await;
    Ok(())
}

/// Host and origin of a request, as seen by authorizers
pub fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let origin = value(header::ORIGIN.as_str())
        .filter(|o| !o.is_empty())
        .or_else(|| value("sec-websocket-origin"));
    RequestMeta::new(value(header::HOST.as_str()).unwrap_or_default(), origin)
}

async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response();
    }
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| run_socket(socket, state)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Drive one WebSocket until it closes
async fn run_socket(socket: WebSocket, state: AppState) {
    let key = state.next_key();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let connection: Arc<dyn Connection> = Arc::new(ChannelConnection::new(key.clone(), tx));
    info!(conn = %key, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_key = key.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    trace!(conn = %writer_key, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                state.handler.on_message(&connection, text.as_str().as_bytes()).await;
            }
            Ok(WsMessage::Binary(data)) => {
                state.handler.on_message(&connection, &data).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %key, error = %e, "socket read failed");
                break;
            }
        }
    }

    state.handler.on_disconnect(&connection).await;
    writer.abort();
    info!(conn = %key, "client disconnected");
}

async fn publish_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    if !state.authorize(&headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized\n".to_string());
    }

    let mut envelope = match envelope::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Error: {e}\n")),
    };
    if envelope.timestamp.is_empty() {
        envelope.timestamp = chrono::Utc::now().to_rfc3339();
    }
    let topic = envelope.topic.clone();

    match state.handler.hub().publish(None, envelope).await {
        Ok(()) => {
            debug!(topic = %topic, "server publish queued");
            (StatusCode::OK, "OK\n".to_string())
        }
        Err(DispatchError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Error: {}\n", DispatchError::Closed),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, format!("Error: {e}\n")),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.handler.hub();
    let (status, text) = if hub.is_quitting() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "ok")
    };
    let body = json!({
        "status": text,
        "connections": hub.connection_count(),
        "identities": hub.identity_count(),
        "topics": hub.topic_count(),
    });
    (status, Json(body))
}
