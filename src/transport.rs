//! WebSocket transport for the hub.
//!
//! Each socket becomes one registry connection. Events addressed to the connection are
//! forwarded to the socket by a dedicated task; inbound frames are parsed into messages
//! and handed to [`ChatHub::spawn_submit`].

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::gateway::{HttpGatewayConfig, HttpInferenceGateway};
use crate::hub::{ChatHub, ConnectionRegistry};
use crate::models::{ClientCommand, ConnectionId, ServerEvent};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method};
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: Arc<HttpInferenceGateway>,
}

impl AppState {
    /// Wire a registry, an HTTP gateway and a hub from configuration
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
        let gateway = HttpInferenceGateway::with_config(HttpGatewayConfig::from(config))?;
        let gateway = Arc::new(gateway);
        let hub = Arc::new(ChatHub::new(registry.clone(), gateway.clone()));

        Ok(Self {
            hub,
            registry,
            gateway,
        })
    }
}

/// Build the relay's routes
pub fn router(state: AppState, allowed_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/chatHub", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(build_cors_layer(allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|e| RelayError::ConfigError(format!("origin '{}': {}", origin, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    info!("CORS: Allowing {} origin(s)", origins.len());
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

/// WebSocket upgrade handler.
///
/// GET /chatHub
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Relay and backend status.
///
/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let backend_healthy = state.gateway.health_check().await.unwrap_or(false);

    Json(json!({
        "status": "ok",
        "connected_clients": state.registry.connection_count(),
        "backend_healthy": backend_healthy,
    }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut events) = match state.registry.register() {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Refusing WebSocket connection: {}", e);
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    if let Err(e) = send_event(&mut sink, &ServerEvent::Connected { connection_id: id }).await {
        error!("Failed to greet connection {}: {}", id, e);
        state.registry.unregister(id);
        return;
    }

    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if send_event(&mut sink, &ServerEvent::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut send_task => {
                info!("Connection {} stopped receiving events", id);
                break;
            }
        };
        let Some(frame) = frame else { break };

        match frame {
            Ok(Message::Text(text)) => {
                // Pruned by the registry: replies could no longer reach this client
                if !state.registry.contains(id) {
                    info!("Connection {} was dropped from the hub", id);
                    break;
                }
                if let Some(message) = parse_inbound(id, text.as_str()) {
                    state.hub.spawn_submit(id, message);
                }
            }
            Ok(Message::Close(_)) => {
                info!("Connection {} closed by client", id);
                break;
            }
            Ok(_) => {
                debug!("Ignoring non-text frame from connection {}", id);
            }
            Err(e) => {
                warn!("WebSocket error on connection {}: {}", id, e);
                break;
            }
        }
    }

    send_task.abort();
    state.registry.unregister(id);
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<()> {
    let json = serde_json::to_string(event)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| RelayError::BroadcastError(e.to_string()))
}

/// Extract the chat message carried by an inbound text frame, if any.
///
/// Frames that parse as a [`ClientCommand`] are handled as such. Valid JSON that is not
/// a known command is dropped; anything that is not JSON at all is taken as the message
/// text itself. Blank messages are dropped.
fn parse_inbound(id: ConnectionId, text: &str) -> Option<String> {
    let message = match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::SendMessage { message }) => message,
        Ok(ClientCommand::Pong) => return None,
        Err(e) if serde_json::from_str::<Value>(text).is_ok() => {
            warn!("Unknown command from connection {}: {}", id, e);
            return None;
        }
        Err(_) => text.to_string(),
    };

    if message.trim().is_empty() {
        debug!("Ignoring blank message from connection {}", id);
        return None;
    }

    Some(message)
}
