//! WebSocket server exposing the gateway's control-frame protocol.
//!
//! Each connection must register before anything else. After registration the
//! socket carries subscribe/unsubscribe frames, producer-pushed events, and
//! tool-call proxying toward the configured upstream endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use relay_core::ids::ClientId;
use relay_rpc::ToolInvoker;

use crate::frames::{self, ClientFrame, Inbound, ServerFrame};
use crate::gateway::{start_sweep_task, Gateway};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// How often expired runs are swept.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3033,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Shared state for the Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub tools: Option<Arc<dyn ToolInvoker>>,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the server. The returned handle keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    gateway: Arc<Gateway>,
    tools: Option<Arc<dyn ToolInvoker>>,
) -> Result<ServerHandle, std::io::Error> {
    let sweeper = start_sweep_task(Arc::clone(&gateway), config.sweep_interval);

    let state = AppState { gateway, tools };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _sweeper: sweeper,
    })
}

pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweeper: tokio::task::JoinHandle<()>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "clients": state.gateway.client_count(),
    }))
}

/// Drive one client connection: registration, control frames, event pushes,
/// and the outbound queue, all in a single task.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut registered: Option<ClientId> = None;
    let mut outbound: Option<mpsc::Receiver<String>> = None;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // consume the immediate tick

    loop {
        tokio::select! {
            queued = next_outbound(&mut outbound), if outbound.is_some() => {
                match queued {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Sender side gone: the client was removed elsewhere.
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = handle_text(
                            &state,
                            &mut registered,
                            &mut outbound,
                            &text.to_string(),
                        );
                        if let Some(frame) = reply {
                            if let Some(encoded) = frame.encode() {
                                if ws_tx.send(WsMessage::Text(encoded.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket error");
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                }
            }
        }
    }

    if let Some(id) = registered {
        state.gateway.unregister_client(&id);
    }
}

async fn next_outbound(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Process one inbound text frame. Returns a frame to send directly on the
/// socket (used before the client has an outbound queue).
fn handle_text(
    state: &AppState,
    registered: &mut Option<ClientId>,
    outbound: &mut Option<mpsc::Receiver<String>>,
    text: &str,
) -> Option<ServerFrame> {
    let inbound = match frames::parse_inbound(text) {
        Ok(inbound) => inbound,
        Err(error) => {
            tracing::warn!(%error, "dropping malformed frame");
            return None;
        }
    };

    match inbound {
        Inbound::Control(ClientFrame::Registration(registration)) => {
            if registered.is_some() {
                tracing::warn!(client_id = ?registered, "duplicate registration ignored");
                return None;
            }
            let (id, rx) = state.gateway.register_client(registration);
            *registered = Some(id);
            *outbound = Some(rx);
            None
        }

        _ if registered.is_none() => Some(ServerFrame::Error {
            message: "registration required".into(),
            timestamp: Utc::now(),
        }),

        Inbound::Control(ClientFrame::Subscribe {
            run_id,
            thread_id,
            event_type,
        }) => {
            let id = registered.as_ref()?;
            if let Err(error) = state.gateway.subscribe(id, run_id, thread_id, event_type) {
                tracing::warn!(client_id = %id, %error, "subscribe failed");
            }
            None
        }

        Inbound::Control(ClientFrame::Unsubscribe {
            run_id,
            thread_id,
            event_type,
        }) => {
            let id = registered.as_ref()?;
            state.gateway.unsubscribe(id, run_id, thread_id, event_type);
            None
        }

        Inbound::Control(ClientFrame::CallTool {
            request_id,
            tool_name,
            arguments,
        }) => {
            let id = registered.clone()?;
            spawn_tool_call(state.clone(), id, request_id, tool_name, arguments);
            None
        }

        Inbound::Event(event) => {
            state.gateway.emit(event);
            None
        }
    }
}

/// Proxy a tool call toward the upstream endpoint; the reply frame goes back
/// through the client's outbound queue so a slow tool never blocks the socket
/// loop.
fn spawn_tool_call(
    state: AppState,
    client_id: ClientId,
    request_id: String,
    tool_name: String,
    arguments: Value,
) {
    tokio::spawn(async move {
        let frame = match &state.tools {
            Some(tools) => match tools.call_tool(&tool_name, arguments).await {
                Ok(result) => ServerFrame::ToolResult {
                    request_id,
                    result,
                    timestamp: Utc::now(),
                },
                Err(error) => {
                    tracing::warn!(tool = %tool_name, %error, "tool call failed");
                    ServerFrame::ToolError {
                        request_id,
                        code: error.error_kind().into(),
                        message: error.to_string(),
                        timestamp: Utc::now(),
                    }
                }
            },
            None => ServerFrame::ToolError {
                request_id,
                code: "unavailable".into(),
                message: "no tool endpoint configured".into(),
                timestamp: Utc::now(),
            },
        };
        if !state.gateway.send_frame(&client_id, &frame) {
            tracing::warn!(client_id = %client_id, "could not deliver tool reply");
        }
    });
}
