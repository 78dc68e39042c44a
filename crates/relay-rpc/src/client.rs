//! Tool-endpoint client: connection state machine plus request correlator.
//!
//! A single background task owns the socket and the pending-request table;
//! callers talk to it over an ops channel and suspend on oneshot replies.
//! Every table mutation happens on that one task, so settlement races
//! (response vs. timeout vs. connection loss) cannot double-fire.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::errors::RpcError;

use crate::wire;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<Value, RpcError>>;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// WebSocket URL of the tool endpoint.
    pub url: String,
    /// Delay before a reconnect attempt after connection loss.
    pub reconnect_interval: Duration,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

impl RpcConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Anything that can invoke a remote tool. Lets the server layer accept a
/// mock endpoint in tests.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, RpcError>;
}

enum Op {
    Connect { ack: oneshot::Sender<Result<(), RpcError>> },
    Call { tool: String, arguments: Value, reply: Reply },
    PendingLen { reply: oneshot::Sender<usize> },
    Close,
}

struct Pending {
    tool: String,
    reply: Reply,
    deadline: Instant,
}

/// Handle to the client task.
pub struct ToolClient {
    ops: mpsc::Sender<Op>,
    state_rx: watch::Receiver<ConnectionState>,
    _actor: JoinHandle<()>,
}

impl ToolClient {
    pub fn new(config: RpcConfig) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let actor = tokio::spawn(run_client(config, ops_rx, state_tx));
        Self {
            ops: ops_tx,
            state_rx,
            _actor: actor,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Establish the connection. Idempotent: if a socket already exists the
    /// call resolves against it instead of opening a duplicate.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.ops
            .send(Op::Connect { ack: ack_tx })
            .await
            .map_err(|_| RpcError::Closed)?;
        ack_rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Invoke a remote tool and wait for its correlated response.
    ///
    /// Connects first if necessary. Resolves with the decoded payload, or
    /// fails with exactly one of: tool error, timeout, transport loss.
    pub async fn call(
        &self,
        tool: impl Into<String>,
        arguments: Value,
    ) -> Result<Value, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(Op::Call {
                tool: tool.into(),
                arguments,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        reply_rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::PendingLen { reply: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Shut down: reject anything in flight and stop reconnecting.
    pub async fn close(&self) {
        let _ = self.ops.send(Op::Close).await;
    }
}

#[async_trait]
impl ToolInvoker for ToolClient {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, RpcError> {
        self.call(tool, arguments).await
    }
}

async fn run_client(
    config: RpcConfig,
    mut ops: mpsc::Receiver<Op>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut socket: Option<WsStream> = None;
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut reconnect_at: Option<Instant> = None;
    let mut next_id: u64 = 0;

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();
        let timeout_due = next_deadline.unwrap_or_else(far_future);
        let reconnect_due = reconnect_at.unwrap_or_else(far_future);

        tokio::select! {
            op = ops.recv() => {
                match op {
                    None => {
                        settle_all(&mut pending, &RpcError::Closed);
                        break;
                    }
                    Some(Op::Connect { ack }) => {
                        if socket.is_some() {
                            let _ = ack.send(Ok(()));
                        } else {
                            match establish(&config, &state_tx).await {
                                Ok(ws) => {
                                    socket = Some(ws);
                                    reconnect_at = None;
                                    let _ = ack.send(Ok(()));
                                }
                                Err(e) => {
                                    reconnect_at =
                                        Some(Instant::now() + config.reconnect_interval);
                                    let _ = ack.send(Err(e));
                                }
                            }
                        }
                    }
                    Some(Op::Call { tool, arguments, reply }) => {
                        if socket.is_none() {
                            match establish(&config, &state_tx).await {
                                Ok(ws) => {
                                    reconnect_at = None;
                                    socket = Some(ws);
                                }
                                Err(e) => {
                                    reconnect_at =
                                        Some(Instant::now() + config.reconnect_interval);
                                    let _ = reply.send(Err(e));
                                    continue;
                                }
                            }
                        }
                        let Some(ws) = socket.as_mut() else {
                            let _ = reply.send(Err(RpcError::Closed));
                            continue;
                        };

                        next_id += 1;
                        let id = next_id.to_string();
                        let request = wire::Request::call_tool(&id, &tool, arguments);
                        let frame = match serde_json::to_string(&request) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = reply.send(Err(RpcError::Protocol(format!(
                                    "unserializable request: {e}"
                                ))));
                                continue;
                            }
                        };

                        if let Err(e) = ws.send(Message::Text(frame.into())).await {
                            tracing::warn!(error = %e, tool = %tool, "send failed, dropping connection");
                            let _ = reply.send(Err(RpcError::Transport(format!(
                                "send failed: {e}"
                            ))));
                            on_disconnect(
                                &mut socket,
                                &mut pending,
                                &mut reconnect_at,
                                &state_tx,
                                config.reconnect_interval,
                            );
                            continue;
                        }

                        pending.insert(
                            id,
                            Pending {
                                tool,
                                reply,
                                deadline: Instant::now() + config.request_timeout,
                            },
                        );
                    }
                    Some(Op::PendingLen { reply }) => {
                        let _ = reply.send(pending.len());
                    }
                    Some(Op::Close) => {
                        settle_all(&mut pending, &RpcError::Closed);
                        if let Some(mut ws) = socket.take() {
                            let _ = ws.close(None).await;
                        }
                        state_tx.send_replace(ConnectionState::Disconnected);
                        tracing::info!("tool client closed");
                        break;
                    }
                }
            }

            frame = recv_frame(&mut socket), if socket.is_some() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), &mut pending),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("tool endpoint closed the connection");
                        on_disconnect(
                            &mut socket,
                            &mut pending,
                            &mut reconnect_at,
                            &state_tx,
                            config.reconnect_interval,
                        );
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket error");
                        on_disconnect(
                            &mut socket,
                            &mut pending,
                            &mut reconnect_at,
                            &state_tx,
                            config.reconnect_interval,
                        );
                    }
                    Some(Ok(_)) => {} // binary / ping / pong
                }
            }

            () = sleep_until(timeout_due), if next_deadline.is_some() => {
                expire_due(&mut pending, config.request_timeout);
            }

            () = sleep_until(reconnect_due), if reconnect_at.is_some() && socket.is_none() => {
                reconnect_at = None;
                match establish(&config, &state_tx).await {
                    Ok(ws) => socket = Some(ws),
                    Err(e) => {
                        tracing::warn!(error = %e, "reconnect attempt failed");
                        reconnect_at = Some(Instant::now() + config.reconnect_interval);
                    }
                }
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

async fn recv_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn establish(
    config: &RpcConfig,
    state_tx: &watch::Sender<ConnectionState>,
) -> Result<WsStream, RpcError> {
    state_tx.send_replace(ConnectionState::Connecting);
    tracing::info!(url = %config.url, "connecting to tool endpoint");
    match connect_async(&config.url).await {
        Ok((ws, _)) => {
            state_tx.send_replace(ConnectionState::Connected);
            tracing::info!("connected to tool endpoint");
            Ok(ws)
        }
        Err(e) => {
            state_tx.send_replace(ConnectionState::Disconnected);
            Err(RpcError::Transport(format!("connect failed: {e}")))
        }
    }
}

fn on_disconnect(
    socket: &mut Option<WsStream>,
    pending: &mut HashMap<String, Pending>,
    reconnect_at: &mut Option<Instant>,
    state_tx: &watch::Sender<ConnectionState>,
    reconnect_interval: Duration,
) {
    *socket = None;
    state_tx.send_replace(ConnectionState::Disconnected);
    if !pending.is_empty() {
        tracing::warn!(
            rejected = pending.len(),
            "rejecting in-flight requests after connection loss"
        );
    }
    settle_all(pending, &RpcError::Transport("websocket connection closed".into()));
    *reconnect_at = Some(Instant::now() + reconnect_interval);
}

fn settle_all(pending: &mut HashMap<String, Pending>, error: &RpcError) {
    for (_, entry) in pending.drain() {
        let _ = entry.reply.send(Err(error.clone()));
    }
}

fn expire_due(pending: &mut HashMap<String, Pending>, timeout: Duration) {
    let now = Instant::now();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in due {
        if let Some(entry) = pending.remove(&id) {
            tracing::warn!(id = %id, tool = %entry.tool, "request timed out");
            let _ = entry.reply.send(Err(RpcError::Timeout {
                tool: entry.tool,
                after: timeout,
            }));
        }
    }
}

fn handle_frame(text: &str, pending: &mut HashMap<String, Pending>) {
    let response: wire::Response = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed response frame");
            return;
        }
    };
    let Some(id) = response.id.clone() else {
        tracing::trace!("ignoring frame without id");
        return;
    };
    let Some(entry) = pending.remove(&id) else {
        // Late or unsolicited. The pending entry is gone, so there is
        // nothing to settle.
        tracing::trace!(id = %id, "no pending request for response id");
        return;
    };
    let _ = entry.reply.send(settle(response));
}

fn settle(response: wire::Response) -> Result<Value, RpcError> {
    if let Some(err) = response.error {
        return Err(RpcError::Tool(
            err.message.unwrap_or_else(|| "unknown error".into()),
        ));
    }
    let Some(result) = response.result else {
        return Ok(Value::Null);
    };
    if result.is_error() {
        let message = result.first_text().unwrap_or("unknown tool error").to_owned();
        return Err(RpcError::Tool(message));
    }
    Ok(wire::decode_result(&result))
}
