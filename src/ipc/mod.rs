pub mod event;
pub mod handlers;

use crate::error::{ErrorCode, KernelError};
use crate::Kernel;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tracing::{debug, error, info, trace, warn};

// ─── Rate limiting ──────────────────────────────────────────────────────────

/// Max new WebSocket connections per IP per minute.
const MAX_CONNECTIONS_PER_MIN: usize = 10;
/// Max RPC requests per connection per second.
const MAX_RPC_PER_SEC: u32 = 100;

/// Per-IP connection rate tracker.
struct ConnectionRateLimiter {
    /// Map of IP -> list of connection timestamps within the last minute.
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Returns `true` if the connection should be allowed.
    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Per-connection RPC rate tracker using a tumbling window (resets each second).
struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns `true` if the request should be allowed.
    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

/// Constant-time token comparison to prevent timing-based token oracle attacks.
/// Returns `true` if `a == b` without short-circuiting on mismatch.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── JSON-RPC 2.0 types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

// ─── Error codes ─────────────────────────────────────────────────────────────

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const UNAUTHORIZED: i32 = -32004;
/// Kernel denied the action (`NOT_ALLOWED`).
const NOT_ALLOWED_CODE: i32 = -32010;
/// Target node has no live session (`NOT_CONNECTED`).
const NOT_CONNECTED_CODE: i32 = -32011;
/// Resource exhaustion or downstream failure (`UNAVAILABLE`).
const UNAVAILABLE_CODE: i32 = -32012;

fn code_for(err: &KernelError) -> i32 {
    match err.code() {
        ErrorCode::InvalidRequest => INVALID_REQUEST,
        ErrorCode::NotAllowed => NOT_ALLOWED_CODE,
        ErrorCode::NotConnected => NOT_CONNECTED_CODE,
        ErrorCode::Unavailable => UNAVAILABLE_CODE,
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(kernel: Arc<Kernel>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", kernel.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "RPC server listening");

    kernel.broadcaster.broadcast(
        "kernel.ready",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "port": kernel.config.port,
            "policySha256": kernel.policy_store.sha256(),
        }),
    );

    // Per-IP connection rate limiter (shared across all accept iterations).
    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping RPC server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let kernel = kernel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, kernel).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    kernel: Arc<Kernel>,
) -> Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024),
        max_frame_size: Some(4 * 1024 * 1024),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Auth challenge ───────────────────────────────────────────────────────
    // The first message from every client must be a `kernel.auth` RPC call
    // carrying the correct token. This keeps other local processes from
    // issuing arbitrary RPC commands.
    if !kernel.auth_token.is_empty() {
        let first = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next()).await;

        let text = match first {
            Ok(Some(Ok(Message::Text(t)))) => t,
            // Timeout, connection closed, or non-text frame — reject silently.
            _ => return Ok(()),
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                let _ = sink
                    .send(Message::Text(error_response(
                        Value::Null,
                        PARSE_ERROR,
                        "Parse error",
                        None,
                    )))
                    .await;
                return Ok(());
            }
        };

        let id = req.id.clone().unwrap_or(Value::Null);

        if req.method != "kernel.auth" {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    UNAUTHORIZED,
                    "Unauthorized — send kernel.auth first",
                    None,
                )))
                .await;
            return Ok(());
        }

        let provided = req
            .params
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !tokens_equal(provided, &kernel.auth_token) {
            let _ = sink
                .send(Message::Text(error_response(
                    id,
                    UNAUTHORIZED,
                    "Unauthorized — invalid token",
                    None,
                )))
                .await;
            return Ok(());
        }

        let resp = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "authenticated": true }
        });
        let _ = sink.send(Message::Text(resp.to_string())).await;
        debug!("client authenticated");
    }

    let mut broadcast_rx = kernel.broadcaster.subscribe();
    let mut rpc_limiter = RpcRateLimiter::new();

    loop {
        tokio::select! {
            // Incoming message from client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !rpc_limiter.check() {
                            let resp = error_response(
                                Value::Null,
                                UNAVAILABLE_CODE,
                                "RPC rate limit exceeded — max 100 req/sec",
                                None,
                            );
                            if let Err(e) = sink.send(Message::Text(resp)).await {
                                warn!(err = %e, "send error");
                                break;
                            }
                            continue;
                        }
                        let response = dispatch_text(&text, &kernel).await;
                        if let Err(e) = sink.send(Message::Text(response)).await {
                            warn!(err = %e, "send error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing broadcast event
            event = broadcast_rx.recv() => {
                match event {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            warn!(err = %e, "broadcast send error");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Slow client: events are dropped for this client and
                        // the sender is never blocked. Keep the connection so
                        // it can still issue RPCs.
                        warn!(skipped = n, "broadcast lagged — slow client skipped events");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Dispatch a raw JSON-RPC text frame.
pub(crate) async fn dispatch_text(text: &str, kernel: &Kernel) -> String {
    let req: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            return error_response(Value::Null, PARSE_ERROR, "Parse error", None);
        }
    };

    if req.jsonrpc != "2.0" {
        return error_response(
            req.id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request",
            None,
        );
    }

    let id = req.id.unwrap_or(Value::Null);
    let params = req.params.unwrap_or(Value::Null);

    trace!(method = %req.method, "rpc dispatch");

    match handlers::dispatch(&req.method, params, kernel).await {
        Ok(value) => {
            let resp = RpcResponse {
                jsonrpc: "2.0",
                id,
                result: Some(value),
                error: None,
            };
            serde_json::to_string(&resp).unwrap_or_default()
        }
        Err(HandlerError::UnknownMethod(method)) => error_response(
            id,
            METHOD_NOT_FOUND,
            &format!("Method not found: {method}"),
            None,
        ),
        Err(HandlerError::Kernel(e)) => {
            let data = serde_json::json!({
                "code": e.code().as_str(),
                "reasons": e.reasons(),
                "breakGlass": break_glass_of(&e),
            });
            error_response(id, code_for(&e), &e.to_string(), Some(data))
        }
    }
}

fn break_glass_of(e: &KernelError) -> Option<&'static str> {
    match e {
        KernelError::Denied { break_glass, .. } => *break_glass,
        _ => None,
    }
}

/// Handler dispatch outcome: a kernel error or an unknown method.
pub(crate) enum HandlerError {
    Kernel(KernelError),
    UnknownMethod(String),
}

impl From<KernelError> for HandlerError {
    fn from(e: KernelError) -> Self {
        HandlerError::Kernel(e)
    }
}

fn error_response(id: Value, code: i32, message: &str, data: Option<Value>) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
            data,
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}
