//! Endpoint Connection (§4.D): the WebSocket JSON-RPC engine for a single
//! upstream endpoint. This crate is always the *callee* on this side — the
//! endpoint sends requests, we respond — which is the mirror image of the
//! client role `mcp/service.rs` plays against downstream services.
//!
//! Grounded in the casial-server `McpClient` connection task
//! (`other_examples/.../client.rs`): a `connect_async`-established stream
//! split into sender/receiver halves driven by a `tokio::select!` loop, here
//! adapted from "we call out and parse responses" to "we parse incoming
//! calls and write responses", plus reconnect scheduling via
//! `reconnect::BackoffPolicy` and the binary audio framing from `codec`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::codec;
use crate::error::Result;
use crate::event_bus::{topics, EventBus};
use crate::jsonrpc::{self, JsonRpcRequest, RequestId};
use crate::mcp::McpServiceManager;
use crate::perf::{PerfAggregate, PerfHistory, PerfRecord};

use super::reconnect::BackoffPolicy;

/// §4.D default reconnect attempt cap; the Endpoint Manager overrides this
/// per connection via `set_max_reconnect_attempts` once it knows the
/// configured `EndpointOptions::max_reconnect_attempts`.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// §4.D default connect-timeout; every transition into CONNECTING is bounded
/// by this deadline unless the Endpoint Manager overrides it via
/// `set_connect_timeout` from `EndpointOptions::connection_timeout_ms`.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

struct Inner {
    state: ConnectionState,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

/// A single upstream endpoint's WebSocket connection: its state machine, its
/// JSON-RPC dispatch loop, and its own performance history.
pub struct EndpointConnection {
    pub url: String,
    inner: RwLock<Inner>,
    perf: RwLock<PerfHistory>,
    services: Arc<McpServiceManager>,
    events: Arc<EventBus>,
    backoff: RwLock<BackoffPolicy>,
    max_reconnect_attempts: AtomicU32,
    reconnect_enabled: std::sync::atomic::AtomicBool,
    manual_disconnect: std::sync::atomic::AtomicBool,
    connect_timeout: RwLock<Duration>,
    outbound_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    run_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl EndpointConnection {
    pub fn new(url: impl Into<String>, services: Arc<McpServiceManager>, events: Arc<EventBus>) -> Self {
        Self {
            url: url.into(),
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                last_error: None,
            }),
            perf: RwLock::new(PerfHistory::default()),
            services,
            events,
            backoff: RwLock::new(BackoffPolicy::default()),
            max_reconnect_attempts: AtomicU32::new(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_enabled: std::sync::atomic::AtomicBool::new(true),
            manual_disconnect: std::sync::atomic::AtomicBool::new(false),
            connect_timeout: RwLock::new(DEFAULT_CONNECT_TIMEOUT),
            outbound_tx: RwLock::new(None),
            run_task: RwLock::new(None),
        }
    }

    /// Override the connect-timeout deadline (§4.E `connectionTimeoutMs`).
    pub async fn set_connect_timeout(&self, timeout: Duration) {
        *self.connect_timeout.write().await = timeout;
    }

    /// Override the reconnect attempt cap (§4.E `EndpointOptions::max_reconnect_attempts`);
    /// takes effect on the next scheduled reconnect.
    pub fn set_max_reconnect_attempts(&self, max_attempts: u32) {
        self.max_reconnect_attempts.store(max_attempts, Ordering::Relaxed);
    }

    /// Override the backoff policy consulted by the reconnect loop (§4.E
    /// options: `reconnectIntervalMs` maps onto the policy's base delay).
    pub async fn set_backoff_policy(&self, policy: BackoffPolicy) {
        *self.backoff.write().await = policy;
    }

    /// Enable/disable automatic reconnect on unexpected disconnect (§4.E
    /// `errorRecoveryEnabled`); manual `disconnect()` always inhibits
    /// auto-reconnect regardless of this flag.
    pub fn set_reconnect_enabled(&self, enabled: bool) {
        self.reconnect_enabled.store(enabled, Ordering::Relaxed);
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn perf_aggregate(&self) -> PerfAggregate {
        self.perf.read().await.aggregate()
    }

    async fn transition(&self, next: ConnectionState) {
        let prev = {
            let mut guard = self.inner.write().await;
            let prev = guard.state;
            guard.state = next;
            if next == ConnectionState::Connected {
                guard.reconnect_attempts = 0;
                guard.last_error = None;
            }
            prev
        };
        tracing::info!("endpoint '{}': {} -> {}", self.url, prev.as_str(), next.as_str());
        self.events
            .emit(
                topics::ENDPOINT_STATUS_CHANGED,
                json!({"url": self.url, "from": prev.as_str(), "to": next.as_str()}),
            )
            .await;
    }

    /// Connect, handshake, and spawn the dispatch loop. Returns once the
    /// WebSocket handshake succeeds; the dispatch loop itself runs in a
    /// background task for the lifetime of the connection.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.transition(ConnectionState::Connecting).await;

        let timeout = *self.connect_timeout.read().await;
        let (ws_stream, _response) =
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&self.url)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    let msg = format!("endpoint '{}': connect failed: {}", self.url, e);
                    self.inner.write().await.last_error = Some(msg.clone());
                    self.transition(ConnectionState::Failed).await;
                    return Err(crate::error::ProxyError::Connection(msg));
                }
                Err(_) => {
                    let msg = format!("endpoint '{}': connect timed out after {:?}", self.url, timeout);
                    self.inner.write().await.last_error = Some(msg);
                    self.transition(ConnectionState::Failed).await;
                    return Err(crate::error::ProxyError::Timeout(timeout));
                }
            };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound_tx.write().await = Some(tx);

        self.transition(ConnectionState::Connected).await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        match outgoing {
                            Some(msg) => {
                                if let Err(e) = ws_sender.send(msg).await {
                                    tracing::warn!("endpoint '{}': send failed: {}", this.url, e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = ws_receiver.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                this.handle_text_frame(&text).await;
                            }
                            Some(Ok(Message::Binary(bytes))) => {
                                this.handle_binary_frame(&bytes).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                this.send_raw(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Pong(_))) => {}
                            Some(Ok(Message::Close(_))) => {
                                tracing::info!("endpoint '{}': closed by peer", this.url);
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                tracing::warn!("endpoint '{}': receive error: {}", this.url, e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            *this.outbound_tx.write().await = None;
            this.on_disconnected().await;
        });

        *self.run_task.write().await = Some(handle);
        Ok(())
    }

    async fn on_disconnected(self: &Arc<Self>) {
        if self.state().await == ConnectionState::Disconnected {
            return;
        }
        self.transition(ConnectionState::Disconnected).await;

        // A manual disconnect() inhibits auto-reconnect (§4.D
        // `isManualDisconnect`); clear the flag once consulted so a later
        // unexpected drop reconnects normally again.
        if self.manual_disconnect.swap(false, Ordering::SeqCst) {
            return;
        }
        if !self.reconnect_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.schedule_reconnect();
    }

    /// Per-connection reconnect loop consuming the shared `BackoffPolicy`
    /// (§4.D). Runs detached; `disconnect()` cancels it by tearing down the
    /// run task, which this loop checks for before each attempt. Gives up
    /// and transitions to FAILED once `max_reconnect_attempts` is reached,
    /// leaving the connection entry in place so `trigger_reconnect` can
    /// resurrect it later (§4.E).
    fn schedule_reconnect(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let max_attempts = this.max_reconnect_attempts.load(Ordering::Relaxed);
                let attempt = {
                    let mut guard = this.inner.write().await;
                    guard.reconnect_attempts += 1;
                    guard.reconnect_attempts
                };

                if attempt > max_attempts {
                    tracing::warn!(
                        "endpoint '{}': giving up after {} reconnect attempts",
                        this.url,
                        max_attempts
                    );
                    this.inner.write().await.last_error =
                        Some(format!("exceeded {} reconnect attempts", max_attempts));
                    this.transition(ConnectionState::Failed).await;
                    return;
                }

                this.transition(ConnectionState::Reconnecting).await;
                let delay = this.backoff.read().await.delay_for_attempt(attempt);
                tracing::info!(
                    "endpoint '{}': reconnecting in {:?} (attempt {}/{})",
                    this.url,
                    delay,
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(delay).await;

                if this.state().await != ConnectionState::Reconnecting {
                    // Someone called disconnect()/connect() in the meantime.
                    return;
                }

                match this.connect().await {
                    Ok(()) => {
                        this.events
                            .emit(
                                topics::CONNECTION_RECONNECT_COMPLETED,
                                json!({"url": this.url, "attempts": attempt}),
                            )
                            .await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("endpoint '{}': reconnect attempt {} failed: {}", this.url, attempt, e);
                        continue;
                    }
                }
            }
        });
    }

    /// Manual disconnect (§4.D): sets `isManualDisconnect` so the close
    /// handler that observes the resulting stream end does not auto-reconnect.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::SeqCst);
        if let Some(handle) = self.run_task.write().await.take() {
            handle.abort();
        }
        *self.outbound_tx.write().await = None;
        self.transition(ConnectionState::Disconnected).await;
    }

    async fn send_raw(&self, msg: Message) {
        if let Some(tx) = self.outbound_tx.read().await.as_ref() {
            let _ = tx.send(msg);
        }
    }

    async fn send_json(&self, value: &Value) {
        if let Ok(text) = serde_json::to_string(value) {
            self.send_raw(Message::Text(text)).await;
        }
    }

    /// Binary frames (§6) decode as audio-codec frames; anything that isn't
    /// a recognizable frame is dropped rather than erroring, since the wire
    /// also carries opaque opus payloads this layer has no reason to parse.
    async fn handle_binary_frame(&self, bytes: &[u8]) {
        if codec::is_frame(bytes) {
            if let Some(frame) = codec::decode(bytes) {
                tracing::debug!(
                    "endpoint '{}': decoded {:?} frame, {} byte payload, ts={}",
                    self.url,
                    frame.frame_type,
                    frame.payload.len(),
                    frame.timestamp
                );
            }
        }
    }

    /// Parse and dispatch a single inbound JSON-RPC text frame (§4.D). Per
    /// §4.D, input that cannot be attributed an id produces no response at
    /// all rather than an error envelope.
    async fn handle_text_frame(&self, text: &str) {
        let Some(request) = JsonRpcRequest::parse(text) else {
            tracing::debug!("endpoint '{}': dropped unparseable frame", self.url);
            return;
        };

        let is_notification = request.is_notification();
        let response = self.dispatch(request).await;

        if let Some(response) = response {
            if !is_notification {
                self.send_json(&response).await;
            }
        }
    }

    /// Handshake methods (§4.D): `initialize`, `tools/list`, `tools/call`,
    /// `ping`, anything else → `-32601`. Notifications (`id` absent/null)
    /// still execute their side effects but produce no envelope.
    async fn dispatch(&self, request: JsonRpcRequest) -> Option<Value> {
        let id = request.id.clone();
        let is_notification = request.is_notification();

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": jsonrpc::MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}, "logging": {}},
                "serverInfo": {"name": "xiaozhi-proxy-core", "version": env!("CARGO_PKG_VERSION")},
            })),
            "tools/list" => Ok(self.handle_tools_list().await),
            "tools/call" => self.handle_tools_call(request.params.clone()).await,
            "ping" => Ok(json!({})),
            other => {
                if is_notification {
                    return None;
                }
                let id = id.unwrap_or(RequestId::Number(0));
                return Some(jsonrpc::error_envelope(
                    id,
                    jsonrpc::METHOD_NOT_FOUND,
                    format!("method not found: {}", other),
                ));
            }
        };

        if is_notification {
            return None;
        }
        let id = id.unwrap_or(RequestId::Number(0));
        Some(match result {
            Ok(value) => jsonrpc::success_envelope(id, value),
            Err(e) => jsonrpc::error_envelope(id, e.rpc_code(), e.to_string()),
        })
    }

    async fn handle_tools_list(&self) -> Value {
        let tools = self.services.get_all_tools().await;
        let entries: Vec<Value> = tools
            .into_iter()
            .map(|(qualified, tool)| {
                json!({
                    "name": qualified,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({"tools": entries})
    }

    /// Execute a `tools/call`, appending a performance record regardless of
    /// outcome (§3/§9 "per endpoint"; spec scenario: success appends
    /// `{name, dur, true}`, failure `{name, dur, false}`).
    async fn handle_tools_call(&self, params: Option<Value>) -> Result<Value> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::error::ProxyError::Validation("tools/call requires a 'name'".into()))?
            .to_string();
        let arguments = params
            .get("arguments")
            .and_then(Value::as_object)
            .cloned();

        let started = Instant::now();
        let outcome = self.services.call_tool(&name, arguments).await;
        let mut perf = self.perf.write().await;
        perf.push(PerfRecord {
            tool_name: name.clone(),
            duration: started.elapsed(),
            success: outcome.is_ok(),
            ts: chrono::Utc::now(),
        });
        drop(perf);

        outcome.map(|result| serde_json::to_value(result).unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<McpServiceManager> {
        Arc::new(McpServiceManager::new(Arc::new(EventBus::default())))
    }

    #[tokio::test]
    async fn connect_to_unreachable_url_is_failed_state() {
        let events = Arc::new(EventBus::default());
        let conn = Arc::new(EndpointConnection::new("ws://127.0.0.1:1/nope", manager(), events));
        let result = conn.connect().await;
        assert!(result.is_err());
        assert_eq!(conn.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn exhausting_reconnect_attempts_settles_on_failed_without_looping_forever() {
        let events = Arc::new(EventBus::default());
        let conn = Arc::new(EndpointConnection::new("ws://127.0.0.1:1/nope", manager(), events));
        conn.set_max_reconnect_attempts(2);
        conn.set_backoff_policy(BackoffPolicy {
            kind: crate::endpoint::reconnect::BackoffKind::Fixed,
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: false,
        })
        .await;

        conn.transition(ConnectionState::Connected).await; // pretend we were up
        conn.on_disconnected().await; // then the peer dropped us

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn manual_disconnect_inhibits_auto_reconnect() {
        let events = Arc::new(EventBus::default());
        let conn = Arc::new(EndpointConnection::new("ws://127.0.0.1:1/nope", manager(), events));
        conn.transition(ConnectionState::Connected).await;
        conn.manual_disconnect.store(true, Ordering::SeqCst);
        conn.on_disconnected().await;
        // No reconnect loop was scheduled; state stays Disconnected, not
        // Reconnecting/Failed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dispatch_unknown_method_is_method_not_found() {
        let events = Arc::new(EventBus::default());
        let conn = EndpointConnection::new("ws://unused", manager(), events);
        let request = JsonRpcRequest::parse(r#"{"jsonrpc":"2.0","id":1,"method":"bogus"}"#).unwrap();
        let response = conn.dispatch(request).await.unwrap();
        assert_eq!(response["error"]["code"], json!(jsonrpc::METHOD_NOT_FOUND));
        assert_eq!(response["id"], json!(1));
    }

    #[tokio::test]
    async fn dispatch_notification_produces_no_response() {
        let events = Arc::new(EventBus::default());
        let conn = EndpointConnection::new("ws://unused", manager(), events);
        let request = JsonRpcRequest::parse(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(conn.dispatch(request).await.is_none());
    }

    #[tokio::test]
    async fn dispatch_initialize_returns_protocol_version() {
        let events = Arc::new(EventBus::default());
        let conn = EndpointConnection::new("ws://unused", manager(), events);
        let request = JsonRpcRequest::parse(r#"{"jsonrpc":"2.0","id":"a","method":"initialize"}"#).unwrap();
        let response = conn.dispatch(request).await.unwrap();
        assert_eq!(
            response["result"]["protocolVersion"],
            json!(jsonrpc::MCP_PROTOCOL_VERSION)
        );
        assert_eq!(response["id"], json!("a"));
    }

    #[tokio::test]
    async fn dispatch_tools_call_on_unqualified_name_is_server_error() {
        let events = Arc::new(EventBus::default());
        let conn = EndpointConnection::new("ws://unused", manager(), events);
        let request = JsonRpcRequest::parse(
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"nosep","arguments":{}}}"#,
        )
        .unwrap();
        let response = conn.dispatch(request).await.unwrap();
        assert!(response.get("error").is_some());
        assert_eq!(response["id"], json!(7));
    }

    #[tokio::test]
    async fn failed_tool_call_still_appends_perf_record() {
        let events = Arc::new(EventBus::default());
        let conn = EndpointConnection::new("ws://unused", manager(), events);
        let request = JsonRpcRequest::parse(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"svc__tool","arguments":{}}}"#,
        )
        .unwrap();
        let _ = conn.dispatch(request).await;
        let agg = conn.perf_aggregate().await;
        assert_eq!(agg.total_calls, 1);
        assert_eq!(agg.failures, 1);
    }
}
