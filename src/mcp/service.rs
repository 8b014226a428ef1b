//! MCP Service (§4.B): one downstream tool-providing process/connection,
//! its status, its cached tool list, and its ping loop.
//!
//! Grounded in the teacher's `McpConnection` (`connection.rs`, pre-rewrite):
//! same connect/disconnect/callTool shape, same idempotent-connect guard,
//! generalized from a single stdio-only connection to the three transports
//! in `transport.rs` and given an explicit timeout + event-bus notifications
//! instead of directly mutating a shared `AppState`.

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolRequestParam, CallToolResult, Tool};
use rmcp::service::RunningService;
use rmcp::RoleClient;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::config::McpServiceConfig;
use crate::error::{ProxyError, Result};
use crate::event_bus::{topics, EventBus};
use crate::mcp::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ServiceStatus {
    fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Disconnected => "disconnected",
            ServiceStatus::Connecting => "connecting",
            ServiceStatus::Connected => "connected",
            ServiceStatus::Failed => "failed",
        }
    }
}

struct Inner {
    running: Option<RunningService<RoleClient, ()>>,
    status: ServiceStatus,
    tools: Vec<Tool>,
    last_error: Option<String>,
    is_pinging: bool,
    last_ping_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Snapshot returned by `McpService::get_status` (§4.B).
#[derive(Debug, Clone)]
pub struct ServiceStatusReport {
    pub name: String,
    pub connected: bool,
    pub initialized: bool,
    pub transport_type: Option<crate::config::TransportKind>,
    pub tool_count: usize,
    pub connection_state: ServiceStatus,
    pub ping_enabled: bool,
    pub is_pinging: bool,
    pub last_ping_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// One downstream MCP service: its config, its live connection (if any), and
/// its cached tool catalog.
pub struct McpService {
    pub config: McpServiceConfig,
    inner: RwLock<Inner>,
    connect_lock: Mutex<()>,
    events: Arc<EventBus>,
    ping_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpService {
    pub fn new(config: McpServiceConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                running: None,
                status: ServiceStatus::Disconnected,
                tools: Vec::new(),
                last_error: None,
                is_pinging: false,
                last_ping_time: None,
            }),
            connect_lock: Mutex::new(()),
            events,
            ping_task: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        self.inner.read().await.status
    }

    /// Cached tool list, retained read-only even while disconnected (§4.B
    /// "tool cache survives disconnect").
    pub async fn tools(&self) -> Vec<Tool> {
        self.inner.read().await.tools.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    /// `{name, connected, initialized, transportType, toolCount,
    /// connectionState, pingEnabled, isPinging, lastPingTime?}` (§4.B
    /// `getStatus()`). `initialized` mirrors `connected` here: a service has
    /// no separate post-handshake flag distinct from reaching CONNECTED, the
    /// way an Endpoint Connection does.
    pub async fn get_status(&self) -> ServiceStatusReport {
        let guard = self.inner.read().await;
        ServiceStatusReport {
            name: self.config.name.clone(),
            connected: guard.status == ServiceStatus::Connected,
            initialized: guard.status == ServiceStatus::Connected,
            transport_type: self.config.resolve_transport().ok(),
            tool_count: guard.tools.len(),
            connection_state: guard.status,
            ping_enabled: self.config.ping.enabled,
            is_pinging: guard.is_pinging,
            last_ping_time: guard.last_ping_time,
        }
    }

    /// Connect, handshake, and cache the tool list. Idempotent: a concurrent
    /// caller finding CONNECTING fails fast rather than queuing behind the
    /// first attempt; a caller finding CONNECTED is a no-op (§4.B).
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let current = self.inner.read().await.status;
            match current {
                ServiceStatus::Connected => return Ok(()),
                ServiceStatus::Connecting => {
                    return Err(ProxyError::Connection(format!(
                        "service '{}' is already connecting",
                        self.config.name
                    )))
                }
                _ => {}
            }
        }

        let _guard = self.connect_lock.lock().await;
        // Re-check after acquiring the lock in case a racing caller finished.
        if self.inner.read().await.status == ServiceStatus::Connected {
            return Ok(());
        }

        self.inner.write().await.status = ServiceStatus::Connecting;

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let result = tokio::time::timeout(timeout, transport::connect(&self.config)).await;

        let running = match result {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                self.mark_failed(e.to_string()).await;
                return Err(ProxyError::Connection(format!(
                    "service '{}': {}",
                    self.config.name, e
                )));
            }
            Err(_) => {
                let msg = format!("service '{}': connect timed out after {:?}", self.config.name, timeout);
                self.mark_failed(msg).await;
                return Err(ProxyError::Timeout(timeout));
            }
        };

        let tools = match tokio::time::timeout(timeout, running.list_tools(Default::default())).await {
            Ok(Ok(result)) => result.tools,
            Ok(Err(e)) => {
                let msg = format!("service '{}': tools/list failed: {}", self.config.name, e);
                self.mark_failed(msg.clone()).await;
                return Err(ProxyError::Protocol(msg));
            }
            Err(_) => {
                let msg = format!("service '{}': tools/list timed out", self.config.name);
                self.mark_failed(msg).await;
                return Err(ProxyError::Timeout(timeout));
            }
        };

        // §9 "Tool-name parsing ambiguity": a tool whose own name contains
        // `__` would produce a qualified name that round-trips ambiguously
        // when split at the first occurrence. Reject the whole connection
        // rather than silently admit an ambiguous entry into the catalog.
        if let Some(bad) = tools.iter().find(|t| t.name.contains("__")) {
            let msg = format!(
                "service '{}': tool '{}' contains '__' and cannot be safely qualified",
                self.config.name, bad.name
            );
            let _ = running.cancel().await;
            self.mark_failed(msg.clone()).await;
            return Err(ProxyError::Validation(msg));
        }

        {
            let mut guard = self.inner.write().await;
            guard.running = Some(running);
            guard.status = ServiceStatus::Connected;
            guard.tools = tools;
            guard.last_error = None;
        }

        tracing::info!("service '{}': -> {}", self.config.name, ServiceStatus::Connected.as_str());
        self.events
            .emit(
                topics::MCP_SERVICE_CONNECTED,
                json!({"service": self.config.name, "status": ServiceStatus::Connected.as_str()}),
            )
            .await;

        if self.config.ping.enabled {
            self.spawn_ping_loop();
        }

        Ok(())
    }

    async fn mark_failed(&self, message: String) {
        let mut guard = self.inner.write().await;
        guard.status = ServiceStatus::Failed;
        guard.running = None;
        guard.last_error = Some(message.clone());
        drop(guard);
        self.events
            .emit(
                topics::MCP_SERVICE_CONNECTION_FAILED,
                json!({"service": self.config.name, "error": message}),
            )
            .await;
    }

    pub async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self.ping_task.lock().await.take() {
            handle.abort();
        }
        let running = self.inner.write().await.running.take();
        if let Some(running) = running {
            let _ = running.cancel().await;
        }
        self.inner.write().await.status = ServiceStatus::Disconnected;
        self.events
            .emit(
                topics::MCP_SERVICE_DISCONNECTED,
                json!({"service": self.config.name}),
            )
            .await;
        Ok(())
    }

    /// Performance recording lives on the endpoint side (§3 "per endpoint"),
    /// not here — `EndpointConnection::execute_tool_call` times this call and
    /// appends the record.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        let guard = self.inner.read().await;
        let running = guard
            .running
            .as_ref()
            .ok_or_else(|| ProxyError::ServiceNotConnected(self.config.name.clone()))?;

        running
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| ProxyError::Protocol(format!("tool call '{}' failed: {}", tool_name, e)))
    }

    /// Ping subsystem (§4.B): after `start_delay_ms`, call a lightweight
    /// `tools/list` on a repeating `interval_ms` timer until disconnected,
    /// marking the service FAILED if a ping errors.
    fn spawn_ping_loop(self: &Arc<Self>) {
        let this = self.clone();
        let setter = self.clone();
        let start_delay = Duration::from_millis(this.config.ping.start_delay_ms);
        let interval = Duration::from_millis(this.config.ping.interval_ms.max(1));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; already waited start_delay
            loop {
                ticker.tick().await;
                if this.status().await != ServiceStatus::Connected {
                    break;
                }
                this.inner.write().await.is_pinging = true;
                let result = {
                    let guard = this.inner.read().await;
                    match guard.running.as_ref() {
                        Some(r) => r.list_tools(Default::default()).await.map(|_| ()),
                        None => break,
                    }
                };
                {
                    let mut guard = this.inner.write().await;
                    guard.is_pinging = false;
                    guard.last_ping_time = Some(chrono::Utc::now());
                }
                if let Err(e) = result {
                    tracing::warn!("service '{}': ping failed: {}", this.config.name, e);
                    this.mark_failed(format!("ping failed: {}", e)).await;
                    break;
                }
            }
        });

        // Note: `disconnect` may race this in rare cases and abort a handle
        // that hasn't been stored yet; the ping loop then simply outlives
        // disconnect briefly before its own `running.is_none()` check exits.
        tokio::spawn(async move {
            *setter.ping_task.lock().await = Some(handle);
        });
    }
}
