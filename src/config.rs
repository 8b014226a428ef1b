//! Data-model configuration types (§3, §6) plus the narrow external
//! collaborator contract the core consumes for persisted endpoint state.
//!
//! File parsing, hot-reload, and on-disk format are explicit non-goals (§1);
//! this module only defines the shapes and the trait boundary, the way the
//! teacher keeps `types.rs` (shapes) separate from `config.rs` (I/O) — here
//! the I/O half is reduced to a trait so callers can supply their own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ProxyError, Result};

/// Downstream MCP service transport kind (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Optional ping subsystem settings for a downstream service (§4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ping_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_ping_start_delay_ms")]
    pub start_delay_ms: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_ping_interval_ms(),
            start_delay_ms: default_ping_start_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ping_interval_ms() -> u64 {
    60_000
}
fn default_ping_start_delay_ms() -> u64 {
    5_000
}

/// Configuration for a single downstream MCP service (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServiceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub ping: PingConfig,
    /// Connect/handshake/`tools/list` deadline (§4.B, default 10s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl McpServiceConfig {
    /// Resolve the effective transport per §3/§6: explicit wins over
    /// `command`, which wins over URL-suffix inference.
    pub fn resolve_transport(&self) -> Result<TransportKind> {
        if let Some(t) = self.transport {
            return Ok(t);
        }
        if self.command.is_some() {
            return Ok(TransportKind::Stdio);
        }
        if let Some(url) = &self.url {
            return Ok(infer_transport_from_url(url));
        }
        Err(ProxyError::Validation(format!(
            "service '{}': no transport, command, or url to infer from",
            self.name
        )))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProxyError::Validation("service name cannot be empty".into()));
        }
        if self.name.contains("__") {
            // Resolves the §9 tool-name ambiguity open question: reject at
            // registration time rather than let qualified names collide.
            return Err(ProxyError::Validation(format!(
                "service '{}': service names must not contain '__'",
                self.name
            )));
        }
        match self.resolve_transport()? {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(ProxyError::Validation(format!(
                        "service '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                if self.url.as_deref().map_or(true, str::is_empty) {
                    return Err(ProxyError::Validation(format!(
                        "service '{}': sse/streamable-http transport requires a url",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// URL path ends with `/sse` (case-sensitive), optionally followed by a
/// query string or fragment, with no trailing slash after it.
fn infer_transport_from_url(url: &str) -> TransportKind {
    let parsed = url::Url::parse(url);
    let path = match &parsed {
        Ok(u) => u.path().to_string(),
        Err(_) => {
            // Not a parseable absolute URL; fall back to a lexical check on
            // the part before any '?' or '#'.
            url.split(['?', '#']).next().unwrap_or(url).to_string()
        }
    };
    if path.ends_with("/sse") {
        TransportKind::Sse
    } else {
        TransportKind::StreamableHttp
    }
}

/// Options governing an Endpoint Manager instance (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOptions {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub error_recovery_enabled: bool,
    #[serde(default = "default_true")]
    pub error_notification_enabled: bool,
    #[serde(default = "default_service_added_delay_ms")]
    pub service_added_delay_ms: u64,
    #[serde(default = "default_service_removed_delay_ms")]
    pub service_removed_delay_ms: u64,
    #[serde(default = "default_batch_added_delay_ms")]
    pub batch_added_delay_ms: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_service_added_delay_ms() -> u64 {
    2_000
}
fn default_service_removed_delay_ms() -> u64 {
    2_000
}
fn default_batch_added_delay_ms() -> u64 {
    3_000
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connection_timeout_ms: default_connection_timeout_ms(),
            error_recovery_enabled: true,
            error_notification_enabled: true,
            service_added_delay_ms: default_service_added_delay_ms(),
            service_removed_delay_ms: default_service_removed_delay_ms(),
            batch_added_delay_ms: default_batch_added_delay_ms(),
        }
    }
}

impl EndpointOptions {
    /// Apply a partial update expressed as a JSON object, rejecting unknown
    /// keys (§4.E options schema) and out-of-range values.
    pub fn merge_from_value(&self, patch: &serde_json::Value) -> Result<Self> {
        let obj = patch
            .as_object()
            .ok_or_else(|| ProxyError::Validation("options patch must be an object".into()))?;

        const KNOWN: &[&str] = &[
            "reconnectIntervalMs",
            "maxReconnectAttempts",
            "connectionTimeoutMs",
            "errorRecoveryEnabled",
            "errorNotificationEnabled",
            "serviceAddedDelayMs",
            "serviceRemovedDelayMs",
            "batchAddedDelayMs",
        ];
        for key in obj.keys() {
            if !KNOWN.contains(&key.as_str()) {
                return Err(ProxyError::Validation(format!("unknown option key: {}", key)));
            }
        }

        let mut merged =
            serde_json::to_value(self).map_err(|e| ProxyError::Internal(e.to_string()))?;
        let merged_obj = merged.as_object_mut().unwrap();
        for (k, v) in obj {
            merged_obj.insert(k.clone(), v.clone());
        }
        let next: EndpointOptions =
            serde_json::from_value(merged).map_err(|e| ProxyError::Validation(e.to_string()))?;
        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> Result<()> {
        if self.reconnect_interval_ms < 100 {
            return Err(ProxyError::Validation("reconnectIntervalMs must be >= 100".into()));
        }
        if self.connection_timeout_ms < 1000 {
            return Err(ProxyError::Validation("connectionTimeoutMs must be >= 1000".into()));
        }
        Ok(())
    }
}

/// Validate a bare endpoint URL string (§3): non-empty, parseable, scheme in
/// {ws, wss}.
pub fn validate_endpoint_url(raw: &str) -> Result<url::Url> {
    if raw.is_empty() {
        return Err(ProxyError::Validation("endpoint url cannot be empty".into()));
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| ProxyError::Validation(format!("invalid endpoint url '{}': {}", raw, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ProxyError::Validation(format!(
            "endpoint url '{}' has unsupported scheme '{}' (expected ws/wss)",
            raw, other
        ))),
    }
}

/// External collaborator (§6): the core never decides the persisted format,
/// only calls through this contract.
#[async_trait::async_trait]
pub trait EndpointConfigStore: Send + Sync {
    async fn get_mcp_endpoints(&self) -> Result<Vec<String>>;
    async fn add_mcp_endpoint(&self, url: &str) -> Result<()>;
    async fn remove_mcp_endpoint(&self, url: &str) -> Result<()>;
    async fn get_mcp_servers(&self) -> Result<Vec<McpServiceConfig>>;
}

/// In-memory implementation used by tests and the composition-root binary.
/// Real deployments supply a file- or database-backed store.
#[derive(Default)]
pub struct InMemoryConfigStore {
    endpoints: tokio::sync::RwLock<Vec<String>>,
    servers: tokio::sync::RwLock<Vec<McpServiceConfig>>,
}

impl InMemoryConfigStore {
    pub fn new(endpoints: Vec<String>, servers: Vec<McpServiceConfig>) -> Self {
        Self {
            endpoints: tokio::sync::RwLock::new(endpoints),
            servers: tokio::sync::RwLock::new(servers),
        }
    }
}

#[async_trait::async_trait]
impl EndpointConfigStore for InMemoryConfigStore {
    async fn get_mcp_endpoints(&self) -> Result<Vec<String>> {
        Ok(self.endpoints.read().await.clone())
    }

    async fn add_mcp_endpoint(&self, url: &str) -> Result<()> {
        let mut guard = self.endpoints.write().await;
        if guard.iter().any(|u| u == url) {
            return Err(ProxyError::Duplicate(format!("endpoint '{}' already persisted", url)));
        }
        guard.push(url.to_string());
        Ok(())
    }

    async fn remove_mcp_endpoint(&self, url: &str) -> Result<()> {
        let mut guard = self.endpoints.write().await;
        guard.retain(|u| u != url);
        Ok(())
    }

    async fn get_mcp_servers(&self) -> Result<Vec<McpServiceConfig>> {
        Ok(self.servers.read().await.clone())
    }
}
