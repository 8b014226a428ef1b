//! Error taxonomy shared across the proxy core.
//!
//! Mirrors the conceptual taxonomy of the JSON-RPC/MCP layer: failures are
//! typed so callers can map them onto JSON-RPC error codes (see
//! [`crate::jsonrpc::ErrorObject`]) without string-matching messages, the
//! same way `GatewayError` / `LegacySseError` in the upstream transport code
//! give each failure mode its own variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("service '{0}' is not connected")]
    ServiceNotConnected(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// JSON-RPC error code this maps onto when surfaced to an endpoint (§7).
    pub fn rpc_code(&self) -> i64 {
        match self {
            ProxyError::ToolNotFound(_) => -32000,
            ProxyError::ServiceNotConnected(_) => -32000,
            ProxyError::Connection(_) => -32000,
            ProxyError::Timeout(_) => -32000,
            ProxyError::Protocol(_) => -32600,
            ProxyError::Validation(_) => -32602,
            ProxyError::Duplicate(_) => -32000,
            ProxyError::Internal(_) => -32603,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
