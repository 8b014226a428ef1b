//! JSON-RPC 2.0 wire types shared by the endpoint connection (as callee) and
//! the downstream MCP service clients (as caller).
//!
//! Adapted from the JSON-RPC envelope used throughout the pack (e.g. the
//! zeroclaw MCP client's `mcp_protocol.rs`), generalized so the `id` field is
//! modeled as the number|string|null|absent sum type the spec calls for
//! rather than a string-coerced scalar.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

/// `id` is number | string | null | absent. Deserializing a JSON `null`
/// produces `None`, same as a missing field — both mean "notification".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// An inbound JSON-RPC request or notification (this crate is always the
/// callee on the endpoint side: the endpoint calls, we respond).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse a single inbound text frame. Returns `None` for anything that
    /// cannot be attributed an id: invalid JSON, non-object shape, or a
    /// `jsonrpc` field that isn't exactly `"2.0"`. Per §4.D, malformed input
    /// produces zero responses rather than an error envelope.
    pub fn parse(text: &str) -> Option<Self> {
        let req: JsonRpcRequest = serde_json::from_str(text).ok()?;
        if req.jsonrpc != JSONRPC_VERSION {
            return None;
        }
        Some(req)
    }
}

/// Outbound `tools/call` params as carried in a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Build a success envelope. `id` is carried verbatim (type and value).
pub fn success_envelope(id: RequestId, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error envelope. `id` is carried verbatim (type and value).
pub fn error_envelope(id: RequestId, code: i64, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

/// An outbound request this crate makes as a client of a downstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcCall {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcCall {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }
}

/// An inbound JSON-RPC response (downstream service → us, as client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}
