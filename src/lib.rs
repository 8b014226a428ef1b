//! `xiaozhi-proxy-core`: an aggregating MCP proxy. Downstream, it speaks as
//! a client to any number of MCP tool providers over stdio, SSE, or
//! streamable HTTP (`mcp`). Upstream, it speaks as a JSON-RPC server to any
//! number of WebSocket endpoints that call into the aggregated tool catalog
//! (`endpoint`). The two sides only ever meet through `McpServiceManager`,
//! which every `EndpointConnection` holds a reference to.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event_bus;
pub mod jsonrpc;
pub mod mcp;
pub mod perf;

pub use config::{EndpointConfigStore, EndpointOptions, InMemoryConfigStore, McpServiceConfig};
pub use endpoint::{EndpointConnection, EndpointManager};
pub use error::{ProxyError, Result};
pub use event_bus::EventBus;
pub use mcp::{McpService, McpServiceManager, QualifiedName};
