//! Downstream MCP service layer (§4.B/§4.C): one `McpService` per configured
//! tool provider, aggregated by an `McpServiceManager`.

pub mod manager;
pub mod service;
pub mod transport;

pub use manager::{McpServiceManager, QualifiedName};
pub use service::{McpService, ServiceStatus, ServiceStatusReport};
