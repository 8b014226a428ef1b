//! Upstream Endpoint layer (§4.D/§4.E): a WebSocket peer that calls *us* as
//! JSON-RPC server, one `EndpointConnection` per configured URL, coordinated
//! fleet-wide by an `EndpointManager`.

pub mod connection;
pub mod manager;
pub mod reconnect;

pub use connection::{ConnectionState, EndpointConnection};
pub use manager::EndpointManager;
pub use reconnect::{BackoffKind, BackoffPolicy};
