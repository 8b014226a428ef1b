//! Composition root: wires the event bus, the MCP Service Manager, and the
//! Endpoint Manager together and runs until interrupted.
//!
//! Not a general CLI surface (file-backed config/hot-reload are non-goals,
//! §1) — mirrors the teacher's `lib.rs::run()` setup closure: init tracing,
//! load whatever config is on hand, initialize the managers, then idle.
//! Takes a single optional positional argument: a path to a JSON file
//! shaped `{"endpoints": [...], "services": [...]}`. With no argument it
//! starts with an empty fleet, which is still useful for exercising
//! `addEndpoint`/`addService` against a running process.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use xiaozhi_proxy_core::config::{InMemoryConfigStore, McpServiceConfig};
use xiaozhi_proxy_core::{EndpointManager, EventBus, McpServiceManager};

#[derive(Debug, Default, Deserialize)]
struct BootstrapConfig {
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    services: Vec<McpServiceConfig>,
}

fn load_bootstrap_config(path: Option<PathBuf>) -> BootstrapConfig {
    let Some(path) = path else {
        return BootstrapConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::error!("proxyd: failed to parse config '{}': {}", path.display(), e);
            BootstrapConfig::default()
        }),
        Err(e) => {
            tracing::error!("proxyd: failed to read config '{}': {}", path.display(), e);
            BootstrapConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting xiaozhi-proxy-core");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let bootstrap = load_bootstrap_config(config_path);

    tracing::info!(
        "loaded bootstrap config: {} endpoints, {} services",
        bootstrap.endpoints.len(),
        bootstrap.services.len()
    );

    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));

    for config in bootstrap.services {
        if let Err(e) = services.add_service_config(config).await {
            tracing::error!("proxyd: failed to register service: {}", e);
        }
    }
    let started = services.start_all().await;
    for (name, outcome) in &started {
        if let Err(e) = outcome {
            tracing::warn!("proxyd: service '{}' failed to connect: {}", name, e);
        }
    }

    let store = Arc::new(InMemoryConfigStore::new(bootstrap.endpoints, vec![]));
    let endpoints = EndpointManager::new(store, services.clone(), events.clone());
    if let Err(e) = endpoints.initialize().await {
        tracing::error!("proxyd: endpoint manager failed to initialize: {}", e);
    }

    tracing::info!("xiaozhi-proxy-core is running; press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("proxyd: failed to listen for ctrl-c: {}", e);
    }

    tracing::info!("shutting down");
    endpoints.cleanup().await;
    let _ = services.stop_all().await;
}
