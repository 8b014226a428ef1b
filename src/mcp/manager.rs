//! MCP Service Manager (§4.C): the aggregate catalog over every registered
//! `McpService`, qualified-name routing, and start/stop lifecycle.
//!
//! Grounded in the teacher's `McpManager` (pre-rewrite), which kept a
//! `HashMap<String, Arc<McpConnection>>` plus a Tauri health loop; this keeps
//! the map shape and the add/connect/disconnect lifecycle but replaces
//! `tauri::AppHandle::emit` with `EventBus` emissions and adds the qualified
//! tool-name / conflict rules the teacher had no need for.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{CallToolResult, Tool};
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::McpServiceConfig;
use crate::error::{ProxyError, Result};
use crate::event_bus::{topics, EventBus};
use crate::mcp::service::{McpService, ServiceStatus};

/// A tool qualified with its owning service: `serviceName__originalName`
/// (§4.C). Split on the *first* `__` so tool names may themselves contain
/// underscores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub service: String,
    pub tool: String,
}

impl QualifiedName {
    pub fn format(service: &str, tool: &str) -> String {
        format!("{}__{}", service, tool)
    }

    pub fn parse(qualified: &str) -> Option<Self> {
        let (service, tool) = qualified.split_once("__")?;
        if service.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self {
            service: service.to_string(),
            tool: tool.to_string(),
        })
    }
}

/// Registers and aggregates every downstream `McpService`.
pub struct McpServiceManager {
    services: RwLock<HashMap<String, Arc<McpService>>>,
    events: Arc<EventBus>,
}

impl McpServiceManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register a service config without starting it. Emits
    /// `mcp:server:added` (§4.F).
    pub async fn add_service_config(&self, config: McpServiceConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.clone();
        {
            let mut guard = self.services.write().await;
            if guard.contains_key(&name) {
                return Err(ProxyError::Duplicate(format!("service '{}' already registered", name)));
            }
            guard.insert(name.clone(), Arc::new(McpService::new(config, self.events.clone())));
        }
        self.events.emit(topics::MCP_SERVER_ADDED, json!({"service": name})).await;
        Ok(())
    }

    /// Batch variant: registers every config, then emits a single
    /// `mcp:server:batch_added` in addition to the per-service
    /// `mcp:server:added` events (§4.F), so a fleet-wide reconnect listener
    /// can debounce on the batch event alone.
    pub async fn add_service_configs_batch(&self, configs: Vec<McpServiceConfig>) -> Result<()> {
        let mut added = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            let name = config.name.clone();
            let mut guard = self.services.write().await;
            if guard.contains_key(&name) {
                return Err(ProxyError::Duplicate(format!("service '{}' already registered", name)));
            }
            guard.insert(name.clone(), Arc::new(McpService::new(config, self.events.clone())));
            drop(guard);
            added.push(name);
        }
        self.events
            .emit(topics::MCP_SERVER_BATCH_ADDED, json!({"services": added}))
            .await;
        Ok(())
    }

    pub async fn start_service(&self, name: &str) -> Result<()> {
        let service = self.get(name).await?;
        service.connect().await
    }

    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let service = self.get(name).await?;
        service.disconnect().await?;
        self.events.emit(topics::MCP_SERVER_REMOVED, json!({"service": name})).await;
        Ok(())
    }

    pub async fn start_all(&self) -> Vec<(String, Result<()>)> {
        let names: Vec<String> = self.services.read().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.start_service(&name).await;
            results.push((name, outcome));
        }
        results
    }

    pub async fn stop_all(&self) -> Vec<(String, Result<()>)> {
        let names: Vec<String> = self.services.read().await.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.stop_service(&name).await;
            results.push((name, outcome));
        }
        results
    }

    pub async fn get(&self, name: &str) -> Result<Arc<McpService>> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::ToolNotFound(format!("no such service: {}", name)))
    }

    pub async fn has_tool(&self, qualified: &str) -> bool {
        match QualifiedName::parse(qualified) {
            Some(q) => match self.services.read().await.get(&q.service) {
                Some(service) => service.tools().await.iter().any(|t| t.name == q.tool),
                None => false,
            },
            None => false,
        }
    }

    /// Aggregated catalog across every CONNECTED service, qualified
    /// `service__tool`. Qualification already disambiguates by service, but
    /// if a service itself publishes the same tool name twice the
    /// later-registered entry wins and a `catalog-conflict` event fires
    /// (§4.C).
    pub async fn get_all_tools(&self) -> Vec<(String, Tool)> {
        let guard = self.services.read().await;
        let mut seen = HashMap::new();
        let mut out = Vec::new();
        for (service_name, service) in guard.iter() {
            if service.status().await != ServiceStatus::Connected {
                continue;
            }
            for tool in service.tools().await {
                let qualified = QualifiedName::format(service_name, &tool.name);
                if seen.insert(qualified.clone(), ()).is_some() {
                    self.events
                        .emit(
                            topics::CATALOG_CONFLICT,
                            json!({"tool": qualified, "service": service_name}),
                        )
                        .await;
                }
                out.push((qualified, tool));
            }
        }
        out
    }

    /// Dispatch a qualified tool call to its owning service. Names without a
    /// `__` separator are routed to a caller-supplied custom-tool handler
    /// instead (§4.C "non-qualified names"); this manager has none wired in,
    /// so they come back as `ToolNotFound`.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        let parsed = QualifiedName::parse(qualified)
            .ok_or_else(|| ProxyError::ToolNotFound(format!("not a qualified tool name: {}", qualified)))?;
        let service = self.get(&parsed.service).await?;
        service.call_tool(&parsed.tool, arguments).await
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    pub async fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        Ok(self.get(name).await?.status().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PingConfig, TransportKind};

    fn test_config(name: &str) -> McpServiceConfig {
        McpServiceConfig {
            name: name.to_string(),
            transport: Some(TransportKind::Stdio),
            command: Some("does-not-exist-binary".into()),
            args: None,
            env: None,
            url: None,
            headers: None,
            api_key: None,
            ping: PingConfig {
                enabled: false,
                ..PingConfig::default()
            },
            connect_timeout_ms: 100,
        }
    }

    #[test]
    fn qualified_name_splits_on_first_double_underscore() {
        let q = QualifiedName::parse("weather__get_forecast__v2").unwrap();
        assert_eq!(q.service, "weather");
        assert_eq!(q.tool, "get_forecast__v2");
    }

    #[test]
    fn qualified_name_rejects_missing_separator() {
        assert!(QualifiedName::parse("noseparator").is_none());
    }

    #[tokio::test]
    async fn duplicate_service_registration_rejected() {
        let events = Arc::new(EventBus::default());
        let manager = McpServiceManager::new(events);
        manager.add_service_config(test_config("calc")).await.unwrap();
        let result = manager.add_service_config(test_config("calc")).await;
        assert!(matches!(result, Err(ProxyError::Duplicate(_))));
    }

    #[tokio::test]
    async fn batch_add_emits_batch_event() {
        let events = Arc::new(EventBus::default());
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        events
            .on(topics::MCP_SERVER_BATCH_ADDED, move |_| {
                let fired2 = fired2.clone();
                async move {
                    fired2.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await;

        let manager = McpServiceManager::new(events);
        manager
            .add_service_configs_batch(vec![test_config("a"), test_config("b")])
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(manager.service_names().await.len(), 2);
    }

    #[tokio::test]
    async fn call_tool_on_non_qualified_name_is_tool_not_found() {
        let events = Arc::new(EventBus::default());
        let manager = McpServiceManager::new(events);
        let result = manager.call_tool("justaname", None).await;
        assert!(matches!(result, Err(ProxyError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn disconnected_service_tools_excluded_from_aggregate_catalog() {
        let events = Arc::new(EventBus::default());
        let manager = McpServiceManager::new(events);
        manager.add_service_config(test_config("calc")).await.unwrap();
        let tools = manager.get_all_tools().await;
        assert!(tools.is_empty());
    }
}
