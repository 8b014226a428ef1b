//! In-process, typed, topic-based pub/sub (§4.F) wiring the Endpoint
//! Connections, the Endpoint Manager, and the MCP Service Manager together
//! without the Endpoint Manager or Endpoint Connections referencing each
//! other directly (§9 "Cross-component references").
//!
//! Grounded in the pack's `EventBus`/hook-system shape (e.g. the
//! `crucible-rune` MCP gateway's `event_bus::{Event, EventBus,
//! EventContext}` import), generalized to a registry keyed by topic string
//! rather than a fixed channel type, per the §9 "Event bus vs. channels"
//! Open Question decision recorded in DESIGN.md.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;

const DEFAULT_MAX_LISTENERS_PER_TOPIC: usize = 64;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A subscribed handler. Implemented for any `Fn(Value) -> impl Future`
/// closure via the blanket impl below, the same way the teacher hands
/// closures straight to `tauri::Emitter::emit` without a named handler type.
pub trait Handler: Send + Sync {
    fn call(&self, payload: Value) -> BoxFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, payload: Value) -> BoxFuture {
        Box::pin(self(payload))
    }
}

struct Listener {
    id: u64,
    handler: Arc<dyn Handler>,
    once: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub count: u64,
    pub last_emitted_at: Option<Instant>,
}

/// The in-process event bus. One instance is shared (by `Arc`) across the
/// Service Manager, the Endpoint Manager, and every Endpoint Connection.
///
/// `listeners` is itself wrapped in an `Arc` (independent of whatever `Arc`
/// the bus as a whole is shared behind) so `emit` can hand a cheap clone of
/// it to a detached supervisor task instead of borrowing `&self` for
/// `'static` — the supervisor outlives the `emit` call that spawned it.
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
    stats: RwLock<HashMap<String, TopicStats>>,
    next_id: AtomicU64,
    max_listeners_per_topic: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LISTENERS_PER_TOPIC)
    }
}

impl EventBus {
    pub fn new(max_listeners_per_topic: usize) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_listeners_per_topic,
        }
    }

    async fn subscribe<F, Fut>(&self, topic: &str, handler: F, once: bool) -> ListenerHandle
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.listeners.write().await;
        let entry = guard.entry(topic.to_string()).or_default();
        if entry.len() >= self.max_listeners_per_topic {
            tracing::warn!(
                "event bus: topic '{}' has {} listeners (limit {}), registering anyway",
                topic,
                entry.len(),
                self.max_listeners_per_topic
            );
        }
        entry.push(Listener {
            id,
            handler: Arc::new(handler),
            once,
        });
        ListenerHandle {
            topic: topic.to_string(),
            id,
        }
    }

    /// Register a handler that fires on every emission of `topic`.
    pub async fn on<F, Fut>(&self, topic: &str, handler: F) -> ListenerHandle
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(topic, handler, false).await
    }

    /// Register a handler that fires at most once, then is removed.
    pub async fn once<F, Fut>(&self, topic: &str, handler: F) -> ListenerHandle
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(topic, handler, true).await
    }

    /// Remove a previously registered listener.
    pub async fn off(&self, handle: &ListenerHandle) {
        let mut guard = self.listeners.write().await;
        if let Some(entry) = guard.get_mut(&handle.topic) {
            entry.retain(|l| l.id != handle.id);
        }
    }

    /// Emit `payload` on `topic`. Returns `true` iff at least one listener
    /// was registered for `topic` at emission time. Listener isolation: a
    /// panicking handler never prevents siblings from running and never
    /// propagates to the caller — each handler runs in its own task. Async
    /// listeners are awaited best-effort by a detached supervisor task, not
    /// by this call: a slow or throwing handler never blocks the emitter
    /// from returning (§4.F). Panics are reported out of band on the
    /// internal `error` topic once the supervisor observes them.
    pub async fn emit(&self, topic: &str, payload: Value) -> bool {
        let snapshot: Vec<(u64, Arc<dyn Handler>, bool)> = {
            let guard = self.listeners.read().await;
            guard
                .get(topic)
                .map(|v| v.iter().map(|l| (l.id, l.handler.clone(), l.once)).collect())
                .unwrap_or_default()
        };

        {
            let mut stats = self.stats.write().await;
            let entry = stats.entry(topic.to_string()).or_default();
            entry.count += 1;
            entry.last_emitted_at = Some(Instant::now());
        }

        if snapshot.is_empty() {
            return false;
        }

        let once_ids: Vec<u64> = snapshot.iter().filter(|(_, _, once)| *once).map(|(id, _, _)| *id).collect();
        if !once_ids.is_empty() {
            let mut guard = self.listeners.write().await;
            if let Some(entry) = guard.get_mut(topic) {
                entry.retain(|l| !once_ids.contains(&l.id));
            }
        }

        let mut joins = Vec::with_capacity(snapshot.len());
        for (_, handler, _) in &snapshot {
            let handler = handler.clone();
            let payload = payload.clone();
            joins.push(tokio::spawn(async move {
                handler.call(payload).await;
            }));
        }

        let topic_owned = topic.to_string();
        let is_error_topic = topic_owned == "error";
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            for join in joins {
                if let Err(join_err) = join.await {
                    if join_err.is_panic() {
                        tracing::error!("event bus: listener for '{}' panicked: {:?}", topic_owned, join_err);
                        if !is_error_topic {
                            // Never recurse back into `emit`'s own
                            // panic-reporting path — deliver straight to the
                            // `error` topic's current listeners instead.
                            deliver_error_report(&listeners, &topic_owned).await;
                        }
                    }
                }
            }
        });

        true
    }

    pub async fn stats(&self, topic: &str) -> TopicStats {
        self.stats.read().await.get(topic).cloned().unwrap_or_default()
    }
}

/// Deliver a panic report to the `error` topic's current listeners without
/// going through `EventBus::emit` (which would re-enter this same
/// panic-reporting path for an `error`-topic listener that itself panics).
async fn deliver_error_report(listeners: &Arc<RwLock<HashMap<String, Vec<Listener>>>>, failed_topic: &str) {
    let snapshot: Vec<Arc<dyn Handler>> = {
        let guard = listeners.read().await;
        guard
            .get("error")
            .map(|v| v.iter().map(|l| l.handler.clone()).collect())
            .unwrap_or_default()
    };

    let payload = serde_json::json!({"topic": failed_topic, "panic": true});
    for handler in snapshot {
        let payload = payload.clone();
        tokio::spawn(async move {
            handler.call(payload).await;
        });
    }
}

#[derive(Debug, Clone)]
pub struct ListenerHandle {
    topic: String,
    id: u64,
}

/// Canonical topic names required by §4.F, kept as constants so call sites
/// can't typo a topic string.
pub mod topics {
    pub const CONFIG_UPDATED: &str = "config:updated";
    pub const STATUS_UPDATED: &str = "status:updated";
    pub const ENDPOINT_STATUS_CHANGED: &str = "endpoint:status:changed";
    pub const MCP_SERVICE_CONNECTED: &str = "mcp:service:connected";
    pub const MCP_SERVICE_DISCONNECTED: &str = "mcp:service:disconnected";
    pub const MCP_SERVICE_CONNECTION_FAILED: &str = "mcp:service:connection:failed";
    pub const MCP_SERVER_ADDED: &str = "mcp:server:added";
    pub const MCP_SERVER_REMOVED: &str = "mcp:server:removed";
    pub const MCP_SERVER_BATCH_ADDED: &str = "mcp:server:batch_added";
    pub const CONNECTION_RECONNECT_COMPLETED: &str = "connection:reconnect:completed";
    pub const CATALOG_CONFLICT: &str = "catalog-conflict";
}
