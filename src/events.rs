//! Typed pub/sub with per-event-type rate limiting and priority (spec.md
//! §4.7). One in-process sink (the SSE broadcaster, `observability.rs`);
//! publishers never block on a slow or absent subscriber.
//!
//! Grounded in the teacher's own small `Instant`-based cooldown/backoff
//! helpers (`proxy/retry.rs`'s `backoff_sleep`) rather than reaching for a
//! rate-limiting crate like `governor` — the bus only needs a
//! last-emitted-at timestamp per event type (SPEC_FULL.md §4.7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capability::EventPublisher;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Tagged-variant event payload (spec.md §9 Design Notes: replace free-form
/// maps with a tagged-variant type; the bus only flattens to a generic map
/// at the serialization boundary, in `to_json`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    EndpointHealthFlip {
        endpoint: String,
        group: String,
        healthy: bool,
    },
    GroupStatusChange {
        group: String,
        active: bool,
        reason: String,
    },
    ConnectionLifecycle {
        connection_id: String,
        status: String,
        endpoint: Option<String>,
    },
    SystemStats {
        active_connections: u64,
        suspended_connections: u64,
    },
    SystemError {
        message: String,
    },
    ConfigChange {
        summary: String,
    },
}

impl EventKind {
    fn default_priority(&self) -> Priority {
        match self {
            EventKind::EndpointHealthFlip { .. } => Priority::High,
            EventKind::GroupStatusChange { .. } => Priority::High,
            EventKind::SystemError { .. } => Priority::High,
            EventKind::ConfigChange { .. } => Priority::High,
            EventKind::ConnectionLifecycle { .. } => Priority::Normal,
            EventKind::SystemStats { .. } => Priority::Low,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            EventKind::EndpointHealthFlip { .. } => "endpoint_health_flip",
            EventKind::GroupStatusChange { .. } => "group_status_change",
            EventKind::ConnectionLifecycle { .. } => "connection_lifecycle",
            EventKind::SystemStats { .. } => "system_stats",
            EventKind::SystemError { .. } => "system_error",
            EventKind::ConfigChange { .. } => "config_change",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub source: String,
    pub priority: Priority,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        let priority = kind.default_priority();
        Self {
            source: source.into(),
            priority,
            timestamp_ms: now_ms(),
            kind,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Minimum interval between forwarded events of a given type. High-priority
/// kinds (health flips, group changes, errors, config changes) are never
/// rate-limited; stats events are heavily debounced; lifecycle events
/// lightly so (spec.md §4.7).
fn rate_limit_for(type_name: &str) -> Duration {
    match type_name {
        "system_stats" => Duration::from_secs(5),
        "connection_lifecycle" => Duration::from_millis(100),
        _ => Duration::ZERO,
    }
}

struct RateLimiterTable {
    last_emitted: HashMap<&'static str, Instant>,
}

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// The bus itself: a bounded mpsc channel plus a background worker that
/// applies the rate limiter and forwards surviving events to subscribers.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    dropped: std::sync::atomic::AtomicU64,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> (std::sync::Arc<Self>, EventBusWorker) {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let bus = std::sync::Arc::new(Self {
            tx,
            dropped: std::sync::atomic::AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        });
        let worker = EventBusWorker {
            rx,
            limiter: RateLimiterTable {
                last_emitted: HashMap::new(),
            },
            subscribers: None,
        };
        (bus, worker)
    }

    /// Registers a new SSE client; returns the receiving half.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn subscribers_snapshot(&self) -> Vec<mpsc::Sender<Event>> {
        let mut guard = self.subscribers.lock();
        guard.retain(|s| !s.is_closed());
        guard.clone()
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Owns the receiving half of the bus; run as its own task (spec.md §5 — one
/// independent thread per subsystem). `run` takes the bus so it can fan out
/// to the live subscriber list without the worker itself holding a lock.
pub struct EventBusWorker {
    rx: mpsc::Receiver<Event>,
    limiter: RateLimiterTable,
    subscribers: Option<std::sync::Arc<EventBus>>,
}

impl EventBusWorker {
    pub async fn run(mut self, bus: std::sync::Arc<EventBus>) {
        self.subscribers = Some(bus.clone());
        while let Some(event) = self.rx.recv().await {
            if !self.should_forward(&event) {
                continue;
            }
            for sub in bus.subscribers_snapshot() {
                if sub.try_send(event.clone()).is_err() {
                    debug!("SSE subscriber channel full or closed, dropping event");
                }
            }
        }
        warn!("event bus worker stopped: channel closed");
    }

    fn should_forward(&mut self, event: &Event) -> bool {
        let type_name = event.kind.type_name();
        let limit = rate_limit_for(type_name);
        if limit.is_zero() {
            return true;
        }
        let now = Instant::now();
        match self.limiter.last_emitted.get(type_name) {
            Some(last) if now.duration_since(*last) < limit => false,
            _ => {
                self.limiter.last_emitted.insert(type_name, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn publish_drops_when_channel_full() {
        let (bus, _worker) = EventBus::new();
        // Fill beyond capacity without a worker draining.
        for _ in 0..(DEFAULT_CHANNEL_CAPACITY + 5) {
            bus.publish(Event::new(
                "test",
                EventKind::SystemStats {
                    active_connections: 0,
                    suspended_connections: 0,
                },
            ))
            .await;
        }
        assert!(bus.dropped_count() > 0);
    }

    #[test]
    fn high_priority_kinds_are_never_rate_limited() {
        assert_eq!(rate_limit_for("endpoint_health_flip"), Duration::ZERO);
        assert_eq!(rate_limit_for("group_status_change"), Duration::ZERO);
        assert_eq!(rate_limit_for("system_error"), Duration::ZERO);
        assert_eq!(rate_limit_for("config_change"), Duration::ZERO);
    }

    #[test]
    fn stats_events_are_heavily_debounced() {
        assert_eq!(rate_limit_for("system_stats"), Duration::from_secs(5));
    }
}
