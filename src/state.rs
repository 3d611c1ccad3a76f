//! Shared runtime state: connection lifecycle records, bounded history, and
//! the handles every HTTP route needs (spec.md §3 "Connection", §5 "Resource
//! bounds"). Mirrors the teacher's `Arc<Mutex<...>>`-behind-a-store shape for
//! `ProxyService`'s own request table, generalized to a read/write lock since
//! reads (snapshotting for `/health`, `/metrics`) vastly outnumber writes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::endpoint::EndpointManager;
use crate::events::EventBus;
use crate::forwarder::EndpointClientCache;
use crate::model::{ConnectionStatus, TokenUsage};
use crate::suspension::SuspensionGate;
use crate::usage::UsageTracker;

const CONNECTION_HISTORY_CAPACITY: usize = 1000;
const RESPONSE_TIMES_CAPACITY: usize = 1000;

/// In-memory lifecycle record for one request (spec.md §3 "Connection").
/// Owned exclusively by the request's own task until it reaches a terminal
/// status, then copied into the bounded history ring.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: String,
    pub path: String,
    pub start_time: SystemTime,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub retry_count: u32,
    pub status: ConnectionStatus,
    pub is_streaming: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub token_usage: TokenUsage,
    pub is_suspended: bool,
    pub suspended_at: Option<SystemTime>,
    pub resumed_at: Option<SystemTime>,
    pub suspended_time_ms: Option<u64>,
}

impl ConnectionRecord {
    pub fn new(
        id: String,
        client_ip: Option<String>,
        user_agent: Option<String>,
        method: String,
        path: String,
        is_streaming: bool,
    ) -> Self {
        Self {
            id,
            client_ip,
            user_agent,
            method,
            path,
            start_time: SystemTime::now(),
            endpoint: None,
            group: None,
            retry_count: 0,
            status: ConnectionStatus::Active,
            is_streaming,
            bytes_sent: 0,
            bytes_received: 0,
            token_usage: TokenUsage::default(),
            is_suspended: false,
            suspended_at: None,
            resumed_at: None,
            suspended_time_ms: None,
        }
    }
}

struct Inner {
    active: HashMap<String, ConnectionRecord>,
    history: VecDeque<ConnectionRecord>,
    response_times: VecDeque<u64>,
}

/// Bounded, lock-guarded table of in-flight and recently-terminal requests
/// (spec.md §5 "Resource bounds": `active_connections` sized to in-flight
/// count, `connection_history` ring at 1000, `response_times` at 1000).
pub struct MetricsStore {
    inner: RwLock<Inner>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                active: HashMap::new(),
                history: VecDeque::with_capacity(CONNECTION_HISTORY_CAPACITY),
                response_times: VecDeque::with_capacity(RESPONSE_TIMES_CAPACITY),
            }),
        }
    }

    pub fn begin(&self, record: ConnectionRecord) {
        self.inner.write().active.insert(record.id.clone(), record);
    }

    pub fn update(&self, id: &str, f: impl FnOnce(&mut ConnectionRecord)) {
        if let Some(record) = self.inner.write().active.get_mut(id) {
            f(record);
        }
    }

    /// Moves a connection out of the active table into history, recording its
    /// response time sample if given.
    pub fn finish(&self, id: &str, response_time_ms: Option<u64>) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.active.remove(id) {
            if inner.history.len() >= CONNECTION_HISTORY_CAPACITY {
                inner.history.pop_front();
            }
            inner.history.push_back(record);
        }
        if let Some(ms) = response_time_ms {
            if inner.response_times.len() >= RESPONSE_TIMES_CAPACITY {
                inner.response_times.pop_front();
            }
            inner.response_times.push_back(ms);
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn suspended_count(&self) -> usize {
        self.inner.read().active.values().filter(|c| c.is_suspended).count()
    }

    pub fn history_snapshot(&self) -> Vec<ConnectionRecord> {
        self.inner.read().history.iter().cloned().collect()
    }

    pub fn average_response_time_ms(&self) -> Option<u64> {
        let inner = self.inner.read();
        if inner.response_times.is_empty() {
            return None;
        }
        Some(inner.response_times.iter().sum::<u64>() / inner.response_times.len() as u64)
    }
}

/// Everything a route handler needs, constructed once in `main` and shared
/// via axum's `State` extractor (spec.md §9 Design Notes #2: no globals, a
/// constructed coordinator instead).
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub endpoints: Arc<EndpointManager>,
    pub events: Arc<EventBus>,
    pub usage: Arc<UsageTracker>,
    pub metrics_store: Arc<MetricsStore>,
    pub suspension_gate: Arc<SuspensionGate>,
    pub http_client: reqwest::Client,
    pub endpoint_clients: Arc<EndpointClientCache>,
}
