//! Narrow capability traits that break the cyclic references a monolithic
//! "god struct" would otherwise force (spec.md §9 Design Notes #1).
//!
//! The retry handler depends on `EndpointSelector` and `EventPublisher`; the
//! proxy handler depends on `RequestRecorder` and `EventPublisher`. None of
//! them hold a concrete `EndpointManager`/`UsageTracker`/`EventBus` — only
//! `Arc<dyn Trait>`, so swapping an implementation (or mocking one in a
//! test) never ripples into unrelated modules.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::model::{ConnectionStatus, Endpoint, TokenUsage};

/// What the retry handler needs from the endpoint pool: ordered candidates,
/// the verdict on each attempt, and the handful of admin mutations exposed
/// over HTTP. Implemented by `endpoint::manager::EndpointManager`.
#[async_trait]
pub trait EndpointSelector: Send + Sync {
    /// Endpoints in the currently active group, ordered per the configured
    /// `SelectionStrategy`, skipping unhealthy/paused ones.
    async fn candidates(&self) -> Vec<Endpoint>;

    /// Advance past the active group (bounded by
    /// `retry.max_group_fallback_depth`) and return its candidates, or
    /// `None` once there is nowhere left to fall back to.
    async fn next_group_candidates(&self) -> Option<(String, Vec<Endpoint>)>;

    async fn record_success(&self, endpoint_name: &str, latency_ms: u64);
    async fn record_failure(&self, endpoint_name: &str);

    async fn pause_group(&self, group: &str, until: Option<Duration>);
    async fn resume_group(&self, group: &str);

    /// Pins `group` as the active group. Without `force`, activation fails
    /// (returns `false`, no pin taken) if no member of `group` is currently
    /// healthy (spec.md §4.1 `activate(name, force)`).
    async fn activate_group(&self, group: &str, force: bool) -> bool;
}

/// What the proxy handler needs from the usage tracker: fire-and-forget
/// lifecycle events, one per `TrackerEvent` ingress kind (spec.md §4.5
/// "Ingress"). Implemented by `usage::UsageTracker`.
#[async_trait]
pub trait RequestRecorder: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn record_start(
        &self,
        connection_id: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
        method: &str,
        path: &str,
        is_streaming: bool,
        start_time: SystemTime,
    );
    async fn record_endpoint_selected(&self, connection_id: &str, endpoint_name: &str, group_name: &str, retry_count: u32);
    async fn record_success(
        &self,
        connection_id: &str,
        usage: TokenUsage,
        model_name: Option<String>,
        duration: Duration,
        http_status: u16,
    );
    async fn record_final_failure(
        &self,
        connection_id: &str,
        reason: &str,
        cancel_reason: Option<String>,
        duration: Duration,
        http_status: Option<u16>,
    );
    async fn record_failed_request_tokens(&self, connection_id: &str, usage: TokenUsage, model_name: Option<String>);
    async fn record_token_recovery(&self, connection_id: &str, usage: TokenUsage, model_name: Option<String>);
}

/// What anything that wants to announce state change needs: publish a typed
/// event without knowing who is subscribed or caring whether the bus is
/// momentarily backed up (spec.md §4.7 drop-on-overflow). Implemented by
/// `events::EventBus`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: crate::events::Event);
}

/// Lightweight per-request context threaded through the forwarder, in place
/// of an opaque `HashMap<String, Box<dyn Any>>` context bag (spec.md §9
/// Design Notes #4).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub start_time: SystemTime,
    pub client_model: Option<String>,
    pub group_fallback_depth: u32,
}

impl RequestContext {
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            status: ConnectionStatus::Active,
            start_time: SystemTime::now(),
            client_model: None,
            group_fallback_depth: 0,
        }
    }
}
