//! Async, batched, single-writer usage/cost accounting pipeline (spec.md
//! §4.5). `UsageTracker` is the thin front the request path talks to — it
//! only ever enqueues to a bounded channel, never touches the database
//! directly, so a slow or stuck write queue cannot stall request handling.

pub mod cost;
pub mod events;
pub mod retention;
pub mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::capability::RequestRecorder;
use crate::model::TokenUsage;
use events::TrackerEvent;

pub struct UsageTracker {
    tx: mpsc::Sender<TrackerEvent>,
    dropped: AtomicU64,
}

impl UsageTracker {
    pub fn new(tx: mpsc::Sender<TrackerEvent>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn submit(&self, event: TrackerEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("usage tracker channel full: dropping event");
        }
    }

    /// Forces the write queue to drain its current batch; used on graceful
    /// shutdown (spec.md §5 "Cancellation": "flush the usage tracker").
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(TrackerEvent::Flush { ack: ack_tx }).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(5), ack_rx).await;
        }
    }

}

#[async_trait]
impl RequestRecorder for UsageTracker {
    async fn record_start(
        &self,
        connection_id: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
        method: &str,
        path: &str,
        is_streaming: bool,
        start_time: SystemTime,
    ) {
        self.submit(TrackerEvent::Start {
            request_id: connection_id.to_string(),
            client_ip,
            user_agent,
            method: method.to_string(),
            path: path.to_string(),
            is_streaming,
            start_time,
        });
    }

    async fn record_endpoint_selected(&self, connection_id: &str, endpoint_name: &str, group_name: &str, retry_count: u32) {
        self.submit(TrackerEvent::FlexibleUpdate {
            request_id: connection_id.to_string(),
            update: Box::new(crate::db::UpdateOptions {
                endpoint_name: Some(endpoint_name.to_string()),
                group_name: Some(group_name.to_string()),
                retry_count: Some(retry_count),
                ..Default::default()
            }),
        });
    }

    async fn record_success(
        &self,
        connection_id: &str,
        usage: TokenUsage,
        model_name: Option<String>,
        duration: Duration,
        http_status: u16,
    ) {
        self.submit(TrackerEvent::Success {
            request_id: connection_id.to_string(),
            usage,
            model_name,
            duration,
            http_status,
        });
    }

    async fn record_final_failure(
        &self,
        connection_id: &str,
        reason: &str,
        cancel_reason: Option<String>,
        duration: Duration,
        http_status: Option<u16>,
    ) {
        self.submit(TrackerEvent::FinalFailure {
            request_id: connection_id.to_string(),
            reason: reason.to_string(),
            cancel_reason,
            duration,
            http_status,
        });
    }

    async fn record_failed_request_tokens(&self, connection_id: &str, usage: TokenUsage, model_name: Option<String>) {
        self.submit(TrackerEvent::FailedRequestTokens {
            request_id: connection_id.to_string(),
            usage,
            model_name,
        });
    }

    async fn record_token_recovery(&self, connection_id: &str, usage: TokenUsage, model_name: Option<String>) {
        self.submit(TrackerEvent::TokenRecovery {
            request_id: connection_id.to_string(),
            usage,
            model_name,
        });
    }
}

pub fn spawn_write_queue(
    db: Arc<dyn crate::db::DbAdapter>,
    pricing: Arc<cost::PricingTable>,
    cfg: crate::config::DatabaseConfig,
    capacity: usize,
) -> (Arc<UsageTracker>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let tracker = Arc::new(UsageTracker::new(tx));
    let queue = writer::WriteQueue::new(rx, db, pricing, cfg);
    let handle = tokio::spawn(queue.run());
    (tracker, handle)
}
