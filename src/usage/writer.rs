//! Single-writer batched persistence pipeline (spec.md §4.5 "Event loop",
//! "Write queue", "Retries", "Retention & summary", "Backup"). One task owns
//! the database connection; every `TrackerEvent` passes through it, so
//! writes to the same `request_id` are always applied in enqueue order
//! (spec.md §5 "Ordering guarantees").

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::config::DatabaseConfig;
use crate::db::{DbAdapter, RequestLogRow, UpdateOptions};
use crate::errors::TrackerError;
use crate::usage::cost::PricingTable;
use crate::usage::events::TrackerEvent;

fn system_time_to_utc(ts: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(ts)
}

pub struct WriteQueue {
    rx: mpsc::Receiver<TrackerEvent>,
    db: Arc<dyn DbAdapter>,
    pricing: Arc<PricingTable>,
    cfg: DatabaseConfig,
    /// request_id -> start_time, used to prefer the stored start time over
    /// a caller-supplied duration when computing `duration_ms` (spec.md §9
    /// Open Question, resolved in DESIGN.md).
    start_times: std::collections::HashMap<String, SystemTime>,
}

impl WriteQueue {
    pub fn new(
        rx: mpsc::Receiver<TrackerEvent>,
        db: Arc<dyn DbAdapter>,
        pricing: Arc<PricingTable>,
        cfg: DatabaseConfig,
    ) -> Self {
        Self {
            rx,
            db,
            pricing,
            cfg,
            start_times: std::collections::HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        if let Err(err) = self.db.bootstrap().await {
            error!(error = %err, "failed to bootstrap usage database schema");
        }

        let mut batch = Vec::with_capacity(self.cfg.batch_size);
        let mut flush_timer = tokio::time::interval(Duration::from_millis(self.cfg.flush_interval_ms));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(TrackerEvent::Flush { ack }) => {
                            self.drain_batch(&mut batch).await;
                            let _ = ack.send(());
                        }
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= self.cfg.batch_size {
                                self.drain_batch(&mut batch).await;
                            }
                        }
                        None => {
                            self.drain_batch(&mut batch).await;
                            debug!("usage tracker write queue shutting down: channel closed");
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    self.drain_batch(&mut batch).await;
                }
            }
        }
    }

    #[instrument(skip(self, batch), fields(len = batch.len()))]
    async fn drain_batch(&mut self, batch: &mut Vec<TrackerEvent>) {
        if batch.is_empty() {
            return;
        }
        debug!("flushing usage tracker batch");
        for event in batch.drain(..) {
            if let Err(err) = self.apply_with_retry(event).await {
                error!(error = %err, "usage tracker write failed after retries");
            }
        }
    }

    async fn apply_with_retry(&mut self, event: TrackerEvent) -> Result<(), TrackerError> {
        let mut attempt = 0u32;
        loop {
            match self.apply_one(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.cfg.max_retry {
                        return Err(err);
                    }
                    self.recover_from(&err).await;
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
    }

    /// Dialect-aware recovery per error class (spec.md §4.5 "Retries").
    async fn recover_from(&self, err: &TrackerError) {
        match err {
            TrackerError::DiskFull(_) => {
                warn!("disk full: cleaning up old rows to free space");
                let cutoff = Utc::now() - chrono::Duration::days(self.cfg.retention_days as i64);
                let _ = self.db.delete_older_than(cutoff).await;
            }
            TrackerError::Connection(_) => {
                warn!("database connection error: will retry");
            }
            TrackerError::Locked(_) => {
                debug!("database locked: awaiting unlock before retry");
            }
            TrackerError::Corruption(_) => {
                error!("database corruption detected: recovery from backup must be performed at startup");
            }
            _ => {}
        }
    }

    async fn apply_one(&mut self, event: TrackerEvent) -> Result<(), TrackerError> {
        match event {
            TrackerEvent::Start {
                request_id,
                client_ip,
                user_agent,
                method,
                path,
                is_streaming,
                start_time,
            } => {
                self.start_times.insert(request_id.clone(), start_time);
                self.db
                    .upsert_request_log(&RequestLogRow {
                        request_id,
                        client_ip,
                        user_agent,
                        method: Some(method),
                        path: Some(path),
                        is_streaming,
                        start_time: Some(system_time_to_utc(start_time)),
                        status: Some("active".to_string()),
                    })
                    .await
            }
            TrackerEvent::FlexibleUpdate { request_id, update } => {
                self.db.apply_update(&request_id, &update).await
            }
            TrackerEvent::Success {
                request_id,
                usage,
                model_name,
                duration,
                http_status,
            } => {
                let duration_ms = self.resolve_duration_ms(&request_id, duration);
                let model = model_name.clone().unwrap_or_else(|| "unknown".to_string());
                let cost = self.pricing.cost_for(&model, usage);
                let update = UpdateOptions {
                    status: Some("completed".to_string()),
                    http_status: Some(http_status),
                    model_name,
                    end_time: Some(Utc::now()),
                    duration_ms: Some(duration_ms),
                    ..Default::default()
                };
                self.db.apply_success(&request_id, usage, cost, &update).await?;
                self.start_times.remove(&request_id);
                Ok(())
            }
            TrackerEvent::FinalFailure {
                request_id,
                reason,
                cancel_reason,
                duration,
                http_status,
            } => {
                let duration_ms = self.resolve_duration_ms(&request_id, duration);
                let update = UpdateOptions {
                    status: Some("failed".to_string()),
                    http_status,
                    end_time: Some(Utc::now()),
                    duration_ms: Some(duration_ms),
                    failure_reason: Some(reason),
                    cancel_reason,
                    ..Default::default()
                };
                self.db.apply_update(&request_id, &update).await?;
                self.start_times.remove(&request_id);
                Ok(())
            }
            TrackerEvent::FailedRequestTokens {
                request_id,
                usage,
                model_name,
            } => {
                let model = model_name.unwrap_or_else(|| "unknown".to_string());
                let cost = self.pricing.cost_for(&model, usage);
                self.db.apply_failed_request_tokens(&request_id, usage, cost).await.map(|_| ())
            }
            TrackerEvent::TokenRecovery {
                request_id,
                usage,
                model_name,
            } => {
                let model = model_name.unwrap_or_else(|| "unknown".to_string());
                let cost = self.pricing.cost_for(&model, usage);
                self.db.apply_token_recovery(&request_id, usage, cost).await
            }
            TrackerEvent::Flush { ack } => {
                let _ = ack.send(());
                Ok(())
            }
        }
    }

    /// Prefers `end_time - start_time` computed from this row's own stored
    /// `start_time` over the caller-supplied `Duration`; falls back to the
    /// supplied value when the start time is unknown to this process, e.g. a
    /// `failed_request_tokens` amendment replayed after a crash-restart
    /// (spec.md §9 Open Question, resolved in DESIGN.md).
    fn resolve_duration_ms(&self, request_id: &str, supplied: Duration) -> i64 {
        match self.start_times.get(request_id) {
            Some(start) => SystemTime::now()
                .duration_since(*start)
                .unwrap_or(supplied)
                .as_millis() as i64,
            None => supplied.as_millis() as i64,
        }
    }
}
