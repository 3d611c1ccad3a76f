//! Periodic retention cleanup and logical backup (spec.md §4.5 "Retention &
//! summary", "Backup"). Each runs as its own independent task (spec.md §5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument};

use crate::db::DbAdapter;

#[instrument(skip(db))]
pub async fn run_cleanup_once(db: &dyn DbAdapter, retention_days: u32) {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    match db.delete_older_than(cutoff).await {
        Ok(deleted) => {
            info!(deleted, "deleted request_logs rows past retention window");
            let _ = db.delete_summary_older_than(cutoff).await;
            let since = Utc::now() - chrono::Duration::days(7);
            if let Err(err) = db.recompute_usage_summary(since).await {
                error!(error = %err, "failed to recompute usage_summary");
            }
            if deleted > 0 {
                if let Err(err) = db.vacuum_or_optimize().await {
                    error!(error = %err, "failed to vacuum/optimize after cleanup");
                }
            }
        }
        Err(err) => error!(error = %err, "retention cleanup delete failed"),
    }
}

pub async fn run_cleanup_task(db: Arc<dyn DbAdapter>, interval: Duration, retention_days: u32) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        run_cleanup_once(db.as_ref(), retention_days).await;
    }
}

#[instrument(skip(db))]
pub async fn run_backup_once(db: &dyn DbAdapter, backup_path: &str) {
    if let Err(err) = db.backup_to(backup_path).await {
        error!(error = %err, "usage tracker backup failed");
    } else {
        info!(path = backup_path, "usage tracker backup completed");
    }
}

pub async fn run_backup_task(db: Arc<dyn DbAdapter>, interval: Duration, backup_path: String) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        run_backup_once(db.as_ref(), &backup_path).await;
    }
}
