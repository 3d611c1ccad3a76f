//! Uniform interface over two SQL dialects: an embedded file (sqlite) and a
//! networked server (mysql) (spec.md §4.6). Each implementor supplies its
//! own UPSERT syntax, `now()` literal, and maintenance command; the write
//! queue (`usage::writer`) depends only on `DbAdapter`.
//!
//! Grounded in `sqlx` directly rather than an ORM: `other_examples/manifests`
//! (`smoelius-litellm-rs`, `AptS-1547-shortlinker`) both reach for a
//! `sqlx`-backed crate for exactly this two-dialect persistence need, but
//! this adapter needs dialect-specific UPSERT/COALESCE control an ORM would
//! fight, so it drops straight to `sqlx::query` (SPEC_FULL.md §2).

pub mod mysql;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::TrackerError;
use crate::model::TokenUsage;

/// One row of `request_logs`. Mirrors spec.md §3 "Persisted request log".
#[derive(Debug, Clone, Default)]
pub struct RequestLogRow {
    pub request_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub is_streaming: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

/// Partial field set for `flexible_update` (spec.md §4.5). `None` means "do
/// not touch this column" — the dynamic `SET` clause only lists non-null
/// fields.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub endpoint_name: Option<String>,
    pub group_name: Option<String>,
    pub status: Option<String>,
    pub retry_count: Option<u32>,
    pub http_status: Option<u16>,
    pub model_name: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub failure_reason: Option<String>,
    pub cancel_reason: Option<String>,
}

/// Per-bucket USD cost, computed by `usage::cost` from a `TokenUsage` and a
/// pricing entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostBreakdown {
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cache_creation_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub total_cost_usd: f64,
}

/// Statuses a row may carry when `failed_request_tokens` is allowed to amend
/// its token counters (spec.md §4.5 "Failure → token backfill").
pub const FAILURE_BACKFILL_STATUSES: &[&str] = &[
    "error",
    "timeout",
    "suspended",
    "cancelled",
    "network_error",
    "auth_error",
    "rate_limited",
    "stream_error",
];

#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub row_count: u64,
    pub earliest_start_time: Option<DateTime<Utc>>,
    pub latest_start_time: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    pub cumulative_cost_usd: f64,
}

#[async_trait]
pub trait DbAdapter: Send + Sync {
    async fn bootstrap(&self) -> Result<(), TrackerError>;

    /// Insert-or-update keyed on `request_id`; `start_time` and other
    /// already-set identity fields are preserved via `COALESCE` on conflict
    /// (spec.md §4.5 UPSERT semantics).
    async fn upsert_request_log(&self, row: &RequestLogRow) -> Result<(), TrackerError>;

    async fn apply_update(&self, request_id: &str, update: &UpdateOptions) -> Result<(), TrackerError>;

    async fn apply_success(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
        update: &UpdateOptions,
    ) -> Result<(), TrackerError>;

    /// Only amends a row whose current `status` is in
    /// `FAILURE_BACKFILL_STATUSES` (spec.md §4.5).
    async fn apply_failed_request_tokens(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
    ) -> Result<bool, TrackerError>;

    /// Amends token counters only, regardless of status.
    async fn apply_token_recovery(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
    ) -> Result<(), TrackerError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError>;

    async fn recompute_usage_summary(&self, since: DateTime<Utc>) -> Result<(), TrackerError>;

    async fn delete_summary_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError>;

    /// Embedded dialect: `VACUUM`. Server dialect: `OPTIMIZE TABLE` per
    /// known table (spec.md §4.6).
    async fn vacuum_or_optimize(&self) -> Result<(), TrackerError>;

    async fn stats(&self) -> Result<DbStats, TrackerError>;

    /// Logical backup: copy every `request_logs` row into a fresh,
    /// same-schema sidecar, then atomically replace the prior backup
    /// (spec.md §4.5 "Backup").
    async fn backup_to(&self, dest_path: &str) -> Result<(), TrackerError>;

    async fn health_check(&self) -> bool;

    fn dialect_name(&self) -> &'static str;
}
