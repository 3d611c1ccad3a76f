//! Embedded-file dialect: SQLite via `sqlx::SqlitePool`. `ON CONFLICT DO
//! UPDATE` for UPSERT, `VACUUM` for maintenance, no native timezone support
//! so every timestamp is spliced in as an explicit ISO-8601 string (spec.md
//! §4.6, §9 Design Notes "Time").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{instrument, warn};

use super::{CostBreakdown, DbAdapter, DbStats, RequestLogRow, UpdateOptions, FAILURE_BACKFILL_STATUSES};
use crate::errors::TrackerError;
use crate::model::TokenUsage;

const SCHEMA: &str = include_str!("schema/sqlite.sql");

pub struct SqliteAdapter {
    pool: SqlitePool,
    path: String,
}

impl SqliteAdapter {
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer discipline (spec.md §4.5 "Write queue")
            .connect(url)
            .await
            .map_err(TrackerError::classify)?;
        let path = url.trim_start_matches("sqlite://").to_string();
        Ok(Self { pool, path })
    }

    fn iso(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339()
    }
}

fn build_set_clause(update: &UpdateOptions) -> (String, Vec<(&'static str, String)>) {
    let mut clauses = Vec::new();
    let mut binds: Vec<(&'static str, String)> = Vec::new();

    macro_rules! push {
        ($col:literal, $val:expr) => {
            if let Some(v) = $val {
                clauses.push(format!("{} = ?", $col));
                binds.push(($col, v.to_string()));
            }
        };
    }

    push!("endpoint_name", update.endpoint_name.clone());
    push!("group_name", update.group_name.clone());
    push!("status", update.status.clone());
    push!("retry_count", update.retry_count);
    push!("http_status_code", update.http_status);
    push!("model_name", update.model_name.clone());
    if let Some(end_time) = update.end_time {
        clauses.push("end_time = ?".to_string());
        binds.push(("end_time", SqliteAdapter::iso(end_time)));
    }
    push!("duration_ms", update.duration_ms);
    push!("failure_reason", update.failure_reason.clone());
    push!("cancel_reason", update.cancel_reason.clone());

    (clauses.join(", "), binds)
}

#[async_trait]
impl DbAdapter for SqliteAdapter {
    #[instrument(skip(self))]
    async fn bootstrap(&self) -> Result<(), TrackerError> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(TrackerError::classify)?;
        }
        Ok(())
    }

    async fn upsert_request_log(&self, row: &RequestLogRow) -> Result<(), TrackerError> {
        let now = Self::iso(Utc::now());
        let start_time = row.start_time.map(Self::iso);
        sqlx::query(
            r#"
            INSERT INTO request_logs
                (request_id, client_ip, user_agent, method, path, is_streaming, status, start_time, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(request_id) DO UPDATE SET
                client_ip = COALESCE(request_logs.client_ip, excluded.client_ip),
                user_agent = COALESCE(request_logs.user_agent, excluded.user_agent),
                method = COALESCE(request_logs.method, excluded.method),
                path = COALESCE(request_logs.path, excluded.path),
                start_time = COALESCE(request_logs.start_time, excluded.start_time),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.request_id)
        .bind(&row.client_ip)
        .bind(&row.user_agent)
        .bind(&row.method)
        .bind(&row.path)
        .bind(row.is_streaming)
        .bind(&row.status)
        .bind(&start_time)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn apply_update(&self, request_id: &str, update: &UpdateOptions) -> Result<(), TrackerError> {
        let (set_clause, binds) = build_set_clause(update);
        if set_clause.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE request_logs SET {set_clause}, updated_at = ? WHERE request_id = ?"
        );
        let mut q = sqlx::query(&sql);
        for (_, v) in &binds {
            q = q.bind(v);
        }
        q = q.bind(Self::iso(Utc::now())).bind(request_id);
        q.execute(&self.pool).await.map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn apply_success(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
        update: &UpdateOptions,
    ) -> Result<(), TrackerError> {
        self.apply_update(request_id, update).await?;
        sqlx::query(
            r#"
            UPDATE request_logs SET
                input_tokens = ?, output_tokens = ?, cache_creation_input_tokens = ?, cache_read_input_tokens = ?,
                input_cost_usd = ?, output_cost_usd = ?, cache_creation_cost_usd = ?, cache_read_cost_usd = ?, total_cost_usd = ?,
                updated_at = ?
            WHERE request_id = ?
            "#,
        )
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(cost.input_cost_usd)
        .bind(cost.output_cost_usd)
        .bind(cost.cache_creation_cost_usd)
        .bind(cost.cache_read_cost_usd)
        .bind(cost.total_cost_usd)
        .bind(Self::iso(Utc::now()))
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn apply_failed_request_tokens(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
    ) -> Result<bool, TrackerError> {
        let placeholders = FAILURE_BACKFILL_STATUSES
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE request_logs SET
                input_tokens = ?, output_tokens = ?, cache_creation_input_tokens = ?, cache_read_input_tokens = ?,
                input_cost_usd = ?, output_cost_usd = ?, cache_creation_cost_usd = ?, cache_read_cost_usd = ?, total_cost_usd = ?,
                updated_at = ?
            WHERE request_id = ? AND status IN ({placeholders})
            "#
        );
        let mut q = sqlx::query(&sql)
            .bind(usage.input_tokens as i64)
            .bind(usage.output_tokens as i64)
            .bind(usage.cache_creation_input_tokens as i64)
            .bind(usage.cache_read_input_tokens as i64)
            .bind(cost.input_cost_usd)
            .bind(cost.output_cost_usd)
            .bind(cost.cache_creation_cost_usd)
            .bind(cost.cache_read_cost_usd)
            .bind(cost.total_cost_usd)
            .bind(Self::iso(Utc::now()))
            .bind(request_id);
        for s in FAILURE_BACKFILL_STATUSES {
            q = q.bind(*s);
        }
        let result = q.execute(&self.pool).await.map_err(TrackerError::classify)?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_token_recovery(
        &self,
        request_id: &str,
        usage: TokenUsage,
        cost: CostBreakdown,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            r#"
            UPDATE request_logs SET
                input_tokens = ?, output_tokens = ?, cache_creation_input_tokens = ?, cache_read_input_tokens = ?,
                input_cost_usd = ?, output_cost_usd = ?, cache_creation_cost_usd = ?, cache_read_cost_usd = ?, total_cost_usd = ?,
                updated_at = ?
            WHERE request_id = ?
            "#,
        )
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(cost.input_cost_usd)
        .bind(cost.output_cost_usd)
        .bind(cost.cache_creation_cost_usd)
        .bind(cost.cache_read_cost_usd)
        .bind(cost.total_cost_usd)
        .bind(Self::iso(Utc::now()))
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError> {
        let result = sqlx::query("DELETE FROM request_logs WHERE start_time < ?")
            .bind(Self::iso(cutoff))
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;
        Ok(result.rows_affected())
    }

    async fn delete_summary_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError> {
        let result = sqlx::query("DELETE FROM usage_summary WHERE day < ?")
            .bind(cutoff.date_naive().to_string())
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;
        Ok(result.rows_affected())
    }

    async fn recompute_usage_summary(&self, since: DateTime<Utc>) -> Result<(), TrackerError> {
        sqlx::query("DELETE FROM usage_summary WHERE day >= ?")
            .bind(since.date_naive().to_string())
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;

        sqlx::query(
            r#"
            INSERT INTO usage_summary
                (day, model_name, endpoint_name, group_name, request_count, input_tokens, output_tokens,
                 cache_creation_input_tokens, cache_read_input_tokens, total_cost_usd, avg_duration_ms)
            SELECT
                substr(start_time, 1, 10) AS day,
                COALESCE(model_name, 'unknown'),
                COALESCE(endpoint_name, 'unknown'),
                COALESCE(group_name, 'unknown'),
                COUNT(*),
                SUM(input_tokens), SUM(output_tokens), SUM(cache_creation_input_tokens), SUM(cache_read_input_tokens),
                SUM(total_cost_usd),
                AVG(duration_ms)
            FROM request_logs
            WHERE start_time >= ?
            GROUP BY day, model_name, endpoint_name, group_name
            "#,
        )
        .bind(Self::iso(since))
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn vacuum_or_optimize(&self) -> Result<(), TrackerError> {
        sqlx::query("VACUUM").execute(&self.pool).await.map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn stats(&self) -> Result<DbStats, TrackerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt, MIN(start_time) as mn, MAX(start_time) as mx, COALESCE(SUM(total_cost_usd), 0) as cost FROM request_logs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(TrackerError::classify)?;

        let row_count: i64 = row.try_get("cnt").unwrap_or(0);
        let earliest: Option<String> = row.try_get("mn").ok();
        let latest: Option<String> = row.try_get("mx").ok();
        let cumulative: f64 = row.try_get("cost").unwrap_or(0.0);

        let size_bytes = tokio::fs::metadata(&self.path).await.ok().map(|m| m.len());

        Ok(DbStats {
            row_count: row_count.max(0) as u64,
            earliest_start_time: earliest.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            latest_start_time: latest.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            size_bytes,
            cumulative_cost_usd: cumulative,
        })
    }

    /// Logical backup via sqlite's own `VACUUM INTO`: a single statement that
    /// writes a complete, compacted copy of every table (and every column —
    /// no hand-rolled per-table `SELECT`/`INSERT` to keep in sync with the
    /// schema) to a fresh file, which is then renamed into place atomically
    /// (spec.md §4.5 "Backup": "copy every row of `request_logs`").
    async fn backup_to(&self, dest_path: &str) -> Result<(), TrackerError> {
        let tmp_path = format!("{dest_path}.tmp");
        if tokio::fs::metadata(&tmp_path).await.is_ok() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(&tmp_path)
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;

        tokio::fs::rename(&tmp_path, dest_path).await.map_err(TrackerError::Io)?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn dialect_name(&self) -> &'static str {
        "sqlite"
    }
}

impl SqliteAdapter {
    /// Renames a corrupted file aside with a timestamp suffix before a
    /// backup restore (spec.md §4.5 "Backup").
    pub async fn quarantine_corrupted(path: &str) -> Result<String, TrackerError> {
        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        let dest = format!("{path}.corrupted.{ts}");
        tokio::fs::rename(path, &dest).await.map_err(TrackerError::Io)?;
        warn!(from = path, to = %dest, "quarantined corrupted database file");
        Ok(dest)
    }
}
