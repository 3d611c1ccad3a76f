//! Networked-server dialect: MySQL via `sqlx::MySqlPool`. `ON DUPLICATE KEY
//! UPDATE` for UPSERT, `OPTIMIZE TABLE` per known table for maintenance
//! (spec.md §4.6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use tracing::instrument;

use super::{CostBreakdown, DbAdapter, DbStats, RequestLogRow, UpdateOptions, FAILURE_BACKFILL_STATUSES};
use crate::errors::TrackerError;
use crate::model::TokenUsage;

const SCHEMA: &str = include_str!("schema/mysql.sql");
const KNOWN_TABLES: &[&str] = &["request_logs", "usage_summary"];

pub struct MySqlAdapter {
    pool: MySqlPool,
}

impl MySqlAdapter {
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1) // single-writer discipline (spec.md §4.5)
            .connect(url)
            .await
            .map_err(TrackerError::classify)?;
        Ok(Self { pool })
    }

    fn naive(ts: DateTime<Utc>) -> chrono::NaiveDateTime {
        ts.naive_utc()
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
        binds.push(("end_time", MySqlAdapter::naive(end_time).to_string()));
    }
    push!("duration_ms", update.duration_ms);
    push!("failure_reason", update.failure_reason.clone());
    push!("cancel_reason", update.cancel_reason.clone());

    (clauses.join(", "), binds)
}

#[async_trait]
impl DbAdapter for MySqlAdapter {
    #[instrument(skip(self))]
    async fn bootstrap(&self) -> Result<(), TrackerError> {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(TrackerError::classify)?;
        }
        Ok(())
    }

    async fn upsert_request_log(&self, row: &RequestLogRow) -> Result<(), TrackerError> {
        let start_time = row.start_time.map(Self::naive);
        sqlx::query(
            r#"
            INSERT INTO request_logs
                (request_id, client_ip, user_agent, method, path, is_streaming, status, start_time, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NOW(6), NOW(6))
            ON DUPLICATE KEY UPDATE
                client_ip = COALESCE(client_ip, VALUES(client_ip)),
                user_agent = COALESCE(user_agent, VALUES(user_agent)),
                method = COALESCE(method, VALUES(method)),
                path = COALESCE(path, VALUES(path)),
                start_time = COALESCE(start_time, VALUES(start_time)),
                updated_at = NOW(6)
            "#,
        )
        .bind(&row.request_id)
        .bind(&row.client_ip)
        .bind(&row.user_agent)
        .bind(&row.method)
        .bind(&row.path)
        .bind(row.is_streaming)
        .bind(&row.status)
        .bind(start_time)
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
        let sql = format!("UPDATE request_logs SET {set_clause}, updated_at = NOW(6) WHERE request_id = ?");
        let mut q = sqlx::query(&sql);
        for (_, v) in &binds {
            q = q.bind(v);
        }
        q = q.bind(request_id);
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
                updated_at = NOW(6)
            WHERE request_id = ?
            "#,
        )
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cache_creation_input_tokens)
        .bind(usage.cache_read_input_tokens)
        .bind(cost.input_cost_usd)
        .bind(cost.output_cost_usd)
        .bind(cost.cache_creation_cost_usd)
        .bind(cost.cache_read_cost_usd)
        .bind(cost.total_cost_usd)
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
                updated_at = NOW(6)
            WHERE request_id = ? AND status IN ({placeholders})
            "#
        );
        let mut q = sqlx::query(&sql)
            .bind(usage.input_tokens)
            .bind(usage.output_tokens)
            .bind(usage.cache_creation_input_tokens)
            .bind(usage.cache_read_input_tokens)
            .bind(cost.input_cost_usd)
            .bind(cost.output_cost_usd)
            .bind(cost.cache_creation_cost_usd)
            .bind(cost.cache_read_cost_usd)
            .bind(cost.total_cost_usd)
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
                updated_at = NOW(6)
            WHERE request_id = ?
            "#,
        )
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.cache_creation_input_tokens)
        .bind(usage.cache_read_input_tokens)
        .bind(cost.input_cost_usd)
        .bind(cost.output_cost_usd)
        .bind(cost.cache_creation_cost_usd)
        .bind(cost.cache_read_cost_usd)
        .bind(cost.total_cost_usd)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError> {
        let result = sqlx::query("DELETE FROM request_logs WHERE start_time < ?")
            .bind(Self::naive(cutoff))
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;
        Ok(result.rows_affected())
    }

    async fn delete_summary_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, TrackerError> {
        let result = sqlx::query("DELETE FROM usage_summary WHERE day < ?")
            .bind(cutoff.date_naive())
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;
        Ok(result.rows_affected())
    }

    async fn recompute_usage_summary(&self, since: DateTime<Utc>) -> Result<(), TrackerError> {
        sqlx::query("DELETE FROM usage_summary WHERE day >= ?")
            .bind(since.date_naive())
            .execute(&self.pool)
            .await
            .map_err(TrackerError::classify)?;

        sqlx::query(
            r#"
            INSERT INTO usage_summary
                (day, model_name, endpoint_name, group_name, request_count, input_tokens, output_tokens,
                 cache_creation_input_tokens, cache_read_input_tokens, total_cost_usd, avg_duration_ms)
            SELECT
                DATE(start_time) AS day,
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
        .bind(Self::naive(since))
        .execute(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        Ok(())
    }

    async fn vacuum_or_optimize(&self) -> Result<(), TrackerError> {
        for table in KNOWN_TABLES {
            sqlx::query(&format!("OPTIMIZE TABLE {table}"))
                .execute(&self.pool)
                .await
                .map_err(TrackerError::classify)?;
        }
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
        let earliest: Option<chrono::NaiveDateTime> = row.try_get("mn").ok();
        let latest: Option<chrono::NaiveDateTime> = row.try_get("mx").ok();
        let cumulative: f64 = row.try_get("cost").unwrap_or(0.0);

        let size_row = sqlx::query(
            "SELECT SUM(data_length + index_length) as size_bytes FROM information_schema.tables WHERE table_schema = DATABASE()",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(TrackerError::classify)?;
        let size_bytes = size_row.and_then(|r| r.try_get::<Option<i64>, _>("size_bytes").ok().flatten()).map(|v| v as u64);

        Ok(DbStats {
            row_count: row_count.max(0) as u64,
            earliest_start_time: earliest.map(|d| DateTime::from_naive_utc_and_offset(d, Utc)),
            latest_start_time: latest.map(|d| DateTime::from_naive_utc_and_offset(d, Utc)),
            size_bytes,
            cumulative_cost_usd: cumulative,
        })
    }

    async fn backup_to(&self, _dest_path: &str) -> Result<(), TrackerError> {
        // The server dialect is expected to rely on its own operator-managed
        // backup tooling (mysqldump / managed snapshots); this adapter only
        // implements the embedded-file logical backup spec.md §4.5 describes.
        Err(TrackerError::Query(
            "logical backup is only implemented for the embedded (sqlite) dialect".to_string(),
        ))
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    fn dialect_name(&self) -> &'static str {
        "mysql"
    }
}
