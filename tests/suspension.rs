//! Request suspension (spec.md §8 scenarios 3-4): a request with no healthy
//! endpoint is held rather than failed immediately, and either times out or
//! resumes once a group becomes available again.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use anthropic_forwarder::config::{RetryConfig, SuspensionConfig};
use anthropic_forwarder::model::SelectionStrategy;

use common::{build_harness, endpoint};

#[tokio::test]
async fn suspend_then_timeout_fails_with_504() {
    let server = mockito::Server::new_async().await;

    let harness = build_harness(
        vec![endpoint("a", &server.url(), "g1", 1, 0)],
        SelectionStrategy::Priority,
        RetryConfig::default(),
        SuspensionConfig {
            enabled: true,
            max_suspended_requests: 10,
            timeout_ms: 200,
        },
    )
    .await;
    // Never marked healthy: no group becomes active, so the first forward
    // attempt is exhausted immediately and the request suspends.

    let router = harness.router();
    let started = std::time::Instant::now();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "claude-3-5-sonnet", "stream": false}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(elapsed >= Duration::from_millis(180), "elapsed {elapsed:?} should be roughly the 200ms suspend timeout");

    harness.flush().await;
    let history = harness.state.metrics_store.history_snapshot();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert!(record.suspended_time_ms.unwrap_or(0) >= 150);

    let pool = harness.db_pool().await;
    let row: sqlx::sqlite::SqliteRow = sqlx::query("SELECT * FROM request_logs WHERE request_id = ?")
        .bind(&record.id)
        .fetch_one(&pool)
        .await
        .expect("row must exist");
    let status: String = sqlx::Row::try_get(&row, "status").unwrap();
    let failure_reason: Option<String> = sqlx::Row::try_get(&row, "failure_reason").unwrap();
    let cancel_reason: Option<String> = sqlx::Row::try_get(&row, "cancel_reason").unwrap();
    assert_eq!(status, "failed");
    assert_eq!(failure_reason.as_deref(), Some("suspend_timeout"));
    assert_eq!(cancel_reason.as_deref(), Some("suspend_timeout"));
}

#[tokio::test]
async fn suspend_then_resume_when_endpoint_becomes_healthy() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"usage":{"input_tokens":5,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#)
        .create_async()
        .await;

    let harness = build_harness(
        vec![endpoint("a", &server.url(), "g1", 1, 0)],
        SelectionStrategy::Priority,
        RetryConfig::default(),
        SuspensionConfig {
            enabled: true,
            max_suspended_requests: 10,
            timeout_ms: 5_000,
        },
    )
    .await;

    let manager = std::sync::Arc::clone(&harness.state.endpoints);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.apply_health_result("a", true, Some(5)).await;
    });

    let router = harness.router();
    let started = std::time::Instant::now();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "claude-3-5-sonnet", "stream": false}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(elapsed < Duration::from_secs(2), "resumption should not wait for the full suspend timeout");

    harness.flush().await;
    mock.assert_async().await;

    let history = harness.state.metrics_store.history_snapshot();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    let suspended_ms = record.suspended_time_ms.expect("suspended_time_ms recorded");
    assert!((40..=1_000).contains(&suspended_ms), "suspended_time_ms={suspended_ms}");

    let pool = harness.db_pool().await;
    let row: sqlx::sqlite::SqliteRow = sqlx::query("SELECT * FROM request_logs WHERE request_id = ?")
        .bind(&record.id)
        .fetch_one(&pool)
        .await
        .expect("row must exist");
    let status: String = sqlx::Row::try_get(&row, "status").unwrap();
    assert_eq!(status, "completed");
}
