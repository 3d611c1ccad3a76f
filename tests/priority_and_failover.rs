//! Endpoint selection and group failover (spec.md §8 scenarios 1-2): the
//! lowest-priority healthy endpoint wins, and a failing endpoint's attempts
//! are retried against its sibling before the request is abandoned.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use anthropic_forwarder::config::RetryConfig;
use anthropic_forwarder::model::SelectionStrategy;

use common::{build_harness, endpoint};

async fn row_for(pool: &sqlx::SqlitePool, request_id: &str) -> sqlx::sqlite::SqliteRow {
    sqlx::query("SELECT * FROM request_logs WHERE request_id = ?")
        .bind(request_id)
        .fetch_one(pool)
        .await
        .expect("row must exist")
}

#[tokio::test]
async fn priority_selection_picks_lowest_priority_healthy_endpoint() {
    let mut server_a = mockito::Server::new_async().await;
    let mut server_b = mockito::Server::new_async().await;
    let mock_a = server_a
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"usage":{"input_tokens":1,"output_tokens":1,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#)
        .create_async()
        .await;
    let mock_b = server_b
        .mock("POST", "/v1/messages")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let harness = build_harness(
        vec![
            endpoint("a", &server_a.url(), "g1", 1, 0),
            endpoint("b", &server_b.url(), "g2", 2, 0),
        ],
        SelectionStrategy::Priority,
        RetryConfig::default(),
        Default::default(),
    )
    .await;
    harness.state.endpoints.apply_health_result("a", true, Some(5)).await;
    harness.state.endpoints.apply_health_result("b", true, Some(5)).await;
    assert_eq!(harness.state.endpoints.active_group_name().as_deref(), Some("g1"));

    let router = harness.router();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "claude-3-5-sonnet", "stream": false}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    harness.flush().await;
    mock_a.assert_async().await;
    mock_b.assert_async().await;

    let history = harness.state.metrics_store.history_snapshot();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.endpoint.as_deref(), Some("a"));
    assert_eq!(record.retry_count, 0);

    let pool = harness.db_pool().await;
    let row = row_for(&pool, &record.id).await;
    let status: String = sqlx::Row::try_get(&row, "status").unwrap();
    let endpoint_name: String = sqlx::Row::try_get(&row, "endpoint_name").unwrap();
    assert_eq!(status, "completed");
    assert_eq!(endpoint_name, "a");
}

#[tokio::test]
async fn failover_to_sibling_endpoint_after_upstream_errors() {
    let mut server_a = mockito::Server::new_async().await;
    let mut server_b = mockito::Server::new_async().await;
    let mock_a = server_a
        .mock("POST", "/v1/messages")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let mock_b = server_b
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"usage":{"input_tokens":100,"output_tokens":50,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#)
        .create_async()
        .await;

    // Same group so the retry handler's in-group candidate order tries "a"
    // then "b" without needing to fall back across groups.
    let harness = build_harness(
        vec![
            endpoint("a", &server_a.url(), "g1", 1, 0),
            endpoint("b", &server_b.url(), "g1", 1, 1),
        ],
        SelectionStrategy::Priority,
        RetryConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter_ms: 0,
            ..Default::default()
        },
        Default::default(),
    )
    .await;
    harness.state.endpoints.apply_health_result("a", true, Some(5)).await;
    harness.state.endpoints.apply_health_result("b", true, Some(5)).await;

    let router = harness.router();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "claude-3-5-sonnet", "stream": false}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    harness.flush().await;
    mock_a.assert_async().await;
    mock_b.assert_async().await;

    let history = harness.state.metrics_store.history_snapshot();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.endpoint.as_deref(), Some("b"));
    assert_eq!(record.retry_count, 1);

    let pool = harness.db_pool().await;
    let row = row_for(&pool, &record.id).await;
    let input_tokens: i64 = sqlx::Row::try_get(&row, "input_tokens").unwrap();
    let output_tokens: i64 = sqlx::Row::try_get(&row, "output_tokens").unwrap();
    let total_cost_usd: f64 = sqlx::Row::try_get(&row, "total_cost_usd").unwrap();
    assert_eq!(input_tokens, 100);
    assert_eq!(output_tokens, 50);
    let expected_cost = 100.0 * 3.0 / 1_000_000.0 + 50.0 * 15.0 / 1_000_000.0;
    assert!((total_cost_usd - expected_cost).abs() < 1e-9, "cost {total_cost_usd} vs {expected_cost}");
}

#[tokio::test]
async fn auth_error_from_one_endpoint_fails_over_to_sibling() {
    let mut server_a = mockito::Server::new_async().await;
    let mut server_b = mockito::Server::new_async().await;
    let mock_a = server_a
        .mock("POST", "/v1/messages")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let mock_b = server_b
        .mock("POST", "/v1/messages")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#)
        .create_async()
        .await;

    let harness = build_harness(
        vec![
            endpoint("a", &server_a.url(), "g1", 1, 0),
            endpoint("b", &server_b.url(), "g1", 1, 1),
        ],
        SelectionStrategy::Priority,
        RetryConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter_ms: 0,
            ..Default::default()
        },
        Default::default(),
    )
    .await;
    harness.state.endpoints.apply_health_result("a", true, Some(5)).await;
    harness.state.endpoints.apply_health_result("b", true, Some(5)).await;

    let router = harness.router();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(json!({"model": "claude-3-5-sonnet", "stream": false}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    // A's 401 is retried against its sibling rather than surfaced directly.
    assert_eq!(response.status(), StatusCode::OK);

    harness.flush().await;
    mock_a.assert_async().await;
    mock_b.assert_async().await;

    let history = harness.state.metrics_store.history_snapshot();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.endpoint.as_deref(), Some("b"));
    assert_eq!(record.retry_count, 1);
}
