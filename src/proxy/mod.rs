//! HTTP front door: request parse, dispatch through the retry handler and
//! suspension protocol, streaming relay, lifecycle recording (spec.md §4.2,
//! §4.3, §4.4, §6). Router construction follows the teacher's `ProxyService`
//! shape (`src/proxy/mod.rs`): one `Router` built from `AppState`, proxied
//! routes behind the auth/logging middleware stack, `/health*` and `/metrics`
//! exempt.

pub mod stream;

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::capability::{EndpointSelector, RequestRecorder};
use crate::errors::ForwardError;
use crate::forwarder::RetryHandler;
use crate::model::{new_connection_id, ConnectionStatus};
use crate::observability::sse_handler;
use crate::state::{AppState, ConnectionRecord};
use crate::suspension::{wait_for_resumption, SuspendOutcome};
use stream::{parse_usage_from_json_body, RelayStream};

/// Response and request headers that must never be copied verbatim across
/// the proxy boundary (standard hop-by-hop set plus framing headers the HTTP
/// library recomputes itself).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub fn router(state: Arc<AppState>) -> Router {
    let proxied = Router::new()
        .route("/{*path}", any(handle_proxy))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), crate::middleware::auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(health_detailed_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", get(sse_handler))
        .route("/admin/groups/{name}/activate", post(activate_group_handler))
        .route("/admin/groups/{name}/pause", post(pause_group_handler))
        .route("/admin/groups/{name}/resume", post(resume_group_handler))
        .merge(proxied)
        .layer(axum::middleware::from_fn(crate::middleware::logging_middleware))
        .with_state(state)
}

#[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
async fn handle_proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let connection_id = new_connection_id();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (parts, body) = req.into_parts();
    let headers = parts.headers.clone();

    let cfg = state.config.snapshot().await;
    let body_bytes = match to_bytes(body, cfg.retry.max_buffered_body_bytes.max(1) * 4).await {
        Ok(b) => b,
        Err(err) => {
            warn!(error = %err, "failed to buffer request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let is_streaming = serde_json::from_slice::<Value>(&body_bytes)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false);
    let model_name = serde_json::from_slice::<Value>(&body_bytes)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string));

    let start_time = SystemTime::now();
    state
        .usage
        .record_start(
            &connection_id,
            client_ip.clone(),
            user_agent.clone(),
            method.as_str(),
            &path_and_query,
            is_streaming,
            start_time,
        )
        .await;
    state.metrics_store.begin(ConnectionRecord::new(
        connection_id.clone(),
        client_ip,
        user_agent,
        method.as_str().to_string(),
        path_and_query.clone(),
        is_streaming,
    ));

    let retry_handler = RetryHandler::new(
        Arc::clone(&state.endpoints) as Arc<dyn EndpointSelector>,
        Arc::clone(&state.endpoint_clients),
        cfg.retry.clone(),
    );

    let response = run_forward_with_suspension(
        &state,
        &retry_handler,
        &connection_id,
        method,
        &path_and_query,
        &headers,
        body_bytes,
        model_name,
        start_time,
        cfg.suspension.enabled,
    )
    .await;

    let elapsed_ms = SystemTime::now().duration_since(start_time).unwrap_or_default().as_millis() as u64;
    state.metrics_store.finish(&connection_id, Some(elapsed_ms));

    response
}

#[allow(clippy::too_many_arguments)]
async fn run_forward_with_suspension(
    state: &Arc<AppState>,
    retry_handler: &RetryHandler,
    connection_id: &str,
    method: axum::http::Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body_bytes: bytes::Bytes,
    model_name: Option<String>,
    start_time: SystemTime,
    suspension_enabled: bool,
) -> Response {
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST);
    let reqwest_headers = to_reqwest_headers(headers);

    let mut attempt_result = retry_handler
        .forward(reqwest_method.clone(), path_and_query, &reqwest_headers, body_bytes.clone())
        .await;

    loop {
        match attempt_result {
            Ok(attempt) => {
                state
                    .usage
                    .record_endpoint_selected(connection_id, &attempt.endpoint.name, &attempt.group, attempt.retry_count)
                    .await;
                state.metrics_store.update(connection_id, |record| {
                    record.endpoint = Some(attempt.endpoint.name.clone());
                    record.group = Some(attempt.group.clone());
                    record.retry_count = attempt.retry_count;
                });
                return relay_response(state, connection_id, model_name, start_time, attempt.response).await;
            }
            Err(exhausted) => {
                let can_suspend = suspension_enabled;
                if !can_suspend {
                    return fail_and_respond(state, connection_id, start_time, exhausted.last_error, exhausted.retry_count).await;
                }

                let Some(_permit) = state.suspension_gate.try_acquire() else {
                    return fail_and_respond(state, connection_id, start_time, exhausted.last_error, exhausted.retry_count).await;
                };

                let suspended_at = SystemTime::now();
                state.metrics_store.update(connection_id, |record| {
                    record.status = ConnectionStatus::Suspended;
                    record.is_suspended = true;
                    record.suspended_at = Some(suspended_at);
                });

                let group_changes = state.endpoints.subscribe_group_changes();
                let cfg = state.config.snapshot().await;
                // No socket-level disconnect hook is wired into this minimal
                // front door, so client cancellation never fires here; the
                // timeout and resumption arms still race normally. See
                // DESIGN.md for the limitation.
                let never_cancelled = CancellationToken::new();
                let selector: Arc<dyn EndpointSelector> = Arc::clone(&state.endpoints) as Arc<dyn EndpointSelector>;
                let outcome = wait_for_resumption(&selector, group_changes, &cfg.suspension, &never_cancelled).await;

                match outcome {
                    SuspendOutcome::Resumed { suspended_for, .. } => {
                        state.metrics_store.update(connection_id, |record| {
                            record.status = ConnectionStatus::Resumed;
                            record.is_suspended = false;
                            record.resumed_at = Some(SystemTime::now());
                            record.suspended_time_ms = Some(suspended_for.as_millis() as u64);
                        });
                        attempt_result = retry_handler
                            .forward(reqwest_method.clone(), path_and_query, &reqwest_headers, body_bytes.clone())
                            .await;
                        continue;
                    }
                    SuspendOutcome::TimedOut { suspended_for } => {
                        state.metrics_store.update(connection_id, |record| {
                            record.status = ConnectionStatus::Timeout;
                            record.is_suspended = false;
                            record.suspended_time_ms = Some(suspended_for.as_millis() as u64);
                        });
                        state
                            .usage
                            .record_final_failure(
                                connection_id,
                                "suspend_timeout",
                                Some("suspend_timeout".to_string()),
                                SystemTime::now().duration_since(start_time).unwrap_or_default(),
                                Some(504),
                            )
                            .await;
                        return error_response(
                            StatusCode::GATEWAY_TIMEOUT,
                            "suspend_timeout",
                            "no endpoint became available before the suspension timeout elapsed",
                        );
                    }
                    SuspendOutcome::Cancelled { .. } => {
                        state.metrics_store.update(connection_id, |record| {
                            record.status = ConnectionStatus::Cancelled;
                            record.is_suspended = false;
                        });
                        state
                            .usage
                            .record_final_failure(
                                connection_id,
                                "client_disconnected",
                                Some("client_disconnected".to_string()),
                                SystemTime::now().duration_since(start_time).unwrap_or_default(),
                                None,
                            )
                            .await;
                        return StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST).into_response();
                    }
                }
            }
        }
    }
}

async fn fail_and_respond(
    state: &Arc<AppState>,
    connection_id: &str,
    start_time: SystemTime,
    last_error: ForwardError,
    retry_count: u32,
) -> Response {
    state.metrics_store.update(connection_id, |record| {
        record.status = ConnectionStatus::Failed;
        record.retry_count = retry_count;
    });
    state
        .usage
        .record_final_failure(
            connection_id,
            last_error.as_token(),
            None,
            SystemTime::now().duration_since(start_time).unwrap_or_default(),
            Some(last_error.http_status()),
        )
        .await;
    error_response(
        StatusCode::from_u16(last_error.http_status()).unwrap_or(StatusCode::BAD_GATEWAY),
        last_error.as_token(),
        &last_error.to_string(),
    )
}

async fn relay_response(
    state: &Arc<AppState>,
    connection_id: &str,
    model_name: Option<String>,
    start_time: SystemTime,
    upstream: reqwest::Response,
) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let is_event_stream = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    let response_headers = to_axum_headers(upstream.headers());

    if is_event_stream {
        let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel();
        let relay = RelayStream::new(upstream, outcome_tx);

        let state = Arc::clone(state);
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            if let Ok(outcome) = outcome_rx.await {
                state.metrics_store.update(&connection_id, |record| {
                    record.bytes_sent = outcome.bytes_sent;
                    record.token_usage = outcome.usage;
                    record.status = if outcome.mid_stream_error {
                        ConnectionStatus::Failed
                    } else {
                        ConnectionStatus::Completed
                    };
                });
                let duration = SystemTime::now().duration_since(start_time).unwrap_or_default();
                if outcome.mid_stream_error {
                    state
                        .usage
                        .record_final_failure(&connection_id, "stream_error", None, duration, Some(200))
                        .await;
                } else {
                    state
                        .usage
                        .record_success(&connection_id, outcome.usage, model_name, duration, 200)
                        .await;
                }
            }
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }
        return builder
            .body(Body::from_stream(relay))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let body_bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(err) => {
            error!(error = %err, "failed to read non-streaming upstream body");
            state
                .usage
                .record_final_failure(
                    connection_id,
                    "stream_error",
                    None,
                    SystemTime::now().duration_since(start_time).unwrap_or_default(),
                    Some(status.as_u16()),
                )
                .await;
            return error_response(StatusCode::BAD_GATEWAY, "stream_error", "upstream body read failed");
        }
    };
    let usage = parse_usage_from_json_body(&body_bytes);
    state.metrics_store.update(connection_id, |record| {
        record.bytes_sent = body_bytes.len() as u64;
        record.token_usage = usage;
        record.status = ConnectionStatus::Completed;
    });
    let duration = SystemTime::now().duration_since(start_time).unwrap_or_default();
    state.usage.record_success(connection_id, usage, model_name, duration, status.as_u16()).await;

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body_bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (status, Json(json!({"type": "error", "error": {"type": error_type, "message": message}}))).into_response()
}

fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) || name.as_str() == "host" {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(n, v);
        }
    }
    out
}

fn to_axum_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(n, v);
        }
    }
    out
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.endpoints.all_endpoints();
    let total = snapshot.len();
    let healthy = snapshot.iter().filter(|(_, rt)| !rt.never_checked && rt.healthy).count();
    let status = if total == 0 || healthy == 0 {
        "unhealthy"
    } else if healthy < total {
        "degraded"
    } else {
        "healthy"
    };
    Json(json!({"status": status, "healthy_endpoints": healthy, "total_endpoints": total}))
}

async fn health_detailed_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.endpoints.all_endpoints();
    let endpoints: Vec<Value> = snapshot
        .into_iter()
        .map(|(endpoint, runtime)| {
            json!({
                "name": endpoint.name,
                "url": endpoint.url,
                "group": endpoint.group,
                "priority": endpoint.priority,
                "healthy": !runtime.never_checked && runtime.healthy,
                "never_checked": runtime.never_checked,
                "response_time_ms": runtime.response_time_ms,
                "consecutive_failures": runtime.consecutive_failures,
            })
        })
        .collect();
    Json(json!({"endpoints": endpoints}))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Ok(metrics) = crate::metrics::Metrics::new() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to initialize metrics registry").into_response();
    };
    let text = metrics.render(&state.endpoints);
    ([("content-type", "text/plain; version=0.0.4")], text).into_response()
}

#[derive(Debug, Deserialize)]
struct ActivateQuery {
    #[serde(default)]
    force: bool,
}

async fn activate_group_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ActivateQuery>,
) -> impl IntoResponse {
    let ok = state.endpoints.activate_group(&name, query.force).await;
    if ok {
        info!(group = %name, force = query.force, "group manually activated via admin endpoint");
        (StatusCode::OK, Json(json!({"activated": name})))
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({"error": "unknown group, or no healthy member and force was not set"})),
        )
    }
}

async fn pause_group_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    state.endpoints.pause_group(&name, None).await;
    (StatusCode::OK, Json(json!({"paused": name})))
}

async fn resume_group_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> impl IntoResponse {
    state.endpoints.resume_group(&name).await;
    (StatusCode::OK, Json(json!({"resumed": name})))
}
