//! Auth, logging and monitoring hooks (spec.md §2 "Middleware", §6 "Front
//! door": "optional bearer-token authorization on all proxied routes; 401 on
//! mismatch"). Kept as plain axum `middleware::from_fn` layers rather than
//! the teacher's setter-wired objects — the cycle the spec calls out (§9
//! Design Notes "Cyclic references") is broken by passing `AppState` once at
//! router construction instead of threading mutable references between
//! middleware and handler.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::state::AppState;

/// Checks `Authorization: Bearer <token>` (or `x-api-key: <token>`) against
/// `server.auth_token` when one is configured; passes through unauthenticated
/// when none is set (spec.md §6: authorization is optional).
pub async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let cfg = state.config.snapshot().await;
    let Some(expected) = cfg.server.auth_token.as_deref().filter(|t| !t.is_empty()) else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| req.headers().get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "rejected request: missing or invalid auth token");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"type":"error","error":{"type":"authentication_error","message":"unauthorized"}}"#))
        .expect("static response is always well-formed")
}

/// Structured per-request log line at request completion, mirroring the
/// teacher's `#[instrument(skip_all, fields(service = ...))]` convention on
/// `handle_proxy`.
pub async fn logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = started.elapsed().as_millis();
    let status = response.status().as_u16();
    if status >= 500 {
        warn!(%method, path, status, elapsed_ms, "request completed with server error");
    } else {
        info!(%method, path, status, elapsed_ms, "request completed");
    }
    response
}
