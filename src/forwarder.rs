//! Retry handler: walks candidates within a group, then falls back across
//! groups, before handing off to suspension (spec.md §4.2, §9 Design Notes
//! "Retry vs suspension": in-group retry, then inter-group fallback, then
//! suspension — three strictly ordered phases, never interleaved).
//!
//! Grounded in the teacher's `proxy/retry.rs` backoff/jitter helpers, kept
//! largely as-is and pointed at the new `RetryConfig` shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::EndpointSelector;
use crate::config::RetryConfig;
use crate::errors::ForwardError;
use crate::model::Endpoint;

/// Caches a `reqwest::Client` per endpoint whose `timeout_ms`/`proxy_url`
/// diverge from the shared default, so per-endpoint transport settings
/// (spec.md §3, §4.2 step 2 "dial via the endpoint's transport") are honored
/// at dial time while endpoints with no overrides keep sharing the default
/// client's connection pool.
pub struct EndpointClientCache {
    base: reqwest::Client,
    custom: RwLock<HashMap<String, reqwest::Client>>,
}

impl EndpointClientCache {
    pub fn new(base: reqwest::Client) -> Self {
        Self {
            base,
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the client to dial `endpoint` with: the shared default unless
    /// the endpoint sets its own `timeout_ms`/`proxy_url`, in which case a
    /// dedicated client is built once and cached by endpoint name.
    pub fn client_for(&self, endpoint: &Endpoint) -> reqwest::Client {
        if endpoint.timeout_ms.is_none() && endpoint.proxy_url.is_none() {
            return self.base.clone();
        }
        if let Some(client) = self.custom.read().get(&endpoint.name) {
            return client.clone();
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout_ms) = endpoint.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(proxy_url) = &endpoint.proxy_url {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => {
                    warn!(endpoint = %endpoint.name, error = %err, "invalid proxy_url, dialing with the default client");
                    return self.base.clone();
                }
            }
        }

        let client = match builder.build() {
            Ok(client) => client,
            Err(err) => {
                warn!(endpoint = %endpoint.name, error = %err, "failed to build per-endpoint client, falling back to default");
                return self.base.clone();
            }
        };
        self.custom.write().insert(endpoint.name.clone(), client.clone());
        client
    }
}

/// Headers the client may have set that must never be forwarded verbatim —
/// either hop-by-hop or about to be replaced with the target endpoint's own
/// auth (spec.md §4.2 "Header rewriting").
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "authorization",
    "x-api-key",
];

pub struct ForwardAttempt {
    pub response: reqwest::Response,
    pub endpoint: Endpoint,
    pub group: String,
    pub retry_count: u32,
}

/// Exhausted every candidate in every group reachable within
/// `max_group_fallback_depth`; the caller (the proxy handler) decides whether
/// to suspend or fail outright.
pub struct ForwardExhausted {
    pub last_error: ForwardError,
    pub retry_count: u32,
}

pub struct RetryHandler {
    selector: Arc<dyn EndpointSelector>,
    clients: Arc<EndpointClientCache>,
    cfg: RetryConfig,
}

impl RetryHandler {
    pub fn new(selector: Arc<dyn EndpointSelector>, clients: Arc<EndpointClientCache>, cfg: RetryConfig) -> Self {
        Self { selector, clients, cfg }
    }

    /// Attempts the request against the active group's candidates, then
    /// against up to `max_group_fallback_depth` subsequent groups. Returns
    /// the first response whose status is not itself classified retryable,
    /// or `ForwardExhausted` once nothing is left to try.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardAttempt, ForwardExhausted> {
        let mut retry_count = 0u32;
        let mut last_error = ForwardError::NoEndpointsAvailable;

        let first = self.selector.candidates().await;
        if first.is_empty() {
            return Err(ForwardExhausted {
                last_error: ForwardError::NoEndpointsAvailable,
                retry_count,
            });
        }

        let mut group_depth = 0u32;
        let mut current_group_candidates = first;
        let mut current_group_name: Option<String> = None;

        loop {
            for endpoint in &current_group_candidates {
                if retry_count >= self.cfg.max_attempts {
                    break;
                }
                let attempt_index = retry_count;

                let url = format!("{}{}", endpoint.url.trim_end_matches('/'), path_and_query);
                let req_headers = build_forward_headers(headers, endpoint);
                let body_too_large = body.len() > self.cfg.max_buffered_body_bytes;

                let started = Instant::now();
                let send_result = self
                    .clients
                    .client_for(endpoint)
                    .request(method.clone(), &url)
                    .headers(req_headers)
                    .body(body.clone())
                    .send()
                    .await;

                match send_result {
                    Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
                        let status = resp.status().as_u16();
                        self.selector.record_failure(&endpoint.name).await;
                        last_error = ForwardError::Auth { status };
                        debug!(endpoint = %endpoint.name, status, "auth error, trying next candidate");
                    }
                    Ok(resp) if !is_retryable_status(resp.status().as_u16()) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        self.selector.record_success(&endpoint.name, latency_ms).await;
                        return Ok(ForwardAttempt {
                            response: resp,
                            endpoint: endpoint.clone(),
                            group: current_group_name.clone().unwrap_or_default(),
                            retry_count,
                        });
                    }
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        self.selector.record_failure(&endpoint.name).await;
                        last_error = ForwardError::Upstream {
                            status,
                            body: String::new(),
                        };
                        debug!(endpoint = %endpoint.name, status, "upstream attempt failed, will retry");
                    }
                    Err(err) if err.is_timeout() => {
                        self.selector.record_failure(&endpoint.name).await;
                        last_error = ForwardError::Timeout;
                        warn!(endpoint = %endpoint.name, "upstream timed out");
                    }
                    Err(err) => {
                        self.selector.record_failure(&endpoint.name).await;
                        last_error = ForwardError::Network(err.to_string());
                        warn!(endpoint = %endpoint.name, error = %err, "upstream network error");
                    }
                }
                retry_count += 1;

                if body_too_large {
                    // Cannot safely replay a buffered body this large again;
                    // stop trying further candidates for this request.
                    return Err(ForwardExhausted { last_error, retry_count });
                }
                if retry_count < self.cfg.max_attempts {
                    backoff_sleep(&self.cfg, attempt_index).await;
                }
            }

            if retry_count >= self.cfg.max_attempts && group_depth >= self.cfg.max_group_fallback_depth {
                break;
            }
            if group_depth >= self.cfg.max_group_fallback_depth {
                break;
            }

            match self.selector.next_group_candidates().await {
                Some((name, candidates)) if !candidates.is_empty() => {
                    group_depth += 1;
                    current_group_name = Some(name);
                    current_group_candidates = candidates;
                    retry_count = 0;
                }
                _ => break,
            }
        }

        Err(ForwardExhausted { last_error, retry_count })
    }
}

fn build_forward_headers(original: &HeaderMap, endpoint: &Endpoint) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in original.iter() {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }

    if let Some(token) = endpoint.auth.resolve_token() {
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
            out.insert(HeaderName::from_static("authorization"), v.clone());
        }
        if let Ok(v) = HeaderValue::from_str(&token) {
            out.insert(HeaderName::from_static("x-api-key"), v);
        }
    }
    for (k, v) in &endpoint.auth.extra_headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            out.insert(name, value);
        }
    }
    out
}

/// Statuses worth trying a different endpoint for (spec.md §7): anything the
/// upstream itself flags as transient, or a hard server failure. 401/403 are
/// classified separately as `ForwardError::Auth` before this is consulted
/// (per-endpoint credentials can be stale without the request itself being
/// malformed); other 4xx is presumed request-shaped and not retried.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Classifies an Anthropic-style JSON error body
/// (`{"type":"error","error":{"type":...}}`) as request-shaped rather than
/// transient, so the caller can skip further retries even on a nominally
/// retryable status.
pub fn is_non_retryable_error_body(body: &[u8]) -> bool {
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    let Some(err) = v.get("error") else {
        return false;
    };
    let Some(t) = err.get("type").and_then(|t| t.as_str()) else {
        return false;
    };
    matches!(
        t,
        "invalid_request_error" | "authentication_error" | "permission_error" | "not_found_error"
    )
}

async fn backoff_sleep(cfg: &RetryConfig, attempt_index: u32) {
    if cfg.base_backoff_ms == 0 {
        return;
    }
    let pow = 1u64 << attempt_index.min(20);
    let base = cfg.base_backoff_ms.saturating_mul(pow);
    let capped = base.min(cfg.max_backoff_ms.max(cfg.base_backoff_ms));
    let jitter = if cfg.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=cfg.jitter_ms)
    };
    tokio::time::sleep(Duration::from_millis(capped.saturating_add(jitter))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_are_429_and_5xx() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn non_retryable_body_detects_invalid_request() {
        let body = br#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#;
        assert!(is_non_retryable_error_body(body));
    }

    #[test]
    fn non_retryable_body_ignores_overloaded_error() {
        let body = br#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#;
        assert!(!is_non_retryable_error_body(body));
    }
}
