//! Periodic parallel health probing (spec.md §4.1 "Health check"). Adapted
//! from the teacher's `crates/core/src/healthcheck.rs`: `FuturesUnordered`
//! fan-out over all endpoints with a global concurrency cap, no probe
//! blocking another and none blocking request traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;
use crate::endpoint::manager::EndpointManager;
use crate::model::Endpoint;

const MAX_CONCURRENT_PROBES: usize = 32;

fn health_check_url(base_url: &str, path: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(base_url)?;
    let trimmed = path.trim_start_matches('/');
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url.join(trimmed)?)
}

struct ProbeResult {
    name: String,
    healthy: bool,
    latency_ms: Option<u64>,
}

/// Builds the client to probe `endpoint` with: the shared sweep client, a
/// `timeout_ms`-sized one matching it, unless the endpoint names its own
/// `proxy_url`, in which case a one-off client routes through it (spec.md
/// §4.1: a proxied endpoint's health check must go through the same proxy
/// its requests do).
fn probe_client(shared: &reqwest::Client, endpoint: &Endpoint, timeout: Duration) -> reqwest::Client {
    let Some(proxy_url) = &endpoint.proxy_url else {
        return shared.clone();
    };
    let builder = reqwest::Client::builder().timeout(timeout).connect_timeout(timeout);
    match reqwest::Proxy::all(proxy_url).and_then(|proxy| builder.proxy(proxy).build()) {
        Ok(client) => client,
        Err(err) => {
            warn!(endpoint = %endpoint.name, error = %err, "invalid proxy_url, probing without it");
            shared.clone()
        }
    }
}

/// A single GET against `cfg.path`; healthy iff it completes within
/// `cfg.timeout_ms` and the status is below 500 (spec.md §4.1).
async fn probe_one(client: reqwest::Client, endpoint: Endpoint, cfg: HealthCheckConfig) -> ProbeResult {
    let url = match health_check_url(&endpoint.url, &cfg.path) {
        Ok(u) => u,
        Err(err) => {
            warn!(endpoint = %endpoint.name, error = %err, "invalid endpoint url for health check");
            return ProbeResult {
                name: endpoint.name,
                healthy: false,
                latency_ms: None,
            };
        }
    };

    let client = probe_client(&client, &endpoint, Duration::from_millis(cfg.timeout_ms));
    let start = Instant::now();
    let mut req = client.get(url).header("Accept", "application/json");
    if let Some(token) = endpoint.auth.resolve_token() {
        req = req.header("Authorization", format!("Bearer {token}"));
        req = req.header("x-api-key", token);
    }
    for (k, v) in &endpoint.auth.extra_headers {
        req = req.header(k, v);
    }

    match req.send().await {
        Ok(resp) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let healthy = resp.status().as_u16() < 500;
            ProbeResult {
                name: endpoint.name,
                healthy,
                latency_ms: Some(latency_ms),
            }
        }
        Err(err) => {
            debug!(endpoint = %endpoint.name, error = %err, "health probe failed");
            ProbeResult {
                name: endpoint.name,
                healthy: false,
                latency_ms: None,
            }
        }
    }
}

/// Runs one full sweep over every configured endpoint, updating the manager
/// as each probe completes (not waiting for the slowest one). Intended to be
/// called on `cfg.interval_secs` cadence by an independent task.
pub async fn run_health_sweep(manager: Arc<EndpointManager>, cfg: HealthCheckConfig) {
    let timeout = Duration::from_millis(cfg.timeout_ms);
    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
    {
        Ok(c) => c,
        Err(err) => {
            warn!(error = %err, "failed to build health-check http client");
            return;
        }
    };

    let sem = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let endpoints: Vec<Endpoint> = manager.all_endpoints().into_iter().map(|(e, _)| e).collect();

    let mut futs = FuturesUnordered::new();
    for endpoint in endpoints {
        let client = client.clone();
        let cfg = cfg.clone();
        let sem = Arc::clone(&sem);
        futs.push(async move {
            let _permit = sem.acquire().await;
            probe_one(client, endpoint, cfg).await
        });
    }

    while let Some(result) = futs.next().await {
        manager
            .apply_health_result(&result.name, result.healthy, result.latency_ms)
            .await;
    }
}

/// Long-running task: sweeps on `cfg.interval_secs`, forever (spec.md §5:
/// one independent thread for the health checker).
pub async fn run_health_checker_task(manager: Arc<EndpointManager>, cfg: HealthCheckConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
    loop {
        ticker.tick().await;
        run_health_sweep(manager.clone(), cfg.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn health_check_url_joins_path() {
        let url = health_check_url("https://api.example.com", "/v1/models").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/models");
    }

    #[test]
    fn health_check_url_preserves_base_path_prefix() {
        let url = health_check_url("https://api.example.com/proxy", "/v1/models").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/proxy/v1/models");
    }
}
