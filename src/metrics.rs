//! Prometheus text exposition for `/metrics` (spec.md §6). Grounded in
//! `KriptoChewbacca-BEJ`'s use of the `prometheus` crate for endpoint/health
//! gauges — the same shape applies here one-for-one.

use prometheus::{Encoder, GaugeVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::endpoint::EndpointManager;

pub struct Metrics {
    registry: Registry,
    endpoints_total: IntGauge,
    endpoints_healthy: IntGauge,
    endpoint_healthy: GaugeVec,
    endpoint_response_time_ms: GaugeVec,
    endpoint_consecutive_fails: GaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let endpoints_total = IntGauge::new(
            "endpoint_forwarder_endpoints_total",
            "Total number of configured endpoints",
        )?;
        let endpoints_healthy = IntGauge::new(
            "endpoint_forwarder_endpoints_healthy",
            "Number of endpoints currently healthy",
        )?;
        let endpoint_healthy = GaugeVec::new(
            Opts::new("endpoint_forwarder_endpoint_healthy", "1 if the endpoint is healthy, else 0"),
            &["name", "url", "priority"],
        )?;
        let endpoint_response_time_ms = GaugeVec::new(
            Opts::new(
                "endpoint_forwarder_endpoint_response_time_ms",
                "Most recent health-check response time in milliseconds",
            ),
            &["name", "url"],
        )?;
        let endpoint_consecutive_fails = GaugeVec::new(
            Opts::new(
                "endpoint_forwarder_endpoint_consecutive_fails",
                "Consecutive health-check failures",
            ),
            &["name", "url"],
        )?;

        registry.register(Box::new(endpoints_total.clone()))?;
        registry.register(Box::new(endpoints_healthy.clone()))?;
        registry.register(Box::new(endpoint_healthy.clone()))?;
        registry.register(Box::new(endpoint_response_time_ms.clone()))?;
        registry.register(Box::new(endpoint_consecutive_fails.clone()))?;

        Ok(Self {
            registry,
            endpoints_total,
            endpoints_healthy,
            endpoint_healthy,
            endpoint_response_time_ms,
            endpoint_consecutive_fails,
        })
    }

    /// Refreshes every gauge from a fresh snapshot of the endpoint pool, then
    /// renders the whole registry as Prometheus text exposition.
    pub fn render(&self, manager: &EndpointManager) -> String {
        let snapshot = manager.all_endpoints();
        self.endpoints_total.set(snapshot.len() as i64);
        self.endpoints_healthy
            .set(snapshot.iter().filter(|(_, rt)| !rt.never_checked && rt.healthy).count() as i64);

        for (endpoint, runtime) in &snapshot {
            let priority = endpoint.priority.to_string();
            self.endpoint_healthy
                .with_label_values(&[&endpoint.name, &endpoint.url, &priority])
                .set(if !runtime.never_checked && runtime.healthy { 1.0 } else { 0.0 });
            self.endpoint_response_time_ms
                .with_label_values(&[&endpoint.name, &endpoint.url])
                .set(runtime.response_time_ms.unwrap_or(0) as f64);
            self.endpoint_consecutive_fails
                .with_label_values(&[&endpoint.name, &endpoint.url])
                .set(runtime.consecutive_failures as f64);
        }

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buf) {
            warn!(error = %err, "failed to encode prometheus metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
