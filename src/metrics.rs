//! Prometheus metrics for the authorization engine.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global metrics registry for the engine.
pub static METRICS: Lazy<AuthzMetrics> = Lazy::new(AuthzMetrics::new);

pub struct AuthzMetrics {
    pub registry: Registry,
    /// Permission decisions by outcome.
    pub decisions_total: IntCounterVec,
    /// Decision cache hits and misses.
    pub cache_operations_total: IntCounterVec,
    /// Resolution latency, cache misses only.
    pub resolution_duration_seconds: Histogram,
    /// Resolutions that hit the internal timeout bound.
    pub resolution_timeouts_total: IntCounter,
    /// Audit events dropped because the buffer overflowed. Monotonically
    /// increasing; audit completeness is best-effort under backend outage.
    pub audit_events_dropped_total: IntCounter,
    /// Failed audit storage writes (retried with backoff).
    pub audit_write_failures_total: IntCounter,
}

impl AuthzMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("authz_decisions_total", "Permission decisions by outcome"),
            &["outcome"],
        )
        .expect("metric definition");
        let cache_operations_total = IntCounterVec::new(
            Opts::new(
                "authz_cache_operations_total",
                "Decision cache operations by result",
            ),
            &["result"],
        )
        .expect("metric definition");
        let resolution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "authz_resolution_duration_seconds",
                "Permission resolution latency (cache misses)",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5]),
        )
        .expect("metric definition");
        let resolution_timeouts_total = IntCounter::new(
            "authz_resolution_timeouts_total",
            "Resolutions denied because the timeout bound elapsed",
        )
        .expect("metric definition");
        let audit_events_dropped_total = IntCounter::new(
            "authz_audit_events_dropped_total",
            "Audit events dropped on buffer overflow",
        )
        .expect("metric definition");
        let audit_write_failures_total = IntCounter::new(
            "authz_audit_write_failures_total",
            "Failed audit storage writes",
        )
        .expect("metric definition");

        for collector in [
            Box::new(decisions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cache_operations_total.clone()),
            Box::new(resolution_duration_seconds.clone()),
            Box::new(resolution_timeouts_total.clone()),
            Box::new(audit_events_dropped_total.clone()),
            Box::new(audit_write_failures_total.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            decisions_total,
            cache_operations_total,
            resolution_duration_seconds,
            resolution_timeouts_total,
            audit_events_dropped_total,
            audit_write_failures_total,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
