//! Request metrics.
//!
//! [`MetricsSink`] is the recording contract the gateway and middleware depend
//! on. [`PrometheusMetrics`] implements it on top of an owned registry and
//! renders the text exposition served at `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Latency histogram boundaries, in seconds.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub trait MetricsSink: Send + Sync {
    /// Called once per request, after the status is known. `route` is the
    /// route pattern, never the literal path.
    fn record_request(&self, method: &str, route: &str, status: u16, duration_secs: f64);

    fn record_rate_limited(&self) {}

    fn record_upstream_error(&self, _backend: &str) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    rate_limited_total: IntCounter,
    upstream_errors_total: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latencies in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "endpoint"],
        )?;
        let rate_limited_total = IntCounter::new(
            "keygate_rate_limited_total",
            "Total number of requests rejected by the rate limiter",
        )?;
        let upstream_errors_total = IntCounterVec::new(
            Opts::new(
                "keygate_upstream_errors_total",
                "Total number of failed forwards by backend",
            ),
            &["backend"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            rate_limited_total,
            upstream_errors_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn request_count(&self, method: &str, route: &str, status: u16) -> u64 {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, route, status.as_str()])
            .get()
    }

    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited_total.get()
    }

    pub fn upstream_error_count(&self, backend: &str) -> u64 {
        self.upstream_errors_total.with_label_values(&[backend]).get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, route, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[method, route])
            .observe(duration_secs);
    }

    fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    fn record_upstream_error(&self, backend: &str) {
        self.upstream_errors_total.with_label_values(&[backend]).inc();
    }
}
