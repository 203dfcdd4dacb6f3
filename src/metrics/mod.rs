use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Register metric descriptions.
pub fn init_metrics() {
    describe_counter!("proxy_requests_total", "Client requests served, by status");
    describe_histogram!(
        "proxy_request_duration_seconds",
        "Client request duration in seconds"
    );
    describe_counter!(
        "backend_attempts_total",
        "Forward attempts per backend, by outcome"
    );
    describe_gauge!("backend_online", "Backend online status (1=online, 0=offline)");
}

/// Start a Prometheus scrape endpoint on the given address.
pub fn start_metrics_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = addr.parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    init_metrics();

    Ok(())
}

pub struct Metrics;

impl Metrics {
    /// Record a finished client request.
    #[inline]
    pub fn record_request(status: u16, duration: Duration) {
        let labels = [("status", status.to_string())];
        counter!("proxy_requests_total", &labels).increment(1);
        histogram!("proxy_request_duration_seconds", &labels).record(duration.as_secs_f64());
    }

    /// Record one forward attempt against a backend.
    #[inline]
    pub fn record_attempt(backend: &str, outcome: &'static str) {
        let labels = [
            ("backend", backend.to_string()),
            ("outcome", outcome.to_string()),
        ];
        counter!("backend_attempts_total", &labels).increment(1);
    }

    /// Reflect a backend's online flag.
    #[inline]
    pub fn set_backend_online(backend: &str, online: bool) {
        let labels = [("backend", backend.to_string())];
        gauge!("backend_online", &labels).set(if online { 1.0 } else { 0.0 });
    }
}
