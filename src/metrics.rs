use axum::{body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::time::{Duration, Instant};
use tracing::info;

/// Install the Prometheus exporter with its own HTTP listener on `port`
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .add_global_label("service", "api_observatory")
        .install()?;

    info!("Metrics server started on :{}/metrics", port);
    Ok(())
}

/// Middleware to collect HTTP request metrics
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    gauge!("http_requests_active").increment(1.0);
    let response = next.run(req).await;
    gauge!("http_requests_active").decrement(1.0);

    let status = response.status().as_u16().to_string();
    let labels = [("method", method), ("path", path), ("status", status)];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());

    response
}

/// One analysis job run, labelled by outcome (`success`, `failure`, `error`)
pub fn record_job_run(job: &str, outcome: &'static str, duration: Duration) {
    counter!("analysis_job_runs_total", "job" => job.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("analysis_job_duration_seconds", "job" => job.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_artifact_write_failure(key: &'static str) {
    counter!("artifact_write_failures_total", "key" => key).increment(1);
}

pub fn record_cache_operation(operation: &'static str, outcome: &'static str, duration: Duration) {
    counter!("cache_operations_total", "operation" => operation, "outcome" => outcome).increment(1);
    histogram!("cache_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

pub fn set_active_connections(count: usize) {
    gauge!("gateway_connections_active").set(count as f64);
}

pub fn record_event_forwarded() {
    counter!("gateway_events_forwarded_total").increment(1);
}

pub fn record_events_lagged(skipped: u64) {
    counter!("gateway_events_lagged_total").increment(skipped);
}

pub fn record_connection_evicted() {
    counter!("gateway_connections_evicted_total").increment(1);
}

pub fn record_relay_reconnect() {
    counter!("gateway_relay_reconnects_total").increment(1);
}
