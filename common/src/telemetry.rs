// Telemetry module for structured logging and metrics
// Logs go through tracing-subscriber, metrics through the Prometheus exporter.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over `log_level`. With `json` set, every
/// entry is a JSON object carrying the current span and its fields.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers:
/// - job_runs_completed_total / job_runs_failed_total / job_runs_omitted_total
/// - job_run_duration_seconds
/// - running_processes
/// - plan_size
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "job_runs_completed_total",
        "Total number of job runs that exited successfully"
    );
    describe_counter!(
        "job_runs_failed_total",
        "Total number of job runs that failed to launch or exited non-zero"
    );
    describe_counter!(
        "job_runs_omitted_total",
        "Total number of job runs skipped because they were overdue"
    );
    describe_histogram!(
        "job_run_duration_seconds",
        "Wall-clock duration of job run processes in seconds"
    );
    describe_gauge!("running_processes", "Number of live job run processes");
    describe_gauge!("plan_size", "Number of items in the published plan");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_run_completed(job_id: i64) {
    counter!("job_runs_completed_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn record_job_run_failed(job_id: i64, reason: &str) {
    counter!(
        "job_runs_failed_total",
        "job_id" => job_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_run_omitted(job_id: i64) {
    counter!("job_runs_omitted_total", "job_id" => job_id.to_string()).increment(1);
}

#[inline]
pub fn record_job_run_duration(job_id: i64, duration_seconds: f64) {
    histogram!("job_run_duration_seconds", "job_id" => job_id.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn update_running_processes(count: usize) {
    gauge!("running_processes").set(count as f64);
}

#[inline]
pub fn update_plan_size(size: usize) {
    gauge!("plan_size").set(size as f64);
}
