//! Prometheus metrics for activestore.
//!
//! Defines metric name constants, recording helpers used by the retry
//! executor and pointer manager, and installs a global Prometheus recorder
//! using `metrics-exporter-prometheus`.  Without an installed recorder the
//! recording helpers are no-ops.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Target operations by outcome (counter). Labels: target, operation, status.
pub const OPERATIONS_TOTAL: &str = "activestore_operations_total";

/// Target operation duration in seconds, retries included (histogram).
/// Labels: target, operation.
pub const OPERATION_DURATION_SECONDS: &str = "activestore_operation_duration_seconds";

/// Retries after transient failures (counter). Labels: target, operation.
pub const RETRIES_TOTAL: &str = "activestore_retries_total";

/// Lost ACTIVE pointer races (counter). Labels: target, operation.
pub const POINTER_CONFLICTS_TOTAL: &str = "activestore_pointer_conflicts_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.
///
/// With `listen` set, also serves `/metrics` on that address; this must be
/// called from within a Tokio runtime.  Idempotent: later calls return the
/// handle installed by the first.
pub fn init_metrics(listen: Option<SocketAddr>) -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = match listen {
        Some(addr) => {
            let builder = PrometheusBuilder::new().with_http_listener(addr);
            let (recorder, exporter) = builder.build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a global metrics recorder is already installed"))?;
            tokio::spawn(exporter);
            handle
        }
        None => PrometheusBuilder::new().install_recorder()?,
    };
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Target operations by outcome");
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Target operation duration in seconds, including retries"
    );
    describe_counter!(RETRIES_TOTAL, "Retries after transient backend failures");
    describe_counter!(POINTER_CONFLICTS_TOTAL, "Lost ACTIVE pointer races");
}

// -- Recording helpers --------------------------------------------------------

/// Record the final outcome of one target operation.
pub fn record_operation(
    target: &str,
    operation: &'static str,
    status: &'static str,
    elapsed: Duration,
) {
    counter!(
        OPERATIONS_TOTAL,
        "target" => target.to_string(),
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    histogram!(
        OPERATION_DURATION_SECONDS,
        "target" => target.to_string(),
        "operation" => operation
    )
    .record(elapsed.as_secs_f64());
}

/// Record one retry after a transient failure.
pub fn record_retry(target: &str, operation: &'static str) {
    counter!(RETRIES_TOTAL, "target" => target.to_string(), "operation" => operation).increment(1);
}

/// Record a lost pointer race.
pub fn record_pointer_conflict(target: &str, operation: &'static str) {
    counter!(
        POINTER_CONFLICTS_TOTAL,
        "target" => target.to_string(),
        "operation" => operation
    )
    .increment(1);
}

// -- Tests --------------------------------------------------------------------
