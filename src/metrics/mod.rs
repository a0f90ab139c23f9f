//! Prometheus Metrics
//!
//! Engine counters and gauges, registered in the default Prometheus
//! registry on first use and exposed by the agent's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{Error, Result};

/// Acquire attempts by result (`bound`, or the error reason).
pub static ACQUIRE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hostbind_acquire_total",
        "Volume acquire attempts by result",
        &["result"]
    )
    .expect("hostbind_acquire_total is a valid metric")
});

/// Workload releases that removed at least one binding.
pub static RELEASE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("hostbind_release_total", "Workload releases processed")
        .expect("hostbind_release_total is a valid metric")
});

/// Host paths created by the engine, by kind.
pub static PATHS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hostbind_paths_created_total",
        "Host paths created by the engine",
        &["kind"]
    )
    .expect("hostbind_paths_created_total is a valid metric")
});

/// Current number of bound mount records.
pub static BOUND_MOUNTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("hostbind_bound_mounts", "Bound mount records")
        .expect("hostbind_bound_mounts is a valid metric")
});

/// Blocking calls that exceeded the watchdog threshold.
pub static WATCHDOG_ANOMALIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "hostbind_watchdog_anomalies_total",
        "Blocking filesystem calls that exceeded the watchdog threshold"
    )
    .expect("hostbind_watchdog_anomalies_total is a valid metric")
});

/// Registered plugin backends.
pub static BACKENDS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("hostbind_backends_active", "Registered plugin backends")
        .expect("hostbind_backends_active is a valid metric")
});

/// Failed handshakes by reason.
pub static HANDSHAKE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hostbind_handshake_failures_total",
        "Plugin handshakes that failed",
        &["reason"]
    )
    .expect("hostbind_handshake_failures_total is a valid metric")
});

/// Bind attempts scheduled for retry.
pub static BIND_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "hostbind_bind_retries_total",
        "Volume bind attempts scheduled for retry"
    )
    .expect("hostbind_bind_retries_total is a valid metric")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<(String, String)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    let body = String::from_utf8(buffer)
        .map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))?;
    Ok((encoder.format_type().to_string(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_engine_metrics() {
        ACQUIRE_TOTAL.with_label_values(&["bound"]).inc();
        BIND_RETRIES.inc();

        let (content_type, body) = render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("hostbind_acquire_total"));
        assert!(body.contains("hostbind_bind_retries_total"));
    }
}
