//! Metrics module for quota-service.
//! Provides Prometheus metrics for quota decisions and ledger storage.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "quota_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Decisions by metric and outcome
pub static DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "quota_decisions_total",
            "Quota decisions by metric and reason"
        ),
        &["metric", "reason"]
    )
    .expect("Failed to register DECISIONS_TOTAL")
});

/// Requests turned away by the rate limiter
pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "quota_rate_limited_total",
        "Requests denied by the rate limiter"
    ))
    .expect("Failed to register RATE_LIMITED_TOTAL")
});

/// Audit writes that could not be persisted
pub static AUDIT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "quota_audit_failures_total",
        "Audit entries that failed to persist"
    ))
    .expect("Failed to register AUDIT_FAILURES_TOTAL")
});

/// Serialization conflicts that forced a retry
pub static SERIALIZATION_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "quota_serialization_retries_total",
        "Quota decisions retried after a serialization conflict"
    ))
    .expect("Failed to register SERIALIZATION_RETRIES_TOTAL")
});

/// Force registration of all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&DECISIONS_TOTAL);
    Lazy::force(&RATE_LIMITED_TOTAL);
    Lazy::force(&AUDIT_FAILURES_TOTAL);
    Lazy::force(&SERIALIZATION_RETRIES_TOTAL);
}

pub fn record_decision(metric: &str, reason: &str) {
    DECISIONS_TOTAL.with_label_values(&[metric, reason]).inc();
}

/// Render the default registry in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
