// =============================================================================
// METRICS MODULE
// =============================================================================
// This module sets up Prometheus metrics for observability.
//
// LEARNING NOTES:
// - Prometheus uses a "pull" model - it scrapes /metrics endpoint
// - Metrics have types: Counter, Gauge, Histogram, Summary
// - Labels add dimensions to metrics (e.g., operation="add_item")
// - Recording without an installed recorder is a no-op, so tests that call
//   these helpers need no setup
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::AppResult;

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Cart engine operations
/// Labels: operation (add_item, apply_coupon, ...), outcome (ok or error code)
pub const CART_OPERATIONS_TOTAL: &str = "cart_operations_total";

/// Coupon application attempts
/// Labels: status (applied/rejected)
pub const COUPON_APPLICATIONS_TOTAL: &str = "coupon_applications_total";

/// Cart totals after successful mutations
pub const CART_TOTAL_VALUE: &str = "cart_total_value";

/// Database query duration histogram
/// Labels: operation (select/upsert)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Installs the global Prometheus recorder and returns the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // Cart values in currency units
    let value_buckets = &[
        100.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 25_000.0, 50_000.0, 100_000.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(Matcher::Full(CART_TOTAL_VALUE.to_string()), value_buckets)?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(CART_OPERATIONS_TOTAL, "Cart engine operations by outcome");
    describe_counter!(COUPON_APPLICATIONS_TOTAL, "Coupon application attempts");
    describe_histogram!(CART_TOTAL_VALUE, "Cart total after each successful mutation");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record the outcome of a cart engine operation
pub fn record_cart_operation<T>(operation: &str, result: &AppResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter!(
        CART_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a coupon application attempt
pub fn record_coupon_application(applied: bool) {
    let status = if applied { "applied" } else { "rejected" };
    counter!(COUPON_APPLICATIONS_TOTAL, "status" => status).increment(1);
}

/// Record a cart total
pub fn observe_cart_total(total: f64) {
    histogram!(CART_TOTAL_VALUE).record(total);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
