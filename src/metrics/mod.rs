//! Metrics module for the order service
//!
//! Exposes Prometheus-compatible counters and histograms for:
//! - HTTP request volume/latency
//! - Order placement outcomes
//! - Payment gateway attempts/outcomes and retry counts
//! - Loyalty worker ticks

#![allow(dead_code)]

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency
pub mod names {
    // HTTP
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "http_requests_in_flight";

    // Orders
    pub const ORDERS_CREATED_TOTAL: &str = "orders_created_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const ORDER_CREATE_DURATION_SECONDS: &str = "order_create_duration_seconds";
    pub const IDEMPOTENT_HITS_TOTAL: &str = "order_idempotent_hits_total";

    // Payments
    pub const PAYMENT_ATTEMPTS_TOTAL: &str = "payment_gateway_attempts_total";
    pub const PAYMENT_AUTHORIZED_TOTAL: &str = "payments_authorized_total";
    pub const PAYMENT_FAILED_TOTAL: &str = "payments_failed_total";
    pub const PAYMENT_UNAVAILABLE_TOTAL: &str = "payments_unavailable_total";
    pub const PAYMENT_VOIDED_TOTAL: &str = "payments_voided_total";
    pub const PAYMENT_RETRY_TOTAL: &str = "payment_gateway_retries_total";
    pub const PAYMENT_GATEWAY_DURATION_SECONDS: &str = "payment_gateway_duration_seconds";

    // Loyalty
    pub const LOYALTY_TICKS_TOTAL: &str = "loyalty_ticks_total";
    pub const LOYALTY_ORDERS_PROCESSED_TOTAL: &str = "loyalty_orders_processed_total";
    pub const LOYALTY_POINTS_AWARDED_TOTAL: &str = "loyalty_points_awarded_total";
    pub const LOYALTY_TICK_DURATION_SECONDS: &str = "loyalty_tick_duration_seconds";
}

/// Label keys
pub mod labels {
    pub const METHOD: &str = "method";
    pub const ENDPOINT: &str = "endpoint";
    pub const STATUS: &str = "status";
    pub const REASON: &str = "reason";
    pub const OPERATION: &str = "operation";
}

/// Initialize the Prometheus metrics exporter.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_CREATE_DURATION_SECONDS.to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full(names::PAYMENT_GATEWAY_DURATION_SECONDS.to_string()),
            &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0],
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full(names::LOYALTY_TICK_DURATION_SECONDS.to_string()),
            &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
        )
        .unwrap();

    builder
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

// ---------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        labels::METHOD => method.to_string(),
        labels::ENDPOINT => endpoint.to_string(),
        labels::STATUS => status_str.clone()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        labels::METHOD => method.to_string(),
        labels::ENDPOINT => endpoint.to_string(),
        labels::STATUS => status_str
    )
    .record(duration_secs);
}

pub fn inc_http_requests_in_flight() {
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
}

pub fn dec_http_requests_in_flight() {
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);
}

// ---------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------

pub fn record_order_created() {
    counter!(names::ORDERS_CREATED_TOTAL).increment(1);
}

pub fn record_order_rejected(reason: &str) {
    counter!(names::ORDERS_REJECTED_TOTAL, labels::REASON => reason.to_string()).increment(1);
}

pub fn record_order_cancelled() {
    counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);
}

pub fn record_order_create_duration(duration_secs: f64) {
    histogram!(names::ORDER_CREATE_DURATION_SECONDS).record(duration_secs);
}

pub fn record_idempotent_hit() {
    counter!(names::IDEMPOTENT_HITS_TOTAL).increment(1);
}

// ---------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------

pub fn record_payment_attempt(operation: &str) {
    counter!(names::PAYMENT_ATTEMPTS_TOTAL, labels::OPERATION => operation.to_string()).increment(1);
}

pub fn record_payment_retry(operation: &str) {
    counter!(names::PAYMENT_RETRY_TOTAL, labels::OPERATION => operation.to_string()).increment(1);
}

pub fn record_payment_authorized() {
    counter!(names::PAYMENT_AUTHORIZED_TOTAL).increment(1);
}

pub fn record_payment_failed() {
    counter!(names::PAYMENT_FAILED_TOTAL).increment(1);
}

pub fn record_payment_unavailable() {
    counter!(names::PAYMENT_UNAVAILABLE_TOTAL).increment(1);
}

pub fn record_payment_voided() {
    counter!(names::PAYMENT_VOIDED_TOTAL).increment(1);
}

pub fn record_payment_gateway_duration(operation: &str, duration_secs: f64) {
    histogram!(names::PAYMENT_GATEWAY_DURATION_SECONDS, labels::OPERATION => operation.to_string())
        .record(duration_secs);
}

// ---------------------------------------------------------------------
// Loyalty
// ---------------------------------------------------------------------

pub fn record_loyalty_tick(duration_secs: f64, orders_processed: u64, points_awarded: u64) {
    counter!(names::LOYALTY_TICKS_TOTAL).increment(1);
    counter!(names::LOYALTY_ORDERS_PROCESSED_TOTAL).increment(orders_processed);
    counter!(names::LOYALTY_POINTS_AWARDED_TOTAL).increment(points_awarded);
    histogram!(names::LOYALTY_TICK_DURATION_SECONDS).record(duration_secs);
}
