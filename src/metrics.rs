// Interception Metrics Module
// Prometheus counters for the capture, rule, breakpoint and persistence paths

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    // Exchange counters
    pub static ref EXCHANGES_CAPTURED: IntCounterVec = register_int_counter_vec!(
        "glance_exchanges_captured_total",
        "Total number of finalized exchanges",
        &["method", "status"]
    ).unwrap();

    pub static ref EXCHANGE_DURATION: HistogramVec = register_histogram_vec!(
        "glance_exchange_duration_seconds",
        "Exchange duration from request observed to entry finalized",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref MOCK_RESPONSES: IntCounter = register_int_counter!(
        "glance_mock_responses_total",
        "Total number of responses synthesized from mock rules"
    ).unwrap();

    pub static ref PREFLIGHT_RESPONSES: IntCounter = register_int_counter!(
        "glance_preflight_responses_total",
        "Total number of CORS preflights answered locally"
    ).unwrap();

    pub static ref PIPELINE_PANICS: IntCounter = register_int_counter!(
        "glance_pipeline_panics_total",
        "Total number of exchanges failed by a fault inside the pipeline"
    ).unwrap();

    // Breakpoint metrics
    pub static ref BREAKPOINTS_REGISTERED: IntCounterVec = register_int_counter_vec!(
        "glance_breakpoints_registered_total",
        "Total number of suspended exchanges",
        &["leg"]
    ).unwrap();

    pub static ref BREAKPOINTS_RESOLVED: IntCounterVec = register_int_counter_vec!(
        "glance_breakpoints_resolved_total",
        "Total number of resumed exchanges by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref BREAKPOINTS_SUSPENDED: IntGauge = register_int_gauge!(
        "glance_breakpoints_suspended",
        "Current number of suspended exchanges"
    ).unwrap();

    // Persistence metrics
    pub static ref ENTRIES_PERSISTED: IntCounter = register_int_counter!(
        "glance_entries_persisted_total",
        "Total number of traffic entries written to durable storage"
    ).unwrap();

    pub static ref PERSISTENCE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "glance_persistence_errors_total",
        "Total number of failed storage operations",
        &["operation"]
    ).unwrap();

    pub static ref DURABILITY_DROPS: IntCounter = register_int_counter!(
        "glance_durability_drops_total",
        "Total number of entries dropped because the write queue was full"
    ).unwrap();

    pub static ref ENTRIES_TRUNCATED: IntCounterVec = register_int_counter_vec!(
        "glance_entries_truncated_total",
        "Total number of bodies cut to the configured maximum size",
        &["part"]
    ).unwrap();

    // Event hub metrics
    pub static ref HUB_MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "glance_hub_messages_dropped_total",
        "Total number of event messages not delivered",
        &["reason"]
    ).unwrap();

    pub static ref HUB_SUBSCRIBERS: IntGauge = register_int_gauge!(
        "glance_hub_subscribers",
        "Current number of registered event subscribers"
    ).unwrap();
}

/// Helper struct for recording interception metrics
pub struct Metrics;

impl Metrics {
    /// Record a finalized exchange
    pub fn record_exchange(method: &str, status: u16, duration_secs: f64) {
        EXCHANGES_CAPTURED
            .with_label_values(&[method, &status.to_string()])
            .inc();

        EXCHANGE_DURATION
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    pub fn record_mock() {
        MOCK_RESPONSES.inc();
    }

    pub fn record_preflight() {
        PREFLIGHT_RESPONSES.inc();
    }

    pub fn record_panic() {
        PIPELINE_PANICS.inc();
    }

    /// Record a newly suspended exchange
    pub fn record_breakpoint_registered(leg: &str) {
        BREAKPOINTS_REGISTERED.with_label_values(&[leg]).inc();
        BREAKPOINTS_SUSPENDED.inc();
    }

    /// Record a resumed exchange ("continued", "aborted", "expired", "released")
    pub fn record_breakpoint_resolved(outcome: &str) {
        BREAKPOINTS_RESOLVED.with_label_values(&[outcome]).inc();
        BREAKPOINTS_SUSPENDED.dec();
    }

    pub fn record_persisted() {
        ENTRIES_PERSISTED.inc();
    }

    pub fn record_persistence_error(operation: &str) {
        PERSISTENCE_ERRORS.with_label_values(&[operation]).inc();
    }

    pub fn record_durability_drop() {
        DURABILITY_DROPS.inc();
    }

    /// Record a truncated body ("request" or "response")
    pub fn record_truncation(part: &str) {
        ENTRIES_TRUNCATED.with_label_values(&[part]).inc();
    }

    /// Record an undelivered event ("queue_full", "subscriber_full", "subscriber_closed")
    pub fn record_hub_drop(reason: &str) {
        HUB_MESSAGES_DROPPED.with_label_values(&[reason]).inc();
    }

    pub fn set_hub_subscribers(count: usize) {
        HUB_SUBSCRIBERS.set(count as i64);
    }
}
