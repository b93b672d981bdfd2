//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_activitypub_activities_sent_total", "Total number of ActivityPub activities queued for sending"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "forgefed_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref QUEUE_PUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_queue_pushes_total", "Total number of queue pushes"),
        &["queue", "result"]
    ).expect("metric can be created");
    pub static ref QUEUE_ITEMS_HANDLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_queue_items_handled_total", "Total number of queue items handled"),
        &["queue", "outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("forgefed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITYPUB_ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()))
        .expect("ACTIVITYPUB_ACTIVITIES_SENT can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(QUEUE_PUSHES_TOTAL.clone()))
        .expect("QUEUE_PUSHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(QUEUE_ITEMS_HANDLED_TOTAL.clone()))
        .expect("QUEUE_ITEMS_HANDLED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
