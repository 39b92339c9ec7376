//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter configured every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: messages dequeued by worker loops.
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("workq.messages.received")
        .with_description("Messages dequeued from the transport")
        .build()
}

/// Counter: how message processing ended.
/// Labels: `outcome` ("committed" | "rolled_back" | "rejected" | "error").
pub fn message_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("workq.messages.outcome")
        .with_description("Message processing outcomes")
        .build()
}

/// Counter: scheduler admission decisions.
/// Labels: `result` ("added" | "queued" | "rejected"), `group`.
pub fn scheduler_admissions() -> Counter<u64> {
    meter()
        .u64_counter("workq.scheduler.admission")
        .with_description("Task scheduler admission decisions")
        .build()
}

/// Counter: heartbeat updates.
/// Labels: `result` ("ok" | "missing" | "error").
pub fn heartbeat_updates() -> Counter<u64> {
    meter()
        .u64_counter("workq.heartbeat.updates")
        .with_description("Heartbeat update attempts")
        .build()
}

/// Counter: messages returned to the queue after their heartbeat lapsed.
pub fn heartbeat_resets() -> Counter<u64> {
    meter()
        .u64_counter("workq.heartbeat.resets")
        .with_description("Messages reset by heartbeat scans")
        .build()
}

/// Histogram: handler duration in milliseconds.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.processing.duration_ms")
        .with_description("Message handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
