//! Metric instrument factories for followup-engine.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"followup-engine"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for followup-engine instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("followup-engine")
}

/// Counter: follow-up state changes and history entries written.
/// Labels: `action` (history action tag).
pub fn followup_transitions() -> Counter<u64> {
    meter()
        .u64_counter("followup.transitions")
        .with_description("Number of follow-up state transitions")
        .build()
}

/// Counter: notifications offered to the queue.
/// Labels: `result` ("ok" | "duplicate").
pub fn notifications_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("followup.queue.enqueued")
        .with_description("Number of notifications enqueued")
        .build()
}

/// Counter: queue-level operations (claim, mark_sent, mark_failed, cancel).
/// Labels: `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("followup.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: delivery attempt outcomes.
/// Labels: `outcome` ("sent" | "retry" | "failed").
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("followup.deliveries")
        .with_description("Notification delivery attempts by outcome")
        .build()
}

/// Counter: escalation scan results.
/// Labels: `result` ("escalated" | "no_response" | "error").
pub fn escalations() -> Counter<u64> {
    meter()
        .u64_counter("followup.escalations")
        .with_description("Overdue follow-ups handled by the escalation scan")
        .build()
}

/// Counter: derived tasks created.
/// Labels: `event_type`.
pub fn tasks_generated() -> Counter<u64> {
    meter()
        .u64_counter("followup.tasks.generated")
        .with_description("Number of derived tasks generated")
        .build()
}

/// Counter: derived tasks closed without a user action.
/// Labels: `reason` ("auto" | "expired").
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("followup.tasks.closed")
        .with_description("Number of derived tasks auto-completed or expired")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("followup.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
