//! Span helpers for delivery attempts and background scans.

use tracing::Span;

/// Start a span for one delivery attempt.
///
/// The `notification.outcome` field is declared empty and is filled via
/// [`record_outcome`].
pub fn start_delivery_span(notification_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "notification.deliver",
        "notification.id" = notification_id,
        "notification.attempt" = attempt,
        "notification.outcome" = tracing::field::Empty,
    )
}

/// Start a span for one scan or sweep cycle.
pub fn start_scan_span(kind: &'static str) -> Span {
    tracing::info_span!(
        "engine.scan",
        "scan.kind" = kind,
        "scan.processed" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("notification.outcome", outcome);
}

pub fn record_processed(span: &Span, processed: usize) {
    span.record("scan.processed", processed as u64);
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
