use followup_engine::telemetry::{TelemetryConfig, init_telemetry, spans};

#[test]
fn init_without_endpoint_uses_local_logging() {
    let _guard = init_telemetry(TelemetryConfig::new(None, "debug")).unwrap();

    let span = spans::start_delivery_span("followup:1:reminder:1", 1);
    spans::record_outcome(&span, "sent");
    spans::record_state_transition(&span, "processing", "sent");

    let scan = spans::start_scan_span("escalation");
    spans::record_processed(&scan, 3);

    // A second global subscriber cannot be installed.
    assert!(init_telemetry(TelemetryConfig::new(None, "info")).is_err());
}
