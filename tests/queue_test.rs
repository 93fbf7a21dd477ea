//! Retry scheduling for failed deliveries, on in-memory rows.

use chrono::{DateTime, Duration, TimeZone, Utc};
use followup_engine::model::*;
use proptest::prelude::*;

fn t() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

fn claimed_row(attempts: u32, max_attempts: u32) -> QueuedNotification {
    QueuedNotification {
        id: 1,
        notification_id: "n-1".to_string(),
        user_id: None,
        to_address: "owner@example.com".to_string(),
        subject: "Reminder".to_string(),
        body: "<p>hi</p>".to_string(),
        status: NotificationStatus::Processing,
        attempts,
        max_attempts,
        last_error: None,
        provider_message_id: None,
        created_at: t(),
        scheduled_for: t(),
        locked_until: Some(t() + Duration::minutes(5)),
        processed_at: None,
    }
}

#[test]
fn scenario_e_three_failures_end_in_failed() {
    let base = Duration::seconds(60);
    let mut row = claimed_row(0, 3);
    let mut now = t();
    let mut outcomes = Vec::new();

    for _ in 0..3 {
        row.attempts += 1;
        let outcome = row.failure_outcome(now, base);
        outcomes.push(outcome);
        if let FailureOutcome::Retry { scheduled_for } = outcome {
            row.scheduled_for = scheduled_for;
            now = scheduled_for;
        }
    }

    assert_eq!(
        outcomes[0],
        FailureOutcome::Retry {
            scheduled_for: t() + Duration::seconds(60)
        }
    );
    assert_eq!(
        outcomes[1],
        FailureOutcome::Retry {
            scheduled_for: t() + Duration::seconds(60 + 120)
        }
    );
    assert_eq!(outcomes[2], FailureOutcome::Exhausted);
    assert_eq!(row.attempts, 3);
}

#[test]
fn single_attempt_rows_fail_on_first_error() {
    let row = claimed_row(1, 1);
    assert!(row.attempts_exhausted());
    assert_eq!(row.failure_outcome(t(), Duration::seconds(60)), FailureOutcome::Exhausted);
}

#[test]
fn notification_keys_are_stable_per_attempt() {
    let id = FollowUpId::new();
    assert_eq!(reminder_key(id, Attempt::FIRST), reminder_key(id, Attempt::FIRST));
    assert_ne!(reminder_key(id, Attempt::FIRST), reminder_key(id, Attempt::MAX));
    assert_ne!(reminder_key(id, Attempt::MAX), escalation_key(id));
}

#[test]
fn terminal_statuses() {
    assert!(NotificationStatus::Sent.is_terminal());
    assert!(NotificationStatus::Failed.is_terminal());
    assert!(NotificationStatus::Cancelled.is_terminal());
    assert!(!NotificationStatus::Pending.is_terminal());
    assert!(!NotificationStatus::Processing.is_terminal());
}

proptest! {
    #[test]
    fn retry_never_moves_schedule_backwards(
        attempts in 1u32..3,
        ahead_secs in 0i64..100_000,
        base_secs in 1i64..3_600,
    ) {
        let mut row = claimed_row(attempts, 3);
        row.scheduled_for = t() + Duration::seconds(ahead_secs);
        match row.failure_outcome(t(), Duration::seconds(base_secs)) {
            FailureOutcome::Retry { scheduled_for } => {
                prop_assert!(scheduled_for >= row.scheduled_for);
                prop_assert!(scheduled_for > t());
            }
            FailureOutcome::Exhausted => prop_assert!(false, "attempts below max must retry"),
        }
    }

    #[test]
    fn exhausted_once_attempts_reach_max(max in 1u32..6, extra in 0u32..3) {
        let row = claimed_row(max + extra, max);
        prop_assert_eq!(row.failure_outcome(t(), Duration::seconds(60)), FailureOutcome::Exhausted);
    }
}
