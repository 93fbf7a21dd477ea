//! Store-backed scenarios. Need a Postgres reachable through DATABASE_URL:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/followup_test cargo test -- --ignored
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use followup_engine::audit::LogAuditSink;
use followup_engine::config::QueueConfig;
use followup_engine::db::{Db, FollowUpFilter};
use followup_engine::engine::{EscalationScanner, QueueWorker};
use followup_engine::error::{Error, Result};
use followup_engine::lifecycle::Lifecycle;
use followup_engine::mailer::Mailer;
use followup_engine::model::*;
use followup_engine::tasks::{EventData, EventType, TaskGenerator, TaskService};
use followup_engine::timing::TimingProfile;
use serial_test::serial;
use uuid::Uuid;

async fn test_db() -> Arc<Db> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for db tests");
    let db = Db::connect(&url).await.expect("failed to connect to database");
    db.migrate().await.expect("failed to run migrations");
    Arc::new(db)
}

async fn user(db: &Db, role: Role) -> User {
    let id = Uuid::new_v4();
    let user = User {
        id: UserId(id),
        name: format!("{role} {id}"),
        email: format!("{id}@example.com"),
        role,
    };
    db.upsert_user(&user).await.unwrap();
    user
}

fn lifecycle(db: &Arc<Db>, profile: TimingProfile) -> Lifecycle {
    Lifecycle::new(Arc::clone(db), profile, Arc::new(LogAuditSink))
}

fn task_service(db: &Arc<Db>) -> Arc<TaskService> {
    Arc::new(TaskService::new(Arc::clone(db), TaskGenerator::new(Duration::hours(48))))
}

/// A third-attempt follow-up that went overdue ten minutes ago.
async fn overdue_final_attempt(db: &Db, owner: UserId) -> FollowUp {
    let now = Utc::now();
    let (mut followup, history) = FollowUp::create(
        NewFollowUp::new(owner, "Offer 2026-17", "Northwind").sent_at(now - Duration::hours(1)),
        now,
        TimingProfile::Fast,
    );
    followup.attempt = Attempt::MAX;
    followup.reminded_attempt = Attempt::MAX.get();
    followup.due_at = now - Duration::minutes(10);
    db.insert_followup(&followup, &history).await.unwrap();
    followup
}

fn notice(key: &str) -> NewNotification {
    NewNotification::new(key, "someone@example.com", "Subject", "<p>body</p>")
}

fn unique_key(prefix: &str) -> String {
    format!("test:{prefix}:{}", Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Follow-up lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_connect_and_migrate() {
    let db = test_db().await;
    db.health_check().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_create_snooze_complete_with_history() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let lifecycle = lifecycle(&db, TimingProfile::Fast);

    let created = lifecycle
        .create(NewFollowUp::new(owner.id, "Offer", "Northwind"))
        .await
        .unwrap();
    assert_eq!(created.attempt, Attempt::FIRST);
    assert_eq!(created.status, FollowUpStatus::Pending);

    let snoozed = lifecycle.snooze(created.id, owner.id).await.unwrap();
    assert_eq!(snoozed.attempt.get(), 2);
    assert_eq!(snoozed.status, FollowUpStatus::Pending);
    assert!(snoozed.due_at > created.due_at);

    let done = lifecycle
        .complete(created.id, owner.id, CompletionReason::ClientResponded)
        .await
        .unwrap();
    assert_eq!(done.status, FollowUpStatus::Completed);
    assert!(done.completed_at.is_some());

    let err = lifecycle.snooze(created.id, owner.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }), "{err}");

    let actions: Vec<HistoryAction> = lifecycle
        .history(created.id, owner.id)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.action)
        .collect();
    assert_eq!(
        actions,
        vec![HistoryAction::Created, HistoryAction::Snoozed, HistoryAction::Completed]
    );
}

#[tokio::test]
#[ignore]
async fn test_other_users_cannot_touch_a_follow_up() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let stranger = user(&db, Role::Member).await;
    let lifecycle = lifecycle(&db, TimingProfile::Fast);

    let created = lifecycle
        .create(NewFollowUp::new(owner.id, "Offer", "Northwind"))
        .await
        .unwrap();

    assert!(matches!(
        lifecycle.snooze(created.id, stranger.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        lifecycle.get(FollowUpId::new(), owner.id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_resend_links_new_record() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let lifecycle = lifecycle(&db, TimingProfile::Standard);

    let original = lifecycle
        .create(NewFollowUp::new(owner.id, "Offer", "Northwind").origin_ref("APP-1"))
        .await
        .unwrap();
    lifecycle.snooze(original.id, owner.id).await.unwrap();

    let fresh = lifecycle.resend(original.id, owner.id).await.unwrap();
    assert_eq!(fresh.resent_from, Some(original.id));
    assert_eq!(fresh.attempt, Attempt::FIRST);
    assert_eq!(fresh.origin_ref.as_deref(), Some("APP-1"));

    let old = lifecycle.get(original.id, owner.id).await.unwrap();
    assert_eq!(old.status, FollowUpStatus::Completed);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_stats_and_filters() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let lifecycle = lifecycle(&db, TimingProfile::Fast);

    let a = lifecycle
        .create(NewFollowUp::new(owner.id, "A", "Northwind Traders"))
        .await
        .unwrap();
    lifecycle
        .create(NewFollowUp::new(owner.id, "B", "Contoso"))
        .await
        .unwrap();
    lifecycle
        .complete(a.id, owner.id, CompletionReason::Paid)
        .await
        .unwrap();
    overdue_final_attempt(&db, owner.id).await;

    let stats = lifecycle.stats(owner.id).await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.no_response, 0);
    assert_eq!(stats.overdue, 1);

    let pending = lifecycle
        .list(&FollowUpFilter::for_user(owner.id).status(FollowUpStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    let northwind = lifecycle
        .list(&FollowUpFilter::for_user(owner.id).client_name("northwind"))
        .await
        .unwrap();
    assert_eq!(northwind.len(), 2);

    let overdue = lifecycle
        .list(&FollowUpFilter::for_user(owner.id).overdue_at(Utc::now()))
        .await
        .unwrap();
    assert_eq!(overdue.len(), 1);
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
#[serial]
async fn test_escalation_assigns_manager_and_queues_once() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    user(&db, Role::Manager).await;
    let followup = overdue_final_attempt(&db, owner.id).await;

    let tasks = task_service(&db);
    let scanner = EscalationScanner::new(Arc::clone(&db), TimingProfile::Fast, Arc::new(LogAuditSink))
        .with_tasks(Arc::clone(&tasks));

    let first = scanner.scan_and_escalate(Utc::now()).await.unwrap();
    assert!(first.notified >= 1);

    let escalated = db.get_followup(followup.id, owner.id).await.unwrap();
    assert_eq!(escalated.status, FollowUpStatus::NoResponse);
    assert!(escalated.escalated);
    assert!(escalated.escalated_at.is_some());
    let manager_id = escalated.manager_id.expect("manager assigned");
    assert_eq!(db.get_user(manager_id).await.unwrap().role, Role::Manager);

    let queued = db.get_notification(&escalation_key(followup.id)).await.unwrap();
    assert_eq!(queued.status, NotificationStatus::Pending);
    assert_eq!(queued.user_id, Some(manager_id));

    // A repeated scan leaves the record alone.
    scanner.scan_and_escalate(Utc::now()).await.unwrap();
    let history = db.followup_history(followup.id, owner.id).await.unwrap();
    let escalations = history
        .iter()
        .filter(|h| h.action == HistoryAction::Escalated)
        .count();
    assert_eq!(escalations, 1);

    let manager_tasks = tasks.list(manager_id, Some(TaskStatus::Pending)).await.unwrap();
    assert!(manager_tasks.iter().any(|t| t.action_type == "handle_escalation"));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_escalation_scan_continues_past_a_failing_row() {
    let db = test_db().await;
    user(&db, Role::Manager).await;
    let missing_owner = UserId(Uuid::new_v4());
    let orphan = overdue_final_attempt(&db, missing_owner).await;
    let owner = user(&db, Role::Member).await;
    let valid = overdue_final_attempt(&db, owner.id).await;

    let scanner = EscalationScanner::new(Arc::clone(&db), TimingProfile::Fast, Arc::new(LogAuditSink));
    let report = scanner.scan_and_escalate(Utc::now()).await.unwrap();
    assert!(report.failed >= 1, "{report:?}");

    let untouched = db.get_followup(orphan.id, missing_owner).await.unwrap();
    assert_eq!(untouched.status, FollowUpStatus::Pending);
    assert!(!untouched.escalated);

    let escalated = db.get_followup(valid.id, owner.id).await.unwrap();
    assert_eq!(escalated.status, FollowUpStatus::NoResponse);
    assert!(escalated.escalated);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_manager_owned_follow_up_closes_without_escalation() {
    let db = test_db().await;
    let owner = user(&db, Role::Manager).await;
    let followup = overdue_final_attempt(&db, owner.id).await;

    let scanner = EscalationScanner::new(Arc::clone(&db), TimingProfile::Fast, Arc::new(LogAuditSink));
    scanner.scan_and_escalate(Utc::now()).await.unwrap();

    let closed = db.get_followup(followup.id, owner.id).await.unwrap();
    assert_eq!(closed.status, FollowUpStatus::NoResponse);
    assert!(!closed.escalated);
    assert!(matches!(
        db.get_notification(&escalation_key(followup.id)).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_reminder_queued_once_per_attempt() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let now = Utc::now();
    let (mut followup, history) = FollowUp::create(
        NewFollowUp::new(owner.id, "Offer", "Northwind"),
        now,
        TimingProfile::Fast,
    );
    followup.due_at = now - Duration::minutes(1);
    db.insert_followup(&followup, &history).await.unwrap();

    let scanner = EscalationScanner::new(Arc::clone(&db), TimingProfile::Fast, Arc::new(LogAuditSink));
    scanner.scan_due_reminders(Utc::now()).await.unwrap();
    scanner.scan_due_reminders(Utc::now()).await.unwrap();

    let reminded = db.get_followup(followup.id, owner.id).await.unwrap();
    assert_eq!(reminded.reminded_attempt, 1);
    assert_eq!(reminded.status, FollowUpStatus::Pending);

    let queued = db
        .get_notification(&reminder_key(followup.id, Attempt::FIRST))
        .await
        .unwrap();
    assert_eq!(queued.to_address, owner.email);

    let reminders = db
        .followup_history(followup.id, owner.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|h| h.action == HistoryAction::ReminderSent)
        .count();
    assert_eq!(reminders, 1);
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_enqueue_is_idempotent() {
    let db = test_db().await;
    let key = unique_key("dedup");

    let first = db.enqueue(&notice(&key)).await.unwrap();
    assert!(matches!(first, EnqueueResult::Queued(_)));

    let second = db
        .enqueue(&NewNotification::new(&key, "other@example.com", "Changed", "<p>changed</p>"))
        .await
        .unwrap();
    assert_eq!(second, EnqueueResult::Duplicate);

    let stored = db.get_notification(&key).await.unwrap();
    assert_eq!(stored.subject, "Subject");
    assert_eq!(stored.to_address, "someone@example.com");
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_concurrent_claims_never_overlap() {
    let db = test_db().await;
    for _ in 0..20 {
        db.enqueue(&notice(&unique_key("claim"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            db.claim_batch(5, Utc::now(), Duration::minutes(5)).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for row in handle.await.unwrap() {
            assert_eq!(row.status, NotificationStatus::Processing);
            assert!(seen.insert(row.id), "row {} claimed twice", row.id);
        }
    }
}

#[tokio::test]
#[ignore]
async fn test_cancel_only_pending() {
    let db = test_db().await;
    let key = unique_key("cancel");
    db.enqueue(&notice(&key)).await.unwrap();

    assert!(db.cancel_notification(&key).await.unwrap());
    assert!(!db.cancel_notification(&key).await.unwrap());
    assert_eq!(
        db.get_notification(&key).await.unwrap().status,
        NotificationStatus::Cancelled
    );
    assert!(!db.cancel_notification(&unique_key("missing")).await.unwrap());
}

struct RecordingMailer {
    fail: bool,
    sent: Mutex<Vec<String>>,
}

impl RecordingMailer {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, _subject: &str, _html: &str) -> Result<String> {
        if self.fail {
            return Err(Error::Delivery("provider rejected message".into()));
        }
        self.sent.lock().unwrap().push(to.to_string());
        Ok(format!("msg-{}", Uuid::new_v4()))
    }
}

fn fast_retry_config() -> QueueConfig {
    QueueConfig {
        retry_base_delay: StdDuration::ZERO,
        ..QueueConfig::default()
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_worker_delivers_and_records_provider_id() {
    let db = test_db().await;
    let key = unique_key("deliver");
    db.enqueue(&notice(&key)).await.unwrap();

    let mailer = Arc::new(RecordingMailer::new(false));
    let worker = QueueWorker::new(Arc::clone(&db), Some(mailer.clone()), fast_retry_config());

    for _ in 0..10 {
        worker.process_once(100).await.unwrap();
        if db.get_notification(&key).await.unwrap().status.is_terminal() {
            break;
        }
    }

    let row = db.get_notification(&key).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.attempts, 1);
    assert!(row.provider_message_id.is_some());
    assert!(row.processed_at.is_some());
    assert!(mailer.sent.lock().unwrap().iter().any(|to| to == "someone@example.com"));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_worker_gives_up_after_max_attempts() {
    let db = test_db().await;
    let key = unique_key("fail");
    db.enqueue(&notice(&key)).await.unwrap();

    let worker = QueueWorker::new(
        Arc::clone(&db),
        Some(Arc::new(RecordingMailer::new(true))),
        fast_retry_config(),
    );

    for _ in 0..10 {
        worker.process_once(100).await.unwrap();
        if db.get_notification(&key).await.unwrap().status.is_terminal() {
            break;
        }
    }

    let row = db.get_notification(&key).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.attempts, 3);
    assert_eq!(row.last_error.as_deref(), Some("delivery failed: provider rejected message"));

    // Failed rows are never picked up again.
    worker.process_once(100).await.unwrap();
    let after = db.get_notification(&key).await.unwrap();
    assert_eq!(after.status, NotificationStatus::Failed);
    assert_eq!(after.attempts, 3);
    assert_eq!(after.scheduled_for, row.scheduled_for);
    assert_eq!(after.processed_at, row.processed_at);
}

/// Claim batches until the row with `key` is among them.
async fn claim_until(db: &Db, key: &str, lease: Duration) -> QueuedNotification {
    for _ in 0..50 {
        let batch = db.claim_batch(500, Utc::now(), lease).await.unwrap();
        if let Some(row) = batch.into_iter().find(|n| n.notification_id == key) {
            return row;
        }
    }
    panic!("{key} was never claimed");
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_expired_lease_is_reclaimed_and_old_claim_is_lost() {
    let db = test_db().await;
    let key = unique_key("reclaim");
    db.enqueue(&notice(&key)).await.unwrap();

    let first = claim_until(&db, &key, Duration::seconds(-1)).await;
    assert_eq!(first.attempts, 1);

    let second = claim_until(&db, &key, Duration::minutes(5)).await;
    assert_eq!(second.attempts, 2);
    assert_eq!(second.status, NotificationStatus::Processing);

    // The first worker's claim is gone: it may neither send nor record.
    assert!(matches!(
        db.renew_lease(&first, Utc::now() + Duration::minutes(5)).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        db.mark_sent(&first, Some("late"), Utc::now()).await,
        Err(Error::InvalidTransition { .. })
    ));
    db.renew_lease(&second, Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_lease_lost_on_last_attempt_fails_the_row() {
    let db = test_db().await;
    let key = unique_key("abandoned");
    db.enqueue(&notice(&key).max_attempts(1)).await.unwrap();

    let claimed = claim_until(&db, &key, Duration::seconds(-1)).await;
    assert_eq!(claimed.attempts, 1);

    db.claim_batch(1, Utc::now(), Duration::minutes(5))
        .await
        .unwrap();

    let row = db.get_notification(&key).await.unwrap();
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error.as_deref(), Some("lease expired"));
    assert!(row.locked_until.is_none());
    assert!(row.processed_at.is_some());
}

// ---------------------------------------------------------------------------
// Derived tasks
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn test_events_generate_and_auto_complete_tasks() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let tasks = task_service(&db);
    let now = Utc::now();

    let review = EventData {
        client_name: Some("Northwind".into()),
        document_type: Some("lease".into()),
        application_id: Some("APP-77".into()),
        urgency: Some("urgent".into()),
        ..EventData::default()
    };
    let created = tasks
        .apply_event(owner.id, EventType::ReviewRequested, &review, now)
        .await
        .unwrap()
        .created
        .unwrap();
    assert_eq!(created.action_type, "review_application");
    assert_eq!(created.priority, Priority::Urgent);

    let approved = tasks
        .apply_event(owner.id, EventType::ApplicationApproved, &review, now)
        .await
        .unwrap();
    assert_eq!(approved.completed, 1);
    assert_eq!(approved.created.unwrap().action_type, "send_document");

    let done = db.get_task(created.id, owner.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());

    let informational = tasks
        .apply_event(owner.id, EventType::NotificationSent, &review, now)
        .await
        .unwrap();
    assert_eq!(informational.completed, 0);
    assert!(informational.created.is_none());
}

#[tokio::test]
#[ignore]
async fn test_task_transitions_and_expiry() {
    let db = test_db().await;
    let owner = user(&db, Role::Member).await;
    let tasks = task_service(&db);

    let data = EventData {
        client_name: Some("Contoso".into()),
        attempt: Some(2),
        ..EventData::default()
    };
    let past = Utc::now() - Duration::days(30);
    let stale = tasks
        .apply_event(owner.id, EventType::FollowUpDue, &data, past)
        .await
        .unwrap()
        .created
        .unwrap();
    let fresh = tasks
        .apply_event(owner.id, EventType::FollowUpDue, &data, Utc::now())
        .await
        .unwrap()
        .created
        .unwrap();

    let started = tasks
        .transition(fresh.id, owner.id, TaskStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    assert!(matches!(
        tasks.transition(fresh.id, owner.id, TaskStatus::Pending).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        tasks.transition(fresh.id, owner.id, TaskStatus::Expired).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        tasks.transition(stale.id, owner.id, TaskStatus::Expired).await,
        Err(Error::InvalidTransition { .. })
    ));

    tasks.expire_overdue(Utc::now(), Duration::days(7)).await.unwrap();
    assert_eq!(db.get_task(stale.id, owner.id).await.unwrap().status, TaskStatus::Expired);
    assert_eq!(db.get_task(fresh.id, owner.id).await.unwrap().status, TaskStatus::InProgress);

    let open = tasks.list(owner.id, Some(TaskStatus::InProgress)).await.unwrap();
    assert_eq!(open.len(), 1);
}
