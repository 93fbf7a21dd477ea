//! Escalation and reminder scans.
//!
//! Both scans select candidates, then handle each row in its own
//! transaction. A failing row is logged and counted and the scan moves on;
//! only an unreachable store ends the scan early.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{Instrument, debug, info, warn};

use crate::audit::{AuditEntry, AuditSink, record_best_effort};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::lifecycle::event_data;
use crate::model::*;
use crate::tasks::{EventType, TaskService};
use crate::telemetry::{metrics, spans};
use crate::templates;
use crate::timing::TimingProfile;

/// Rows examined per scan. The next tick picks up the rest.
const SCAN_LIMIT: i64 = 500;

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub examined: usize,
    /// Escalated to a manager (escalation scan) or reminded (reminder scan).
    pub notified: usize,
    /// Moved to no_response without a manager.
    pub closed: usize,
    /// Changed by someone else between selection and lock.
    pub skipped: usize,
    pub failed: usize,
}

enum RowOutcome {
    Notified,
    Closed,
}

pub struct EscalationScanner {
    db: Arc<Db>,
    profile: TimingProfile,
    audit: Arc<dyn AuditSink>,
    tasks: Option<Arc<TaskService>>,
    max_attempts: u32,
}

impl EscalationScanner {
    pub fn new(db: Arc<Db>, profile: TimingProfile, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            db,
            profile,
            audit,
            tasks: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_tasks(mut self, tasks: Arc<TaskService>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Delivery attempts for the notifications this scanner queues.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Move overdue third attempts to no_response, escalating to a manager
    /// unless the owner is one. Safe to run concurrently and repeatedly.
    pub async fn scan_and_escalate(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let span = spans::start_scan_span("escalation");
        let cutoff = now - self.profile.escalation_grace();

        async {
            let candidates = self.db.escalation_candidates(cutoff, SCAN_LIMIT).await?;
            let mut report = ScanReport {
                examined: candidates.len(),
                ..ScanReport::default()
            };

            for followup in &candidates {
                match self.escalate_one(followup, now).await {
                    Ok(RowOutcome::Notified) => {
                        report.notified += 1;
                        metrics::escalations().add(1, &[KeyValue::new("result", "escalated")]);
                    }
                    Ok(RowOutcome::Closed) => {
                        report.closed += 1;
                        metrics::escalations().add(1, &[KeyValue::new("result", "no_response")]);
                    }
                    Err(Error::InvalidTransition { from, .. }) => {
                        debug!(followup_id = %followup.id, from = %from, "already handled elsewhere");
                        report.skipped += 1;
                    }
                    Err(e) if e.is_dependency_unavailable() => return Err(e),
                    Err(e) => {
                        warn!(followup_id = %followup.id, error = %e, "escalation failed");
                        metrics::escalations().add(1, &[KeyValue::new("result", "error")]);
                        report.failed += 1;
                    }
                }
            }

            spans::record_processed(&tracing::Span::current(), report.examined);
            if report.examined > 0 {
                info!(
                    examined = report.examined,
                    escalated = report.notified,
                    no_response = report.closed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "escalation scan finished"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn escalate_one(&self, candidate: &FollowUp, now: DateTime<Utc>) -> Result<RowOutcome> {
        let owner = self.db.get_user(candidate.user_id).await?;

        let manager = if owner.is_manager() {
            None
        } else {
            let found = self.db.find_manager_excluding(owner.id).await?;
            if found.is_none() {
                warn!(followup_id = %candidate.id, owner = %owner.id, "no manager available, closing without escalation");
            }
            found
        };

        let Some(manager) = manager else {
            let followup = self
                .db
                .mutate_followup(candidate.id, None, |current| current.mark_no_response(None, now))
                .await?;
            self.audit("followup.no_response", &followup, json!({ "escalated": false }))
                .await;
            self.emit_task_event(&followup, owner.id, EventType::FollowUpNoResponse)
                .await;
            return Ok(RowOutcome::Closed);
        };

        let max_attempts = self.max_attempts;
        let (followup, enqueued) = self
            .db
            .mutate_followup_with_notice(candidate.id, None, |current| {
                let transition = current.escalate(manager.id, now)?;
                let email = templates::escalation(current, &owner, &manager);
                let notice =
                    NewNotification::new(escalation_key(current.id), &manager.email, email.subject, email.html)
                        .user(manager.id)
                        .max_attempts(max_attempts);
                Ok((transition, Some(notice)))
            })
            .await?;

        info!(
            followup_id = %followup.id,
            manager = %manager.id,
            duplicate = matches!(enqueued, Some(EnqueueResult::Duplicate)),
            "follow-up escalated"
        );
        self.audit(
            "followup.escalate",
            &followup,
            json!({ "manager_id": manager.id.to_string() }),
        )
        .await;
        self.emit_task_event(&followup, owner.id, EventType::FollowUpNoResponse)
            .await;
        self.emit_task_event(&followup, manager.id, EventType::FollowUpEscalated)
            .await;
        Ok(RowOutcome::Notified)
    }

    /// Queue one reminder per attempt for pending follow-ups that are due.
    pub async fn scan_due_reminders(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let span = spans::start_scan_span("reminder");

        async {
            let candidates = self.db.reminder_candidates(now, SCAN_LIMIT).await?;
            let mut report = ScanReport {
                examined: candidates.len(),
                ..ScanReport::default()
            };

            for followup in &candidates {
                match self.remind_one(followup, now).await {
                    Ok(_) => report.notified += 1,
                    Err(Error::InvalidTransition { from, .. }) => {
                        debug!(followup_id = %followup.id, from = %from, "reminder no longer needed");
                        report.skipped += 1;
                    }
                    Err(e) if e.is_dependency_unavailable() => return Err(e),
                    Err(e) => {
                        warn!(followup_id = %followup.id, error = %e, "reminder failed");
                        report.failed += 1;
                    }
                }
            }

            spans::record_processed(&tracing::Span::current(), report.examined);
            if report.examined > 0 {
                info!(
                    examined = report.examined,
                    reminded = report.notified,
                    skipped = report.skipped,
                    failed = report.failed,
                    "reminder scan finished"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn remind_one(&self, candidate: &FollowUp, now: DateTime<Utc>) -> Result<RowOutcome> {
        let owner = self.db.get_user(candidate.user_id).await?;
        let max_attempts = self.max_attempts;

        let (followup, _) = self
            .db
            .mutate_followup_with_notice(candidate.id, None, |current| {
                let transition = current.record_reminder(now)?;
                let email = templates::reminder(current);
                let notice = NewNotification::new(
                    reminder_key(current.id, current.attempt),
                    &owner.email,
                    email.subject,
                    email.html,
                )
                .user(owner.id)
                .max_attempts(max_attempts);
                Ok((transition, Some(notice)))
            })
            .await?;

        debug!(followup_id = %followup.id, attempt = %followup.attempt, "reminder queued");
        self.emit_task_event(&followup, owner.id, EventType::FollowUpDue)
            .await;
        Ok(RowOutcome::Notified)
    }

    async fn audit(&self, action: &str, followup: &FollowUp, details: serde_json::Value) {
        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new("system", action, format!("followup:{}", followup.id), details),
        )
        .await;
    }

    async fn emit_task_event(&self, followup: &FollowUp, user: UserId, event: EventType) {
        let Some(tasks) = &self.tasks else {
            return;
        };
        if let Err(e) = tasks
            .apply_event(user, event, &event_data(followup), Utc::now())
            .await
        {
            warn!(followup_id = %followup.id, event = %event, error = %e, "task event failed");
        }
    }
}
