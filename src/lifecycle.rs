//! Follow-up lifecycle: the interactive operations on a follow-up.
//!
//! Every mutation is one conditional update plus one history entry in a
//! single transaction. Notifications are never queued here; the reminder
//! and escalation scans own that.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditSink, record_best_effort};
use crate::db::{Db, FollowUpFilter};
use crate::error::{Error, Result};
use crate::model::*;
use crate::tasks::{EventData, EventType, TaskService};
use crate::telemetry::metrics;
use crate::timing::TimingProfile;

pub struct Lifecycle {
    db: Arc<Db>,
    profile: TimingProfile,
    audit: Arc<dyn AuditSink>,
    tasks: Option<Arc<TaskService>>,
    deadline: Option<Duration>,
}

impl Lifecycle {
    pub fn new(db: Arc<Db>, profile: TimingProfile, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            db,
            profile,
            audit,
            tasks: None,
            deadline: None,
        }
    }

    /// Feed lifecycle events into the derived task store.
    pub fn with_tasks(mut self, tasks: Arc<TaskService>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Bound every store call by `deadline`; overruns fail with
    /// [`Error::Timeout`].
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn create(&self, new: NewFollowUp) -> Result<FollowUp> {
        let (followup, history) = FollowUp::create(new, Utc::now(), self.profile);
        self.bounded("create", self.db.insert_followup(&followup, &history))
            .await?;

        info!(
            followup_id = %followup.id,
            user = %followup.user_id,
            due_at = %followup.due_at,
            "follow-up created"
        );
        self.audit(
            followup.user_id,
            "followup.create",
            followup.id,
            json!({ "client_name": followup.client_name, "due_at": followup.due_at }),
        )
        .await;
        Ok(followup)
    }

    /// Advance to the next attempt with a due date counted from now.
    pub async fn snooze(&self, id: FollowUpId, user_id: UserId) -> Result<FollowUp> {
        let profile = self.profile;
        let followup = self
            .bounded(
                "snooze",
                self.db.mutate_followup(id, Some(user_id), |current| {
                    current.snooze(user_id, Utc::now(), profile)
                }),
            )
            .await?;

        info!(followup_id = %id, attempt = %followup.attempt, due_at = %followup.due_at, "follow-up snoozed");
        self.audit(
            user_id,
            "followup.snooze",
            id,
            json!({ "attempt": followup.attempt, "due_at": followup.due_at }),
        )
        .await;
        Ok(followup)
    }

    pub async fn complete(
        &self,
        id: FollowUpId,
        user_id: UserId,
        reason: CompletionReason,
    ) -> Result<FollowUp> {
        let followup = self
            .bounded(
                "complete",
                self.db.mutate_followup(id, Some(user_id), |current| {
                    current.complete(user_id, reason, Utc::now())
                }),
            )
            .await?;

        info!(followup_id = %id, reason = %reason, "follow-up completed");
        self.audit(user_id, "followup.complete", id, json!({ "reason": reason }))
            .await;
        if let Some(event) = completion_event(reason) {
            self.emit_task_event(&followup, followup.user_id, event).await;
        }
        Ok(followup)
    }

    /// Give up on an overdue third attempt without escalating.
    pub async fn mark_no_response(&self, id: FollowUpId, user_id: UserId) -> Result<FollowUp> {
        let followup = self
            .bounded(
                "mark_no_response",
                self.db.mutate_followup(id, Some(user_id), |current| {
                    current.mark_no_response(Some(user_id), Utc::now())
                }),
            )
            .await?;

        info!(followup_id = %id, "follow-up marked no response");
        self.audit(user_id, "followup.no_response", id, json!({})).await;
        self.emit_task_event(&followup, followup.user_id, EventType::FollowUpNoResponse)
            .await;
        Ok(followup)
    }

    /// Close the record and start over at attempt 1, sent now.
    pub async fn resend(&self, id: FollowUpId, user_id: UserId) -> Result<FollowUp> {
        let profile = self.profile;
        let resend = self
            .bounded(
                "resend",
                self.db.resend_followup(id, user_id, |current| {
                    current.resend(user_id, Utc::now(), profile)
                }),
            )
            .await?;

        info!(followup_id = %id, fresh_id = %resend.fresh.id, "follow-up resent");
        self.audit(
            user_id,
            "followup.resend",
            id,
            json!({ "fresh_id": resend.fresh.id }),
        )
        .await;
        Ok(resend.fresh)
    }

    pub async fn stats(&self, user_id: UserId) -> Result<FollowUpStats> {
        self.bounded("stats", self.db.followup_stats(user_id, Utc::now()))
            .await
    }

    pub async fn get(&self, id: FollowUpId, user_id: UserId) -> Result<FollowUp> {
        self.bounded("get", self.db.get_followup(id, user_id)).await
    }

    pub async fn list(&self, filter: &FollowUpFilter) -> Result<Vec<FollowUp>> {
        self.bounded("list", self.db.list_followups(filter)).await
    }

    pub async fn history(&self, id: FollowUpId, user_id: UserId) -> Result<Vec<HistoryEntry>> {
        self.bounded("history", self.db.followup_history(id, user_id))
            .await
    }

    // -----------------------------------------------------------------------

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| Error::Timeout(format!("{operation} exceeded {deadline:?}")))?,
            None => fut.await,
        };
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
        result
    }

    async fn audit(&self, actor: UserId, action: &str, id: FollowUpId, details: serde_json::Value) {
        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(actor, action, format!("followup:{id}"), details),
        )
        .await;
    }

    /// Task bookkeeping follows a committed change; a failure here is logged
    /// and never undoes it.
    async fn emit_task_event(&self, followup: &FollowUp, owner: UserId, event: EventType) {
        let Some(tasks) = &self.tasks else {
            return;
        };
        let data = event_data(followup);
        if let Err(e) = tasks.apply_event(owner, event, &data, Utc::now()).await {
            warn!(followup_id = %followup.id, event = %event, error = %e, "task event failed");
        }
    }
}

/// Task event a completion reason implies, if any.
pub fn completion_event(reason: CompletionReason) -> Option<EventType> {
    match reason {
        CompletionReason::ClientResponded => Some(EventType::ClientResponded),
        CompletionReason::Signed => Some(EventType::DocumentSigned),
        CompletionReason::Paid => Some(EventType::PaymentReceived),
        CompletionReason::Cancelled | CompletionReason::Other => None,
    }
}

pub fn event_data(followup: &FollowUp) -> EventData {
    EventData {
        client_name: Some(followup.client_name.clone()),
        subject: Some(followup.subject.clone()),
        document_type: followup.document_type.clone(),
        application_id: followup.origin_ref.clone(),
        urgency: None,
        attempt: Some(followup.attempt.get()),
        sent_at: Some(followup.sent_at),
        followup_id: Some(followup.id.to_string()),
    }
}
