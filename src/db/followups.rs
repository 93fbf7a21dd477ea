//! Follow-up persistence: rows, history, and transactional state changes.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::filter::{FollowUpFilter, followup_select};
use super::queue::enqueue_on;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

pub(crate) const FOLLOWUP_COLUMNS: &str = "id, user_id, subject, client_name, client_email, document_type, origin_ref, attempt, sent_at, due_at, status, completed_at, completed_reason, escalated, escalated_at, manager_id, reminded_attempt, resent_from, created_at, updated_at";

impl super::Db {
    /// Insert a new follow-up together with its `created` history entry.
    pub async fn insert_followup(&self, followup: &FollowUp, history: &HistoryDraft) -> Result<()> {
        let mut tx = self.begin().await?;
        insert_followup_on(&mut tx, followup).await?;
        insert_history_on(&mut tx, history).await?;
        tx.commit().await?;
        record_transition(history);
        Ok(())
    }

    /// Get a follow-up owned by `user_id`.
    pub async fn get_followup(&self, id: FollowUpId, user_id: UserId) -> Result<FollowUp> {
        let mut conn = self.pool().acquire().await?;
        get_followup_on(&mut conn, id, Some(user_id), false)
            .await?
            .ok_or_else(|| Error::NotFound(format!("follow-up {id}")))
    }

    /// Lock the row, compute a transition from its current state, and write
    /// the change plus its history entry in one transaction.
    ///
    /// `user_id = None` is used by background scans, which act on any owner.
    pub async fn mutate_followup<F>(
        &self,
        id: FollowUpId,
        user_id: Option<UserId>,
        change: F,
    ) -> Result<FollowUp>
    where
        F: FnOnce(&FollowUp) -> Result<Transition>,
    {
        let (followup, _) = self
            .mutate_followup_with_notice(id, user_id, |current| Ok((change(current)?, None)))
            .await?;
        Ok(followup)
    }

    /// Like [`mutate_followup`](Self::mutate_followup), but the change may
    /// also produce a notification, enqueued inside the same transaction.
    pub async fn mutate_followup_with_notice<F>(
        &self,
        id: FollowUpId,
        user_id: Option<UserId>,
        change: F,
    ) -> Result<(FollowUp, Option<EnqueueResult>)>
    where
        F: FnOnce(&FollowUp) -> Result<(Transition, Option<NewNotification>)>,
    {
        let mut tx = self.begin().await?;
        let current = get_followup_on(&mut tx, id, user_id, true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("follow-up {id}")))?;

        let (transition, notice) = change(&current)?;
        apply_transition_on(&mut tx, &transition).await?;
        insert_history_on(&mut tx, &transition.history).await?;
        let enqueued = match notice {
            Some(notice) => Some(enqueue_on(&mut tx, &notice, Utc::now()).await?),
            None => None,
        };
        tx.commit().await?;

        record_transition(&transition.history);
        Ok((transition.updated, enqueued))
    }

    /// Close a follow-up and insert its replacement atomically.
    pub async fn resend_followup<F>(&self, id: FollowUpId, user_id: UserId, change: F) -> Result<Resend>
    where
        F: FnOnce(&FollowUp) -> Result<Resend>,
    {
        let mut tx = self.begin().await?;
        let current = get_followup_on(&mut tx, id, Some(user_id), true)
            .await?
            .ok_or_else(|| Error::NotFound(format!("follow-up {id}")))?;

        let resend = change(&current)?;
        apply_transition_on(&mut tx, &resend.superseded).await?;
        insert_history_on(&mut tx, &resend.superseded.history).await?;
        insert_followup_on(&mut tx, &resend.fresh).await?;
        insert_history_on(&mut tx, &resend.fresh_history).await?;
        tx.commit().await?;

        record_transition(&resend.superseded.history);
        record_transition(&resend.fresh_history);
        Ok(resend)
    }

    /// List follow-ups matching a typed filter.
    pub async fn list_followups(&self, filter: &FollowUpFilter) -> Result<Vec<FollowUp>> {
        let rows: Vec<FollowUpRow> = followup_select(filter)
            .build_query_as()
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(FollowUpRow::try_into_followup).collect()
    }

    /// History of a follow-up in the order entries were written.
    pub async fn followup_history(&self, id: FollowUpId, user_id: UserId) -> Result<Vec<HistoryEntry>> {
        // Ownership check doubles as existence check.
        self.get_followup(id, user_id).await?;

        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT id, followup_id, user_id, action, previous_status, new_status, note, created_at
             FROM followup_history WHERE followup_id = $1 ORDER BY id ASC",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(HistoryRow::try_into_entry).collect()
    }

    /// Aggregate counts for one user. "Today" is the UTC day containing `now`.
    pub async fn followup_stats(&self, user_id: UserId, now: DateTime<Utc>) -> Result<FollowUpStats> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let day_end = day_start + Duration::days(1);

        let (pending, completed, no_response, overdue, due_today): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'no_response'),
                    COUNT(*) FILTER (WHERE status = 'pending' AND due_at < $2),
                    COUNT(*) FILTER (WHERE status = 'pending' AND due_at >= $3 AND due_at < $4)
                 FROM followups WHERE user_id = $1",
            )
            .bind(user_id.0)
            .bind(now)
            .bind(day_start)
            .bind(day_end)
            .fetch_one(self.pool())
            .await?;

        Ok(FollowUpStats {
            pending,
            completed,
            no_response,
            overdue,
            due_today,
        })
    }

    /// Third-attempt follow-ups overdue since before `cutoff` that have not
    /// been escalated yet.
    pub async fn escalation_candidates(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<FollowUp>> {
        let rows: Vec<FollowUpRow> = sqlx::query_as(&format!(
            "SELECT {FOLLOWUP_COLUMNS} FROM followups
             WHERE status = 'pending' AND attempt = $1 AND escalated = false AND due_at < $2
             ORDER BY due_at ASC
             LIMIT $3"
        ))
        .bind(i16::from(Attempt::MAX.get()))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(FollowUpRow::try_into_followup).collect()
    }

    /// Pending follow-ups past due whose current attempt has no reminder yet.
    pub async fn reminder_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FollowUp>> {
        let rows: Vec<FollowUpRow> = sqlx::query_as(&format!(
            "SELECT {FOLLOWUP_COLUMNS} FROM followups
             WHERE status = 'pending' AND reminded_attempt < attempt AND due_at <= $1
             ORDER BY due_at ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(FollowUpRow::try_into_followup).collect()
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept &mut PgConnection so they work with both a pooled
// connection and a transaction (which derefs to one).
// ---------------------------------------------------------------------------

async fn insert_followup_on(conn: &mut PgConnection, f: &FollowUp) -> Result<()> {
    sqlx::query(
        "INSERT INTO followups (id, user_id, subject, client_name, client_email, document_type, origin_ref, attempt, sent_at, due_at, status, completed_at, completed_reason, escalated, escalated_at, manager_id, reminded_attempt, resent_from, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
    )
    .bind(f.id.0)
    .bind(f.user_id.0)
    .bind(&f.subject)
    .bind(&f.client_name)
    .bind(&f.client_email)
    .bind(&f.document_type)
    .bind(&f.origin_ref)
    .bind(i16::from(f.attempt.get()))
    .bind(f.sent_at)
    .bind(f.due_at)
    .bind(f.status.as_str())
    .bind(f.completed_at)
    .bind(f.completed_reason.map(CompletionReason::as_str))
    .bind(f.escalated)
    .bind(f.escalated_at)
    .bind(f.manager_id.map(|m| m.0))
    .bind(i16::from(f.reminded_attempt))
    .bind(f.resent_from.map(|r| r.0))
    .bind(f.created_at)
    .bind(f.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn get_followup_on(
    conn: &mut PgConnection,
    id: FollowUpId,
    user_id: Option<UserId>,
    for_update: bool,
) -> Result<Option<FollowUp>> {
    let sql = format!(
        "SELECT {FOLLOWUP_COLUMNS} FROM followups
         WHERE id = $1 AND ($2::uuid IS NULL OR user_id = $2){}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<FollowUpRow> = sqlx::query_as(&sql)
        .bind(id.0)
        .bind(user_id.map(|u| u.0))
        .fetch_optional(&mut *conn)
        .await?;
    row.map(FollowUpRow::try_into_followup).transpose()
}

/// Write the mutable columns of a transition, guarded by the status and
/// attempt the transition was computed from.
async fn apply_transition_on(conn: &mut PgConnection, t: &Transition) -> Result<()> {
    let f = &t.updated;
    let rows_affected = sqlx::query(
        "UPDATE followups SET attempt = $1, due_at = $2, status = $3, completed_at = $4, completed_reason = $5,
                escalated = $6, escalated_at = $7, manager_id = $8, reminded_attempt = $9, updated_at = $10
         WHERE id = $11 AND status = $12 AND attempt = $13",
    )
    .bind(i16::from(f.attempt.get()))
    .bind(f.due_at)
    .bind(f.status.as_str())
    .bind(f.completed_at)
    .bind(f.completed_reason.map(CompletionReason::as_str))
    .bind(f.escalated)
    .bind(f.escalated_at)
    .bind(f.manager_id.map(|m| m.0))
    .bind(i16::from(f.reminded_attempt))
    .bind(f.updated_at)
    .bind(f.id.0)
    .bind(t.expected_status.as_str())
    .bind(i16::from(t.expected_attempt.get()))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(Error::invalid_transition(t.expected_status, f.status));
    }
    Ok(())
}

async fn insert_history_on(conn: &mut PgConnection, h: &HistoryDraft) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO followup_history (followup_id, user_id, action, previous_status, new_status, note, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING id",
    )
    .bind(h.followup_id.0)
    .bind(h.actor.map(|a| a.0))
    .bind(h.action.as_str())
    .bind(h.previous_status.map(FollowUpStatus::as_str))
    .bind(h.new_status.map(FollowUpStatus::as_str))
    .bind(&h.note)
    .bind(h.created_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

fn record_transition(h: &HistoryDraft) {
    metrics::followup_transitions().add(1, &[KeyValue::new("action", h.action.as_str())]);
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct FollowUpRow {
    id: Uuid,
    user_id: Uuid,
    subject: String,
    client_name: String,
    client_email: Option<String>,
    document_type: Option<String>,
    origin_ref: Option<String>,
    attempt: i16,
    sent_at: DateTime<Utc>,
    due_at: DateTime<Utc>,
    status: String,
    completed_at: Option<DateTime<Utc>>,
    completed_reason: Option<String>,
    escalated: bool,
    escalated_at: Option<DateTime<Utc>>,
    manager_id: Option<Uuid>,
    reminded_attempt: i16,
    resent_from: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FollowUpRow {
    pub(crate) fn try_into_followup(self) -> Result<FollowUp> {
        let attempt = u8::try_from(self.attempt)
            .ok()
            .and_then(Attempt::new)
            .ok_or_else(|| Error::Other(format!("attempt out of range in store: {}", self.attempt)))?;

        Ok(FollowUp {
            id: FollowUpId(self.id),
            user_id: UserId(self.user_id),
            subject: self.subject,
            client_name: self.client_name,
            client_email: self.client_email,
            document_type: self.document_type,
            origin_ref: self.origin_ref,
            attempt,
            sent_at: self.sent_at,
            due_at: self.due_at,
            status: self.status.parse()?,
            completed_at: self.completed_at,
            completed_reason: self.completed_reason.as_deref().map(str::parse).transpose()?,
            escalated: self.escalated,
            escalated_at: self.escalated_at,
            manager_id: self.manager_id.map(UserId),
            reminded_attempt: self.reminded_attempt.clamp(0, 3) as u8,
            resent_from: self.resent_from.map(FollowUpId),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    followup_id: Uuid,
    user_id: Option<Uuid>,
    action: String,
    previous_status: Option<String>,
    new_status: Option<String>,
    note: Option<String>,
    created_at: DateTime<Utc>,
}

impl HistoryRow {
    fn try_into_entry(self) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: self.id,
            followup_id: FollowUpId(self.followup_id),
            actor: self.user_id.map(UserId),
            action: self.action.parse()?,
            previous_status: self.previous_status.as_deref().map(str::parse).transpose()?,
            new_status: self.new_status.as_deref().map(str::parse).transpose()?,
            note: self.note,
            created_at: self.created_at,
        })
    }
}
