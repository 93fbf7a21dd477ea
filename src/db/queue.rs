//! Notification delivery queue: idempotent enqueue, lock-skipping dequeue,
//! bounded retry.
//!
//! Delivery is at-least-once. Dedup happens at enqueue time through the
//! unique logical notification id; mutual exclusion between workers comes
//! from `FOR UPDATE SKIP LOCKED` plus a claim lease.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use tracing::warn;

const QUEUE_COLUMNS: &str = "id, notification_id, user_id, to_address, subject, body, status, attempts, max_attempts, last_error, provider_message_id, created_at, scheduled_for, locked_until, processed_at";

impl super::Db {
    /// Enqueue a notification. A second call with the same logical id is a
    /// no-op that reports [`EnqueueResult::Duplicate`]; the first body wins.
    pub async fn enqueue(&self, new: &NewNotification) -> Result<EnqueueResult> {
        let mut conn = self.pool().acquire().await?;
        enqueue_on(&mut conn, new, Utc::now()).await
    }

    /// Claim up to `batch_size` deliverable rows for this worker.
    ///
    /// Selection and claim happen in one transaction: rows are read with
    /// `FOR UPDATE SKIP LOCKED`, then marked processing with `attempts + 1`
    /// and a lease before the locks are released. Two workers never get
    /// the same row. The batch comes back in creation order.
    ///
    /// Rows whose lease ran out on their final attempt are failed first;
    /// they can never be claimed again.
    pub async fn claim_batch(
        &self,
        batch_size: i64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<QueuedNotification>> {
        let mut tx = self.begin().await?;
        let abandoned = fail_abandoned_on(&mut tx, now).await?;
        if abandoned > 0 {
            warn!(count = abandoned, "failed notifications whose last attempt lost its lease");
            metrics::deliveries().add(abandoned, &[KeyValue::new("outcome", "failed")]);
        }
        let selected = dequeue_on(&mut tx, batch_size, now).await?;
        if selected.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = selected.iter().map(|n| n.id).collect();
        let claimed = claim_on(&mut tx, &ids, now, now + lease).await?;
        tx.commit().await?;

        metrics::queue_operations().add(
            claimed.len() as u64,
            &[KeyValue::new("operation", "claim")],
        );
        Ok(claimed)
    }

    /// Push a claimed row's lease out to `locked_until` just before sending
    /// it. Fails with [`Error::InvalidTransition`] when the claim was lost,
    /// i.e. another worker reclaimed the row after the old lease ran out.
    pub async fn renew_lease(&self, row: &QueuedNotification, locked_until: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE notification_queue SET locked_until = $1
             WHERE id = $2 AND status = 'processing' AND attempts = $3",
        )
        .bind(locked_until)
        .bind(row.id)
        .bind(row.attempts as i32)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::invalid_transition(
                format!("notification {} (claim lost)", row.notification_id),
                NotificationStatus::Processing,
            ));
        }
        Ok(())
    }

    /// Record a successful send. The row is immutable afterwards.
    pub async fn mark_sent(
        &self,
        row: &QueuedNotification,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE notification_queue
             SET status = 'sent', processed_at = $1, provider_message_id = $2, locked_until = NULL, updated_at = $1
             WHERE id = $3 AND status = 'processing' AND attempts = $4",
        )
        .bind(now)
        .bind(provider_message_id)
        .bind(row.id)
        .bind(row.attempts as i32)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::invalid_transition(
                format!("notification {} (claim lost)", row.notification_id),
                NotificationStatus::Sent,
            ));
        }
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "mark_sent")]);
        Ok(())
    }

    /// Record a failed send: back to pending with linear backoff, or failed
    /// for good once attempts are exhausted.
    pub async fn mark_failed(
        &self,
        row: &QueuedNotification,
        error: &str,
        now: DateTime<Utc>,
        base_delay: Duration,
    ) -> Result<FailureOutcome> {
        let outcome = row.failure_outcome(now, base_delay);
        let (status, scheduled_for, processed_at) = match outcome {
            FailureOutcome::Retry { scheduled_for } => {
                (NotificationStatus::Pending, scheduled_for, None)
            }
            FailureOutcome::Exhausted => (NotificationStatus::Failed, row.scheduled_for, Some(now)),
        };

        let rows_affected = sqlx::query(
            "UPDATE notification_queue
             SET status = $1, last_error = $2, scheduled_for = GREATEST(scheduled_for, $3),
                 processed_at = $4, locked_until = NULL, updated_at = $5
             WHERE id = $6 AND status = 'processing' AND attempts = $7",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(scheduled_for)
        .bind(processed_at)
        .bind(now)
        .bind(row.id)
        .bind(row.attempts as i32)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::invalid_transition(
                format!("notification {} (claim lost)", row.notification_id),
                status,
            ));
        }
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "mark_failed")]);
        Ok(outcome)
    }

    /// Suppress a notification that has not been picked up yet. Returns
    /// false when the row is missing or no longer pending.
    pub async fn cancel_notification(&self, notification_id: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE notification_queue SET status = 'cancelled', updated_at = now()
             WHERE notification_id = $1 AND status = 'pending'",
        )
        .bind(notification_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        metrics::queue_operations().add(1, &[KeyValue::new("operation", "cancel")]);
        Ok(rows_affected > 0)
    }

    /// Look up a queued notification by logical id.
    pub async fn get_notification(&self, notification_id: &str) -> Result<QueuedNotification> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {QUEUE_COLUMNS} FROM notification_queue WHERE notification_id = $1"
        ))
        .bind(notification_id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("notification {notification_id}")))?
            .try_into_notification()
    }

    /// Number of rows per status.
    pub async fn queue_counts(&self) -> Result<Vec<(NotificationStatus, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notification_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(status, n)| Ok((status.parse()?, n)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Inner functions
// ---------------------------------------------------------------------------

pub(crate) async fn enqueue_on(
    conn: &mut PgConnection,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<EnqueueResult> {
    let max_attempts = i32::try_from(new.max_attempts).map_err(|_| {
        Error::Other(format!(
            "max_attempts {} out of range for {}",
            new.max_attempts, new.notification_id
        ))
    })?;
    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO notification_queue (notification_id, user_id, to_address, subject, body, status, attempts, max_attempts, created_at, scheduled_for, updated_at)
         VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $7)
         ON CONFLICT (notification_id) DO NOTHING
         RETURNING id",
    )
    .bind(&new.notification_id)
    .bind(new.user_id.map(|u| u.0))
    .bind(&new.to_address)
    .bind(&new.subject)
    .bind(&new.body)
    .bind(max_attempts)
    .bind(now)
    .bind(new.scheduled_for.unwrap_or(now))
    .fetch_optional(&mut *conn)
    .await?;

    let result = match inserted {
        Some((id,)) => EnqueueResult::Queued(id),
        None => EnqueueResult::Duplicate,
    };
    metrics::notifications_enqueued().add(
        1,
        &[KeyValue::new(
            "result",
            if matches!(result, EnqueueResult::Queued(_)) {
                "ok"
            } else {
                "duplicate"
            },
        )],
    );
    Ok(result)
}

/// Fail `processing` rows whose lease expired after their last permitted
/// attempt was counted. Returns how many were failed.
pub(crate) async fn fail_abandoned_on(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<u64> {
    let rows_affected = sqlx::query(
        "UPDATE notification_queue
         SET status = 'failed', last_error = 'lease expired', processed_at = $1,
             locked_until = NULL, updated_at = $1
         WHERE status = 'processing'
           AND attempts >= max_attempts
           AND (locked_until IS NULL OR locked_until <= $1)",
    )
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows_affected)
}

/// Select deliverable rows, locking them and skipping rows another
/// transaction already holds. Must run inside the transaction that claims
/// them.
pub(crate) async fn dequeue_on(
    conn: &mut PgConnection,
    batch_size: i64,
    now: DateTime<Utc>,
) -> Result<Vec<QueuedNotification>> {
    let rows: Vec<QueueRow> = sqlx::query_as(&format!(
        "SELECT {QUEUE_COLUMNS} FROM notification_queue
         WHERE attempts < max_attempts
           AND scheduled_for <= $1
           AND (status = 'pending'
                OR (status = 'processing' AND (locked_until IS NULL OR locked_until <= $1)))
         ORDER BY created_at ASC, id ASC
         LIMIT $2
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(now)
    .bind(batch_size.max(1))
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(QueueRow::try_into_notification).collect()
}

/// Mark selected rows processing, count the attempt, and set the lease.
pub(crate) async fn claim_on(
    conn: &mut PgConnection,
    ids: &[i64],
    now: DateTime<Utc>,
    locked_until: DateTime<Utc>,
) -> Result<Vec<QueuedNotification>> {
    let rows: Vec<QueueRow> = sqlx::query_as(&format!(
        "UPDATE notification_queue
         SET status = 'processing', attempts = attempts + 1, locked_until = $2, updated_at = $3
         WHERE id = ANY($1)
         RETURNING {QUEUE_COLUMNS}"
    ))
    .bind(ids)
    .bind(locked_until)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    let mut claimed = rows
        .into_iter()
        .map(QueueRow::try_into_notification)
        .collect::<Result<Vec<_>>>()?;
    claimed.sort_by_key(|n| (n.created_at, n.id));
    Ok(claimed)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    notification_id: String,
    user_id: Option<Uuid>,
    to_address: String,
    subject: String,
    body: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    created_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl QueueRow {
    fn try_into_notification(self) -> Result<QueuedNotification> {
        Ok(QueuedNotification {
            id: self.id,
            notification_id: self.notification_id,
            user_id: self.user_id.map(UserId),
            to_address: self.to_address,
            subject: self.subject,
            body: self.body,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            last_error: self.last_error,
            provider_message_id: self.provider_message_id,
            created_at: self.created_at,
            scheduled_for: self.scheduled_for,
            locked_until: self.locked_until,
            processed_at: self.processed_at,
        })
    }
}
