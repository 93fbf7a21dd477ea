//! Queued notifications: one durable, deduplicated unit of outbound email.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{FollowUpId, UserId};
use crate::error::{Error, Result};

/// Default number of delivery attempts before a row is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "processing" => Ok(NotificationStatus::Processing),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "cancelled" => Ok(NotificationStatus::Cancelled),
            other => Err(Error::Other(format!("unknown notification status: {other}"))),
        }
    }
}

/// A row of the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: i64,
    /// Logical notification id. Unique across the queue.
    pub notification_id: String,
    pub user_id: Option<UserId>,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    /// Claim lease. A processing row becomes claimable again once it passes.
    pub locked_until: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// What to do with a row whose delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, not before the given instant.
    Retry { scheduled_for: DateTime<Utc> },
    /// Attempts exhausted.
    Exhausted,
}

impl QueuedNotification {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Linear backoff keyed on the attempt count: the n-th failure waits
    /// `base_delay * n`. `attempts` was already incremented by the claim.
    /// The schedule never moves backwards.
    pub fn failure_outcome(&self, now: DateTime<Utc>, base_delay: Duration) -> FailureOutcome {
        if self.attempts_exhausted() {
            return FailureOutcome::Exhausted;
        }
        let next = now + base_delay * self.attempts.max(1) as i32;
        FailureOutcome::Retry {
            scheduled_for: next.max(self.scheduled_for),
        }
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new row was inserted.
    Queued(i64),
    /// A row with this logical id already existed; nothing changed.
    Duplicate,
}

/// Builder for an enqueue request.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub(crate) notification_id: String,
    pub(crate) user_id: Option<UserId>,
    pub(crate) to_address: String,
    pub(crate) subject: String,
    pub(crate) body: String,
    pub(crate) scheduled_for: Option<DateTime<Utc>>,
    pub(crate) max_attempts: u32,
}

impl NewNotification {
    pub fn new(
        notification_id: impl Into<String>,
        to_address: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            user_id: None,
            to_address: to_address.into(),
            subject: subject.into(),
            body: body.into(),
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Deliver no earlier than `at`. Defaults to enqueue time.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn notification_id(&self) -> &str {
        &self.notification_id
    }
}

/// Logical id of the reminder for one attempt of a follow-up.
pub fn reminder_key(id: FollowUpId, attempt: super::Attempt) -> String {
    format!("followup:{id}:reminder:{attempt}")
}

/// Logical id of the escalation notice for a follow-up.
pub fn escalation_key(id: FollowUpId) -> String {
    format!("followup:{id}:escalation")
}
