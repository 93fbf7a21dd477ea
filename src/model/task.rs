//! Derived tasks: actionable to-do items materialized from business events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Dismissed,
    /// Only the maintenance sweep sets this.
    Expired,
}

impl TaskStatus {
    /// Moves a user may request. `Expired` is never one of them; only
    /// the overdue sweep writes it.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Dismissed)
                | (InProgress, Completed)
                | (InProgress, Dismissed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Dismissed | TaskStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Dismissed => "dismissed",
            TaskStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "dismissed" => Ok(TaskStatus::Dismissed),
            "expired" => Ok(TaskStatus::Expired),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::Other(format!("unknown priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedTask {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub due_at: DateTime<Utc>,
    pub auto_generated: bool,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub application_id: Option<String>,
    pub client_name: Option<String>,
    pub document_type: Option<String>,
    /// Event type tag that produced this task.
    pub source_event: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task produced by a rule, not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub priority: Priority,
    pub due_at: DateTime<Utc>,
    pub auto_generated: bool,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub application_id: Option<String>,
    pub client_name: Option<String>,
    pub document_type: Option<String>,
    pub source_event: Option<String>,
}

/// Which open tasks an event completes. Every populated field must match;
/// the owning user always must.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCriteria {
    pub user_id: UserId,
    pub action_type: Option<String>,
    pub application_id: Option<String>,
    pub client_name: Option<String>,
    pub document_type: Option<String>,
}

impl CompletionCriteria {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            action_type: None,
            application_id: None,
            client_name: None,
            document_type: None,
        }
    }

    /// Evaluate against a task in memory. Mirrors the SQL the store runs.
    pub fn matches(&self, task: &DerivedTask) -> bool {
        fn field(want: &Option<String>, have: &Option<String>) -> bool {
            match want {
                None => true,
                Some(w) => have.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(w)),
            }
        }
        task.user_id == self.user_id
            && matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress)
            && self.action_type.as_ref().is_none_or(|a| *a == task.action_type)
            && field(&self.application_id, &task.application_id)
            && field(&self.client_name, &task.client_name)
            && field(&self.document_type, &task.document_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use TaskStatus::*;
        for from in [Completed, Dismissed, Expired] {
            for to in [Pending, InProgress, Completed, Dismissed, Expired] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn cannot_go_back_to_pending() {
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn expired_is_not_a_manual_target() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Expired));
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Expired));
    }

    #[test]
    fn priorities_order_by_urgency() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Low < Priority::Medium);
    }
}
