//! Typed query criteria and their translation to SQL.
//!
//! Filter shapes live here as plain structs; each has exactly one function
//! that turns it into a parameterized statement, so the translation can be
//! checked without a database.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use super::followups::FOLLOWUP_COLUMNS;
use crate::model::{CompletionCriteria, FollowUpStatus, TaskStatus, UserId};

/// Criteria for listing follow-ups.
#[derive(Debug, Clone)]
pub struct FollowUpFilter {
    pub user_id: Option<UserId>,
    pub status: Option<FollowUpStatus>,
    /// Only pending follow-ups already past due at this instant.
    pub overdue_at: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on the client name.
    pub client_name: Option<String>,
    pub escalated: Option<bool>,
    pub manager_id: Option<UserId>,
    pub limit: i64,
}

impl Default for FollowUpFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            overdue_at: None,
            client_name: None,
            escalated: None,
            manager_id: None,
            limit: 100,
        }
    }
}

impl FollowUpFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: FollowUpStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn overdue_at(mut self, now: DateTime<Utc>) -> Self {
        self.overdue_at = Some(now);
        self
    }

    pub fn client_name(mut self, needle: impl Into<String>) -> Self {
        self.client_name = Some(needle.into());
        self
    }

    pub fn escalated(mut self, escalated: bool) -> Self {
        self.escalated = Some(escalated);
        self
    }

    pub fn manager(mut self, manager_id: UserId) -> Self {
        self.manager_id = Some(manager_id);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Appends ` WHERE ` before the first condition and ` AND ` before the rest.
struct Conditions {
    any: bool,
}

impl Conditions {
    fn new() -> Self {
        Self { any: false }
    }

    fn next<'a>(&mut self, qb: &mut QueryBuilder<'a, Postgres>) {
        qb.push(if self.any { " AND " } else { " WHERE " });
        self.any = true;
    }
}

/// `SELECT` for follow-ups matching `filter`, soonest due first.
pub(crate) fn followup_select(filter: &FollowUpFilter) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {FOLLOWUP_COLUMNS} FROM followups"));
    let mut cond = Conditions::new();

    if let Some(user_id) = filter.user_id {
        cond.next(&mut qb);
        qb.push("user_id = ").push_bind(user_id.0);
    }
    if let Some(status) = filter.status {
        cond.next(&mut qb);
        qb.push("status = ").push_bind(status.as_str());
    }
    if let Some(now) = filter.overdue_at {
        cond.next(&mut qb);
        qb.push("status = 'pending' AND due_at < ").push_bind(now);
    }
    if let Some(ref needle) = filter.client_name {
        cond.next(&mut qb);
        qb.push("client_name ILIKE ")
            .push_bind(format!("%{}%", escape_like(needle)));
    }
    if let Some(escalated) = filter.escalated {
        cond.next(&mut qb);
        qb.push("escalated = ").push_bind(escalated);
    }
    if let Some(manager_id) = filter.manager_id {
        cond.next(&mut qb);
        qb.push("manager_id = ").push_bind(manager_id.0);
    }

    qb.push(" ORDER BY due_at ASC, created_at ASC LIMIT ")
        .push_bind(filter.limit.max(1));
    qb
}

/// `UPDATE` that completes every open task matching `criteria`.
pub(crate) fn completion_update(
    criteria: &CompletionCriteria,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE derived_tasks SET status = ");
    qb.push_bind(TaskStatus::Completed.as_str())
        .push(", completed_at = ")
        .push_bind(now)
        .push(", updated_at = ")
        .push_bind(now)
        .push(" WHERE user_id = ")
        .push_bind(criteria.user_id.0)
        .push(" AND status IN ('pending', 'in_progress')");

    if let Some(ref action_type) = criteria.action_type {
        qb.push(" AND action_type = ").push_bind(action_type.clone());
    }
    if let Some(ref application_id) = criteria.application_id {
        qb.push(" AND lower(application_id) = lower(")
            .push_bind(application_id.clone())
            .push(")");
    }
    if let Some(ref client_name) = criteria.client_name {
        qb.push(" AND lower(client_name) = lower(")
            .push_bind(client_name.clone())
            .push(")");
    }
    if let Some(ref document_type) = criteria.document_type {
        qb.push(" AND lower(document_type) = lower(")
            .push_bind(document_type.clone())
            .push(")");
    }
    qb
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
