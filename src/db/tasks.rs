//! Derived task persistence.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::filter::completion_update;
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const TASK_COLUMNS: &str = "id, user_id, title, description, category, priority, status, due_at, auto_generated, action_type, action_payload, application_id, client_name, document_type, source_event, created_at, updated_at, completed_at";

/// What applying one event to the task store did.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Open tasks completed by the event's completion criteria.
    pub completed: u64,
    /// The task the event produced, if any.
    pub created: Option<DerivedTask>,
}

impl super::Db {
    /// Complete matching tasks and insert the new one in a single
    /// transaction, so "approved" closes the review and opens the send task
    /// together or not at all.
    pub async fn apply_task_changes(
        &self,
        complete: Option<&CompletionCriteria>,
        create: Option<&NewTask>,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        let mut tx = self.begin().await?;
        let completed = match complete {
            Some(criteria) => auto_complete_on(&mut tx, criteria, now).await?,
            None => 0,
        };
        let created = match create {
            Some(task) => Some(insert_task_on(&mut tx, task, now).await?),
            None => None,
        };
        tx.commit().await?;

        if completed > 0 {
            metrics::tasks_completed().add(completed, &[KeyValue::new("reason", "auto")]);
        }
        if let Some(ref task) = created {
            metrics::tasks_generated().add(
                1,
                &[KeyValue::new(
                    "event_type",
                    task.source_event.clone().unwrap_or_default(),
                )],
            );
        }
        Ok(TaskOutcome { completed, created })
    }

    pub async fn get_task(&self, id: TaskId, user_id: UserId) -> Result<DerivedTask> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM derived_tasks WHERE id = $1 AND user_id = $2"
        ))
        .bind(id.0)
        .bind(user_id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    /// Move a task along its state machine. Terminal states never change.
    pub async fn transition_task(
        &self,
        id: TaskId,
        user_id: UserId,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<DerivedTask> {
        let current = self.get_task(id, user_id).await?;
        if !current.status.can_transition_to(to) {
            return Err(Error::invalid_transition(current.status, to));
        }
        let completed_at = (to == TaskStatus::Completed).then_some(now);

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE derived_tasks SET status = $1, updated_at = $2, completed_at = COALESCE($3, completed_at)
             WHERE id = $4 AND user_id = $5 AND status = $6
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(now)
        .bind(completed_at)
        .bind(id.0)
        .bind(user_id.0)
        .bind(current.status.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::invalid_transition(current.status, to))?
            .try_into_task()
    }

    /// Expire open tasks that have been overdue for longer than `grace`.
    pub async fn expire_overdue_tasks(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE derived_tasks SET status = 'expired', updated_at = $1
             WHERE status IN ('pending', 'in_progress') AND due_at < $2",
        )
        .bind(now)
        .bind(now - grace)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            metrics::tasks_completed().add(rows_affected, &[KeyValue::new("reason", "expired")]);
        }
        Ok(rows_affected)
    }

    /// Tasks for a user, optionally narrowed to one status, soonest due first.
    pub async fn list_tasks(&self, user_id: UserId, status: Option<TaskStatus>) -> Result<Vec<DerivedTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM derived_tasks
             WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)
             ORDER BY due_at ASC"
        ))
        .bind(user_id.0)
        .bind(status.map(TaskStatus::as_str))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

// ---------------------------------------------------------------------------
// Inner functions
// ---------------------------------------------------------------------------

async fn insert_task_on(conn: &mut PgConnection, task: &NewTask, now: DateTime<Utc>) -> Result<DerivedTask> {
    let row: TaskRow = sqlx::query_as(&format!(
        "INSERT INTO derived_tasks (id, user_id, title, description, category, priority, status, due_at, auto_generated, action_type, action_payload, application_id, client_name, document_type, source_event, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
         RETURNING {TASK_COLUMNS}"
    ))
    .bind(TaskId::new().0)
    .bind(task.user_id.0)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.category)
    .bind(task.priority.as_str())
    .bind(task.due_at)
    .bind(task.auto_generated)
    .bind(&task.action_type)
    .bind(&task.action_payload)
    .bind(&task.application_id)
    .bind(&task.client_name)
    .bind(&task.document_type)
    .bind(&task.source_event)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into_task()
}

async fn auto_complete_on(
    conn: &mut PgConnection,
    criteria: &CompletionCriteria,
    now: DateTime<Utc>,
) -> Result<u64> {
    let rows_affected = completion_update(criteria, now)
        .build()
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows_affected)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    description: Option<String>,
    category: String,
    priority: String,
    status: String,
    due_at: DateTime<Utc>,
    auto_generated: bool,
    action_type: String,
    action_payload: serde_json::Value,
    application_id: Option<String>,
    client_name: Option<String>,
    document_type: Option<String>,
    source_event: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<DerivedTask> {
        Ok(DerivedTask {
            id: TaskId(self.id),
            user_id: UserId(self.user_id),
            title: self.title,
            description: self.description,
            category: self.category,
            priority: self.priority.parse()?,
            status: self.status.parse()?,
            due_at: self.due_at,
            auto_generated: self.auto_generated,
            action_type: self.action_type,
            action_payload: self.action_payload,
            application_id: self.application_id,
            client_name: self.client_name,
            document_type: self.document_type,
            source_event: self.source_event,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
