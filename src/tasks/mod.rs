//! Rule-derived tasks.
//!
//! Events from the lifecycle (and from outside, e.g. review decisions) are
//! mapped to a [`TaskPlan`] by a pure [`TaskGenerator`]; [`TaskService`]
//! applies that plan to the store in one transaction.

pub mod generator;
pub mod rules;

pub use generator::{TaskGenerator, TaskPlan};
pub use rules::{EventData, EventType, Rule};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::db::{Db, TaskOutcome};
use crate::error::Result;
use crate::model::{DerivedTask, TaskId, TaskStatus, UserId};

pub struct TaskService {
    db: Arc<Db>,
    generator: TaskGenerator,
}

impl TaskService {
    pub fn new(db: Arc<Db>, generator: TaskGenerator) -> Self {
        Self { db, generator }
    }

    /// Auto-complete and generate for one event, atomically.
    pub async fn apply_event(
        &self,
        user_id: UserId,
        event: EventType,
        data: &EventData,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        let plan = self.generator.plan(user_id, event, data, now);
        if plan.is_empty() {
            debug!(user = %user_id, event = %event, "event produced no task changes");
            return Ok(TaskOutcome {
                completed: 0,
                created: None,
            });
        }
        let outcome = self
            .db
            .apply_task_changes(plan.complete.as_ref(), plan.create.as_ref(), now)
            .await?;
        info!(
            user = %user_id,
            event = %event,
            completed = outcome.completed,
            created = outcome.created.as_ref().map(|t| t.id.to_string()).unwrap_or_default(),
            "task event applied"
        );
        Ok(outcome)
    }

    pub async fn transition(&self, id: TaskId, user_id: UserId, to: TaskStatus) -> Result<DerivedTask> {
        self.db.transition_task(id, user_id, to, Utc::now()).await
    }

    pub async fn expire_overdue(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64> {
        let expired = self.db.expire_overdue_tasks(now, grace).await?;
        if expired > 0 {
            info!(expired, "expired overdue tasks");
        }
        Ok(expired)
    }

    pub async fn list(&self, user_id: UserId, status: Option<TaskStatus>) -> Result<Vec<DerivedTask>> {
        self.db.list_tasks(user_id, status).await
    }
}
