//! Pure mapping from events to task plans. Nothing here touches storage.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::rules::{EventData, EventType, Rule, default_rules, render};
use crate::model::{CompletionCriteria, NewTask, UserId};

/// What one event asks the task store to do.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPlan {
    pub complete: Option<CompletionCriteria>,
    pub create: Option<NewTask>,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.complete.is_none() && self.create.is_none()
    }
}

pub struct TaskGenerator {
    rules: HashMap<EventType, Rule>,
    no_response_min_elapsed: Duration,
}

impl TaskGenerator {
    pub fn new(no_response_min_elapsed: Duration) -> Self {
        Self::with_rules(default_rules(), no_response_min_elapsed)
    }

    pub fn with_rules(rules: HashMap<EventType, Rule>, no_response_min_elapsed: Duration) -> Self {
        Self {
            rules,
            no_response_min_elapsed,
        }
    }

    /// False for informational events, unregistered events, and a
    /// no-response event that arrives before the minimum elapsed time since
    /// the follow-up was sent.
    pub fn should_generate(&self, event: EventType, data: &EventData, now: DateTime<Utc>) -> bool {
        let Some(rule) = self.rules.get(&event) else {
            return false;
        };
        if rule.informational {
            return false;
        }
        match (event, data.sent_at) {
            (EventType::FollowUpNoResponse, Some(sent_at)) => {
                now - sent_at >= self.no_response_min_elapsed
            }
            _ => true,
        }
    }

    /// The task this event produces, if any.
    pub fn generate_task(
        &self,
        user_id: UserId,
        event: EventType,
        data: &EventData,
        now: DateTime<Utc>,
    ) -> Option<NewTask> {
        if !self.should_generate(event, data, now) {
            return None;
        }
        let rule = self.rules.get(&event)?;
        Some(NewTask {
            user_id,
            title: render(rule.title, data),
            description: rule.description.map(|d| render(d, data)),
            category: rule.category.to_string(),
            priority: rule.priority.resolve(data),
            due_at: rule.due.resolve(data, now),
            auto_generated: true,
            action_type: rule.action_type.to_string(),
            action_payload: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            application_id: data.application_id.clone(),
            client_name: data.client_name.clone(),
            document_type: data.document_type.clone(),
            source_event: Some(event.as_str().to_string()),
        })
    }

    /// The open tasks this event completes, if the rule declares a match.
    /// Informational events may still complete tasks.
    pub fn completion_criteria(
        &self,
        user_id: UserId,
        event: EventType,
        data: &EventData,
    ) -> Option<CompletionCriteria> {
        let rule = self.rules.get(&event)?.completes?;
        let mut criteria = CompletionCriteria::for_user(user_id);
        criteria.action_type = rule.action_type.map(str::to_string);
        if rule.match_application {
            criteria.application_id = Some(data.application_id.clone()?);
        }
        if rule.match_client {
            criteria.client_name = Some(data.client_name.clone()?);
        }
        if rule.match_document_type {
            criteria.document_type = data.document_type.clone();
        }
        Some(criteria)
    }

    pub fn plan(&self, user_id: UserId, event: EventType, data: &EventData, now: DateTime<Utc>) -> TaskPlan {
        TaskPlan {
            complete: self.completion_criteria(user_id, event, data),
            create: self.generate_task(user_id, event, data, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use uuid::Uuid;

    fn generator() -> TaskGenerator {
        TaskGenerator::new(Duration::hours(48))
    }

    fn user() -> UserId {
        UserId(Uuid::new_v4())
    }

    #[test]
    fn informational_events_generate_nothing() {
        let now = Utc::now();
        let g = generator();
        for event in [EventType::ReminderSent, EventType::NotificationSent, EventType::PaymentReceived] {
            assert!(!g.should_generate(event, &EventData::default(), now));
            assert!(g.generate_task(user(), event, &EventData::default(), now).is_none());
        }
    }

    #[test]
    fn early_no_response_is_suppressed() {
        let now = Utc::now();
        let g = generator();
        let mut data = EventData {
            sent_at: Some(now - Duration::hours(2)),
            ..Default::default()
        };
        assert!(!g.should_generate(EventType::FollowUpNoResponse, &data, now));
        data.sent_at = Some(now - Duration::hours(72));
        assert!(g.should_generate(EventType::FollowUpNoResponse, &data, now));
    }

    #[test]
    fn approval_completes_review_and_creates_send() {
        let now = Utc::now();
        let owner = user();
        let data = EventData {
            client_name: Some("Acme".into()),
            document_type: Some("quote".into()),
            application_id: Some("APP-7".into()),
            ..Default::default()
        };
        let plan = generator().plan(owner, EventType::ApplicationApproved, &data, now);

        let complete = plan.complete.unwrap();
        assert_eq!(complete.user_id, owner);
        assert_eq!(complete.action_type.as_deref(), Some("review_application"));
        assert_eq!(complete.application_id.as_deref(), Some("APP-7"));

        let task = plan.create.unwrap();
        assert_eq!(task.title, "Send approved quote to Acme");
        assert_eq!(task.action_type, "send_document");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.due_at, now + Duration::hours(24));
        assert_eq!(task.source_event.as_deref(), Some("application_approved"));
    }

    #[test]
    fn approval_without_application_id_completes_nothing() {
        let plan = generator().plan(user(), EventType::ApplicationApproved, &EventData::default(), Utc::now());
        assert!(plan.complete.is_none());
        assert!(plan.create.is_some());
    }

    #[test]
    fn urgent_review_is_due_sooner() {
        let now = Utc::now();
        let data = EventData {
            urgency: Some("urgent".into()),
            ..Default::default()
        };
        let task = generator()
            .generate_task(user(), EventType::ReviewRequested, &data, now)
            .unwrap();
        assert_eq!(task.priority, Priority::Urgent);
        assert_eq!(task.due_at, now + Duration::hours(8));
    }

    #[test]
    fn payment_only_completes() {
        let data = EventData {
            client_name: Some("Acme".into()),
            ..Default::default()
        };
        let plan = generator().plan(user(), EventType::PaymentReceived, &data, Utc::now());
        assert!(plan.create.is_none());
        assert_eq!(plan.complete.unwrap().client_name.as_deref(), Some("Acme"));
    }
}
