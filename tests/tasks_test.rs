//! Event-to-task rules through the public generator API.

use chrono::{DateTime, Duration, TimeZone, Utc};
use followup_engine::lifecycle::event_data;
use followup_engine::model::*;
use followup_engine::tasks::rules::{default_rules, render};
use followup_engine::tasks::{EventData, EventType, TaskGenerator};
use followup_engine::timing::TimingProfile;
use uuid::Uuid;

fn t() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

fn user() -> UserId {
    UserId(Uuid::from_u128(1))
}

fn generator() -> TaskGenerator {
    TaskGenerator::new(Duration::hours(48))
}

fn client(name: &str) -> EventData {
    EventData {
        client_name: Some(name.to_string()),
        subject: Some("Lease renewal".to_string()),
        document_type: Some("lease".to_string()),
        ..EventData::default()
    }
}

#[test]
fn every_event_type_has_a_rule_and_round_trips() {
    let rules = default_rules();
    for event in EventType::ALL {
        assert!(rules.contains_key(&event), "{event}");
        assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
    }
    assert!("follow_up_lost".parse::<EventType>().is_err());
}

#[test]
fn render_fills_known_fields_and_marks_missing_ones() {
    let data = client("Acme");
    assert_eq!(render("Call {client_name} about {subject}", &data), "Call Acme about Lease renewal");
    assert_eq!(render("App {application_id}", &data), "App unknown");
    assert_eq!(render("open {brace", &data), "open {brace");
}

#[test]
fn due_follow_up_priority_rises_with_attempts() {
    let generator = generator();
    let mut data = client("Acme");
    let mut priorities = Vec::new();
    for attempt in 1..=3 {
        data.attempt = Some(attempt);
        let task = generator
            .generate_task(user(), EventType::FollowUpDue, &data, t())
            .unwrap();
        assert_eq!(task.action_type, "contact_client");
        assert_eq!(task.due_at, t() + Duration::hours(24));
        priorities.push(task.priority);
    }
    assert_eq!(priorities, vec![Priority::Medium, Priority::High, Priority::Urgent]);
}

#[test]
fn no_response_completes_contact_tasks_and_opens_a_review() {
    let generator = generator();
    let mut data = client("Acme");
    data.sent_at = Some(t() - Duration::days(21));

    let plan = generator.plan(user(), EventType::FollowUpNoResponse, &data, t());
    let criteria = plan.complete.unwrap();
    assert_eq!(criteria.action_type.as_deref(), Some("contact_client"));
    assert_eq!(criteria.client_name.as_deref(), Some("Acme"));
    assert_eq!(criteria.document_type.as_deref(), Some("lease"));

    let task = plan.create.unwrap();
    assert_eq!(task.action_type, "review_no_response");
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.source_event.as_deref(), Some("follow_up_no_response"));
    assert!(task.auto_generated);
}

#[test]
fn completion_criteria_match_case_insensitively() {
    let generator = generator();
    let criteria = generator
        .completion_criteria(user(), EventType::ClientResponded, &client("ACME"))
        .unwrap();

    let mut task = DerivedTask {
        id: TaskId::new(),
        user_id: user(),
        title: "Follow up with Acme".to_string(),
        description: None,
        category: "follow_up".to_string(),
        priority: Priority::Medium,
        status: TaskStatus::Pending,
        due_at: t(),
        auto_generated: true,
        action_type: "contact_client".to_string(),
        action_payload: serde_json::Value::Null,
        application_id: None,
        client_name: Some("acme".to_string()),
        document_type: Some("Lease".to_string()),
        source_event: Some("follow_up_due".to_string()),
        created_at: t(),
        updated_at: t(),
        completed_at: None,
    };
    assert!(criteria.matches(&task));

    task.status = TaskStatus::Dismissed;
    assert!(!criteria.matches(&task), "terminal tasks are never auto-completed");

    task.status = TaskStatus::InProgress;
    task.user_id = UserId(Uuid::from_u128(2));
    assert!(!criteria.matches(&task), "other users' tasks are untouched");
}

#[test]
fn follow_up_event_data_carries_its_fields() {
    let (followup, _) = FollowUp::create(
        NewFollowUp::new(user(), "Offer", "Northwind")
            .document_type("offer")
            .origin_ref("APP-9"),
        t(),
        TimingProfile::Standard,
    );
    let data = event_data(&followup);
    assert_eq!(data.client_name.as_deref(), Some("Northwind"));
    assert_eq!(data.application_id.as_deref(), Some("APP-9"));
    assert_eq!(data.attempt, Some(1));
    assert_eq!(data.sent_at, Some(t()));
    assert_eq!(data.followup_id, Some(followup.id.to_string()));
}
