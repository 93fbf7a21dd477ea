//! Declarative rule registry: one [`Rule`] per event type.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Priority;

/// Event type tags understood by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FollowUpDue,
    FollowUpNoResponse,
    FollowUpEscalated,
    ClientResponded,
    ReviewRequested,
    ApplicationApproved,
    ApplicationRejected,
    DocumentSigned,
    PaymentReceived,
    ReminderSent,
    NotificationSent,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::FollowUpDue,
        EventType::FollowUpNoResponse,
        EventType::FollowUpEscalated,
        EventType::ClientResponded,
        EventType::ReviewRequested,
        EventType::ApplicationApproved,
        EventType::ApplicationRejected,
        EventType::DocumentSigned,
        EventType::PaymentReceived,
        EventType::ReminderSent,
        EventType::NotificationSent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FollowUpDue => "follow_up_due",
            EventType::FollowUpNoResponse => "follow_up_no_response",
            EventType::FollowUpEscalated => "follow_up_escalated",
            EventType::ClientResponded => "client_responded",
            EventType::ReviewRequested => "review_requested",
            EventType::ApplicationApproved => "application_approved",
            EventType::ApplicationRejected => "application_rejected",
            EventType::DocumentSigned => "document_signed",
            EventType::PaymentReceived => "payment_received",
            EventType::ReminderSent => "reminder_sent",
            EventType::NotificationSent => "notification_sent",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown event type: {s}")))
    }
}

/// Free-form event payload. Every field is optional; rules read what they
/// need and templates render missing fields as "unknown".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub client_name: Option<String>,
    pub subject: Option<String>,
    pub document_type: Option<String>,
    pub application_id: Option<String>,
    /// "low" | "normal" | "high" | "urgent"
    pub urgency: Option<String>,
    pub attempt: Option<u8>,
    pub sent_at: Option<DateTime<Utc>>,
    pub followup_id: Option<String>,
}

impl EventData {
    /// Look up a template placeholder by name.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "client_name" => self.client_name.clone(),
            "subject" => self.subject.clone(),
            "document_type" => self.document_type.clone(),
            "application_id" => self.application_id.clone(),
            "urgency" => self.urgency.clone(),
            "attempt" => self.attempt.map(|a| a.to_string()),
            "followup_id" => self.followup_id.clone(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityRule {
    Fixed(Priority),
    /// Map the event's `urgency` field, falling back to the default.
    ByUrgency { default: Priority },
    /// Later attempts are more pressing.
    ByAttempt,
}

impl PriorityRule {
    pub fn resolve(self, data: &EventData) -> Priority {
        match self {
            PriorityRule::Fixed(p) => p,
            PriorityRule::ByUrgency { default } => match data.urgency.as_deref() {
                Some("urgent") => Priority::Urgent,
                Some("high") => Priority::High,
                Some("low") => Priority::Low,
                Some("normal") | Some("medium") => Priority::Medium,
                _ => default,
            },
            PriorityRule::ByAttempt => match data.attempt.unwrap_or(1) {
                0 | 1 => Priority::Medium,
                2 => Priority::High,
                _ => Priority::Urgent,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueRule {
    Hours(i64),
    /// Urgent events get `urgent` hours, everything else `normal`.
    ByUrgency { urgent: i64, normal: i64 },
}

impl DueRule {
    pub fn resolve(self, data: &EventData, now: DateTime<Utc>) -> DateTime<Utc> {
        let hours = match self {
            DueRule::Hours(h) => h,
            DueRule::ByUrgency { urgent, normal } => match data.urgency.as_deref() {
                Some("urgent") | Some("high") => urgent,
                _ => normal,
            },
        };
        now + Duration::hours(hours)
    }
}

/// Which event fields an auto-completion match keys on, beyond the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRule {
    /// Action type of the tasks to complete.
    pub action_type: Option<&'static str>,
    pub match_application: bool,
    pub match_client: bool,
    pub match_document_type: bool,
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// `{field}` placeholders are filled from [`EventData`].
    pub title: &'static str,
    pub description: Option<&'static str>,
    pub category: &'static str,
    pub priority: PriorityRule,
    pub due: DueRule,
    pub action_type: &'static str,
    /// Purely informational events never produce a task.
    pub informational: bool,
    pub completes: Option<CompletionRule>,
}

/// Render a `{field}` template.
pub fn render(template: &str, data: &EventData) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&data.field(name).unwrap_or_else(|| "unknown".to_string()));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

const CLIENT_MATCH: CompletionRule = CompletionRule {
    action_type: None,
    match_application: false,
    match_client: true,
    match_document_type: true,
};

/// The built-in registry.
pub fn default_rules() -> HashMap<EventType, Rule> {
    use EventType::*;
    HashMap::from([
        (
            FollowUpDue,
            Rule {
                title: "Follow up with {client_name}",
                description: Some("Attempt {attempt} on \"{subject}\" is due."),
                category: "follow_up",
                priority: PriorityRule::ByAttempt,
                due: DueRule::Hours(24),
                action_type: "contact_client",
                informational: false,
                completes: None,
            },
        ),
        (
            FollowUpNoResponse,
            Rule {
                title: "No response from {client_name}",
                description: Some("Decide next steps for \"{subject}\" after three attempts."),
                category: "follow_up",
                priority: PriorityRule::Fixed(Priority::High),
                due: DueRule::Hours(48),
                action_type: "review_no_response",
                informational: false,
                completes: Some(CompletionRule {
                    action_type: Some("contact_client"),
                    ..CLIENT_MATCH
                }),
            },
        ),
        (
            FollowUpEscalated,
            Rule {
                title: "Escalated: {client_name}",
                description: Some("\"{subject}\" was escalated to you."),
                category: "escalation",
                priority: PriorityRule::Fixed(Priority::Urgent),
                due: DueRule::Hours(24),
                action_type: "handle_escalation",
                informational: false,
                completes: None,
            },
        ),
        (
            ClientResponded,
            Rule {
                title: "Reply to {client_name}",
                description: Some("{client_name} responded about {document_type}."),
                category: "client",
                priority: PriorityRule::ByUrgency { default: Priority::Medium },
                due: DueRule::ByUrgency { urgent: 4, normal: 24 },
                action_type: "reply_client",
                informational: false,
                completes: Some(CLIENT_MATCH),
            },
        ),
        (
            ReviewRequested,
            Rule {
                title: "Review {document_type} for {client_name}",
                description: Some("Application {application_id} is waiting for review."),
                category: "review",
                priority: PriorityRule::ByUrgency { default: Priority::Medium },
                due: DueRule::ByUrgency { urgent: 8, normal: 48 },
                action_type: "review_application",
                informational: false,
                completes: None,
            },
        ),
        (
            ApplicationApproved,
            Rule {
                title: "Send approved {document_type} to {client_name}",
                description: Some("Application {application_id} was approved."),
                category: "review",
                priority: PriorityRule::Fixed(Priority::High),
                due: DueRule::Hours(24),
                action_type: "send_document",
                informational: false,
                completes: Some(CompletionRule {
                    action_type: Some("review_application"),
                    match_application: true,
                    match_client: false,
                    match_document_type: false,
                }),
            },
        ),
        (
            ApplicationRejected,
            Rule {
                title: "Revise {document_type} for {client_name}",
                description: Some("Application {application_id} was rejected."),
                category: "review",
                priority: PriorityRule::Fixed(Priority::High),
                due: DueRule::Hours(48),
                action_type: "revise_application",
                informational: false,
                completes: Some(CompletionRule {
                    action_type: Some("review_application"),
                    match_application: true,
                    match_client: false,
                    match_document_type: false,
                }),
            },
        ),
        (
            DocumentSigned,
            Rule {
                title: "File signed {document_type} from {client_name}",
                description: None,
                category: "document",
                priority: PriorityRule::Fixed(Priority::Medium),
                due: DueRule::Hours(72),
                action_type: "file_document",
                informational: false,
                completes: Some(CLIENT_MATCH),
            },
        ),
        (
            PaymentReceived,
            Rule {
                title: "Payment received from {client_name}",
                description: None,
                category: "billing",
                priority: PriorityRule::Fixed(Priority::Low),
                due: DueRule::Hours(0),
                action_type: "none",
                informational: true,
                completes: Some(CompletionRule {
                    action_type: None,
                    match_application: false,
                    match_client: true,
                    match_document_type: false,
                }),
            },
        ),
        (
            ReminderSent,
            Rule {
                title: "Reminder sent to {client_name}",
                description: None,
                category: "follow_up",
                priority: PriorityRule::Fixed(Priority::Low),
                due: DueRule::Hours(0),
                action_type: "none",
                informational: true,
                completes: None,
            },
        ),
        (
            NotificationSent,
            Rule {
                title: "Notification sent",
                description: None,
                category: "notification",
                priority: PriorityRule::Fixed(Priority::Low),
                due: DueRule::Hours(0),
                action_type: "none",
                informational: true,
                completes: None,
            },
        ),
    ])
}
