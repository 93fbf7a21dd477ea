//! Reminder and escalation emails.

use crate::model::{FollowUp, User};

/// Rendered subject and HTML body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub html: String,
}

/// Reminder to the owner that an attempt is due.
pub fn reminder(followup: &FollowUp) -> Email {
    let subject = format!(
        "Follow-up due: {} (attempt {} of 3)",
        followup.client_name, followup.attempt
    );
    let html = format!(
        "<p>Your follow-up with <strong>{client}</strong> about <em>{subject}</em> is due.</p>\
         <p>Attempt {attempt} of 3, due {due}.</p>{doc}",
        client = escape_html(&followup.client_name),
        subject = escape_html(&followup.subject),
        attempt = followup.attempt,
        due = followup.due_at.format("%Y-%m-%d %H:%M UTC"),
        doc = document_line(followup),
    );
    Email { subject, html }
}

/// Notice to the assigned manager that a follow-up went unanswered.
pub fn escalation(followup: &FollowUp, owner: &User, manager: &User) -> Email {
    let subject = format!("Escalated follow-up: {}", followup.client_name);
    let html = format!(
        "<p>Hello {manager},</p>\
         <p>{owner}'s follow-up with <strong>{client}</strong> about <em>{subject}</em> \
         received no response after three attempts and has been assigned to you.</p>\
         <p>First sent {sent}.</p>{doc}",
        manager = escape_html(&manager.name),
        owner = escape_html(&owner.name),
        client = escape_html(&followup.client_name),
        subject = escape_html(&followup.subject),
        sent = followup.sent_at.format("%Y-%m-%d"),
        doc = document_line(followup),
    );
    Email { subject, html }
}

fn document_line(followup: &FollowUp) -> String {
    match &followup.document_type {
        Some(doc) => format!("<p>Document: {}</p>", escape_html(doc)),
        None => String::new(),
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
