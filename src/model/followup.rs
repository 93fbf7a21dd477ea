//! Follow-up records, their history, and the lifecycle state machine.
//!
//! Every transition is a pure function from the current record to a
//! [`Transition`]: the updated record, the guard the store must match, and
//! the single history entry that accompanies it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::error::{Error, Result};
use crate::timing::TimingProfile;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FollowUpId(pub Uuid);

impl FollowUpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FollowUpId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FollowUpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FollowUpId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(FollowUpId)
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// Contact attempt number, always within `1..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Attempt(u8);

impl Attempt {
    pub const FIRST: Attempt = Attempt(1);
    pub const MAX: Attempt = Attempt(3);

    pub fn new(n: u8) -> Option<Self> {
        (Self::FIRST.0..=Self::MAX.0).contains(&n).then_some(Attempt(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The following attempt, saturating at [`Attempt::MAX`].
    pub fn next(self) -> Self {
        Attempt((self.0 + 1).min(Self::MAX.0))
    }

    pub fn is_final(self) -> bool {
        self == Self::MAX
    }
}

impl TryFrom<u8> for Attempt {
    type Error = String;

    fn try_from(n: u8) -> std::result::Result<Self, Self::Error> {
        Attempt::new(n).ok_or_else(|| format!("attempt out of range: {n}"))
    }
}

impl From<Attempt> for u8 {
    fn from(a: Attempt) -> u8 {
        a.0
    }
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    /// Only ever appears in history. Snoozing leaves the row pending.
    Snoozed,
    Completed,
    NoResponse,
}

impl FollowUpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Snoozed => "snoozed",
            FollowUpStatus::Completed => "completed",
            FollowUpStatus::NoResponse => "no_response",
        }
    }
}

impl std::fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FollowUpStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(FollowUpStatus::Pending),
            "snoozed" => Ok(FollowUpStatus::Snoozed),
            "completed" => Ok(FollowUpStatus::Completed),
            "no_response" => Ok(FollowUpStatus::NoResponse),
            other => Err(Error::Other(format!("unknown follow-up status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    ClientResponded,
    Signed,
    Paid,
    Cancelled,
    Other,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::ClientResponded => "client_responded",
            CompletionReason::Signed => "signed",
            CompletionReason::Paid => "paid",
            CompletionReason::Cancelled => "cancelled",
            CompletionReason::Other => "other",
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompletionReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_responded" => Ok(CompletionReason::ClientResponded),
            "signed" => Ok(CompletionReason::Signed),
            "paid" => Ok(CompletionReason::Paid),
            "cancelled" => Ok(CompletionReason::Cancelled),
            "other" => Ok(CompletionReason::Other),
            other => Err(Error::Other(format!("unknown completion reason: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Follow-up
// ---------------------------------------------------------------------------

/// One outstanding client-contact obligation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: FollowUpId,
    pub user_id: UserId,
    pub subject: String,
    pub client_name: String,
    pub client_email: Option<String>,
    pub document_type: Option<String>,
    /// Reference to the document the original communication was about.
    pub origin_ref: Option<String>,
    pub attempt: Attempt,
    pub sent_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_reason: Option<CompletionReason>,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub manager_id: Option<UserId>,
    /// Highest attempt a reminder has been queued for (0 = none yet).
    pub reminded_attempt: u8,
    /// The record this one superseded through a resend.
    pub resent_from: Option<FollowUpId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Builder for recording a new outbound communication.
#[derive(Debug, Clone)]
pub struct NewFollowUp {
    pub(crate) user_id: UserId,
    pub(crate) subject: String,
    pub(crate) client_name: String,
    pub(crate) client_email: Option<String>,
    pub(crate) document_type: Option<String>,
    pub(crate) origin_ref: Option<String>,
    pub(crate) sent_at: Option<DateTime<Utc>>,
}

impl NewFollowUp {
    pub fn new(
        user_id: UserId,
        subject: impl Into<String>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            subject: subject.into(),
            client_name: client_name.into(),
            client_email: None,
            document_type: None,
            origin_ref: None,
            sent_at: None,
        }
    }

    pub fn client_email(mut self, email: impl Into<String>) -> Self {
        self.client_email = Some(email.into());
        self
    }

    pub fn document_type(mut self, doc_type: impl Into<String>) -> Self {
        self.document_type = Some(doc_type.into());
        self
    }

    pub fn origin_ref(mut self, origin: impl Into<String>) -> Self {
        self.origin_ref = Some(origin.into());
        self
    }

    /// When the communication went out. Defaults to creation time.
    pub fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = Some(at);
        self
    }
}

/// A computed state change: the record after the change, the values the
/// stored row must still hold for the change to apply, and its history entry.
#[derive(Debug, Clone)]
pub struct Transition {
    pub expected_status: FollowUpStatus,
    pub expected_attempt: Attempt,
    pub updated: FollowUp,
    pub history: HistoryDraft,
}

/// Result of a resend: the superseded record and its replacement.
#[derive(Debug, Clone)]
pub struct Resend {
    pub superseded: Transition,
    pub fresh: FollowUp,
    pub fresh_history: HistoryDraft,
}

impl FollowUp {
    /// Start tracking a new communication at attempt 1.
    pub fn create(new: NewFollowUp, now: DateTime<Utc>, profile: TimingProfile) -> (Self, HistoryDraft) {
        let sent_at = new.sent_at.unwrap_or(now);
        let followup = FollowUp {
            id: FollowUpId::new(),
            user_id: new.user_id,
            subject: new.subject,
            client_name: new.client_name,
            client_email: new.client_email,
            document_type: new.document_type,
            origin_ref: new.origin_ref,
            attempt: Attempt::FIRST,
            sent_at,
            due_at: profile.compute_due_date(sent_at, Attempt::FIRST),
            status: FollowUpStatus::Pending,
            completed_at: None,
            completed_reason: None,
            escalated: false,
            escalated_at: None,
            manager_id: None,
            reminded_attempt: 0,
            resent_from: None,
            created_at: now,
            updated_at: now,
        };
        let history = HistoryDraft {
            followup_id: followup.id,
            actor: Some(followup.user_id),
            action: HistoryAction::Created,
            previous_status: None,
            new_status: Some(FollowUpStatus::Pending),
            note: Some(format!("due {}", followup.due_at.to_rfc3339())),
            created_at: now,
        };
        (followup, history)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == FollowUpStatus::Pending && self.due_at < now
    }

    /// Push the follow-up to the next attempt, counting the new due date from
    /// `now`. The row stays pending; only the history records the snooze.
    pub fn snooze(&self, actor: UserId, now: DateTime<Utc>, profile: TimingProfile) -> Result<Transition> {
        if self.status != FollowUpStatus::Pending {
            return Err(Error::invalid_transition(self.status, FollowUpStatus::Snoozed));
        }
        let attempt = self.attempt.next();
        let mut updated = self.clone();
        updated.attempt = attempt;
        updated.due_at = profile.compute_due_date(now, attempt);
        updated.updated_at = now;

        Ok(self.transition(
            updated,
            Some(actor),
            HistoryAction::Snoozed,
            Some(format!("attempt {} -> {attempt}", self.attempt)),
            now,
        ))
    }

    pub fn complete(&self, actor: UserId, reason: CompletionReason, now: DateTime<Utc>) -> Result<Transition> {
        self.completed_with(actor, reason, HistoryAction::Completed, Some(reason.to_string()), now)
    }

    /// Give up on the client. Only a third attempt that is already overdue
    /// may end this way.
    pub fn mark_no_response(&self, actor: Option<UserId>, now: DateTime<Utc>) -> Result<Transition> {
        self.check_no_response(now)?;
        let mut updated = self.clone();
        updated.status = FollowUpStatus::NoResponse;
        updated.updated_at = now;
        Ok(self.transition(updated, actor, HistoryAction::MarkedNoResponse, None, now))
    }

    /// Hand an unanswered third attempt to a manager. Escalation happens at
    /// most once per record.
    pub fn escalate(&self, manager: UserId, now: DateTime<Utc>) -> Result<Transition> {
        self.check_no_response(now)?;
        if self.escalated {
            return Err(Error::invalid_transition("escalated", "escalated"));
        }
        let mut updated = self.clone();
        updated.status = FollowUpStatus::NoResponse;
        updated.escalated = true;
        updated.escalated_at = Some(now);
        updated.manager_id = Some(manager);
        updated.updated_at = now;
        Ok(self.transition(
            updated,
            None,
            HistoryAction::Escalated,
            Some(format!("assigned to manager {manager}")),
            now,
        ))
    }

    /// Note that a reminder for the current attempt has been queued.
    pub fn record_reminder(&self, now: DateTime<Utc>) -> Result<Transition> {
        if self.status != FollowUpStatus::Pending {
            return Err(Error::invalid_transition(self.status, "reminder_sent"));
        }
        if self.reminded_attempt >= self.attempt.get() {
            return Err(Error::invalid_transition(
                format!("reminded attempt {}", self.reminded_attempt),
                "reminder_sent",
            ));
        }
        let mut updated = self.clone();
        updated.reminded_attempt = self.attempt.get();
        updated.updated_at = now;
        Ok(self.transition(
            updated,
            None,
            HistoryAction::ReminderSent,
            Some(format!("attempt {}", self.attempt)),
            now,
        ))
    }

    /// Close this record and start a fresh one at attempt 1, sent now.
    pub fn resend(&self, actor: UserId, now: DateTime<Utc>, profile: TimingProfile) -> Result<Resend> {
        let (mut fresh, mut fresh_history) = FollowUp::create(
            NewFollowUp {
                user_id: self.user_id,
                subject: self.subject.clone(),
                client_name: self.client_name.clone(),
                client_email: self.client_email.clone(),
                document_type: self.document_type.clone(),
                origin_ref: self.origin_ref.clone(),
                sent_at: Some(now),
            },
            now,
            profile,
        );
        fresh.resent_from = Some(self.id);
        fresh_history.actor = Some(actor);
        fresh_history.note = Some(format!("resent from {}", self.id));

        let superseded = self.completed_with(
            actor,
            CompletionReason::Other,
            HistoryAction::Resent,
            Some(format!("superseded by {}", fresh.id)),
            now,
        )?;

        Ok(Resend {
            superseded,
            fresh,
            fresh_history,
        })
    }

    fn completed_with(
        &self,
        actor: UserId,
        reason: CompletionReason,
        action: HistoryAction,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if self.status == FollowUpStatus::Completed {
            return Err(Error::invalid_transition(self.status, FollowUpStatus::Completed));
        }
        let mut updated = self.clone();
        updated.status = FollowUpStatus::Completed;
        updated.completed_at = Some(now);
        updated.completed_reason = Some(reason);
        updated.updated_at = now;
        Ok(self.transition(updated, Some(actor), action, note, now))
    }

    fn check_no_response(&self, now: DateTime<Utc>) -> Result<()> {
        if self.status != FollowUpStatus::Pending {
            return Err(Error::invalid_transition(self.status, FollowUpStatus::NoResponse));
        }
        if !self.attempt.is_final() {
            return Err(Error::invalid_transition(
                format!("pending at attempt {}", self.attempt),
                FollowUpStatus::NoResponse,
            ));
        }
        if self.due_at >= now {
            return Err(Error::invalid_transition(
                "pending (not yet due)",
                FollowUpStatus::NoResponse,
            ));
        }
        Ok(())
    }

    fn transition(
        &self,
        updated: FollowUp,
        actor: Option<UserId>,
        action: HistoryAction,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        let history = HistoryDraft {
            followup_id: self.id,
            actor,
            action,
            previous_status: Some(self.status),
            new_status: Some(updated.status),
            note,
            created_at: now,
        };
        Transition {
            expected_status: self.status,
            expected_attempt: self.attempt,
            updated,
            history,
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Snoozed,
    Completed,
    MarkedNoResponse,
    ReminderSent,
    Escalated,
    Resent,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Snoozed => "snoozed",
            HistoryAction::Completed => "completed",
            HistoryAction::MarkedNoResponse => "marked_no_response",
            HistoryAction::ReminderSent => "reminder_sent",
            HistoryAction::Escalated => "escalated",
            HistoryAction::Resent => "resent",
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(HistoryAction::Created),
            "snoozed" => Ok(HistoryAction::Snoozed),
            "completed" => Ok(HistoryAction::Completed),
            "marked_no_response" => Ok(HistoryAction::MarkedNoResponse),
            "reminder_sent" => Ok(HistoryAction::ReminderSent),
            "escalated" => Ok(HistoryAction::Escalated),
            "resent" => Ok(HistoryAction::Resent),
            other => Err(Error::Other(format!("unknown history action: {other}"))),
        }
    }
}

/// A history entry not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryDraft {
    pub followup_id: FollowUpId,
    /// None for entries written by background scans.
    pub actor: Option<UserId>,
    pub action: HistoryAction,
    pub previous_status: Option<FollowUpStatus>,
    pub new_status: Option<FollowUpStatus>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored, append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub followup_id: FollowUpId,
    pub actor: Option<UserId>,
    pub action: HistoryAction,
    pub previous_status: Option<FollowUpStatus>,
    pub new_status: Option<FollowUpStatus>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpStats {
    pub pending: i64,
    pub completed: i64,
    pub no_response: i64,
    /// Pending and past due.
    pub overdue: i64,
    /// Pending and due at some point today (UTC).
    pub due_today: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn owner() -> UserId {
        UserId(Uuid::from_u128(7))
    }

    fn created() -> FollowUp {
        FollowUp::create(
            NewFollowUp::new(owner(), "Quote #12", "Acme Ltd"),
            t0(),
            TimingProfile::Fast,
        )
        .0
    }

    fn overdue_final() -> FollowUp {
        let mut f = created();
        f.attempt = Attempt::MAX;
        f.due_at = t0() - Duration::minutes(10);
        f
    }

    #[test]
    fn attempt_bounds() {
        assert!(Attempt::new(0).is_none());
        assert!(Attempt::new(4).is_none());
        assert_eq!(Attempt::MAX.next(), Attempt::MAX);
        assert_eq!(Attempt::FIRST.next().get(), 2);
    }

    #[test]
    fn create_starts_pending_at_first_attempt() {
        let (f, history) = FollowUp::create(
            NewFollowUp::new(owner(), "Quote", "Acme").sent_at(t0()),
            t0() + Duration::seconds(5),
            TimingProfile::Fast,
        );
        assert_eq!(f.attempt, Attempt::FIRST);
        assert_eq!(f.status, FollowUpStatus::Pending);
        assert_eq!(f.due_at, t0() + Duration::minutes(1));
        assert_eq!(history.action, HistoryAction::Created);
    }

    #[test]
    fn snooze_counts_from_now_and_stays_pending() {
        let f = created();
        let now = t0() + Duration::minutes(2);
        let t = f.snooze(owner(), now, TimingProfile::Fast).unwrap();
        assert_eq!(t.updated.attempt.get(), 2);
        assert_eq!(t.updated.due_at, t0() + Duration::minutes(4));
        assert_eq!(t.updated.status, FollowUpStatus::Pending);
        assert_eq!(t.history.action, HistoryAction::Snoozed);
        assert_eq!(t.expected_attempt, Attempt::FIRST);
    }

    #[test]
    fn snooze_rejects_completed() {
        let f = created();
        let done = f.complete(owner(), CompletionReason::Paid, t0()).unwrap().updated;
        assert!(matches!(
            done.snooze(owner(), t0(), TimingProfile::Fast),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn no_response_requires_overdue_final_attempt() {
        let f = created();
        assert!(f.mark_no_response(None, t0() + Duration::hours(1)).is_err());

        let f = overdue_final();
        let t = f.mark_no_response(None, t0()).unwrap();
        assert_eq!(t.updated.status, FollowUpStatus::NoResponse);
        assert!(!t.updated.escalated);
    }

    #[test]
    fn escalate_sets_manager_once() {
        let manager = UserId(Uuid::from_u128(99));
        let t = overdue_final().escalate(manager, t0()).unwrap();
        assert!(t.updated.escalated);
        assert_eq!(t.updated.manager_id, Some(manager));
        assert_eq!(t.updated.escalated_at, Some(t0()));
        assert!(t.updated.escalate(manager, t0()).is_err());
    }

    #[test]
    fn reminder_recorded_once_per_attempt() {
        let f = created();
        let t = f.record_reminder(t0()).unwrap();
        assert_eq!(t.updated.reminded_attempt, 1);
        assert!(t.updated.record_reminder(t0()).is_err());

        let snoozed = t.updated.snooze(owner(), t0(), TimingProfile::Fast).unwrap().updated;
        assert!(snoozed.record_reminder(t0()).is_ok());
    }

    #[test]
    fn resend_links_both_records() {
        let f = overdue_final();
        let r = f.resend(owner(), t0(), TimingProfile::Fast).unwrap();
        assert_eq!(r.superseded.updated.status, FollowUpStatus::Completed);
        assert_eq!(r.superseded.updated.completed_reason, Some(CompletionReason::Other));
        assert_eq!(r.superseded.history.action, HistoryAction::Resent);
        assert_eq!(r.fresh.resent_from, Some(f.id));
        assert_eq!(r.fresh.attempt, Attempt::FIRST);
        assert_eq!(r.fresh.sent_at, t0());
        assert_ne!(r.fresh.id, f.id);
    }
}
