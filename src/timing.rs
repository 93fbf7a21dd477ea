//! Timing profiles.
//!
//! One value selected at startup decides every offset the lifecycle uses:
//! due dates per attempt and the grace period before escalation. Business
//! logic receives the profile; it never inspects the environment itself.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::followup::Attempt;

/// Which clock the follow-up lifecycle runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingProfile {
    /// Minutes instead of days, for demos and tests.
    Fast,
    /// Production cadence.
    #[default]
    Standard,
}

impl TimingProfile {
    /// Offset from the reference time for a given attempt.
    pub fn offset(self, attempt: Attempt) -> Duration {
        let step = i64::from(attempt.get());
        match self {
            TimingProfile::Fast => Duration::minutes(step),
            TimingProfile::Standard => Duration::days(7 * step),
        }
    }

    /// How long a third-attempt follow-up may sit overdue before the
    /// scanner escalates it.
    pub fn escalation_grace(self) -> Duration {
        match self {
            TimingProfile::Fast => Duration::minutes(1),
            TimingProfile::Standard => Duration::days(1),
        }
    }

    /// Due date for `attempt` counted from `from`. Pure: the same inputs
    /// always produce the same instant.
    pub fn compute_due_date(self, from: DateTime<Utc>, attempt: Attempt) -> DateTime<Utc> {
        from + self.offset(attempt)
    }
}

impl fmt::Display for TimingProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimingProfile::Fast => "fast",
            TimingProfile::Standard => "standard",
        })
    }
}

impl FromStr for TimingProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "dev" | "demo" => Ok(TimingProfile::Fast),
            "standard" | "prod" | "production" => Ok(TimingProfile::Standard),
            other => Err(Error::Config(format!("unknown timing profile: {other}"))),
        }
    }
}
