//! Core data model.
//!
//! Follow-ups track client re-contact obligations, queued notifications carry
//! outbound delivery work, and derived tasks are to-do items materialized from
//! business events. State changes are computed here as pure values; the `db`
//! module persists them.

pub mod followup;
pub mod notification;
pub mod task;
pub mod user;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use followup::*;
pub use notification::*;
pub use task::*;
pub use user::*;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for user references. The directory that owns users is external;
/// the engine only carries the id around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(UserId)
    }
}
