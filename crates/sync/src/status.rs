//! Sync item lifecycle states.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued change.
///
/// `Completed` is the only stable terminal state. `Failed` and `Conflict`
/// are parked, not dead: a failed item can be retried and a conflicted item
/// re-enters the queue once a resolution is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Conflict => "CONFLICT",
        }
    }

    /// A retryable item may be claimed for another sync attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::Failed | SyncStatus::Conflict
        )
    }

    /// Completed items never change again; they only get pruned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Completed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
