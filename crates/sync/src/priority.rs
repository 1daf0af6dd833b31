//! Priority bands for queued work.

use serde::{Deserialize, Serialize};

use fieldops_core::ValueObject;

use crate::item::SyncItemType;

/// Service-order tier of a queued change.
///
/// Variant order doubles as sort order: `Critical` drains first. Within a
/// band, older items go first (FIFO by capture timestamp).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl SyncPriority {
    /// Numeric sort key; lower is served first.
    pub fn order(&self) -> u8 {
        match self {
            SyncPriority::Critical => 0,
            SyncPriority::High => 1,
            SyncPriority::Normal => 2,
            SyncPriority::Low => 3,
        }
    }

    /// Initial priority for an item type. Safety paperwork and captured
    /// evidence outrank routine progress updates.
    pub fn for_item_type(item_type: SyncItemType) -> Self {
        match item_type {
            SyncItemType::SafetyPermit => SyncPriority::Critical,
            SyncItemType::Evidence | SyncItemType::Signature => SyncPriority::High,
            SyncItemType::Execution
            | SyncItemType::Checklist
            | SyncItemType::ServiceEntrySheet => SyncPriority::Normal,
            SyncItemType::Task | SyncItemType::Cost => SyncPriority::Low,
        }
    }
}

impl ValueObject for SyncPriority {}
