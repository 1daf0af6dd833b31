//! The unit of pending work: one captured change, its lifecycle, and its
//! retry bookkeeping.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use fieldops_core::{Entity, ExecutionId, OrderId, UserId};

use crate::config::SyncConfig;
use crate::device::DeviceIdentity;
use crate::priority::SyncPriority;
use crate::status::SyncStatus;

/// Unique queue item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncItemId(pub Uuid);

impl SyncItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SyncItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of domain record a queued change touches. Closed set: extend by
/// adding a variant, never by passing strings through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncItemType {
    Execution,
    Checklist,
    Evidence,
    Task,
    Cost,
    SafetyPermit,
    ServiceEntrySheet,
    Signature,
}

/// CRUD verb of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("cannot sync item in status: {0}")]
    NotRetryable(SyncStatus),
}

/// Input for enqueueing a new change.
#[derive(Debug, Clone)]
pub struct NewSyncItem {
    pub item_type: SyncItemType,
    pub operation: SyncOperation,
    pub payload: Value,
    pub device_id: DeviceIdentity,
    pub user_id: UserId,
    pub order_id: Option<OrderId>,
    pub execution_id: Option<ExecutionId>,
    /// When the change happened on-device; defaults to now at enqueue.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewSyncItem {
    pub fn new(
        item_type: SyncItemType,
        operation: SyncOperation,
        payload: Value,
        device_id: DeviceIdentity,
        user_id: UserId,
    ) -> Self {
        Self {
            item_type,
            operation,
            payload,
            device_id,
            user_id,
            order_id: None,
            execution_id: None,
            timestamp: None,
        }
    }

    pub fn for_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn for_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn captured_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// One pending change captured on a device.
///
/// Owned exclusively by the queue until it reaches a terminal state; all
/// mutation goes through the `mark_*` methods, which enforce the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: SyncItemId,
    pub item_type: SyncItemType,
    pub operation: SyncOperation,
    pub payload: Value,
    /// Capture time on-device, not enqueue time.
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceIdentity,
    pub user_id: UserId,
    pub order_id: Option<OrderId>,
    pub execution_id: Option<ExecutionId>,
    pub status: SyncStatus,
    pub priority: SyncPriority,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    /// Build a fresh item; priority derives from the item type.
    pub fn new(spec: NewSyncItem) -> Self {
        Self {
            id: SyncItemId::new(),
            priority: SyncPriority::for_item_type(spec.item_type),
            item_type: spec.item_type,
            operation: spec.operation,
            payload: spec.payload,
            timestamp: spec.timestamp.unwrap_or_else(Utc::now),
            device_id: spec.device_id,
            user_id: spec.user_id,
            order_id: spec.order_id,
            execution_id: spec.execution_id,
            status: SyncStatus::Pending,
            retry_count: 0,
            last_retry_at: None,
            error_message: None,
            synced_at: None,
        }
    }

    /// Claim the item for a sync attempt.
    pub fn mark_syncing(&mut self) -> Result<(), StateError> {
        if !self.status.is_retryable() {
            return Err(StateError::NotRetryable(self.status));
        }
        self.status = SyncStatus::Syncing;
        self.last_retry_at = Some(Utc::now());
        Ok(())
    }

    /// The apply step succeeded; the item is now immutable except for pruning.
    pub fn mark_completed(&mut self) {
        self.status = SyncStatus::Completed;
        self.synced_at = Some(Utc::now());
        self.error_message = None;
    }

    /// The apply step failed. Requeues as `Pending` while retries remain,
    /// otherwise parks the item as `Failed`.
    pub fn mark_failed(&mut self, error: impl Into<String>, config: &SyncConfig) {
        self.retry_count += 1;
        self.error_message = Some(error.into());
        self.status = if self.retry_count >= config.max_retries {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };
    }

    /// The apply step detected a field-level divergence needing resolution.
    pub fn mark_conflict(&mut self, details: &str) {
        self.status = SyncStatus::Conflict;
        self.error_message = Some(format!("conflict: {details}"));
    }

    pub fn can_retry(&self, config: &SyncConfig) -> bool {
        self.status.is_retryable() && self.retry_count < config.max_retries
    }

    /// Exponential backoff delay before the next attempt, capped.
    pub fn retry_delay(&self, config: &SyncConfig) -> Duration {
        // Shift is clamped so the multiplier cannot overflow before the cap
        // kicks in.
        let exponent = self.retry_count.min(31);
        let delay = config
            .retry_base_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(config.retry_max_delay)
    }

    /// Promote to the top band for urgent operations. Never lowers.
    pub fn elevate_priority(&mut self) {
        if self.priority != SyncPriority::Critical {
            self.priority = SyncPriority::Critical;
        }
    }

    /// Payload-free view for status queries.
    pub fn summary(&self) -> SyncQueueItemSummary {
        SyncQueueItemSummary {
            id: self.id,
            item_type: self.item_type,
            operation: self.operation,
            timestamp: self.timestamp,
            order_id: self.order_id,
            execution_id: self.execution_id,
            status: self.status,
            priority: self.priority,
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
            synced_at: self.synced_at,
        }
    }
}

impl Entity for SyncQueueItem {
    type Id = SyncItemId;

    fn id(&self) -> &SyncItemId {
        &self.id
    }
}

/// DTO exposed to status queries; omits the payload document.
#[derive(Debug, Clone, Serialize)]
pub struct SyncQueueItemSummary {
    pub id: SyncItemId,
    pub item_type: SyncItemType,
    pub operation: SyncOperation,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<OrderId>,
    pub execution_id: Option<ExecutionId>,
    pub status: SyncStatus,
    pub priority: SyncPriority,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_item(item_type: SyncItemType) -> SyncQueueItem {
        SyncQueueItem::new(NewSyncItem::new(
            item_type,
            SyncOperation::Update,
            json!({"progress": 40}),
            DeviceIdentity::generate(),
            UserId::new(),
        ))
    }

    #[test]
    fn new_item_starts_pending_with_derived_priority() {
        let item = test_item(SyncItemType::SafetyPermit);
        assert_eq!(item.status, SyncStatus::Pending);
        assert_eq!(item.priority, SyncPriority::Critical);
        assert_eq!(item.retry_count, 0);
        assert!(item.synced_at.is_none());
    }

    #[test]
    fn lifecycle_pending_syncing_completed() {
        let mut item = test_item(SyncItemType::Task);

        item.mark_syncing().unwrap();
        assert_eq!(item.status, SyncStatus::Syncing);
        assert!(item.last_retry_at.is_some());

        item.mark_completed();
        assert_eq!(item.status, SyncStatus::Completed);
        assert!(item.synced_at.is_some());
        assert!(item.error_message.is_none());
    }

    #[test]
    fn cannot_claim_item_twice() {
        let mut item = test_item(SyncItemType::Task);
        item.mark_syncing().unwrap();

        assert_eq!(
            item.mark_syncing(),
            Err(StateError::NotRetryable(SyncStatus::Syncing))
        );
    }

    #[test]
    fn cannot_claim_completed_item() {
        let mut item = test_item(SyncItemType::Task);
        item.mark_syncing().unwrap();
        item.mark_completed();

        assert!(item.mark_syncing().is_err());
    }

    #[test]
    fn failure_requeues_until_ceiling() {
        let config = SyncConfig::default();
        let mut item = test_item(SyncItemType::Checklist);

        for attempt in 1..config.max_retries {
            item.mark_syncing().unwrap();
            item.mark_failed("store unreachable", &config);
            assert_eq!(item.status, SyncStatus::Pending);
            assert_eq!(item.retry_count, attempt);
            assert!(item.can_retry(&config));
        }

        item.mark_syncing().unwrap();
        item.mark_failed("store unreachable", &config);
        assert_eq!(item.status, SyncStatus::Failed);
        assert_eq!(item.retry_count, config.max_retries);
        assert!(!item.can_retry(&config));
    }

    #[test]
    fn conflict_is_recorded_and_retryable() {
        let mut item = test_item(SyncItemType::Execution);
        item.mark_syncing().unwrap();
        item.mark_conflict("progress diverged");

        assert_eq!(item.status, SyncStatus::Conflict);
        assert_eq!(
            item.error_message.as_deref(),
            Some("conflict: progress diverged")
        );
        assert!(item.can_retry(&SyncConfig::default()));
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let config = SyncConfig::default();
        let mut item = test_item(SyncItemType::Task);

        assert_eq!(item.retry_delay(&config), Duration::from_secs(1));
        item.retry_count = 1;
        assert_eq!(item.retry_delay(&config), Duration::from_secs(2));
        item.retry_count = 4;
        assert_eq!(item.retry_delay(&config), Duration::from_secs(16));
        item.retry_count = 20;
        assert_eq!(item.retry_delay(&config), Duration::from_secs(300));
    }

    #[test]
    fn elevate_priority_never_lowers() {
        let mut item = test_item(SyncItemType::Cost);
        assert_eq!(item.priority, SyncPriority::Low);

        item.elevate_priority();
        assert_eq!(item.priority, SyncPriority::Critical);

        item.elevate_priority();
        assert_eq!(item.priority, SyncPriority::Critical);
    }

    #[test]
    fn summary_round_trips_without_payload() {
        let item = test_item(SyncItemType::Evidence);
        let summary = item.summary();

        assert_eq!(summary.id, item.id);
        assert_eq!(summary.status, item.status);
        let as_json = serde_json::to_value(&summary).unwrap();
        assert!(as_json.get("payload").is_none());
    }

    proptest! {
        /// Backoff never decreases as the retry count grows.
        #[test]
        fn retry_delay_is_monotone(counts in prop::collection::vec(0u32..64, 2..20)) {
            let config = SyncConfig::default();
            let mut item = test_item(SyncItemType::Task);
            let mut sorted = counts.clone();
            sorted.sort_unstable();

            let mut last = Duration::ZERO;
            for count in sorted {
                item.retry_count = count;
                let delay = item.retry_delay(&config);
                prop_assert!(delay >= last);
                prop_assert!(delay <= config.retry_max_delay);
                last = delay;
            }
        }
    }
}
