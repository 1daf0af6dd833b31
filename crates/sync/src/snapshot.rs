//! Offline snapshot build / validate / apply.
//!
//! A snapshot is a flattened, self-contained copy of an execution's checklist
//! that a device can work against without connectivity. What the device sends
//! back is untrusted input: it goes through integrity validation before a
//! retried, effectively-atomic apply step that updates items, marks the
//! execution synchronized, and writes an audit record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use fieldops_core::{ChecklistId, ChecklistItemId, ExecutionId, OrderId, UserId};

use crate::config::SnapshotConfig;
use crate::device::DeviceIdentity;
use crate::ports::{
    AuditReader, AuditRecord, AuditSink, ChecklistItemStore, ChecklistItemUpdate,
    ExecutionReader, ExecutionStore, GeoLocation, PortError,
};

/// Version of the snapshot payload schema this build produces.
pub const SCHEMA_VERSION: u32 = 1;

/// Audit action name stamped on every offline sync.
pub const SYNC_ACTION: &str = "SYNC_OFFLINE";

/// State of a checklist item as captured on-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecklistItemState {
    Pending,
    Completed,
    Rejected,
}

impl ChecklistItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistItemState::Pending => "pending",
            ChecklistItemState::Completed => "completed",
            ChecklistItemState::Rejected => "rejected",
        }
    }

    /// Parse a device-reported state; `None` for anything outside the known
    /// set.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ChecklistItemState::Pending),
            "completed" => Some(ChecklistItemState::Completed),
            "rejected" => Some(ChecklistItemState::Rejected),
            _ => None,
        }
    }
}

/// One flattened checklist item inside a snapshot.
///
/// `state` stays a plain string here: the payload is a wire document coming
/// back from devices, and unknown states must be caught by integrity
/// validation, not by deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub id: ChecklistItemId,
    pub name: String,
    pub state: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub checklist_id: ChecklistId,
    /// Global position assigned by structural traversal order.
    pub ordinal: u32,
}

/// Self-contained, offline-usable copy of an execution's checklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineSnapshot {
    pub execution_id: ExecutionId,
    pub order_id: OrderId,
    pub order_number: String,
    pub items: Vec<SnapshotItem>,
    pub captured_at: DateTime<Utc>,
    pub device_id: DeviceIdentity,
    /// Where the device was when it finished working, if it reported one.
    pub location: Option<GeoLocation>,
    pub schema_version: u32,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("integrity validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] PortError),
}

/// Result of an apply run, returned (not thrown) to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotApplyOutcome {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub items_updated: usize,
    pub error_count: usize,
    pub message: String,
    pub processing_time_ms: u64,
}

/// Aggregate view of an actor's recent offline syncs, derived from audit
/// records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncMetrics {
    pub total_synced: u64,
    pub total_failed: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Builds offline snapshots and validates/applies what devices send back.
pub struct OfflineSnapshotService {
    reader: Arc<dyn ExecutionReader>,
    items: Arc<dyn ChecklistItemStore>,
    executions: Arc<dyn ExecutionStore>,
    audit: Arc<dyn AuditSink>,
    audit_reader: Arc<dyn AuditReader>,
    config: SnapshotConfig,
}

impl OfflineSnapshotService {
    pub fn new(
        reader: Arc<dyn ExecutionReader>,
        items: Arc<dyn ChecklistItemStore>,
        executions: Arc<dyn ExecutionStore>,
        audit: Arc<dyn AuditSink>,
        audit_reader: Arc<dyn AuditReader>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            reader,
            items,
            executions,
            audit,
            audit_reader,
            config,
        }
    }

    /// Flatten an execution's checklists into an offline-usable payload.
    /// Ordinals follow structural traversal order, not time.
    pub async fn build_snapshot(
        &self,
        execution_id: ExecutionId,
    ) -> Result<OfflineSnapshot, SnapshotError> {
        let source = self
            .reader
            .load_checklists(execution_id)
            .await?
            .ok_or(SnapshotError::ExecutionNotFound(execution_id))?;

        let mut items = Vec::new();
        let mut ordinal = 0u32;
        for checklist in &source.checklists {
            for item in &checklist.items {
                items.push(SnapshotItem {
                    id: item.id,
                    name: item.name.clone(),
                    state: item.state.as_str().to_string(),
                    completed_at: item.completed_at,
                    notes: item.notes.clone(),
                    checklist_id: checklist.id,
                    ordinal,
                });
                ordinal += 1;
            }
        }

        tracing::info!(
            execution_id = %execution_id,
            items = items.len(),
            "offline snapshot built"
        );

        Ok(OfflineSnapshot {
            execution_id,
            order_id: source.order_id,
            order_number: source.order_number,
            items,
            captured_at: Utc::now(),
            device_id: DeviceIdentity::generate(),
            location: None,
            schema_version: SCHEMA_VERSION,
        })
    }

    /// Integrity rules a returning payload must pass, checked in order:
    /// no duplicate item ids, only known states, every id known to the
    /// source of truth, and a supported schema version.
    pub async fn validate_integrity(
        &self,
        payload: &OfflineSnapshot,
    ) -> Result<(), SnapshotError> {
        let mut seen = HashSet::new();
        for item in &payload.items {
            if !seen.insert(item.id) {
                return Err(SnapshotError::Validation(format!(
                    "payload contains duplicate checklist item id: {}",
                    item.id
                )));
            }
        }

        for item in &payload.items {
            if ChecklistItemState::parse(&item.state).is_none() {
                return Err(SnapshotError::Validation(format!(
                    "unknown checklist item state: {:?}",
                    item.state
                )));
            }
        }

        let ids: Vec<ChecklistItemId> = payload.items.iter().map(|item| item.id).collect();
        let existing = self.items.existing_ids(&ids).await?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !existing.contains(*id))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SnapshotError::Validation(format!(
                "checklist items not found in source of truth: {}",
                missing.join(", ")
            )));
        }

        if payload.schema_version > self.config.max_schema_version {
            return Err(SnapshotError::Validation(format!(
                "unsupported schema version {}; maximum supported is {}",
                payload.schema_version, self.config.max_schema_version
            )));
        }

        tracing::debug!(execution_id = %payload.execution_id, "integrity validation passed");
        Ok(())
    }

    /// Validate, then run the effectively-atomic apply step with bounded
    /// retries. Validation failures surface as `Err`; exhausted transient
    /// retries come back as a failure outcome the caller treats like any
    /// other apply failure.
    pub async fn apply(
        &self,
        payload: &OfflineSnapshot,
        user_id: &UserId,
    ) -> Result<SnapshotApplyOutcome, SnapshotError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.try_apply(payload, user_id).await {
                Ok((items_updated, error_count)) => {
                    let processing_time_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        execution_id = %payload.execution_id,
                        items_updated,
                        error_count,
                        processing_time_ms,
                        "offline snapshot applied"
                    );
                    return Ok(SnapshotApplyOutcome {
                        success: true,
                        execution_id: payload.execution_id,
                        items_updated,
                        error_count,
                        message: format!(
                            "synchronization complete: {items_updated} items updated"
                        ),
                        processing_time_ms,
                    });
                }
                Err(SnapshotError::Store(err)) if err.is_transient() => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %err,
                        "snapshot apply attempt failed"
                    );
                    if attempt >= self.config.max_attempts {
                        let message = format!(
                            "synchronization failed after {} attempts",
                            self.config.max_attempts
                        );
                        tracing::error!(execution_id = %payload.execution_id, "{message}");
                        return Ok(SnapshotApplyOutcome {
                            success: false,
                            execution_id: payload.execution_id,
                            items_updated: 0,
                            error_count: payload.items.len(),
                            message,
                            processing_time_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.apply_backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Recent-sync metrics for one actor, read back from the audit trail.
    pub async fn sync_metrics(&self, user_id: &UserId) -> Result<SyncMetrics, PortError> {
        let records = self
            .audit_reader
            .recent_by_actor(user_id, SYNC_ACTION, 100)
            .await?;

        let total_synced = records
            .iter()
            .filter_map(|record| record.detail.get("itemsUpdated"))
            .filter_map(|value| value.as_u64())
            .sum();
        let total_failed = records
            .iter()
            .filter_map(|record| record.detail.get("errors"))
            .filter_map(|value| value.as_u64())
            .sum();

        Ok(SyncMetrics {
            total_synced,
            total_failed,
            last_sync_at: records.first().map(|record| record.recorded_at),
        })
    }

    /// One attempt at the whole apply step. A single item failing is counted
    /// and carried into the audit record without aborting the step; a store
    /// failure on the execution update or audit write fails the attempt.
    async fn try_apply(
        &self,
        payload: &OfflineSnapshot,
        user_id: &UserId,
    ) -> Result<(usize, usize), SnapshotError> {
        self.validate_integrity(payload).await?;

        let mut items_updated = 0usize;
        let mut item_errors = 0usize;

        for item in &payload.items {
            // Unreachable after validation, but a counted error beats a panic.
            let Some(state) = ChecklistItemState::parse(&item.state) else {
                item_errors += 1;
                continue;
            };

            let update = ChecklistItemUpdate {
                id: item.id,
                state,
                completed_at: item.completed_at,
                notes: item.notes.clone(),
                completed_by: (state == ChecklistItemState::Completed).then_some(*user_id),
            };

            match self.items.update_state(update).await {
                Ok(()) => items_updated += 1,
                Err(err) => {
                    tracing::warn!(
                        item_id = %item.id,
                        error = %err,
                        "checklist item update failed"
                    );
                    item_errors += 1;
                }
            }
        }

        self.executions
            .mark_synchronized(payload.execution_id, payload.location)
            .await?;

        self.audit
            .record(AuditRecord {
                action: SYNC_ACTION.to_string(),
                entity_type: "Execution".to_string(),
                entity_id: payload.execution_id.to_string(),
                actor: *user_id,
                detail: json!({
                    "itemsUpdated": items_updated,
                    "deviceId": payload.device_id,
                    "capturedAt": payload.captured_at,
                    "errors": item_errors,
                }),
                recorded_at: Utc::now(),
            })
            .await?;

        Ok((items_updated, item_errors))
    }

    fn apply_backoff(&self, attempt: u32) -> Duration {
        self.config
            .retry_base_delay
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1).min(31)).unwrap_or(u32::MAX))
    }
}
