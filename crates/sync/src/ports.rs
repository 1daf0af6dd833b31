//! Narrow contracts the engine consumes.
//!
//! The relational world (executions, checklist items, audit log) and the
//! domain-specific apply step live behind these traits. The engine never
//! reaches around them, and their transactional discipline is owned by the
//! implementing side. In-memory implementations for tests/dev sit next to
//! the traits.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fieldops_core::{ChecklistId, ChecklistItemId, ExecutionId, OrderId, UserId};

use crate::item::SyncQueueItem;
use crate::snapshot::ChecklistItemState;

/// Failure surfaced by a collaborator.
///
/// `Unavailable` is transient (worth retrying); `NotFound` is not.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl PortError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(anyhow::anyhow!(msg.into()))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Unavailable(_))
    }
}

/// GPS fix reported by a device at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// One checklist item as read from the system of record.
#[derive(Debug, Clone)]
pub struct SourceChecklistItem {
    pub id: ChecklistItemId,
    pub name: String,
    pub state: ChecklistItemState,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// A named checklist and its items, in structural order.
#[derive(Debug, Clone)]
pub struct ChecklistGroup {
    pub id: ChecklistId,
    pub name: String,
    pub items: Vec<SourceChecklistItem>,
}

/// Checklist structure of one execution plus its parent order.
#[derive(Debug, Clone)]
pub struct ExecutionChecklists {
    pub execution_id: ExecutionId,
    pub order_id: OrderId,
    pub order_number: String,
    pub checklists: Vec<ChecklistGroup>,
}

/// Read access to an execution's checklist structure.
#[async_trait]
pub trait ExecutionReader: Send + Sync {
    async fn load_checklists(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionChecklists>, PortError>;
}

/// Point update of one checklist item's state and completion metadata.
#[derive(Debug, Clone)]
pub struct ChecklistItemUpdate {
    pub id: ChecklistItemId,
    pub state: ChecklistItemState,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Who gets the completion attributed; set only when the item becomes
    /// completed.
    pub completed_by: Option<UserId>,
}

/// Existence checks and point updates against checklist items.
#[async_trait]
pub trait ChecklistItemStore: Send + Sync {
    /// Which of the given ids exist in the source of truth.
    async fn existing_ids(
        &self,
        ids: &[ChecklistItemId],
    ) -> Result<HashSet<ChecklistItemId>, PortError>;

    async fn update_state(&self, update: ChecklistItemUpdate) -> Result<(), PortError>;
}

/// Point update marking an execution synchronized.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn mark_synchronized(
        &self,
        execution_id: ExecutionId,
        location: Option<GeoLocation>,
    ) -> Result<(), PortError>;
}

/// Structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: UserId,
    pub detail: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit writes.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), PortError>;
}

/// Read access to recent audit records, newest first.
#[async_trait]
pub trait AuditReader: Send + Sync {
    async fn recent_by_actor(
        &self,
        actor: &UserId,
        action: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, PortError>;
}

/// Outcome of applying one queued change against the system of record.
/// Failures are reported here, not thrown; the processor turns them into
/// retries or a `Failed`/`Conflict` status.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub message: String,
    /// Server-assigned id when the apply created a record.
    pub new_id: Option<String>,
    /// Divergence detail when the applier hit a concurrent edit.
    pub conflict: Option<String>,
}

impl ApplyOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_id: None,
            conflict: None,
        }
    }

    pub fn created(message: impl Into<String>, new_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_id: Some(new_id.into()),
            conflict: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            new_id: None,
            conflict: None,
        }
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            success: false,
            message: format!("conflict: {detail}"),
            new_id: None,
            conflict: Some(detail),
        }
    }
}

/// The domain-specific create/update/delete against the system of record.
#[async_trait]
pub trait DomainSyncApplier: Send + Sync {
    async fn apply(&self, item: &SyncQueueItem) -> ApplyOutcome;
}

/// In-memory execution/checklist world for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryWorkOrderStore {
    executions: RwLock<HashMap<ExecutionId, ExecutionChecklists>>,
    item_states: RwLock<HashMap<ChecklistItemId, ChecklistItemUpdate>>,
    synchronized: RwLock<HashMap<ExecutionId, Option<GeoLocation>>>,
}

impl InMemoryWorkOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an execution and index its items for existence checks.
    pub fn insert_execution(&self, execution: ExecutionChecklists) {
        let mut item_states = self.item_states.write().unwrap();
        for checklist in &execution.checklists {
            for item in &checklist.items {
                item_states.insert(
                    item.id,
                    ChecklistItemUpdate {
                        id: item.id,
                        state: item.state,
                        completed_at: item.completed_at,
                        notes: item.notes.clone(),
                        completed_by: None,
                    },
                );
            }
        }
        self.executions
            .write()
            .unwrap()
            .insert(execution.execution_id, execution);
    }

    pub fn item_state(&self, id: &ChecklistItemId) -> Option<ChecklistItemUpdate> {
        self.item_states.read().unwrap().get(id).cloned()
    }

    pub fn synchronized_location(
        &self,
        execution_id: &ExecutionId,
    ) -> Option<Option<GeoLocation>> {
        self.synchronized.read().unwrap().get(execution_id).copied()
    }
}

#[async_trait]
impl ExecutionReader for InMemoryWorkOrderStore {
    async fn load_checklists(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionChecklists>, PortError> {
        Ok(self.executions.read().unwrap().get(&execution_id).cloned())
    }
}

#[async_trait]
impl ChecklistItemStore for InMemoryWorkOrderStore {
    async fn existing_ids(
        &self,
        ids: &[ChecklistItemId],
    ) -> Result<HashSet<ChecklistItemId>, PortError> {
        let item_states = self.item_states.read().unwrap();
        Ok(ids
            .iter()
            .filter(|id| item_states.contains_key(*id))
            .copied()
            .collect())
    }

    async fn update_state(&self, update: ChecklistItemUpdate) -> Result<(), PortError> {
        let mut item_states = self.item_states.write().unwrap();
        if !item_states.contains_key(&update.id) {
            return Err(PortError::NotFound(update.id.to_string()));
        }
        item_states.insert(update.id, update);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryWorkOrderStore {
    async fn mark_synchronized(
        &self,
        execution_id: ExecutionId,
        location: Option<GeoLocation>,
    ) -> Result<(), PortError> {
        if !self
            .executions
            .read()
            .unwrap()
            .contains_key(&execution_id)
        {
            return Err(PortError::NotFound(execution_id.to_string()));
        }
        self.synchronized
            .write()
            .unwrap()
            .insert(execution_id, location);
        Ok(())
    }
}

/// In-memory audit log for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.read().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<(), PortError> {
        self.records.write().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl AuditReader for InMemoryAuditLog {
    async fn recent_by_actor(
        &self,
        actor: &UserId,
        action: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, PortError> {
        let records = self.records.read().unwrap();
        let mut matching: Vec<AuditRecord> = records
            .iter()
            .filter(|record| &record.actor == actor && record.action == action)
            .cloned()
            .collect();
        matching.sort_by_key(|record| std::cmp::Reverse(record.recorded_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
