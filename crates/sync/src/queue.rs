//! In-memory, priority-ordered holding area for pending sync work.
//!
//! The queue is the only shared mutable state in the engine: an id-keyed map
//! behind a lock plus one atomic flag gating drain cycles. It carries no
//! durability guarantee between restarts; `export_all`/`import_all` cover
//! continuity when the host wants it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use fieldops_core::UserId;

use crate::item::{NewSyncItem, SyncItemId, SyncQueueItem};
use crate::status::SyncStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue item not found: {0}")]
    NotFound(SyncItemId),
}

/// Full-scan tally of queue contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflict: usize,
}

/// Receiver half of the queue's "item added" wake channel.
///
/// The processor selects on this; the queue only ever fire-and-forgets into
/// the sending half.
#[derive(Debug)]
pub struct WakeSignals {
    receiver: mpsc::Receiver<()>,
}

impl WakeSignals {
    /// Wait for the next wake signal; `None` once the queue is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }
}

/// The authoritative in-process holding area for not-yet-completed items.
pub struct SyncQueue {
    items: RwLock<HashMap<SyncItemId, SyncQueueItem>>,
    processing: AtomicBool,
    wake_tx: mpsc::Sender<()>,
}

impl SyncQueue {
    /// Create the queue and the wake-signal stream its processor listens on.
    pub fn new() -> (Self, WakeSignals) {
        let (wake_tx, receiver) = mpsc::channel(16);
        (
            Self {
                items: RwLock::new(HashMap::new()),
                processing: AtomicBool::new(false),
                wake_tx,
            },
            WakeSignals { receiver },
        )
    }

    /// Build and insert a new item, then signal the processor.
    pub fn enqueue(&self, spec: NewSyncItem) -> SyncQueueItem {
        let item = SyncQueueItem::new(spec);
        self.items
            .write()
            .unwrap()
            .insert(item.id, item.clone());

        // Fire-and-forget: a full channel means the processor is already
        // awake and will see this item when it pulls pending work.
        let _ = self.wake_tx.try_send(());

        tracing::debug!(
            item_id = %item.id,
            item_type = ?item.item_type,
            priority = ?item.priority,
            "sync item queued"
        );
        item
    }

    /// Items awaiting sync (`Pending` or `Conflict`), optionally scoped to a
    /// user, ordered by (priority, capture timestamp).
    pub fn pending_items(&self, user_id: Option<&UserId>) -> Vec<SyncQueueItem> {
        let items = self.items.read().unwrap();
        let mut pending: Vec<SyncQueueItem> = items
            .values()
            .filter(|item| {
                matches!(item.status, SyncStatus::Pending | SyncStatus::Conflict)
            })
            .filter(|item| user_id.map_or(true, |user| &item.user_id == user))
            .cloned()
            .collect();

        pending.sort_by_key(|item| (item.priority.order(), item.timestamp));
        pending
    }

    pub fn get(&self, id: &SyncItemId) -> Option<SyncQueueItem> {
        self.items.read().unwrap().get(id).cloned()
    }

    /// Replace an item wholesale (last-write-wins; the processor owns the
    /// correctness of concurrent mutation).
    pub fn update(&self, item: SyncQueueItem) -> Result<(), QueueError> {
        let mut items = self.items.write().unwrap();
        if !items.contains_key(&item.id) {
            return Err(QueueError::NotFound(item.id));
        }
        items.insert(item.id, item);
        Ok(())
    }

    /// Drop all completed items; returns how many were removed.
    pub fn prune_completed(&self) -> usize {
        let mut items = self.items.write().unwrap();
        let before = items.len();
        items.retain(|_, item| item.status != SyncStatus::Completed);
        let pruned = before - items.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned completed sync items");
        }
        pruned
    }

    pub fn stats(&self) -> QueueStats {
        let items = self.items.read().unwrap();
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in items.values() {
            match item.status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Completed => stats.completed += 1,
                SyncStatus::Failed => stats.failed += 1,
                SyncStatus::Conflict => stats.conflict += 1,
            }
        }
        stats
    }

    /// Serialize every item for restart continuity.
    pub fn export_all(&self) -> Vec<Value> {
        let items = self.items.read().unwrap();
        items
            .values()
            .filter_map(|item| match serde_json::to_value(item) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::error!(item_id = %item.id, error = %err, "failed to export sync item");
                    None
                }
            })
            .collect()
    }

    /// Re-load previously exported records. Completed items and malformed
    /// records are skipped, never fatal. Returns how many were imported.
    pub fn import_all(&self, records: Vec<Value>) -> usize {
        let mut imported = 0;
        let mut items = self.items.write().unwrap();

        for record in records {
            let item: SyncQueueItem = match serde_json::from_value(record) {
                Ok(item) => item,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed sync queue record");
                    continue;
                }
            };
            if item.status == SyncStatus::Completed {
                tracing::debug!(item_id = %item.id, "skipping already-completed record");
                continue;
            }
            items.insert(item.id, item);
            imported += 1;
        }

        tracing::info!(imported, "sync queue import finished");
        imported
    }

    /// Whether a drain cycle is currently active.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Atomically claim the drain flag. Returns false when another drain is
    /// already running.
    pub fn try_begin_processing(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the drain flag; must run on every exit path of a drain.
    pub fn end_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }
}
