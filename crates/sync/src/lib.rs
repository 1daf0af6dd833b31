//! `fieldops-sync`
//!
//! **Responsibility:** the offline synchronization engine of the FieldOps
//! platform.
//!
//! A field technician's device keeps capturing changes without connectivity;
//! this crate reconciles them with the server later under three guarantees:
//! at most one concurrent drain, ordered retries with exponential backoff,
//! and field-level conflict resolution. It also builds the offline snapshot
//! a device works against and validates/applies what comes back.
//!
//! Data flow: device mutation → [`queue::SyncQueue::enqueue`] →
//! [`processor::SyncProcessor`] wakes (signal or tick) → consults
//! [`connectivity::ConnectivityOracle`] → applies each pending item through
//! the [`ports::DomainSyncApplier`] → terminal status, backoff retry, or
//! conflict → prune + stats.
//!
//! Everything relational (executions, checklist items, audit) is an external
//! collaborator behind the narrow traits in [`ports`].

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod device;
pub mod item;
pub mod ports;
pub mod priority;
pub mod processor;
pub mod queue;
pub mod snapshot;
pub mod status;

pub use config::{ConnectivityConfig, SnapshotConfig, SyncConfig};
pub use conflict::{ConflictData, ConflictResolution, ConflictResolver, ConflictStrategy};
pub use connectivity::{ConnectivityOracle, ConnectivityProbe, ConnectivityStatus, HttpProbe};
pub use device::DeviceIdentity;
pub use item::{
    NewSyncItem, StateError, SyncItemId, SyncItemType, SyncOperation, SyncQueueItem,
    SyncQueueItemSummary,
};
pub use ports::{ApplyOutcome, DomainSyncApplier, PortError};
pub use priority::SyncPriority;
pub use processor::{CycleSummary, ProcessOutcome, SyncEvent, SyncEvents, SyncProcessor};
pub use queue::{QueueError, QueueStats, SyncQueue, WakeSignals};
pub use snapshot::{
    ChecklistItemState, OfflineSnapshot, OfflineSnapshotService, SnapshotApplyOutcome,
    SnapshotError, SnapshotItem, SyncMetrics, SCHEMA_VERSION,
};
pub use status::SyncStatus;
