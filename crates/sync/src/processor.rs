//! The drain-cycle orchestrator.
//!
//! One scheduler loop wakes on "item added" signals, a periodic tick, or an
//! explicit force call; drains the queue in (priority, timestamp) order when
//! online; and schedules per-item backoff retries. At most one drain runs at
//! a time, enforced through the queue's processing flag, which an RAII guard
//! releases on every exit path.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityOracle;
use crate::item::{SyncItemId, SyncQueueItem};
use crate::ports::DomainSyncApplier;
use crate::queue::{QueueStats, SyncQueue, WakeSignals};

/// Why a drain cycle did (or did not) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProcessOutcome {
    /// Another drain holds the processing flag; nothing was done.
    AlreadyProcessing,
    /// Offline; work is deferred, not failed.
    Offline,
    /// Nothing pending.
    Idle,
    /// A cycle ran to completion.
    Completed(CycleSummary),
}

/// Aggregate result of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub pruned: usize,
    pub stats: QueueStats,
}

/// Notifications emitted while draining. Fire-and-forget: a listener that
/// falls behind loses events, never blocks the drain.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ItemCompleted {
        item_id: SyncItemId,
    },
    ItemFailed {
        item_id: SyncItemId,
        error: String,
        will_retry: bool,
    },
    ItemConflicted {
        item_id: SyncItemId,
        detail: String,
    },
    CycleCompleted(CycleSummary),
}

/// Receiver half of the processor's event stream.
#[derive(Debug)]
pub struct SyncEvents {
    receiver: mpsc::Receiver<SyncEvent>,
}

impl SyncEvents {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }
}

/// What happened to one item inside a drain.
enum ItemDisposition {
    Succeeded,
    Conflicted,
    Failed,
    Skipped,
}

/// Releases the queue's processing flag on every exit path, including
/// panics unwinding out of an apply call.
struct ProcessingGuard<'a> {
    queue: &'a SyncQueue,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.queue.end_processing();
    }
}

/// Scheduler/orchestrator tying queue, oracle, and applier together.
pub struct SyncProcessor {
    queue: Arc<SyncQueue>,
    oracle: Arc<ConnectivityOracle>,
    applier: Arc<dyn DomainSyncApplier>,
    config: SyncConfig,
    shutdown: Notify,
    events_tx: mpsc::Sender<SyncEvent>,
}

impl SyncProcessor {
    pub fn new(
        queue: Arc<SyncQueue>,
        oracle: Arc<ConnectivityOracle>,
        applier: Arc<dyn DomainSyncApplier>,
        config: SyncConfig,
    ) -> (Arc<Self>, SyncEvents) {
        let (events_tx, receiver) = mpsc::channel(64);
        (
            Arc::new(Self {
                queue,
                oracle,
                applier,
                config,
                shutdown: Notify::new(),
                events_tx,
            }),
            SyncEvents { receiver },
        )
    }

    /// Start the scheduler loop: periodic tick plus "item added" wake-ups,
    /// until shutdown.
    pub fn spawn(self: &Arc<Self>, mut wake: WakeSignals) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("sync processor started");

            let mut tick = tokio::time::interval(this.config.tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = this.shutdown.notified() => {
                        tracing::info!("sync processor received shutdown signal");
                        break;
                    }
                    _ = tick.tick() => {
                        this.try_process_queue().await;
                    }
                    signal = wake.recv() => {
                        match signal {
                            Some(()) => { this.try_process_queue().await; }
                            // Queue dropped; nothing left to process.
                            None => break,
                        }
                    }
                }
            }

            tracing::info!("sync processor stopped");
        })
    }

    /// Request graceful shutdown of the scheduler loop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Drain the queue if idle and online. A single item's failure never
    /// aborts the batch.
    pub async fn try_process_queue(self: &Arc<Self>) -> ProcessOutcome {
        self.process(false).await
    }

    /// Explicit "process now": forces a fresh connectivity check, then drains.
    pub async fn force_process(self: &Arc<Self>) -> ProcessOutcome {
        self.process(true).await
    }

    async fn process(self: &Arc<Self>, force_connectivity: bool) -> ProcessOutcome {
        if !self.queue.try_begin_processing() {
            tracing::debug!("drain skipped: already processing");
            return ProcessOutcome::AlreadyProcessing;
        }
        let _guard = ProcessingGuard { queue: &self.queue };

        let status = self.oracle.check(force_connectivity).await;
        if !status.is_online {
            tracing::debug!(
                internet = status.internet_reachable,
                "drain deferred: offline"
            );
            return ProcessOutcome::Offline;
        }

        let pending = self.queue.pending_items(None);
        if pending.is_empty() {
            return ProcessOutcome::Idle;
        }

        tracing::info!(count = pending.len(), "draining sync queue");
        let mut summary = CycleSummary::default();

        for item in pending {
            match self.apply_one(item).await {
                ItemDisposition::Succeeded => summary.succeeded += 1,
                ItemDisposition::Conflicted => summary.conflicts += 1,
                ItemDisposition::Failed => summary.failed += 1,
                ItemDisposition::Skipped => continue,
            }
            summary.processed += 1;
        }

        summary.pruned = self.queue.prune_completed();
        summary.stats = self.queue.stats();

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            conflicts = summary.conflicts,
            pruned = summary.pruned,
            "drain cycle complete"
        );
        self.emit(SyncEvent::CycleCompleted(summary.clone()));

        ProcessOutcome::Completed(summary)
    }

    /// Apply one claimed item and record the result. Also schedules the
    /// backoff retry when the failure is retryable.
    async fn apply_one(self: &Arc<Self>, mut item: SyncQueueItem) -> ItemDisposition {
        if let Err(err) = item.mark_syncing() {
            // The item changed state since it was pulled; leave it alone.
            tracing::warn!(item_id = %item.id, error = %err, "skipping unclaimable item");
            return ItemDisposition::Skipped;
        }
        if self.queue.update(item.clone()).is_err() {
            tracing::warn!(item_id = %item.id, "item vanished mid-drain");
            return ItemDisposition::Skipped;
        }

        let outcome = self.applier.apply(&item).await;

        if outcome.success {
            item.mark_completed();
            let _ = self.queue.update(item.clone());
            tracing::info!(item_id = %item.id, "sync item applied");
            self.emit(SyncEvent::ItemCompleted { item_id: item.id });
            return ItemDisposition::Succeeded;
        }

        if let Some(detail) = outcome.conflict {
            item.mark_conflict(&detail);
            let _ = self.queue.update(item.clone());
            tracing::warn!(item_id = %item.id, detail = %detail, "sync item conflicted");
            self.emit(SyncEvent::ItemConflicted {
                item_id: item.id,
                detail,
            });
            return ItemDisposition::Conflicted;
        }

        item.mark_failed(&outcome.message, &self.config);
        let will_retry = item.can_retry(&self.config);
        let _ = self.queue.update(item.clone());

        if will_retry {
            tracing::warn!(
                item_id = %item.id,
                retry_count = item.retry_count,
                error = %outcome.message,
                "sync item failed; retry scheduled"
            );
            self.schedule_retry(&item);
        } else {
            tracing::error!(
                item_id = %item.id,
                retry_count = item.retry_count,
                error = %outcome.message,
                "sync item failed permanently"
            );
        }

        self.emit(SyncEvent::ItemFailed {
            item_id: item.id,
            error: outcome.message,
            will_retry,
        });
        ItemDisposition::Failed
    }

    /// One-shot timer that revalidates `can_retry` when it fires; a timer
    /// for an item that has since completed or been superseded is a silent
    /// no-op.
    fn schedule_retry(self: &Arc<Self>, item: &SyncQueueItem) {
        let delay = item.retry_delay(&self.config);
        let item_id = item.id;
        let this = Arc::clone(self);

        tracing::debug!(
            item_id = %item_id,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_item(item_id).await;
        });
    }

    /// Reprocess a single item, subject to the same gating as a full drain.
    pub async fn retry_item(self: &Arc<Self>, item_id: SyncItemId) {
        let Some(item) = self.queue.get(&item_id) else {
            return;
        };
        if !item.can_retry(&self.config) {
            tracing::debug!(item_id = %item_id, "stale retry timer ignored");
            return;
        }

        if !self.queue.try_begin_processing() {
            // An active drain will pick the item up itself.
            return;
        }
        let _guard = ProcessingGuard { queue: &self.queue };

        let status = self.oracle.check(false).await;
        if !status.is_online {
            return;
        }

        // Re-fetch: the item may have moved while we checked connectivity.
        let Some(item) = self.queue.get(&item_id) else {
            return;
        };
        if !item.can_retry(&self.config) {
            return;
        }

        self.apply_one(item).await;
        self.queue.prune_completed();
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivityConfig;
    use crate::connectivity::ConnectivityProbe;
    use crate::device::DeviceIdentity;
    use crate::item::{NewSyncItem, SyncItemType, SyncOperation};
    use crate::ports::ApplyOutcome;
    use async_trait::async_trait;
    use fieldops_core::UserId;
    use serde_json::json;
    use std::time::Duration;

    struct FixedProbe {
        online: bool,
    }

    #[async_trait]
    impl ConnectivityProbe for FixedProbe {
        async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            self.online
        }
    }

    struct OkApplier;

    #[async_trait]
    impl DomainSyncApplier for OkApplier {
        async fn apply(&self, _item: &SyncQueueItem) -> ApplyOutcome {
            ApplyOutcome::ok("applied")
        }
    }

    fn oracle(online: bool) -> Arc<ConnectivityOracle> {
        Arc::new(ConnectivityOracle::new(
            ConnectivityConfig::new("http://api.local/health"),
            Arc::new(FixedProbe { online }),
        ))
    }

    fn spec() -> NewSyncItem {
        NewSyncItem::new(
            SyncItemType::Task,
            SyncOperation::Update,
            json!({"done": true}),
            DeviceIdentity::generate(),
            UserId::new(),
        )
    }

    #[tokio::test]
    async fn offline_defers_and_releases_the_flag() {
        let (queue, _wake) = SyncQueue::new();
        let queue = Arc::new(queue);
        queue.enqueue(spec());

        let (processor, _events) = SyncProcessor::new(
            queue.clone(),
            oracle(false),
            Arc::new(OkApplier),
            SyncConfig::default(),
        );

        assert_eq!(processor.try_process_queue().await, ProcessOutcome::Offline);
        assert!(!queue.is_processing());
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let (queue, _wake) = SyncQueue::new();
        let queue = Arc::new(queue);

        let (processor, _events) = SyncProcessor::new(
            queue.clone(),
            oracle(true),
            Arc::new(OkApplier),
            SyncConfig::default(),
        );

        assert!(queue.try_begin_processing());
        assert_eq!(
            processor.try_process_queue().await,
            ProcessOutcome::AlreadyProcessing
        );
        // The rejected call must not have cleared the owner's flag.
        assert!(queue.is_processing());
        queue.end_processing();
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let (queue, _wake) = SyncQueue::new();
        let queue = Arc::new(queue);

        let (processor, _events) = SyncProcessor::new(
            queue.clone(),
            oracle(true),
            Arc::new(OkApplier),
            SyncConfig::default(),
        );

        assert_eq!(processor.try_process_queue().await, ProcessOutcome::Idle);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn successful_drain_completes_and_prunes() {
        let (queue, _wake) = SyncQueue::new();
        let queue = Arc::new(queue);
        queue.enqueue(spec());
        queue.enqueue(spec());

        let (processor, mut events) = SyncProcessor::new(
            queue.clone(),
            oracle(true),
            Arc::new(OkApplier),
            SyncConfig::default(),
        );

        let outcome = processor.try_process_queue().await;
        let ProcessOutcome::Completed(summary) = outcome else {
            panic!("expected completed drain, got {outcome:?}");
        };
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.pruned, 2);
        assert_eq!(summary.stats.total, 0);
        assert!(!queue.is_processing());

        assert!(matches!(
            events.try_recv(),
            Some(SyncEvent::ItemCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn stale_retry_timer_is_a_no_op() {
        let (queue, _wake) = SyncQueue::new();
        let queue = Arc::new(queue);
        let item = queue.enqueue(spec());

        let (processor, _events) = SyncProcessor::new(
            queue.clone(),
            oracle(true),
            Arc::new(OkApplier),
            SyncConfig::default(),
        );

        // Complete the item out-of-band, then fire the retry.
        let mut done = queue.get(&item.id).unwrap();
        done.mark_syncing().unwrap();
        done.mark_completed();
        queue.update(done).unwrap();

        processor.retry_item(item.id).await;
        assert_eq!(queue.get(&item.id).unwrap().retry_count, 0);
    }
}
