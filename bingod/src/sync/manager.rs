use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bingo_core::{MutationKind, Payload};
use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use super::backoff::{Decision, RetryPolicy};
use super::connectivity::Connectivity;
use super::executor::{Outcome, SyncExecutor};
use super::queue::{
    DrainReport, FailedItem, ItemState, QueueItem, QueueStatus, QueueStatusItem, lease_owner_id,
    now_millis,
};
use super::store::{LocalStore, Requeue, StorageStats, StoreError, SyncMeta};

pub const MAX_DRAIN_CONCURRENCY: usize = 4;
pub const DRAIN_LEASE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("no failed item with id {0}")]
    FailedItemNotFound(String),
    #[error("failed item {id} is older than pending item {pending_id} for the same record")]
    NewerEditPending { id: String, pending_id: String },
}

/// Owns the pending queue. The store is the only source of truth; nothing
/// about queued items is cached in memory between calls.
pub struct QueueManager {
    store: LocalStore,
    executor: Arc<dyn SyncExecutor>,
    policy: RetryPolicy,
    connectivity: Connectivity,
    concurrency: usize,
    draining: AtomicBool,
    // Holder name for the drain lease shared by every process on the database.
    lease_owner: String,
    lease_ttl: Duration,
    // Serializes coalescing writes against outcome bookkeeping.
    write_lock: Mutex<()>,
    enqueued: Notify,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QueueManager {
    pub fn new(
        store: LocalStore,
        executor: Arc<dyn SyncExecutor>,
        policy: RetryPolicy,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            executor,
            policy,
            connectivity,
            concurrency: 1,
            draining: AtomicBool::new(false),
            lease_owner: lease_owner_id(),
            lease_ttl: DRAIN_LEASE_TTL,
            write_lock: Mutex::new(()),
            enqueued: Notify::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_DRAIN_CONCURRENCY);
        self
    }

    /// How long a claimed drain lease stays valid without renewal. It is
    /// renewed after every applied outcome, so it must outlast one attempt.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Signalled after every successful enqueue.
    pub fn enqueued(&self) -> &Notify {
        &self.enqueued
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Persists the mutation and returns its queue id. Never touches the
    /// network. A re-save of a record that is still pending replaces the
    /// queued payload and returns the existing id.
    pub async fn enqueue(&self, kind: MutationKind, payload: Payload) -> Result<String, QueueError> {
        let _write = self.write_lock.lock().await;

        if let Some(key) = kind.domain_key(&payload)
            && let Some(existing) = self.store.find_pending_by_domain_key(kind, &key).await?
            && self.store.replace_payload(&existing.id, &payload).await?
        {
            tracing::debug!(id = %existing.id, %kind, domain_key = %key, "coalesced re-save into pending item");
            self.enqueued.notify_one();
            return Ok(existing.id);
        }

        let item = QueueItem::new(kind, payload, now_millis());
        self.store.put(&item).await?;
        tracing::info!(id = %item.id, %kind, "mutation queued");
        self.enqueued.notify_one();
        Ok(item.id)
    }

    /// Runs one pass over the pending queue. Returns `None` without doing
    /// anything when a pass is already running, in this process or in another
    /// one sharing the database, or when the remote is unreachable.
    pub async fn drain(&self) -> Option<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain already in progress");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        if !self.connectivity.is_online() {
            tracing::debug!("offline; drain skipped");
            return None;
        }

        match self
            .store
            .acquire_drain_lease(&self.lease_owner, now_millis(), self.lease_deadline())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("drain lease held by another process; drain skipped");
                return None;
            }
            Err(err) => {
                tracing::warn!("failed to claim drain lease: {err}");
                return None;
            }
        }

        let report = self.drain_pass().await;
        if let Err(err) = self.store.release_drain_lease(&self.lease_owner).await {
            tracing::warn!("failed to release drain lease: {err}");
        }
        if !report.is_empty() {
            tracing::info!(
                attempted = report.attempted,
                synced = report.synced,
                retried = report.retried,
                failed = report.failed,
                deferred = report.deferred,
                interrupted = report.interrupted,
                superseded = report.superseded,
                "drain finished"
            );
        }
        Some(report)
    }

    pub async fn on_connectivity_restored(&self) -> Option<DrainReport> {
        self.drain().await
    }

    pub async fn on_timer_tick(&self) -> Option<DrainReport> {
        self.drain().await
    }

    /// Drains once per offline to online transition until the connectivity
    /// channel closes.
    pub async fn run_connectivity_listener(&self) {
        let mut rx = self.connectivity.subscribe();
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if online {
                self.on_connectivity_restored().await;
            }
        }
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, QueueError> {
        let pending = self.store.list_pending().await?;
        let stats = self.store.storage_stats().await?;
        Ok(QueueStatus {
            pending_count: pending.len(),
            items: pending
                .into_iter()
                .map(|item| QueueStatusItem {
                    id: item.id,
                    kind: item.kind,
                    attempts: item.attempts,
                })
                .collect(),
            failed_count: stats.failed,
            draining: self.is_draining(),
        })
    }

    pub async fn list_failed(&self) -> Result<Vec<FailedItem>, QueueError> {
        Ok(self.store.list_failed().await?)
    }

    pub async fn clear_failed(&self) -> Result<u64, QueueError> {
        let cleared = self.store.clear_failed().await?;
        tracing::info!(cleared, "failed items cleared");
        Ok(cleared)
    }

    /// Queues a failed item's payload again as a fresh mutation. Refuses
    /// when the same record has been saved again since, so the stale payload
    /// never replaces the newer one.
    pub async fn resubmit_failed(&self, id: &str) -> Result<String, QueueError> {
        let _write = self.write_lock.lock().await;
        match self.store.requeue_failed(id, now_millis()).await? {
            Requeue::Queued(item) => {
                tracing::info!(id, new_id = %item.id, kind = %item.kind, "failed item resubmitted");
                self.enqueued.notify_one();
                Ok(item.id)
            }
            Requeue::NotFound => Err(QueueError::FailedItemNotFound(id.to_string())),
            Requeue::Superseded { pending_id } => Err(QueueError::NewerEditPending {
                id: id.to_string(),
                pending_id,
            }),
        }
    }

    pub async fn purge_synced(&self) -> Result<u64, QueueError> {
        Ok(self.store.purge_synced().await?)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, QueueError> {
        Ok(self.store.storage_stats().await?)
    }

    pub async fn sync_meta(&self) -> Result<SyncMeta, QueueError> {
        Ok(self.store.sync_meta().await?)
    }

    async fn drain_pass(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let started = now_millis();

        let pending = match self.store.list_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!("failed to load pending items: {err}");
                return report;
            }
        };
        let (due, deferred): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|item| item.is_due(started));
        report.deferred = deferred.len();
        let due_count = due.len();

        let executor = &self.executor;
        let connectivity = &self.connectivity;
        let attempts = stream::iter(due)
            .map(move |item| async move {
                if !connectivity.is_online() {
                    return (item, None);
                }
                let outcome = executor.attempt_sync(&item).await;
                (item, Some(outcome))
            })
            .buffered(self.concurrency);
        let mut attempts = std::pin::pin!(attempts);

        while let Some((item, outcome)) = attempts.next().await {
            let Some(outcome) = outcome else {
                report.interrupted += 1;
                continue;
            };
            report.attempted += 1;
            if let Err(err) = self.apply_outcome(&item, outcome, &mut report).await {
                tracing::warn!(id = %item.id, kind = %item.kind, "failed to record sync outcome: {err}");
            }
            match self
                .store
                .renew_drain_lease(&self.lease_owner, self.lease_deadline())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // Expired and claimed elsewhere; the remaining items belong to that pass.
                    report.interrupted += due_count - report.attempted - report.interrupted;
                    tracing::warn!("drain lease lost; stopping pass");
                    break;
                }
                Err(err) => tracing::warn!("failed to renew drain lease: {err}"),
            }
        }

        if let Err(err) = self.store.record_drain(now_millis(), report.synced > 0).await {
            tracing::warn!("failed to record drain time: {err}");
        }
        report
    }

    fn lease_deadline(&self) -> i64 {
        let ttl = i64::try_from(self.lease_ttl.as_millis()).unwrap_or(i64::MAX);
        now_millis().saturating_add(ttl)
    }

    async fn apply_outcome(
        &self,
        item: &QueueItem,
        outcome: Outcome,
        report: &mut DrainReport,
    ) -> Result<(), StoreError> {
        let attempts = item.attempts.saturating_add(1);
        let now = now_millis();
        let decision = self.policy.decide(attempts, &outcome);
        let _write = self.write_lock.lock().await;

        match decision {
            Decision::Synced => {
                if self
                    .store
                    .mark_synced(&item.id, item.revision, attempts, now)
                    .await?
                {
                    report.synced += 1;
                    report.tally(item.kind).synced += 1;
                    tracing::info!(id = %item.id, kind = %item.kind, attempts, "mutation synced");
                } else {
                    // Re-saved while in flight; the newer payload goes out next pass.
                    self.store
                        .record_attempt(&item.id, attempts, now, None, None)
                        .await?;
                    report.superseded += 1;
                    tracing::debug!(id = %item.id, kind = %item.kind, "delivered payload was superseded");
                }
            }
            Decision::Retry { after, reason } => {
                let delay_ms = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
                self.store
                    .record_attempt(
                        &item.id,
                        attempts,
                        now,
                        Some(now.saturating_add(delay_ms)),
                        Some(&reason),
                    )
                    .await?;
                report.retried += 1;
                report.tally(item.kind).retried += 1;
                tracing::warn!(
                    id = %item.id,
                    kind = %item.kind,
                    attempts,
                    retry_in_ms = delay_ms,
                    "sync attempt failed: {reason}"
                );
            }
            Decision::Fail { reason } => {
                let current = self.store.get(&item.id).await?;
                if current.is_some_and(|current| {
                    current.state == ItemState::Pending && current.revision != item.revision
                }) {
                    self.store
                        .record_attempt(&item.id, attempts, now, None, Some(&reason))
                        .await?;
                    report.superseded += 1;
                    tracing::debug!(id = %item.id, kind = %item.kind, "rejected payload was superseded");
                    return Ok(());
                }
                if self
                    .store
                    .archive_failed(&item.id, attempts, now, &reason)
                    .await?
                    .is_some()
                {
                    report.failed += 1;
                    report.tally(item.kind).failed += 1;
                    tracing::warn!(
                        id = %item.id,
                        kind = %item.kind,
                        attempts,
                        "mutation failed permanently: {reason}"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
