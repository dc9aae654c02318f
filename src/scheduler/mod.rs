//! The Upload Scheduler: drives which queued transfer gets a slot next
//! and tracks the in-flight task for each dispatched upload.
//!
//! `schedule()` and `monitor()` each guard themselves with a
//! `tokio::sync::Mutex::try_lock`, mirroring `DownloadEngine::process_queue`'s
//! single-flight guard: a burst of external triggers (progress ticks,
//! reconfigure events, a timer) collapses to one running pass rather than
//! queuing up redundant ones.

mod error;

pub use error::SchedulerError;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::governor::{Governor, Grant};
use crate::peer::{PeerClient, UploadHooks, UploadRequest};
use crate::queue::{ResolvedCandidate, SlotOutcome, UploadQueue};
use crate::sync_support::CancellationToken;
use crate::transfer::{Transfer, TransferFilter, TransferId, TransferState, TransferStore};
use crate::user_service::UserService;

/// Soft overshoot allowance above `global_slots` that `schedule()`
/// tolerates before refusing to consider new candidates — slots in flight
/// can briefly exceed the configured total when a reconfigure lowers it
/// out from under already-dispatched transfers, and that is accepted by
/// design rather than forcibly aborted.
const GLOBAL_SLOT_OVERSHOOT_ALLOWANCE: u32 = 4;

/// The progress-persistence throttle: updates closer together than this
/// are coalesced in memory and not written through to the store.
const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_millis(250);

/// Implements the six callbacks a `PeerClient` drives a transfer through,
/// wiring them to the Queue and Governor. Kept as its own `Arc`-held type
/// (rather than implementing `UploadHooks` directly on `UploadScheduler`)
/// so it can be held independently by spawned tasks without needing a
/// self-referential `Arc<UploadScheduler>`.
pub struct SchedulerHooks {
    queue: Arc<UploadQueue>,
    governor: Arc<Governor>,
    store: Arc<dyn TransferStore>,
    last_persisted: DashMap<TransferId, tokio::time::Instant>,
}

impl SchedulerHooks {
    fn new(queue: Arc<UploadQueue>, governor: Arc<Governor>, store: Arc<dyn TransferStore>) -> Self {
        Self {
            queue,
            governor,
            store,
            last_persisted: DashMap::new(),
        }
    }

    async fn persist(&self, transfer: &Transfer) {
        if let Err(error) = self.store.update(transfer.clone()).await {
            warn!(id = %transfer.id, %error, "failed to persist transfer state");
        }
    }
}

#[async_trait]
impl UploadHooks for SchedulerHooks {
    async fn on_state_changed(&self, _previous: TransferState, transfer: &Transfer) {
        if transfer.state.is_queued() {
            self.queue.enqueue(&transfer.username, &transfer.filename);
        }
        self.persist(transfer).await;
    }

    async fn on_progress(&self, transfer: &Transfer) {
        let now = tokio::time::Instant::now();
        let should_persist = self
            .last_persisted
            .get(&transfer.id)
            .map(|last| now.duration_since(*last) >= PROGRESS_PERSIST_INTERVAL)
            .unwrap_or(true);
        if should_persist {
            self.last_persisted.insert(transfer.id.clone(), now);
            self.persist(transfer).await;
        }
    }

    async fn on_governor(&self, transfer: &Transfer, requested: u64, cancel: CancellationToken) -> Grant {
        self.governor.acquire(&transfer.username, requested, &cancel).await
    }

    async fn on_reporter(&self, _transfer: &Transfer, grant: Grant, attempted: u64, actual: u64) {
        self.governor.give_back(grant, attempted, actual).await;
    }

    async fn on_slot_awaiter(&self, transfer: &Transfer, cancel: CancellationToken) -> SlotOutcome {
        let Some(slot) = self.queue.await_start(&transfer.username, &transfer.filename) else {
            return SlotOutcome::Cancelled;
        };
        tokio::select! {
            outcome = slot.wait() => outcome,
            () = cancel.cancelled() => SlotOutcome::Cancelled,
        }
    }

    async fn on_slot_released(&self, transfer: &Transfer) {
        self.queue.complete(&transfer.username, &transfer.filename);
        self.last_persisted.remove(&transfer.id);
    }
}

struct TrackedTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct UploadScheduler {
    hooks: Arc<SchedulerHooks>,
    queue: Arc<UploadQueue>,
    store: Arc<dyn TransferStore>,
    user_service: Arc<dyn UserService>,
    peer_client: Arc<dyn PeerClient>,
    tracked: DashMap<TransferId, TrackedTask>,
    schedule_lock: AsyncMutex<()>,
    monitor_lock: AsyncMutex<()>,
    global_slots: AtomicU32,
}

impl UploadScheduler {
    #[must_use]
    pub fn new(
        queue: Arc<UploadQueue>,
        governor: Arc<Governor>,
        store: Arc<dyn TransferStore>,
        user_service: Arc<dyn UserService>,
        peer_client: Arc<dyn PeerClient>,
        global_slots: u32,
    ) -> Self {
        Self {
            hooks: Arc::new(SchedulerHooks::new(queue.clone(), governor, store.clone())),
            queue,
            store,
            user_service,
            peer_client,
            tracked: DashMap::new(),
            schedule_lock: AsyncMutex::new(()),
            monitor_lock: AsyncMutex::new(()),
            global_slots: AtomicU32::new(global_slots),
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn set_global_slots(&self, slots: u32) {
        self.global_slots.store(slots, Ordering::SeqCst);
    }

    /// Spawns the peer-client upload for a transfer already in
    /// `Queued|Locally`. Duplicate calls for a transfer already tracked
    /// are suppressed (idempotent) and logged, never double-dispatched.
    #[instrument(skip(self, transfer), fields(id = %transfer.id))]
    pub async fn launch(&self, transfer: Transfer) {
        use dashmap::mapref::entry::Entry;

        let cancel = CancellationToken::new();
        match self.tracked.entry(transfer.id.clone()) {
            Entry::Occupied(_) => {
                warn!(id = %transfer.id, "duplicate schedule suppressed");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(TrackedTask {
                    cancel: cancel.clone(),
                    handle: None,
                });
            }
        }

        let hooks = self.hooks.clone();
        let peer_client = self.peer_client.clone();
        let store = self.store.clone();
        let id = transfer.id.clone();
        let request = UploadRequest::from(&transfer);

        let join = tokio::spawn(async move {
            let result = peer_client.upload(request, hooks, cancel).await;
            finalize(&store, &id, result).await;
        });

        if let Some(mut entry) = self.tracked.get_mut(&transfer.id) {
            entry.handle = Some(join);
        }
    }

    /// One scheduling pass: launches any pending transfer not yet tracked
    /// (covers restart recovery and retried launch failures), then asks
    /// the Queue to select and grant at most one candidate.
    pub async fn schedule(&self) {
        let Ok(_guard) = self.schedule_lock.try_lock() else {
            return;
        };

        // Gated on granted slots, not `tracked.len()`: every launched
        // transfer sits in `tracked` from the moment it's spawned, long
        // before it ever holds a slot, so `tracked.len()` would count
        // parked waiters as if they were active uploads and could wedge
        // this check shut forever once enough transfers are enqueued.
        let overshoot_ceiling = self.global_slots.load(Ordering::SeqCst) + GLOBAL_SLOT_OVERSHOOT_ALLOWANCE;
        if self.queue.total_used_slots() > overshoot_ceiling {
            return;
        }

        let pending = match self.store.list(TransferFilter::pending(), false).await {
            Ok(rows) => rows,
            Err(error) => {
                warn!(%error, "failed to list pending transfers");
                return;
            }
        };

        for transfer in pending.iter().filter(|t| !self.tracked.contains_key(&t.id)) {
            self.launch(transfer.clone()).await;
        }

        let mut resolved = Vec::with_capacity(pending.len());
        for transfer in &pending {
            let group = self.user_service.effective_group(&transfer.username).await;
            resolved.push(ResolvedCandidate {
                username: transfer.username.clone(),
                filename: transfer.filename.clone(),
                group,
            });
        }
        self.queue.select_and_grant(&resolved);
    }

    /// Reconciliation pass: for every tracked task whose `JoinHandle` has
    /// finished, awaits it (cheap, since it's already done), drops it from
    /// tracking, and — if the persisted row still lacks `Completed` (task
    /// panicked, or a persistence failure left it hanging) — retrofits a
    /// terminal state so no transfer is left stuck forever.
    pub async fn monitor(&self) {
        let Ok(_guard) = self.monitor_lock.try_lock() else {
            return;
        };

        let finished: Vec<TransferId> = self
            .tracked
            .iter()
            .filter(|e| e.handle.as_ref().is_some_and(JoinHandle::is_finished))
            .map(|e| e.key().clone())
            .collect();

        for id in finished {
            if let Some((_, mut task)) = self.tracked.remove(&id) {
                if let Some(handle) = task.handle.take() {
                    if let Err(join_error) = handle.await {
                        warn!(%id, %join_error, "upload task ended abnormally");
                    }
                }
            }

            match self.store.find(&id).await {
                Ok(Some(mut row)) if !row.state.is_terminal() => {
                    row.mark_completed(
                        TransferState::ERRORED,
                        Some("reconciled: task ended without a terminal state".to_string()),
                    );
                    if let Err(error) = self.store.update(row).await {
                        warn!(%id, %error, "failed to persist reconciled terminal state");
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(%id, %error, "failed to load transfer during reconciliation"),
            }
        }
    }

    /// Cancels a tracked transfer and removes it from tracking immediately,
    /// so a second call for the same id sees no entry. Idempotent: the
    /// first call returns `true`, later calls for the same id return
    /// `false`. The spawned task itself keeps running to drain its
    /// cancellation and finalize the transfer — dropping it from `tracked`
    /// only means `monitor()` no longer has to reconcile it.
    pub fn try_cancel(&self, id: &TransferId) -> bool {
        match self.tracked.remove(id) {
            Some((_, task)) => {
                task.cancel.cancel();
                true
            }
            None => self.queue_level_cancel(id),
        }
    }

    fn queue_level_cancel(&self, _id: &TransferId) -> bool {
        // A transfer not yet tracked has no running task to cancel; the
        // queue-level `cancel` path is keyed by (username, filename), not
        // transfer id, and is driven by `UploadManager` which has both.
        false
    }
}

async fn finalize(store: &Arc<dyn TransferStore>, id: &TransferId, result: Result<Transfer, crate::peer::PeerClientError>) {
    use crate::peer::PeerClientError;

    let (outcome, exception) = match &result {
        Ok(_) => (TransferState::SUCCEEDED, None),
        Err(PeerClientError::Cancelled) => (TransferState::CANCELLED, None),
        Err(PeerClientError::TimedOut) => (TransferState::TIMED_OUT, Some("transfer timed out".to_string())),
        Err(error @ PeerClientError::PeerOffline(_)) => (TransferState::ERRORED, Some(error.to_string())),
        Err(error @ PeerClientError::Other(_)) => (TransferState::ERRORED, Some(error.to_string())),
    };

    match store.find(id).await {
        Ok(Some(mut row)) => {
            if !row.state.is_terminal() {
                row.mark_completed(outcome, exception);
                if let Err(error) = store.update(row).await {
                    warn!(%id, %error, "failed to persist terminal transfer state");
                }
            }
        }
        Ok(None) => warn!(%id, "transfer vanished before finalization"),
        Err(error) => warn!(%id, %error, "failed to load transfer for finalization"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{GroupOptions, Options, Strategy, UploadOptions};
    use crate::peer::FakePeerClient;
    use crate::transfer::InMemoryTransferStore;
    use crate::user_service::InMemoryUserService;
    use std::collections::HashMap as StdHashMap;

    fn options() -> Options {
        Options {
            upload: UploadOptions {
                global_slots: 2,
                global_speed_limit: None,
                default: GroupOptions {
                    slots: 2,
                    priority: 10,
                    strategy: Strategy::FirstInFirstOut,
                    speed_limit: None,
                    members: Vec::new(),
                },
                leechers: GroupOptions {
                    slots: 1,
                    priority: 100,
                    strategy: Strategy::FirstInFirstOut,
                    speed_limit: None,
                    members: Vec::new(),
                },
                user_defined: StdHashMap::new(),
            },
        }
    }

    fn scheduler() -> (Arc<UploadScheduler>, Arc<UploadQueue>, Arc<dyn TransferStore>) {
        let opts = options();
        let queue = Arc::new(UploadQueue::new(&opts));
        let governor = Arc::new(Governor::new(&opts, Arc::new(InMemoryUserService::new())));
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let user_service: Arc<dyn UserService> = Arc::new(InMemoryUserService::new());
        let peer_client: Arc<dyn PeerClient> = Arc::new(FakePeerClient {
            chunk_size: 1024,
            ..FakePeerClient::default()
        });
        let scheduler = Arc::new(UploadScheduler::new(
            queue.clone(),
            governor,
            store.clone(),
            user_service,
            peer_client,
            opts.upload.global_slots,
        ));
        (scheduler, queue, store)
    }

    #[tokio::test]
    async fn schedule_launches_pending_transfers_and_grants_a_slot() {
        let (scheduler, queue, store) = scheduler();
        let mut transfer = Transfer::new_upload("1".into(), "alice", "a.bin", "/tmp/a.bin".into(), 10);
        transfer.transition_to_queued_locally();
        store.add_or_supersede(transfer).await.unwrap();
        queue.enqueue("alice", "a.bin");

        scheduler.schedule().await;
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.monitor().await;

        let row = store.find(&"1".to_string()).await.unwrap().unwrap();
        assert!(row.state.is_terminal());
        assert!(row.state.contains(TransferState::SUCCEEDED));
    }

    #[tokio::test]
    async fn duplicate_launch_for_the_same_transfer_is_suppressed() {
        let (scheduler, _queue, store) = scheduler();
        let mut transfer = Transfer::new_upload("1".into(), "alice", "a.bin", "/tmp/a.bin".into(), 10);
        transfer.transition_to_queued_locally();
        store.add_or_supersede(transfer.clone()).await.unwrap();

        scheduler.launch(transfer.clone()).await;
        scheduler.launch(transfer).await;
        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn try_cancel_is_idempotent() {
        let (scheduler, queue, store) = scheduler();
        let mut transfer = Transfer::new_upload("1".into(), "alice", "a.bin", "/tmp/a.bin".into(), u64::from(u32::MAX));
        transfer.transition_to_queued_locally();
        store.add_or_supersede(transfer.clone()).await.unwrap();
        queue.enqueue("alice", "a.bin");

        scheduler.launch(transfer).await;
        assert!(scheduler.try_cancel(&"1".to_string()));
        assert!(!scheduler.try_cancel(&"1".to_string()));
    }

    #[tokio::test]
    async fn offline_peer_marks_transfer_errored_via_finalize() {
        let opts = options();
        let queue = Arc::new(UploadQueue::new(&opts));
        let governor = Arc::new(Governor::new(&opts, Arc::new(InMemoryUserService::new())));
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let user_service: Arc<dyn UserService> = Arc::new(InMemoryUserService::new());
        let peer_client: Arc<dyn PeerClient> = Arc::new(FakePeerClient {
            offline_users: vec!["bob".to_string()],
            ..FakePeerClient::default()
        });
        let scheduler = UploadScheduler::new(queue.clone(), governor, store.clone(), user_service, peer_client, 2);

        let mut transfer = Transfer::new_upload("1".into(), "bob", "b.bin", "/tmp/b.bin".into(), 10);
        transfer.transition_to_queued_locally();
        store.add_or_supersede(transfer.clone()).await.unwrap();
        queue.enqueue("bob", "b.bin");

        scheduler.launch(transfer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.monitor().await;

        let row = store.find(&"1".to_string()).await.unwrap().unwrap();
        assert!(row.state.contains(TransferState::ERRORED));
    }
}
