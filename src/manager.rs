//! `UploadManager`: the thin composition root wiring the Queue, Governor,
//! Scheduler and the three external ports together and exposing the
//! produced operations (`Enqueue`, `TryCancel`, `List`, `Remove`,
//! `GetUserStatistics`) as inherent methods — the same role `main.rs`
//! plays wiring `Queue` + `DownloadEngine` + `RateLimiter` together.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::governor::Governor;
use crate::options::Options;
use crate::peer::PeerClient;
use crate::queue::UploadQueue;
use crate::scheduler::UploadScheduler;
use crate::shares::ShareResolver;
use crate::statistics::{self, UserStatistics};
use crate::transfer::{Transfer, TransferError, TransferFilter, TransferId, TransferStore};
use crate::user_service::UserService;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("'{filename}' is not shared with '{username}'")]
    NotFound { username: String, filename: String },

    #[error("failed to stat local file: {0}")]
    Io(String),

    #[error("transfer store error: {0}")]
    Store(#[from] TransferError),
}

#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("transfer {0} has not completed yet")]
    NotCompleted(TransferId),

    #[error("transfer store error: {0}")]
    Store(#[from] TransferError),
}

pub struct UploadManager {
    store: Arc<dyn TransferStore>,
    shares: Arc<dyn ShareResolver>,
    queue: Arc<UploadQueue>,
    governor: Arc<Governor>,
    scheduler: Arc<UploadScheduler>,
}

impl UploadManager {
    #[must_use]
    pub fn new(
        options: &Options,
        store: Arc<dyn TransferStore>,
        user_service: Arc<dyn UserService>,
        shares: Arc<dyn ShareResolver>,
        peer_client: Arc<dyn PeerClient>,
    ) -> Self {
        let queue = Arc::new(UploadQueue::new(options));
        let governor = Arc::new(Governor::new(options, user_service.clone()));
        let scheduler = Arc::new(UploadScheduler::new(
            queue.clone(),
            governor.clone(),
            store.clone(),
            user_service,
            peer_client,
            options.upload.global_slots,
        ));
        Self {
            store,
            shares,
            queue,
            governor,
            scheduler,
        }
    }

    /// Resolves the local path, writes the initial `Transfer` row (already
    /// transitioned to `Queued|Locally`), registers it with the Queue, and
    /// spawns the peer upload. Returns as soon as the row is written and
    /// the task is spawned — it does not wait for the transfer to finish.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, username: &str, filename: &str) -> Result<TransferId, EnqueueError> {
        let Some(local_path) = self.shares.resolve(username, filename).await else {
            return Err(EnqueueError::NotFound {
                username: username.to_string(),
                filename: filename.to_string(),
            });
        };

        let size = tokio::fs::metadata(&local_path)
            .await
            .map_err(|e| EnqueueError::Io(e.to_string()))?
            .len();

        let id = format!("{username}:{filename}:{}", uuid_like());
        let mut transfer = Transfer::new_upload(id.clone(), username, filename, local_path, size);
        transfer.transition_to_queued_locally();

        self.store.add_or_supersede(transfer.clone()).await?;
        self.queue.enqueue(username, filename);
        self.scheduler.launch(transfer).await;

        Ok(id)
    }

    #[must_use]
    pub fn try_cancel(&self, id: &TransferId) -> bool {
        self.scheduler.try_cancel(id)
    }

    pub async fn list(&self, filter: TransferFilter, include_removed: bool) -> Result<Vec<Transfer>, TransferError> {
        self.store.list(filter, include_removed).await
    }

    /// Soft-deletes a completed transfer's row. Rejects transfers that
    /// haven't reached a terminal state yet — use `try_cancel` for those.
    pub async fn remove(&self, id: &TransferId) -> Result<(), RemoveError> {
        let transfer = self.store.find(id).await?.ok_or_else(|| RemoveError::NotCompleted(id.clone()))?;
        if !transfer.state.is_terminal() {
            return Err(RemoveError::NotCompleted(id.clone()));
        }
        self.store.soft_delete(id).await?;
        Ok(())
    }

    pub async fn get_user_statistics(&self, username: &str) -> Result<UserStatistics, TransferError> {
        statistics::compute(self.store.as_ref(), username).await
    }

    pub async fn schedule(&self) {
        self.scheduler.schedule().await;
    }

    pub async fn monitor(&self) {
        self.scheduler.monitor().await;
    }

    pub async fn reconfigure(&self, options: &Options) {
        self.queue.reconfigure(options);
        self.governor.reconfigure(options).await;
        self.scheduler.set_global_slots(options.upload.global_slots);
    }
}

/// A process-unique, monotonically increasing suffix — good enough for an
/// opaque transfer id when the caller doesn't already have a primary key
/// to reuse (no UUID dependency; see DESIGN.md).
fn uuid_like() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
