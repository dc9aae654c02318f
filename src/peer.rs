//! The peer transport port and the six callbacks a `PeerClient`
//! implementation invokes while driving a single upload. The production
//! Soulseek wire client lives outside this crate; `FakePeerClient` below
//! is the only implementation shipped, for tests and doctests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::SlotOutcome;
use crate::sync_support::CancellationToken;
use crate::transfer::{Transfer, TransferId, TransferState};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub transfer_id: TransferId,
    pub username: String,
    pub filename: String,
    pub local_path: PathBuf,
    pub size: u64,
}

impl From<&Transfer> for UploadRequest {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id.clone(),
            username: transfer.username.clone(),
            filename: transfer.filename.clone(),
            local_path: transfer.local_path.clone(),
            size: transfer.size,
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerClientError {
    #[error("peer '{0}' is offline")]
    PeerOffline(String),
    #[error("transfer timed out")]
    TimedOut,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("peer client error: {0}")]
    Other(String),
}

/// The six callbacks a `PeerClient` must invoke, in this order, while
/// driving a transfer: `on_state_changed` on every phase transition,
/// `on_slot_awaiter` exactly once before the first `on_governor`,
/// `on_governor`/`on_reporter` once per chunk, `on_progress` as bytes
/// move, and `on_slot_released` exactly once, last.
#[async_trait]
pub trait UploadHooks: Send + Sync {
    async fn on_state_changed(&self, previous: TransferState, transfer: &Transfer);

    async fn on_progress(&self, transfer: &Transfer);

    async fn on_governor(&self, transfer: &Transfer, requested: u64, cancel: CancellationToken) -> crate::governor::Grant;

    async fn on_reporter(&self, transfer: &Transfer, grant: crate::governor::Grant, attempted: u64, actual: u64);

    async fn on_slot_awaiter(&self, transfer: &Transfer, cancel: CancellationToken) -> SlotOutcome;

    async fn on_slot_released(&self, transfer: &Transfer);
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn upload(
        &self,
        request: UploadRequest,
        hooks: Arc<dyn UploadHooks>,
        cancel: CancellationToken,
    ) -> Result<Transfer, PeerClientError>;
}

/// A scriptable fake used by tests: sends the file in `chunk_size`-byte
/// chunks, reporting progress and running every callback in the same
/// order a real client would.
#[derive(Debug, Clone)]
pub struct FakePeerClient {
    pub chunk_size: u64,
    pub fail_with: Option<String>,
    pub offline_users: Vec<String>,
}

impl Default for FakePeerClient {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            fail_with: None,
            offline_users: Vec::new(),
        }
    }
}

#[async_trait]
impl PeerClient for FakePeerClient {
    async fn upload(
        &self,
        request: UploadRequest,
        hooks: Arc<dyn UploadHooks>,
        cancel: CancellationToken,
    ) -> Result<Transfer, PeerClientError> {
        if self.offline_users.contains(&request.username) {
            return Err(PeerClientError::PeerOffline(request.username));
        }

        let mut transfer = Transfer::new_upload(
            request.transfer_id,
            &request.username,
            &request.filename,
            request.local_path,
            request.size,
        );
        transfer.transition_to_queued_locally();
        hooks.on_state_changed(TransferState::REQUESTED, &transfer).await;

        let outcome = hooks.on_slot_awaiter(&transfer, cancel.clone()).await;
        if outcome == SlotOutcome::Cancelled {
            transfer.mark_completed(TransferState::CANCELLED, None);
            return Err(PeerClientError::Cancelled);
        }

        transfer.transition_to_in_progress();
        hooks.on_state_changed(TransferState::QUEUED | TransferState::LOCALLY, &transfer).await;

        let mut sent = 0u64;
        while sent < request.size {
            if cancel.is_cancelled() {
                hooks.on_slot_released(&transfer).await;
                transfer.mark_completed(TransferState::CANCELLED, None);
                return Err(PeerClientError::Cancelled);
            }
            if let Some(reason) = &self.fail_with {
                hooks.on_slot_released(&transfer).await;
                transfer.mark_completed(TransferState::ERRORED, Some(reason.clone()));
                return Err(PeerClientError::Other(reason.clone()));
            }

            let requested = self.chunk_size.min(request.size - sent);
            let grant = hooks.on_governor(&transfer, requested, cancel.clone()).await;
            let actual = grant.bytes;
            sent += actual;
            transfer.set_bytes_transferred(sent);
            hooks.on_reporter(&transfer, grant, requested, actual).await;
            hooks.on_progress(&transfer).await;

            if actual == 0 {
                // governor gave nothing back (cancelled mid-acquire)
                hooks.on_slot_released(&transfer).await;
                transfer.mark_completed(TransferState::CANCELLED, None);
                return Err(PeerClientError::Cancelled);
            }
        }

        hooks.on_slot_released(&transfer).await;
        transfer.mark_completed(TransferState::SUCCEEDED, None);
        hooks.on_state_changed(TransferState::IN_PROGRESS, &transfer).await;
        Ok(transfer)
    }
}
