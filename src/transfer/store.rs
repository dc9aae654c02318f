//! Persistence port for `Transfer` rows. The core depends only on this
//! trait; SQLite/byte-for-byte schema compatibility with any upstream
//! store is explicitly out of scope — the `InMemoryTransferStore` below
//! is the only implementation this crate ships, mirroring `Db::new_in_memory()`'s
//! test-only pool.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use super::error::TransferError;
use super::model::{Direction, Transfer, TransferId, TransferState};

#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub username: Option<String>,
    pub direction: Option<Direction>,
    /// Matches if the transfer's state intersects this mask at all. `None`
    /// matches any state.
    pub states_any_of: Option<TransferState>,
}

impl TransferFilter {
    #[must_use]
    pub fn for_username(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn pending() -> Self {
        Self {
            states_any_of: Some(TransferState::QUEUED | TransferState::LOCALLY),
            ..Self::default()
        }
    }

    fn matches(&self, transfer: &Transfer) -> bool {
        if let Some(username) = &self.username {
            if &transfer.username != username {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if transfer.direction != direction {
                return false;
            }
        }
        if let Some(mask) = self.states_any_of {
            if !transfer.state.intersects(mask) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Inserts a new row, or, if an active (non-removed, non-terminal)
    /// upload already exists for the same `(username, filename)`, marks
    /// the old one removed and inserts the new one in its place.
    async fn add_or_supersede(&self, transfer: Transfer) -> Result<(), TransferError>;

    async fn update(&self, transfer: Transfer) -> Result<(), TransferError>;

    async fn find(&self, id: &TransferId) -> Result<Option<Transfer>, TransferError>;

    async fn list(&self, filter: TransferFilter, include_removed: bool) -> Result<Vec<Transfer>, TransferError>;

    async fn soft_delete(&self, id: &TransferId) -> Result<(), TransferError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTransferStore {
    rows: DashMap<TransferId, Transfer>,
}

impl InMemoryTransferStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    #[instrument(skip(self, transfer), fields(id = %transfer.id))]
    async fn add_or_supersede(&self, transfer: Transfer) -> Result<(), TransferError> {
        for mut existing in self.rows.iter_mut() {
            if existing.username == transfer.username
                && existing.filename == transfer.filename
                && !existing.removed
                && !existing.state.is_terminal()
            {
                existing.removed = true;
            }
        }
        self.rows.insert(transfer.id.clone(), transfer);
        Ok(())
    }

    #[instrument(skip(self, transfer), fields(id = %transfer.id))]
    async fn update(&self, transfer: Transfer) -> Result<(), TransferError> {
        if !self.rows.contains_key(&transfer.id) {
            return Err(TransferError::NotFound(transfer.id));
        }
        self.rows.insert(transfer.id.clone(), transfer);
        Ok(())
    }

    async fn find(&self, id: &TransferId) -> Result<Option<Transfer>, TransferError> {
        Ok(self.rows.get(id).map(|r| r.clone()))
    }

    async fn list(&self, filter: TransferFilter, include_removed: bool) -> Result<Vec<Transfer>, TransferError> {
        Ok(self
            .rows
            .iter()
            .map(|r| r.clone())
            .filter(|t| include_removed || !t.removed)
            .filter(|t| filter.matches(t))
            .collect())
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, id: &TransferId) -> Result<(), TransferError> {
        let mut row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        row.removed = true;
        Ok(())
    }
}
