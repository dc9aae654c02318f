use std::path::PathBuf;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque unique identifier. Callers mint it however they already mint
/// primary keys; the core never parses it.
pub type TransferId = String;

bitflags! {
    /// Orthogonal transfer state flags. Several combine freely (e.g. a
    /// transfer is `QUEUED | LOCALLY` before it is ever `IN_PROGRESS`), and
    /// exactly one terminal flag is set once `COMPLETED` is set.
    ///
    /// Serde support comes from bitflags' own `serde` feature, which
    /// requires the derive to be listed inside the macro so it can
    /// generate the `Serialize`/`Deserialize` impls itself.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransferState: u32 {
        const REQUESTED    = 1 << 0;
        const QUEUED       = 1 << 1;
        const LOCALLY      = 1 << 2;
        const REMOTELY     = 1 << 3;
        const INITIALIZING = 1 << 4;
        const IN_PROGRESS  = 1 << 5;
        const COMPLETED    = 1 << 6;
        const SUCCEEDED    = 1 << 7;
        const CANCELLED    = 1 << 8;
        const TIMED_OUT    = 1 << 9;
        const ERRORED      = 1 << 10;
        const REJECTED     = 1 << 11;
        const ABORTED      = 1 << 12;
    }
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.contains(Self::COMPLETED)
    }

    #[must_use]
    pub fn is_queued(self) -> bool {
        self.contains(Self::QUEUED) && self.contains(Self::LOCALLY) && !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub username: String,
    pub direction: Direction,
    pub filename: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub start_offset: u64,
    pub bytes_transferred: u64,
    pub average_speed: f64,
    pub state: TransferState,
    pub requested_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub place_in_queue: Option<u32>,
    pub exception: Option<String>,
    pub removed: bool,
}

impl Transfer {
    #[must_use]
    pub fn new_upload(id: TransferId, username: &str, filename: &str, local_path: PathBuf, size: u64) -> Self {
        Self {
            id,
            username: username.to_string(),
            direction: Direction::Upload,
            filename: filename.to_string(),
            local_path,
            size,
            start_offset: 0,
            bytes_transferred: 0,
            average_speed: 0.0,
            state: TransferState::REQUESTED,
            requested_at: Utc::now(),
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            place_in_queue: None,
            exception: None,
            removed: false,
        }
    }

    pub fn transition_to_queued_locally(&mut self) {
        self.state.remove(TransferState::REQUESTED);
        self.state.insert(TransferState::QUEUED | TransferState::LOCALLY);
        self.enqueued_at = Some(Utc::now());
    }

    pub fn transition_to_in_progress(&mut self) {
        self.state.remove(TransferState::QUEUED | TransferState::LOCALLY);
        self.state
            .insert(TransferState::REMOTELY | TransferState::INITIALIZING | TransferState::IN_PROGRESS);
        self.started_at = Some(Utc::now());
    }

    /// Sets bytes transferred, clamped to `size` so progress can never
    /// exceed the declared transfer size regardless of what the transport
    /// layer reports.
    pub fn set_bytes_transferred(&mut self, bytes: u64) {
        self.bytes_transferred = bytes.min(self.size);
    }

    /// Marks the transfer terminal. `outcome` must contain exactly one of
    /// `SUCCEEDED | CANCELLED | TIMED_OUT | ERRORED | REJECTED | ABORTED`.
    pub fn mark_completed(&mut self, outcome: TransferState, exception: Option<String>) {
        self.state.remove(TransferState::IN_PROGRESS);
        self.state.insert(TransferState::COMPLETED | outcome);
        self.ended_at = Some(Utc::now());
        self.exception = exception;
    }
}
