//! Slot accounting, rate governance, and scheduling for a peer-to-peer
//! upload pipeline.
//!
//! This crate implements the core decision-making for a Soulseek-style
//! upload pipeline: which queued upload gets a slot next (`queue`), how
//! fast a group of peers is allowed to move bytes (`governor`), and what
//! drives dispatch and reconciliation of in-flight transfers
//! (`scheduler`). The wire protocol, HTTP surface, config-file parsing and
//! share index are deliberately not here — they're expressed as traits
//! (`PeerClient`, `TransferStore`, `UserService`, `ShareResolver`) this
//! crate depends on, with an in-memory implementation of each for tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod governor;
pub mod manager;
pub mod options;
pub mod peer;
pub mod queue;
pub mod scheduler;
pub mod shares;
pub mod statistics;
pub mod sync_support;
pub mod transfer;
pub mod user_service;

pub use governor::{Governor, Grant, TokenBucket, TokenBucketSnapshot};
pub use manager::{EnqueueError, RemoveError, UploadManager};
pub use options::{GroupOptions, Options, OptionsError, Strategy, UploadOptions};
pub use peer::{FakePeerClient, PeerClient, PeerClientError, UploadHooks, UploadRequest};
pub use queue::{CompleteOutcome, QueueError, ResolvedCandidate, SelectedUpload, SlotAwait, SlotOutcome, UploadQueue};
pub use scheduler::{SchedulerError, UploadScheduler};
pub use shares::{InMemoryShareResolver, ShareResolver};
pub use statistics::UserStatistics;
pub use sync_support::CancellationToken;
pub use transfer::{Direction, InMemoryTransferStore, Transfer, TransferError, TransferFilter, TransferId, TransferState, TransferStore};
pub use user_service::{InMemoryUserService, UserService};
