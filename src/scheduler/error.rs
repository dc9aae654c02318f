use thiserror::Error;

use crate::transfer::TransferId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no tracked task for transfer {0}")]
    NotFound(TransferId),

    #[error("transient peer failure for transfer {0}: {1}")]
    TransientPeer(TransferId, String),

    #[error("transfer {0} was cancelled")]
    Cancelled(TransferId),

    #[error("duplicate schedule attempt for transfer {0} suppressed")]
    DuplicateSchedule(TransferId),

    #[error("failed to persist terminal state for transfer {0}: {1}")]
    PersistenceFailure(TransferId, String),
}
