use thiserror::Error;

use super::model::TransferId;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("transfer store backend error: {0}")]
    Backend(String),
}
