use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no queued entry for user '{username}' and file '{filename}'")]
    NotFound { username: String, filename: String },

    #[error("entry for user '{username}' and file '{filename}' already enqueued")]
    AlreadyEnqueued { username: String, filename: String },
}
