use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by [`LinkStorage`](crate::storage::LinkStorage) backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("short link not found: {0}")]
    NotFound(String),
    #[error("short link deleted by every owner: {0}")]
    Deleted(String),
    #[error("short link already claimed: {0}")]
    AlreadyExists(String),
    /// The code and URL disagree with a stored link.
    #[error("short link conflicts with a stored link: {0}")]
    Conflict(String),
    #[error("storage statement rejected: {0}")]
    Statement(String),
    #[error("storage execution failed: {0}")]
    Execution(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("storage is closed: {0}")]
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
}
