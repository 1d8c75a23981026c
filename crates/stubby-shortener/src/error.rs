use stubby_core::{CoreError, StorageError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortenerError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
    #[error("url already shortened: {0}")]
    AlreadyExists(String),
    #[error("short link conflicts with a stored link: {0}")]
    Conflict(String),
    #[error("short link not found: {0}")]
    NotFound(String),
    #[error("short link deleted: {0}")]
    Gone(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<CoreError> for ShortenerError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidShortCode(message) => Self::InvalidShortCode(message),
            CoreError::InvalidUserId(message) => Self::InvalidUserId(message),
        }
    }
}

impl From<StorageError> for ShortenerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(code) => Self::NotFound(code),
            StorageError::Deleted(code) => Self::Gone(code),
            StorageError::AlreadyExists(code) => Self::AlreadyExists(code),
            StorageError::Conflict(message) => Self::Conflict(message),
            other => Self::Storage(other.to_string()),
        }
    }
}
