//! Core types and traits for the Stubby URL shortener.
//!
//! This crate provides the storage contract shared by every backend and the
//! services layered on top of it, together with the identifiers and records
//! that flow through that contract.

pub mod error;
pub mod record;
pub mod shortcode;
pub mod storage;
pub mod user;

pub use error::{CoreError, StorageError};
pub use record::{ShortLinkRecord, UserLinkRecord};
pub use shortcode::ShortCode;
pub use storage::LinkStorage;
pub use user::UserId;
