//! URL shortening on top of any [`LinkStorage`](stubby_core::LinkStorage)
//! backend.
//!
//! Short codes are derived from the URL itself, so shortening the same URL
//! twice yields the same short link. The service only ever talks to storage
//! through the storage contract.

pub mod error;
pub mod service;

pub use error::ShortenerError;
pub use service::{
    BatchItem, BatchShortened, Shortened, ShortenerService, Statistics, UserUrl,
};
