//! Storage backends for the Stubby URL shortener.
//!
//! Three implementations of [`LinkStorage`] are provided:
//!
//! - [`MemoryStorage`]: a lock-guarded table living in process memory.
//! - [`FileStorage`]: the memory table persisted as JSON after every write.
//! - [`PostgresStorage`]: PostgreSQL via `sqlx`, with soft deletes routed
//!   through the asynchronous [`DeletePipeline`].
//!
//! [`StorageBackend`] picks one of them once, at construction time.

pub mod backend;
pub mod file;
pub mod memory;
pub mod pipeline;
pub mod postgres;

pub use backend::{StorageBackend, StorageConfig};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use pipeline::{BatchApplier, DeleteIntake, DeletePipeline, PipelineConfig};
pub use postgres::{PostgresConfig, PostgresStorage};
pub use stubby_core::error::{Result, StorageError};
pub use stubby_core::LinkStorage;
