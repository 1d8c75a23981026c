use crate::file::FileStorage;
use crate::memory::MemoryStorage;
use crate::postgres::{PostgresConfig, PostgresStorage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use stubby_core::error::Result;
use stubby_core::{LinkStorage, ShortCode, UserId};
use tracing::info;

/// Selects and configures one storage backend.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    File { path: PathBuf },
    Postgres(PostgresConfig),
}

impl StorageConfig {
    fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Memory => "memory",
            StorageConfig::File { .. } => "file",
            StorageConfig::Postgres(_) => "postgres",
        }
    }
}

impl Display for StorageConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// The backend chosen at startup.
///
/// Dispatches every [`LinkStorage`] call to the wrapped implementation.
pub enum StorageBackend {
    Memory(MemoryStorage),
    File(FileStorage),
    Postgres(PostgresStorage),
}

macro_rules! dispatch {
    ($self:ident, $storage:ident => $call:expr) => {
        match $self {
            StorageBackend::Memory($storage) => $call,
            StorageBackend::File($storage) => $call,
            StorageBackend::Postgres($storage) => $call,
        }
    };
}

impl StorageBackend {
    /// Opens the backend described by `config`.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        let kind = config.kind();
        let backend = match config {
            StorageConfig::Memory => StorageBackend::Memory(MemoryStorage::new()),
            StorageConfig::File { path } => StorageBackend::File(FileStorage::open(path).await?),
            StorageConfig::Postgres(config) => {
                StorageBackend::Postgres(PostgresStorage::connect(config).await?)
            }
        };
        info!(backend = kind, "storage backend opened");
        Ok(backend)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageBackend::Memory(_) => "memory",
            StorageBackend::File(_) => "file",
            StorageBackend::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl LinkStorage for StorageBackend {
    async fn get(&self, code: &ShortCode) -> Result<String> {
        dispatch!(self, storage => storage.get(code).await)
    }

    async fn put(&self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()> {
        dispatch!(self, storage => storage.put(user, code, original_url).await)
    }

    async fn put_batch(&self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()> {
        dispatch!(self, storage => storage.put_batch(user, links).await)
    }

    async fn get_user_links(&self, user: &UserId) -> Result<HashMap<ShortCode, String>> {
        dispatch!(self, storage => storage.get_user_links(user).await)
    }

    async fn delete(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        dispatch!(self, storage => storage.delete(codes, user).await)
    }

    async fn delete_batch(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        dispatch!(self, storage => storage.delete_batch(codes, user).await)
    }

    async fn url_count(&self) -> Result<usize> {
        dispatch!(self, storage => storage.url_count().await)
    }

    async fn user_count(&self) -> Result<usize> {
        dispatch!(self, storage => storage.user_count().await)
    }

    async fn ping(&self) -> Result<()> {
        dispatch!(self, storage => storage.ping().await)
    }

    async fn close(&self) -> Result<()> {
        dispatch!(self, storage => storage.close().await)
    }
}
