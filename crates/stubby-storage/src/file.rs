use crate::memory::{LinkTable, MemoryStorage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use stubby_core::error::{Result, StorageError};
use stubby_core::{LinkStorage, ShortCode, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File-backed implementation of [`LinkStorage`].
///
/// Keeps a [`MemoryStorage`] as the working copy and rewrites the whole JSON
/// file after every successful mutation. Mutations are serialized; when the
/// file cannot be written the working copy is rolled back, so reads never
/// see a change the caller was told failed.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    memory: MemoryStorage,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Opens `path`, loading existing links, or creates an empty file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let (table, existed) = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => (LinkTable::default(), true),
            Ok(bytes) => {
                let table = serde_json::from_slice(&bytes).map_err(|err| {
                    StorageError::InvalidData(format!("{}: {err}", path.display()))
                })?;
                (table, true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => (LinkTable::default(), false),
            Err(err) => return Err(io_error(&path, err)),
        };

        info!(path = %path.display(), links = table.len(), "opened file storage");

        let storage = Self {
            path,
            memory: MemoryStorage::from_table(table),
            write_lock: Mutex::new(()),
        };
        if !existed {
            storage.persist().await?;
        }
        Ok(storage)
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_table(&self.memory.snapshot()).await
    }

    /// Writes the working copy, restoring `before` if that fails.
    ///
    /// Callers hold `write_lock` from taking `before` until this returns.
    async fn commit(&self, before: LinkTable) -> Result<()> {
        if let Err(err) = self.write_table(&self.memory.snapshot()).await {
            warn!(path = %self.path.display(), error = %err, "rolling back unsaved change");
            self.memory.restore(before);
            return Err(err);
        }
        Ok(())
    }

    async fn write_table(&self, table: &LinkTable) -> Result<()> {
        let bytes =
            serde_json::to_vec(table).map_err(|err| StorageError::InvalidData(err.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|err| io_error(&self.path, err))?;
        debug!(path = %self.path.display(), "persisted link table");
        Ok(())
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl LinkStorage for FileStorage {
    async fn get(&self, code: &ShortCode) -> Result<String> {
        self.memory.get(code).await
    }

    async fn put(&self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let before = self.memory.snapshot();
        self.memory.put(user, code, original_url).await?;
        self.commit(before).await
    }

    async fn put_batch(&self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let before = self.memory.snapshot();
        self.memory.put_batch(user, links).await?;
        self.commit(before).await
    }

    async fn get_user_links(&self, user: &UserId) -> Result<HashMap<ShortCode, String>> {
        self.memory.get_user_links(user).await
    }

    async fn delete(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        self.delete_batch(codes, user).await
    }

    async fn delete_batch(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let before = self.memory.snapshot();
        self.memory.delete_batch(codes, user).await?;
        self.commit(before).await
    }

    async fn url_count(&self) -> Result<usize> {
        self.memory.url_count().await
    }

    async fn user_count(&self) -> Result<usize> {
        self.memory.user_count().await
    }

    async fn ping(&self) -> Result<()> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|_| ())
            .map_err(|err| io_error(&self.path, err))
    }

    async fn close(&self) -> Result<()> {
        self.persist().await
    }
}
