use crate::pipeline::{BatchApplier, UserDeletes};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use stubby_core::error::{Result, StorageError};
use stubby_core::{LinkStorage, ShortCode, ShortLinkRecord, UserId, UserLinkRecord};
use tracing::debug;

/// The link and claim tables shared by the memory and file backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LinkTable {
    links: BTreeMap<ShortCode, ShortLinkRecord>,
    claims: Vec<UserLinkRecord>,
    #[serde(default)]
    next_id: i64,
    #[serde(skip)]
    by_url: HashMap<String, ShortCode>,
}

impl LinkTable {
    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Rebuilds the URL index after deserializing.
    pub(crate) fn reindex(&mut self) {
        self.by_url = self
            .links
            .values()
            .map(|record| (record.original_url.clone(), record.short_code.clone()))
            .collect();
    }

    fn user_count(&self) -> usize {
        self.claims
            .iter()
            .map(|claim| &claim.user_id)
            .collect::<HashSet<_>>()
            .len()
    }

    fn resolve(&self, code: &ShortCode) -> Result<String> {
        let record = self
            .links
            .get(code)
            .ok_or_else(|| StorageError::NotFound(code.to_string()))?;

        let live = self
            .claims
            .iter()
            .any(|claim| claim.short_link_id == record.id && !claim.is_deleted);

        if live {
            Ok(record.original_url.clone())
        } else {
            Err(StorageError::Deleted(code.to_string()))
        }
    }

    fn has_claim(&self, user: &UserId, link_id: i64) -> bool {
        self.claims
            .iter()
            .any(|claim| &claim.user_id == user && claim.short_link_id == link_id)
    }

    /// Returns the id of the link for `original_url`, creating it if needed.
    fn link_id(&mut self, code: &ShortCode, original_url: &str) -> Result<i64> {
        if let Some(stored) = self.by_url.get(original_url) {
            if stored != code {
                return Err(StorageError::Conflict(format!(
                    "{original_url} is stored under {stored}, not {code}"
                )));
            }
        }

        if let Some(record) = self.links.get(code) {
            if record.original_url != original_url {
                return Err(StorageError::Conflict(format!(
                    "{code} belongs to {}",
                    record.original_url
                )));
            }
            return Ok(record.id);
        }

        self.next_id += 1;
        let record = ShortLinkRecord {
            id: self.next_id,
            original_url: original_url.to_owned(),
            short_code: code.clone(),
        };
        self.links.insert(code.clone(), record);
        self.by_url.insert(original_url.to_owned(), code.clone());
        Ok(self.next_id)
    }

    fn claim(&mut self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()> {
        let link_id = self.link_id(code, original_url)?;

        if self.has_claim(user, link_id) {
            return Err(StorageError::AlreadyExists(code.to_string()));
        }

        self.claims.push(UserLinkRecord {
            user_id: user.clone(),
            short_link_id: link_id,
            is_deleted: false,
        });
        Ok(())
    }

    /// Claims every link or none of them.
    fn claim_all(&mut self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()> {
        let mut staged = self.clone();
        for (original_url, code) in links {
            staged.claim(user, code, original_url)?;
        }
        *self = staged;
        Ok(())
    }

    fn user_links(&self, user: &UserId) -> HashMap<ShortCode, String> {
        let live: HashSet<i64> = self
            .claims
            .iter()
            .filter(|claim| &claim.user_id == user && !claim.is_deleted)
            .map(|claim| claim.short_link_id)
            .collect();

        self.links
            .values()
            .filter(|record| live.contains(&record.id))
            .map(|record| (record.short_code.clone(), record.original_url.clone()))
            .collect()
    }

    /// Marks `user`'s live claims on `codes` deleted and returns how many changed.
    fn soft_delete(&mut self, user: &UserId, codes: &[ShortCode]) -> usize {
        let ids: HashSet<i64> = codes
            .iter()
            .filter_map(|code| self.links.get(code).map(|record| record.id))
            .collect();

        let mut affected = 0;
        for claim in self.claims.iter_mut().filter(|claim| {
            &claim.user_id == user && !claim.is_deleted && ids.contains(&claim.short_link_id)
        }) {
            claim.is_deleted = true;
            affected += 1;
        }
        affected
    }
}

/// In-memory implementation of [`LinkStorage`].
///
/// All state sits behind one lock so that batch operations stay atomic.
/// Deletions are applied immediately; there is no pipeline in front of it.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    table: RwLock<LinkTable>,
}

impl MemoryStorage {
    /// Creates an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_table(mut table: LinkTable) -> Self {
        table.reindex();
        Self {
            table: RwLock::new(table),
        }
    }

    pub(crate) fn snapshot(&self) -> LinkTable {
        self.table.read().clone()
    }

    /// Replaces the whole table, undoing changes made since `table` was taken.
    pub(crate) fn restore(&self, table: LinkTable) {
        *self.table.write() = table;
    }

    fn soft_delete_groups(&self, groups: &[UserDeletes]) -> usize {
        let mut table = self.table.write();
        groups
            .iter()
            .map(|group| table.soft_delete(&group.user_id, &group.codes))
            .sum()
    }
}

#[async_trait]
impl LinkStorage for MemoryStorage {
    async fn get(&self, code: &ShortCode) -> Result<String> {
        self.table.read().resolve(code)
    }

    async fn put(&self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()> {
        self.table.write().claim(user, code, original_url)
    }

    async fn put_batch(&self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()> {
        self.table.write().claim_all(user, links)
    }

    async fn get_user_links(&self, user: &UserId) -> Result<HashMap<ShortCode, String>> {
        Ok(self.table.read().user_links(user))
    }

    async fn delete(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        self.delete_batch(codes, user).await
    }

    async fn delete_batch(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        let affected = self.table.write().soft_delete(user, codes);
        debug!(user_id = %user, requested = codes.len(), affected, "soft-deleted user links");
        Ok(())
    }

    async fn url_count(&self) -> Result<usize> {
        Ok(self.table.read().len())
    }

    async fn user_count(&self) -> Result<usize> {
        Ok(self.table.read().user_count())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BatchApplier for MemoryStorage {
    async fn apply(&self, groups: &[UserDeletes]) -> Result<()> {
        let affected = self.soft_delete_groups(groups);
        debug!(users = groups.len(), affected, "soft-deleted user links");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new_unchecked(id)
    }

    fn code(value: &str) -> ShortCode {
        ShortCode::new_unchecked(value)
    }

    #[tokio::test]
    async fn put_and_get() {
        let storage = MemoryStorage::new();

        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        assert_eq!(
            storage.get(&code("abc123")).await.unwrap(),
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn get_unknown_code_is_not_found() {
        let storage = MemoryStorage::new();

        let err = storage.get(&code("nope")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_claim_conflicts() {
        let storage = MemoryStorage::new();

        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();
        let err = storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn second_user_shares_the_link() {
        let storage = MemoryStorage::new();

        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();
        storage
            .put(&user("bob"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        assert_eq!(storage.snapshot().len(), 1);
        assert_eq!(storage.get_user_links(&user("bob")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn url_keeps_its_first_code() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        let err = storage
            .put(&user("bob"), &code("xyz789"), "https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(
            storage.get(&code("abc123")).await.unwrap(),
            "https://example.com"
        );
        assert!(matches!(
            storage.get(&code("xyz789")).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.get_user_links(&user("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn code_cannot_point_at_second_url() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        let err = storage
            .put(&user("bob"), &code("abc123"), "https://example.org")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
        assert!(storage.get_user_links(&user("bob")).await.unwrap().is_empty());
        assert_eq!(storage.url_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reloaded_table_still_detects_conflicts() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();
        let reloaded: LinkTable =
            serde_json::from_slice(&serde_json::to_vec(&storage.snapshot()).unwrap()).unwrap();

        let reloaded = MemoryStorage::from_table(reloaded);
        let err = reloaded
            .put(&user("bob"), &code("xyz789"), "https://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn counts_links_and_users() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("aaa111"), "https://a.example")
            .await
            .unwrap();
        storage
            .put(&user("alice"), &code("bbb222"), "https://b.example")
            .await
            .unwrap();
        storage
            .put(&user("bob"), &code("aaa111"), "https://a.example")
            .await
            .unwrap();
        storage
            .delete_batch(&[code("bbb222")], &user("alice"))
            .await
            .unwrap();

        assert_eq!(storage.url_count().await.unwrap(), 2);
        assert_eq!(storage.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn put_batch_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("taken1"), "https://taken.example")
            .await
            .unwrap();

        let links = HashMap::from([
            ("https://fresh.example".to_string(), code("fresh1")),
            ("https://taken.example".to_string(), code("taken1")),
        ]);
        let err = storage.put_batch(&user("alice"), &links).await.unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert!(matches!(
            storage.get(&code("fresh1")).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn put_batch_claims_every_link() {
        let storage = MemoryStorage::new();
        let links = HashMap::from([
            ("https://one.example".to_string(), code("one111")),
            ("https://two.example".to_string(), code("two222")),
        ]);

        storage.put_batch(&user("alice"), &links).await.unwrap();

        let owned = storage.get_user_links(&user("alice")).await.unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[&code("two222")], "https://two.example");
    }

    #[tokio::test]
    async fn link_stays_live_until_every_owner_deletes() {
        let storage = MemoryStorage::new();
        for owner in ["alice", "bob"] {
            storage
                .put(&user(owner), &code("shared"), "https://example.com")
                .await
                .unwrap();
        }

        storage
            .delete_batch(&[code("shared")], &user("alice"))
            .await
            .unwrap();
        assert_eq!(
            storage.get(&code("shared")).await.unwrap(),
            "https://example.com"
        );
        assert!(storage
            .get_user_links(&user("alice"))
            .await
            .unwrap()
            .is_empty());

        storage
            .delete_batch(&[code("shared")], &user("bob"))
            .await
            .unwrap();
        assert!(matches!(
            storage.get(&code("shared")).await,
            Err(StorageError::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn repeated_delete_is_idempotent() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        storage
            .delete_batch(&[code("abc123")], &user("alice"))
            .await
            .unwrap();
        let once = storage.snapshot();
        storage
            .delete_batch(&[code("abc123")], &user("alice"))
            .await
            .unwrap();

        assert_eq!(storage.snapshot(), once);
    }

    #[tokio::test]
    async fn deleting_someone_elses_link_is_a_no_op() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("abc123"), "https://example.com")
            .await
            .unwrap();

        storage
            .delete_batch(&[code("abc123"), code("unknown")], &user("mallory"))
            .await
            .unwrap();

        assert_eq!(
            storage.get(&code("abc123")).await.unwrap(),
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn batch_applier_covers_every_group() {
        let storage = MemoryStorage::new();
        storage
            .put(&user("alice"), &code("aaa111"), "https://a.example")
            .await
            .unwrap();
        storage
            .put(&user("bob"), &code("bbb222"), "https://b.example")
            .await
            .unwrap();

        storage
            .apply(&[
                UserDeletes {
                    user_id: user("alice"),
                    codes: vec![code("aaa111")],
                },
                UserDeletes {
                    user_id: user("bob"),
                    codes: vec![code("bbb222")],
                },
            ])
            .await
            .unwrap();

        assert!(matches!(
            storage.get(&code("aaa111")).await,
            Err(StorageError::Deleted(_))
        ));
        assert!(matches!(
            storage.get(&code("bbb222")).await,
            Err(StorageError::Deleted(_))
        ));
    }
}
