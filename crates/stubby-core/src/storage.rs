use crate::error::Result;
use crate::shortcode::ShortCode;
use crate::user::UserId;
use async_trait::async_trait;
use std::collections::HashMap;

/// The capability set every storage backend provides.
///
/// Services only talk to storage through this trait. Soft deletion is scoped
/// to a user's claim: a short link keeps resolving while at least one owner
/// still holds a live claim on it.
#[async_trait]
pub trait LinkStorage: Send + Sync + 'static {
    /// Resolves a short code to its original URL.
    ///
    /// Fails with `NotFound` if the code is unknown and with `Deleted` if every
    /// claim on it has been deleted.
    async fn get(&self, code: &ShortCode) -> Result<String>;

    /// Stores the link if absent and records `user`'s claim on it.
    ///
    /// There is one link per original URL and its code never changes. Fails
    /// with `Conflict` if `original_url` is stored under another code or
    /// `code` belongs to another URL, and with `AlreadyExists` if `user`
    /// already claimed `code`.
    async fn put(&self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()>;

    /// Same as [`put`](Self::put) for many links keyed by original URL.
    ///
    /// All-or-nothing: a single conflicting claim fails the whole call with
    /// `AlreadyExists` and nothing is written.
    async fn put_batch(&self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()>;

    /// Returns `user`'s live claims as `code -> original URL`.
    async fn get_user_links(&self, user: &UserId) -> Result<HashMap<ShortCode, String>>;

    /// Requests soft deletion of `user`'s claims on `codes`.
    ///
    /// Backends may apply the request asynchronously, in which case it is not
    /// guaranteed to be visible when this returns and failures are only
    /// logged.
    async fn delete(&self, codes: &[ShortCode], user: &UserId) -> Result<()>;

    /// Soft-deletes `user`'s claims on `codes` before returning.
    ///
    /// Codes the user does not own, or already deleted, are ignored.
    async fn delete_batch(&self, codes: &[ShortCode], user: &UserId) -> Result<()>;

    /// Number of distinct short links stored, deleted ones included.
    async fn url_count(&self) -> Result<usize>;

    /// Number of distinct users holding at least one claim.
    async fn user_count(&self) -> Result<usize>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Flushes pending work and releases the backend.
    async fn close(&self) -> Result<()>;
}
