use crate::error::ShortenerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stubby_core::{LinkStorage, ShortCode, StorageError, UserId};
use tracing::{debug, info};

type Result<T> = std::result::Result<T, ShortenerError>;

/// Outcome of shortening one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortened {
    pub short_url: String,
    /// `false` when the user had already shortened this URL before.
    pub created: bool,
}

/// One entry of a batch shortening request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchItem {
    pub correlation_id: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchShortened {
    pub correlation_id: String,
    pub short_url: String,
}

/// A live link owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserUrl {
    pub short_url: String,
    pub original_url: String,
}

/// Totals across every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub urls: usize,
    pub users: usize,
}

/// Shortens, resolves and deletes links on behalf of users.
///
/// Short URLs are `base_url` followed by the derived [`ShortCode`].
#[derive(Debug)]
pub struct ShortenerService<S> {
    storage: Arc<S>,
    base_url: String,
}

impl<S> Clone for ShortenerService<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            base_url: self.base_url.clone(),
        }
    }
}

impl<S: LinkStorage> ShortenerService<S> {
    pub fn new(storage: S, base_url: impl Into<String>) -> Self {
        Self::with_shared(Arc::new(storage), base_url)
    }

    pub fn with_shared(storage: Arc<S>, base_url: impl Into<String>) -> Self {
        Self {
            storage,
            base_url: base_url.into(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Validates that the URL has an http(s) scheme and a host.
    fn validate_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(ShortenerError::InvalidUrl(
                "URL cannot be empty".to_string(),
            ));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL must not contain whitespace: {url}"
            )));
        }

        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL must have a valid scheme and host: {url}"
            )));
        };

        let scheme = scheme.to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL scheme must be http or https: {scheme}"
            )));
        }

        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL must have a host: {url}"
            )));
        }

        Ok(())
    }

    fn short_url(&self, code: &ShortCode) -> String {
        code.to_url(&self.base_url)
    }

    fn parse_codes(codes: &[String]) -> Result<Vec<ShortCode>> {
        codes
            .iter()
            .map(|code| ShortCode::new(code.as_str()).map_err(ShortenerError::from))
            .collect()
    }

    /// Shortens `original_url` for `user`.
    ///
    /// Shortening a URL the user already owns is not an error: the existing
    /// short URL is returned with `created` unset.
    pub async fn shorten(&self, user: &UserId, original_url: &str) -> Result<Shortened> {
        Self::validate_url(original_url)?;

        let code = ShortCode::from_url(original_url);
        let short_url = self.short_url(&code);

        match self.storage.put(user, &code, original_url).await {
            Ok(()) => {
                debug!(user_id = %user, code = %code, "shortened url");
                Ok(Shortened {
                    short_url,
                    created: true,
                })
            }
            Err(StorageError::AlreadyExists(_)) => Ok(Shortened {
                short_url,
                created: false,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Shortens every item or none of them.
    ///
    /// Fails with `AlreadyExists` if the user already owns any of the URLs.
    pub async fn shorten_batch(
        &self,
        user: &UserId,
        items: &[BatchItem],
    ) -> Result<Vec<BatchShortened>> {
        let mut links = HashMap::with_capacity(items.len());
        let mut shortened = Vec::with_capacity(items.len());

        for item in items {
            Self::validate_url(&item.original_url)?;
            let code = ShortCode::from_url(&item.original_url);
            shortened.push(BatchShortened {
                correlation_id: item.correlation_id.clone(),
                short_url: self.short_url(&code),
            });
            links.insert(item.original_url.clone(), code);
        }

        if links.is_empty() {
            return Ok(shortened);
        }

        self.storage.put_batch(user, &links).await?;
        debug!(user_id = %user, links = links.len(), "shortened url batch");
        Ok(shortened)
    }

    /// Returns the original URL behind `code`.
    pub async fn resolve(&self, code: &str) -> Result<String> {
        let code = ShortCode::new(code)?;
        Ok(self.storage.get(&code).await?)
    }

    /// Lists `user`'s live links, ordered by short URL.
    pub async fn user_urls(&self, user: &UserId) -> Result<Vec<UserUrl>> {
        let links = self.storage.get_user_links(user).await?;

        let mut urls: Vec<UserUrl> = links
            .into_iter()
            .map(|(code, original_url)| UserUrl {
                short_url: self.short_url(&code),
                original_url,
            })
            .collect();
        urls.sort_by(|a, b| a.short_url.cmp(&b.short_url));
        Ok(urls)
    }

    /// Requests deletion of `user`'s links and returns without waiting for it.
    ///
    /// With a pipelined backend the deletion becomes visible once its batch
    /// commits; failures are only logged.
    pub async fn delete_urls(&self, user: &UserId, codes: &[String]) -> Result<()> {
        let codes = Self::parse_codes(codes)?;
        self.storage.delete(&codes, user).await?;
        Ok(())
    }

    /// Deletes `user`'s links before returning.
    pub async fn delete_urls_now(&self, user: &UserId, codes: &[String]) -> Result<()> {
        let codes = Self::parse_codes(codes)?;
        self.storage.delete_batch(&codes, user).await?;
        Ok(())
    }

    /// Counts stored links and the users who claimed them.
    ///
    /// Deleted links and users whose claims are all deleted still count.
    pub async fn statistics(&self) -> Result<Statistics> {
        let urls = self.storage.url_count().await?;
        let users = self.storage.user_count().await?;
        Ok(Statistics { urls, users })
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.storage.ping().await?)
    }

    /// Closes the storage, waiting for pending deletions.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await?;
        info!("shortener service closed");
        Ok(())
    }
}
