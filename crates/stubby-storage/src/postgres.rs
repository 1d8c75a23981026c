use crate::pipeline::{BatchApplier, DeletePipeline, PipelineConfig, UserDeletes};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stubby_core::error::{Result, StorageError};
use stubby_core::{LinkStorage, ShortCode, UserId};
use tracing::{debug, info};
use typed_builder::TypedBuilder;

const SCHEMA: &str = include_str!("../ddl/postgres/schema.sql");

/// SQLSTATE class for syntax errors and access rule violations, raised while
/// a statement is being prepared.
const STATEMENT_ERROR_CLASS: &str = "42";

const SELECT_LINK: &str = r#"
    SELECT u.origin_url,
           COALESCE(BOOL_OR(NOT ul.is_deleted), FALSE) AS live
    FROM urls u
    LEFT JOIN user_links ul ON ul.url_id = u.id
    WHERE u.short_url = $1
    GROUP BY u.id, u.origin_url
    LIMIT 1
"#;

// Yields no row when either the URL or the code is already stored.
const INSERT_LINK: &str = r#"
    INSERT INTO urls (origin_url, short_url)
    VALUES ($1, $2)
    ON CONFLICT DO NOTHING
    RETURNING id
"#;

const SELECT_LINK_BY_URL: &str = r#"
    SELECT id, short_url
    FROM urls
    WHERE origin_url = $1
"#;

const COUNT_URLS: &str = "SELECT COUNT(*) FROM urls";

const COUNT_USERS: &str = "SELECT COUNT(DISTINCT user_id) FROM user_links";

const INSERT_CLAIM: &str = r#"
    INSERT INTO user_links (user_id, url_id)
    VALUES ($1, $2)
"#;

const SELECT_USER_LINKS: &str = r#"
    SELECT u.short_url, u.origin_url
    FROM user_links ul
    JOIN urls u ON u.id = ul.url_id
    WHERE ul.user_id = $1
      AND ul.is_deleted = FALSE
"#;

const SOFT_DELETE: &str = r#"
    UPDATE user_links
    SET is_deleted = TRUE
    WHERE user_id = $1
      AND is_deleted = FALSE
      AND url_id IN (SELECT id FROM urls WHERE short_url = ANY($2))
"#;

/// Connection settings for [`PostgresStorage`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct PostgresConfig {
    #[builder(setter(into))]
    pub database_url: String,
    #[builder(default = 10)]
    pub max_connections: u32,
    #[builder(default = Duration::from_secs(5))]
    pub acquire_timeout: Duration,
    #[builder(default)]
    pub pipeline: PipelineConfig,
}

/// PostgreSQL implementation of [`LinkStorage`].
///
/// Links live in `urls`, one row per original URL. Each user's claim is a
/// row in `user_links` carrying the soft-delete flag, so one owner deleting
/// a shared link never breaks it for the others. [`LinkStorage::delete`]
/// only enqueues into the [`DeletePipeline`]; the pipeline's workers apply
/// whole batches through [`LinkStorage::delete_batch`]'s statement.
pub struct PostgresStorage {
    pool: PgPool,
    pipeline: DeletePipeline,
}

impl PostgresStorage {
    /// Opens a connection pool, creates the schema and starts the pipeline.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(map_sqlx_error)?;

        Self::with_pool(pool, config.pipeline).await
    }

    /// Builds the storage on top of an existing pool.
    pub async fn with_pool(pool: PgPool, pipeline: PipelineConfig) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(map_sqlx_error)?;

        let deleter = Arc::new(SoftDeleter { pool: pool.clone() });
        let pipeline = DeletePipeline::spawn(deleter, pipeline);
        info!("postgres storage ready");

        Ok(Self { pool, pipeline })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Applies grouped soft deletes, one transaction per call.
struct SoftDeleter {
    pool: PgPool,
}

#[async_trait]
impl BatchApplier for SoftDeleter {
    async fn apply(&self, groups: &[UserDeletes]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut affected = 0;
        for group in groups {
            let codes: Vec<String> = group
                .codes
                .iter()
                .map(|code| code.as_str().to_owned())
                .collect();

            // Statement text is constant, so each pooled connection prepares
            // it once and reuses it from its statement cache.
            affected += sqlx::query(SOFT_DELETE)
                .bind(group.user_id.as_str())
                .bind(codes)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
        }
        // Dropping `tx` on any early return rolls back every group.
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(users = groups.len(), affected, "soft-deleted user links");
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Classifies a `sqlx` error into the storage error taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match &err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        sqlx::Error::Database(db)
            if db
                .code()
                .is_some_and(|code| code.starts_with(STATEMENT_ERROR_CLASS)) =>
        {
            StorageError::Statement(message)
        }
        _ => StorageError::Execution(message),
    }
}

/// Looks up the link a conflicting insert ran into.
///
/// The link only matches when both the URL and the code agree with it.
async fn stored_link_id(
    conn: &mut PgConnection,
    code: &ShortCode,
    original_url: &str,
) -> Result<i64> {
    let row = sqlx::query(SELECT_LINK_BY_URL)
        .bind(original_url)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    let Some(row) = row else {
        return Err(StorageError::Conflict(format!("{code} belongs to another url")));
    };

    let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
    let stored: String = row.try_get("short_url").map_err(map_sqlx_error)?;
    if stored != code.as_str() {
        return Err(StorageError::Conflict(format!(
            "{original_url} is stored under {stored}, not {code}"
        )));
    }
    Ok(id)
}

fn count(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|err| StorageError::InvalidData(err.to_string()))
}

/// Creates the link if needed and records `user`'s claim on it.
async fn claim(
    conn: &mut PgConnection,
    user: &UserId,
    code: &ShortCode,
    original_url: &str,
) -> Result<()> {
    let inserted: Option<i64> = sqlx::query_scalar(INSERT_LINK)
        .bind(original_url)
        .bind(code.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    let url_id = match inserted {
        Some(id) => id,
        None => stored_link_id(conn, code, original_url).await?,
    };

    let result = sqlx::query(INSERT_CLAIM)
        .bind(user.as_str())
        .bind(url_id)
        .execute(&mut *conn)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => {
            Err(StorageError::AlreadyExists(code.to_string()))
        }
        Err(err) => Err(map_sqlx_error(err)),
    }
}

#[async_trait]
impl LinkStorage for PostgresStorage {
    async fn get(&self, code: &ShortCode) -> Result<String> {
        let row = sqlx::query(SELECT_LINK)
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Err(StorageError::NotFound(code.to_string()));
        };

        let original_url: String = row.try_get("origin_url").map_err(map_sqlx_error)?;
        let live: bool = row.try_get("live").map_err(map_sqlx_error)?;

        if live {
            Ok(original_url)
        } else {
            Err(StorageError::Deleted(code.to_string()))
        }
    }

    async fn put(&self, user: &UserId, code: &ShortCode, original_url: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        claim(&mut tx, user, code, original_url).await?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn put_batch(&self, user: &UserId, links: &HashMap<String, ShortCode>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for (original_url, code) in links {
            claim(&mut tx, user, code, original_url).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(user_id = %user, links = links.len(), "stored link batch");
        Ok(())
    }

    async fn get_user_links(&self, user: &UserId) -> Result<HashMap<ShortCode, String>> {
        let rows = sqlx::query(SELECT_USER_LINKS)
            .bind(user.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let short_url: String = row.try_get("short_url").map_err(map_sqlx_error)?;
                let original_url: String = row.try_get("origin_url").map_err(map_sqlx_error)?;
                Ok((ShortCode::new_unchecked(short_url), original_url))
            })
            .collect()
    }

    async fn delete(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        self.pipeline.intake().enqueue_all(user, codes).await?;
        debug!(user_id = %user, requested = codes.len(), "queued link deletion");
        Ok(())
    }

    async fn delete_batch(&self, codes: &[ShortCode], user: &UserId) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }

        SoftDeleter {
            pool: self.pool.clone(),
        }
        .apply(&[UserDeletes {
            user_id: user.clone(),
            codes: codes.to_vec(),
        }])
        .await
    }

    async fn url_count(&self) -> Result<usize> {
        let urls: i64 = sqlx::query_scalar(COUNT_URLS)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        count(urls)
    }

    async fn user_count(&self) -> Result<usize> {
        let users: i64 = sqlx::query_scalar(COUNT_USERS)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        count(users)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    async fn close(&self) -> Result<()> {
        let drained = self.pipeline.shutdown().await;
        self.pool.close().await;
        info!("postgres storage closed");
        drained
    }
}
