use clap::{Parser, ValueEnum};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;
use stubby_storage::{PipelineConfig, PostgresConfig, StorageConfig};

pub const STORAGE_BACKEND_ENV: &str = "STUBBY_STORAGE_BACKEND";
pub const FILE_STORAGE_PATH_ENV: &str = "STUBBY_FILE_STORAGE_PATH";
pub const DATABASE_DSN_ENV: &str = "STUBBY_DATABASE_DSN";
pub const BASE_URL_ENV: &str = "STUBBY_BASE_URL";
pub const DELETE_BATCH_SIZE_ENV: &str = "STUBBY_DELETE_BATCH_SIZE";
pub const DELETE_FLUSH_INTERVAL_MS_ENV: &str = "STUBBY_DELETE_FLUSH_INTERVAL_MS";
pub const DELETE_WORKERS_ENV: &str = "STUBBY_DELETE_WORKERS";
pub const DELETE_QUEUE_CAPACITY_ENV: &str = "STUBBY_DELETE_QUEUE_CAPACITY";
pub const DELETE_SHUTDOWN_TIMEOUT_SECS_ENV: &str = "STUBBY_DELETE_SHUTDOWN_TIMEOUT_SECS";
pub const LOG_JSON_ENV: &str = "STUBBY_LOG_JSON";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "memory")]
    Memory,
    #[value(name = "file")]
    File,
    #[value(name = "postgres")]
    Postgres,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::Memory => write!(f, "memory"),
            StorageBackendArg::File => write!(f, "file"),
            StorageBackendArg::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stubby")]
pub struct CLI {
    #[arg(
        long,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::Memory
    )]
    pub storage: StorageBackendArg,

    #[arg(long, env = FILE_STORAGE_PATH_ENV, required_if_eq("storage", "file"))]
    pub file_storage_path: Option<PathBuf>,

    #[arg(long, env = DATABASE_DSN_ENV, required_if_eq("storage", "postgres"))]
    pub database_dsn: Option<String>,

    #[arg(long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, env = DELETE_BATCH_SIZE_ENV, default_value_t = 5)]
    pub delete_batch_size: usize,

    #[arg(long, env = DELETE_FLUSH_INTERVAL_MS_ENV, default_value_t = 5_000)]
    pub delete_flush_interval_ms: u64,

    /// Defaults to the number of available CPUs.
    #[arg(long, env = DELETE_WORKERS_ENV)]
    pub delete_workers: Option<usize>,

    #[arg(long, env = DELETE_QUEUE_CAPACITY_ENV, default_value_t = 1024)]
    pub delete_queue_capacity: usize,

    #[arg(long, env = DELETE_SHUTDOWN_TIMEOUT_SECS_ENV, default_value_t = 30)]
    pub delete_shutdown_timeout_secs: u64,

    #[arg(long, env = LOG_JSON_ENV)]
    pub log_json: bool,
}

impl CLI {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig::builder()
            .batch_size(self.delete_batch_size)
            .flush_interval(Duration::from_millis(self.delete_flush_interval_ms))
            .workers(self.delete_workers.unwrap_or(defaults.workers))
            .queue_capacity(self.delete_queue_capacity)
            .shutdown_timeout(Duration::from_secs(self.delete_shutdown_timeout_secs))
            .build()
    }

    pub fn storage_config(&self) -> anyhow::Result<StorageConfig> {
        let config = match self.storage {
            StorageBackendArg::Memory => StorageConfig::Memory,
            StorageBackendArg::File => {
                let path = self.file_storage_path.clone().ok_or_else(|| {
                    anyhow::anyhow!("file storage path is required when storage backend is file")
                })?;
                StorageConfig::File { path }
            }
            StorageBackendArg::Postgres => {
                let dsn = self.database_dsn.clone().ok_or_else(|| {
                    anyhow::anyhow!("database dsn is required when storage backend is postgres")
                })?;
                StorageConfig::Postgres(
                    PostgresConfig::builder()
                        .database_url(dsn)
                        .pipeline(self.pipeline_config())
                        .build(),
                )
            }
        };
        Ok(config)
    }
}
