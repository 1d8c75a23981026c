mod cli;

use crate::cli::CLI;
use anyhow::Context;
use clap::Parser;
use stubby_core::LinkStorage;
use stubby_shortener::ShortenerService;
use stubby_storage::StorageBackend;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.log_json);

    info!(
        storage_backend = %config.storage,
        base_url = %config.base_url,
        "starting stubby"
    );

    let storage = StorageBackend::open(config.storage_config()?)
        .await
        .context("failed to open storage backend")?;
    storage.ping().await.context("storage backend is not reachable")?;

    let service = ShortenerService::new(storage, config.base_url.clone());
    let stats = service
        .statistics()
        .await
        .context("failed to read storage statistics")?;
    info!(
        backend = service.storage().kind(),
        urls = stats.urls,
        users = stats.users,
        "stubby ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested, draining pending deletions");

    if let Err(err) = service.close().await {
        error!(error = %err, "storage did not close cleanly");
        return Err(err.into());
    }

    info!("stubby stopped");
    Ok(())
}
