// src/main.rs

use anyhow::{Context, Result};
use odm::api;
use odm::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("odm=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tokio::fs::create_dir_all(config.packages_dir())
        .await
        .with_context(|| format!("cannot create {}", config.packages_dir().display()))?;

    let store = SqliteTaskStore::open(&config.database_path())
        .await
        .with_context(|| format!("cannot open {}", config.database_path().display()))?;
    let downloader = Downloader::new(config.engine()).context("cannot build HTTP client")?;
    let manager = Arc::new(TaskManager::new(Arc::new(store), downloader, config.manager()).await?);

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(manager.clone().run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, data_dir = %config.data_dir.display(), "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, api::router(manager))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler.await?;
    Ok(())
}
