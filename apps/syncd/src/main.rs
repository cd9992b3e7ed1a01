//! Headless sync daemon: keeps a local Huddle store in sync until Ctrl-C.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tokio::sync::broadcast::error::RecvError;

use huddle_core::sync::SystemClock;
use huddle_storage_sqlite::{ConnectionOptions, LocalStore};
use huddle_sync_client::{HuddleApiClient, RefreshTokenSession, WebSocketTransport};
use huddle_sync_engine::{OutboxEvent, SyncEngine, SyncEngineDeps};

use crate::config::SyncdConfig;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = SyncdConfig::from_env()?;

    let data_dir = config.data_dir.to_string_lossy().to_string();
    let store = LocalStore::open(
        &data_dir,
        ConnectionOptions {
            encryption_key: config.db_key.clone(),
            ..ConnectionOptions::default()
        },
    )
    .with_context(|| format!("open local store in {}", data_dir))?;

    let backend = HuddleApiClient::new(&config.api_url, config.api_key.clone())
        .context("create API client")?;
    let session = RefreshTokenSession::new(
        &config.auth_url,
        config.api_key.clone(),
        config.refresh_token.clone(),
    )
    .context("create session")?;

    let engine = SyncEngine::new(
        SyncEngineDeps {
            messaging: Arc::new(store.messaging()),
            read_state: Arc::new(store.read_state()),
            outbox: Arc::new(store.outbox()),
            tombstones: Arc::new(store.tombstones()),
            cursors: Arc::new(store.cursors()),
            backend: Arc::new(backend),
            session: Arc::new(session),
            transport: Arc::new(WebSocketTransport::new(&config.stream_url)),
            clock: Arc::new(SystemClock),
        },
        config.engine.clone(),
        config.user_id.clone(),
    );

    let mut events = engine.outbox_events();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OutboxEvent::Delivered { entity_id, .. }) => info!("[Syncd] Delivered {}", entity_id),
                Ok(OutboxEvent::Retrying {
                    entity_id,
                    retry_count,
                    ..
                }) => info!("[Syncd] Retrying {} (attempt {})", entity_id, retry_count),
                Ok(OutboxEvent::Poisoned {
                    entity_id, reason, ..
                }) => warn!("[Syncd] Gave up on {}: {}", entity_id, reason),
                Err(RecvError::Lagged(skipped)) => warn!("[Syncd] Missed {} outbox event(s)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.start().await.context("start sync engine")?;
    info!(
        "[Syncd] Syncing {} for {} (store {})",
        config.api_url, config.user_id, data_dir
    );

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("[Syncd] Shutting down");
    engine.stop().await;
    reporter.abort();
    Ok(())
}
