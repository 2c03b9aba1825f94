//! `skytrail record`: WebSocket subscriber -> single-writer SQLite store.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::store::{Database, StoreCommand, StoreWorker};
use crate::subscriber::SubscriberClient;
use crate::supervisor::supervise;

/// Persistence queue depth: the backpressure point between the live
/// stream and the writer.
pub(crate) const PERSIST_QUEUE: usize = 1024;

pub async fn execute(config: &Config, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    // An unopenable database is a fatal init error.
    let db = Database::open(&config.db_path)?;
    let worker = StoreWorker::new(
        db,
        config.session_gap(),
        config.save_interval,
        Arc::clone(&metrics),
    )?;

    let (store_tx, store_rx) = flume::bounded::<StoreCommand>(PERSIST_QUEUE);
    let worker_handle = std::thread::Builder::new()
        .name("store-worker".to_string())
        .spawn(move || worker.run(store_rx))
        .context("failed to spawn store worker thread")?;

    let subscribe = {
        let uri = config.ws_uri.clone();
        let save_interval = config.save_interval;
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        let store_tx = store_tx.clone();
        supervise("subscriber", cancel.clone(), move || {
            let client = SubscriberClient::new(uri.clone(), save_interval, Arc::clone(&metrics));
            let store_tx = store_tx.clone();
            let cancel = cancel.clone();
            async move { client.run(store_tx, cancel).await }
        })
    };

    let result = subscribe.await;

    // Closing the channel lets the worker flush, checkpoint, and exit.
    drop(store_tx);
    info!("waiting for store worker to drain");
    let worker_result = tokio::task::spawn_blocking(move || worker_handle.join())
        .await
        .context("failed to join store worker")?;
    worker_result
        .map_err(|_| anyhow::anyhow!("store worker panicked"))?
        .context("store worker failed")?;

    result
}
