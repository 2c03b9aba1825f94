//! `skytrail run`: the whole pipeline in one process. The recorder
//! subscribes to the local publisher, and the tracker's session-close
//! events reach the store directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::feed::{FeedClient, FeedConfig};
use crate::metrics::Metrics;
use crate::publisher::Publisher;
use crate::store::{Database, StoreCommand, StoreWorker};
use crate::subscriber::SubscriberClient;
use crate::supervisor::supervise;
use crate::tracker::{SessionClose, Tracker, run_tracker};

use super::ingest::{EXPIRY_SCAN_INTERVAL, FRAME_QUEUE};
use super::record::PERSIST_QUEUE;

pub async fn execute(config: &Config, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    // Fatal init first: the listening socket and the database.
    let publisher = Publisher::bind(config.ws_port).await?;
    let db = Database::open(&config.db_path)?;
    let worker = StoreWorker::new(
        db,
        config.session_gap(),
        config.save_interval,
        Arc::clone(&metrics),
    )?;

    let (frame_tx, frame_rx) = flume::bounded(FRAME_QUEUE);
    let (message_tx, message_rx) = flume::bounded(FRAME_QUEUE);
    let (snapshot_tx, snapshot_rx) = flume::bounded(16);
    let (close_tx, close_rx) = flume::bounded::<SessionClose>(256);
    let (store_tx, store_rx) = flume::bounded::<StoreCommand>(PERSIST_QUEUE);

    let worker_handle = std::thread::Builder::new()
        .name("store-worker".to_string())
        .spawn(move || worker.run(store_rx))
        .context("failed to spawn store worker thread")?;

    let feed = {
        let config = FeedConfig {
            host: config.dump1090_host.clone(),
            port: config.dump1090_raw_port,
        };
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        supervise("feed", cancel.clone(), move || {
            let client = FeedClient::new(config.clone(), Arc::clone(&metrics));
            let frame_tx = frame_tx.clone();
            let cancel = cancel.clone();
            async move { client.run(frame_tx, cancel).await }
        })
    };

    let decode = {
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        supervise("decode", cancel.clone(), move || {
            super::decode_loop(
                frame_rx.clone(),
                message_tx.clone(),
                Arc::clone(&metrics),
                cancel.clone(),
            )
        })
    };

    let tracker = {
        let receiver = config.receiver;
        let expiry = config.expiry;
        let assembly_timeout = config.assembly_timeout;
        let metrics = Arc::clone(&metrics);
        let cancel = cancel.clone();
        supervise("tracker", cancel.clone(), move || {
            let tracker = Tracker::new(
                receiver,
                expiry,
                assembly_timeout,
                Arc::clone(&metrics),
            );
            run_tracker(
                tracker,
                message_rx.clone(),
                snapshot_rx.clone(),
                Some(close_tx.clone()),
                EXPIRY_SCAN_INTERVAL,
                cancel.clone(),
            )
        })
    };

    // Session-close events from the assembler flow into the store queue.
    let closes = {
        let store_tx = store_tx.clone();
        async move {
            while let Ok(close) = close_rx.recv_async().await {
                let command = StoreCommand::CloseSession {
                    icao: format!("{:06X}", close.icao),
                    end_time: close.last_seen,
                };
                if store_tx.send_async(command).await.is_err() {
                    break;
                }
            }
            Ok::<(), anyhow::Error>(())
        }
    };

    let publish = publisher.run(
        config.publish_interval,
        snapshot_tx,
        Arc::clone(&metrics),
        cancel.clone(),
    );

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

    let result = tokio::try_join!(feed, decode, tracker, closes, publish, subscribe);
    if result.is_err() {
        cancel.cancel();
    }

    drop(store_tx);
    info!("waiting for store worker to drain");
    let worker_result = tokio::task::spawn_blocking(move || worker_handle.join())
        .await
        .context("failed to join store worker")?;
    worker_result
        .map_err(|_| anyhow::anyhow!("store worker panicked"))?
        .context("store worker failed")?;

    result.map(|_| ())
}
