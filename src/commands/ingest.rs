//! `skytrail ingest`: dump1090 feed -> decoder -> tracker -> publisher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{FeedClient, FeedConfig};
use crate::metrics::Metrics;
use crate::publisher::Publisher;
use crate::supervisor::supervise;
use crate::tracker::{Tracker, run_tracker};

/// Cadence of the tracker's expiry scan.
pub(crate) const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Raw-frame and decoded-message queue depths; deep enough to absorb
/// bursts, bounded so the socket backpressures instead of the heap.
pub(crate) const FRAME_QUEUE: usize = 4096;

pub async fn execute(config: &Config, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    // Bind first: a taken port is a fatal init error, not a retry loop.
    let publisher = Publisher::bind(config.ws_port).await?;

    let (frame_tx, frame_rx) = flume::bounded(FRAME_QUEUE);
    let (message_tx, message_rx) = flume::bounded(FRAME_QUEUE);
    let (snapshot_tx, snapshot_rx) = flume::bounded(16);

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
                None,
                EXPIRY_SCAN_INTERVAL,
                cancel.clone(),
            )
        })
    };

    let publish = publisher.run(
        config.publish_interval,
        snapshot_tx,
        Arc::clone(&metrics),
        cancel.clone(),
    );

    let result = tokio::try_join!(feed, decode, tracker, publish);
    if result.is_err() {
        cancel.cancel();
    }
    result.map(|_| ())
}
