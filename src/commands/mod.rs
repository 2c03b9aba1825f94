//! Process entrypoints, one per deployment role.

pub mod ingest;
pub mod record;
pub mod run;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::metrics::Metrics;
use crate::modes::{self, DecodedMessage};

/// Decode raw feed frames and hand them to the tracker. Malformed frames
/// are counted and dropped.
pub(crate) async fn decode_loop(
    frames: flume::Receiver<(DateTime<Utc>, String)>,
    decoded: flume::Sender<DecodedMessage>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv_async() => frame,
        };
        let Ok((rx_time, hex)) = frame else {
            break;
        };
        match modes::decode(&hex, rx_time) {
            Ok(message) => {
                if decoded.send_async(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                metrics.inc(&metrics.decode_failed, "decode.failed_total");
                trace!("dropping frame: {e}");
            }
        }
    }
    Ok(())
}
