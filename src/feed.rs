//! Frame source: TCP client for the dump1090 raw feed.
//!
//! dump1090 serves hex Mode-S frames on port 30002 in AVR text framing,
//! one frame per line (`*<hex>;`, or `@<12 hex MLAT digits><hex>;`).
//! The client reconnects forever with the shared backoff policy and never
//! buffers unbounded: frames go into a bounded channel and the TCP socket
//! backpressures if the decoder falls behind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::metrics::Metrics;
use crate::net::Backoff;

/// No data for this long counts as a dead connection.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

enum ConnectionResult {
    /// Ran until the peer closed or we were cancelled.
    Closed,
    /// Could not establish the connection.
    ConnectFailed(anyhow::Error),
    /// Established, then failed mid-operation.
    OperationFailed(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
}

pub struct FeedClient {
    config: FeedConfig,
    metrics: Arc<Metrics>,
}

impl FeedClient {
    pub fn new(config: FeedConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    /// Read frames until cancelled, reconnecting on any failure.
    pub async fn run(
        &self,
        frames: flume::Sender<(DateTime<Utc>, String)>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect_and_read(&frames, &cancel).await {
                ConnectionResult::Closed => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!("feed connection closed by peer, reconnecting");
                    backoff.reset();
                }
                ConnectionResult::ConnectFailed(e) => {
                    let delay = backoff.next_delay();
                    warn!("feed connect failed: {e:#}, retrying in {delay:?}");
                    metrics::counter!("feed.connection.failed_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
                ConnectionResult::OperationFailed(e) => {
                    let delay = backoff.next_delay();
                    warn!("feed read failed: {e:#}, reconnecting in {delay:?}");
                    metrics::counter!("feed.operation.failed_total").increment(1);
                    self.metrics
                        .inc(&self.metrics.feed_reconnects, "feed.reconnects_total");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        info!("feed client stopped");
        Ok(())
    }

    async fn connect_and_read(
        &self,
        frames: &flume::Sender<(DateTime<Utc>, String)>,
        cancel: &CancellationToken,
    ) -> ConnectionResult {
        let address = format!("{}:{}", self.config.host, self.config.port);
        info!("connecting to dump1090 at {address}");

        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                return ConnectionResult::ConnectFailed(anyhow::anyhow!(
                    "failed to connect to {address}: {e}"
                ));
            }
        };
        info!("connected to dump1090 at {address}");
        metrics::gauge!("feed.connected").set(1.0);

        let reader = BufReader::new(stream);
        let mut lines = reader.lines();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    metrics::gauge!("feed.connected").set(0.0);
                    return ConnectionResult::Closed;
                }
                read = tokio::time::timeout(READ_TIMEOUT, lines.next_line()) => match read {
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => {
                        metrics::gauge!("feed.connected").set(0.0);
                        return ConnectionResult::Closed;
                    }
                    Ok(Err(e)) => {
                        metrics::gauge!("feed.connected").set(0.0);
                        return ConnectionResult::OperationFailed(anyhow::anyhow!(
                            "read error: {e}"
                        ));
                    }
                    Err(_) => {
                        metrics::gauge!("feed.connected").set(0.0);
                        return ConnectionResult::OperationFailed(anyhow::anyhow!(
                            "no data for {}s",
                            READ_TIMEOUT.as_secs()
                        ));
                    }
                },
            };

            match parse_avr_line(&line) {
                Some(hex) => {
                    let rx_time = Utc::now();
                    self.metrics
                        .inc(&self.metrics.frames_received, "feed.frames.received_total");
                    trace!("frame: {hex}");
                    // Blocking send: the channel is the backpressure point
                    // between the socket and the decoder.
                    if frames.send_async((rx_time, hex.to_string())).await.is_err() {
                        metrics::gauge!("feed.connected").set(0.0);
                        return ConnectionResult::Closed;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        self.metrics
                            .inc(&self.metrics.malformed_frames, "feed.frames.malformed_total");
                    }
                }
            }
        }
    }
}

/// Extract the hex payload from one AVR line.
pub fn parse_avr_line(line: &str) -> Option<&str> {
    let line = line.trim();
    let body = line.strip_suffix(';')?;
    let payload = if let Some(rest) = body.strip_prefix('*') {
        rest
    } else if let Some(rest) = body.strip_prefix('@') {
        // MLAT variant: 12 hex digits of counter before the frame.
        if rest.len() <= 12 {
            return None;
        }
        &rest[12..]
    } else {
        return None;
    };
    if payload.is_empty() || !payload.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_star_framing() {
        assert_eq!(
            parse_avr_line("*8D40621D58C382D690C8AC2863A7;"),
            Some("8D40621D58C382D690C8AC2863A7")
        );
        assert_eq!(parse_avr_line("  *02E19838AD7DC3;  "), Some("02E19838AD7DC3"));
    }

    #[test]
    fn parses_mlat_framing() {
        assert_eq!(
            parse_avr_line("@0000012345678D40621D58C382D690C8AC2863A7;"),
            Some("8D40621D58C382D690C8AC2863A7")
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_avr_line(""), None);
        assert_eq!(parse_avr_line("8D40621D"), None); // no framing
        assert_eq!(parse_avr_line("*8D40621D"), None); // no terminator
        assert_eq!(parse_avr_line("*;"), None); // empty payload
        assert_eq!(parse_avr_line("*zzzz;"), None); // not hex
        assert_eq!(parse_avr_line("@00000123;"), None); // timestamp only
    }
}
