//! Publisher fan-out.
//!
//! WebSocket server that broadcasts one JSON frame per tick to every
//! connected subscriber. Delivery is at-most-once: each subscriber gets a
//! one-frame send buffer, a full buffer drops the frame, and a subscriber
//! that stays full for several consecutive ticks is disconnected so one
//! stalled peer can never hold the pipeline back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::tracker::AircraftSnapshot;

/// Consecutive ticks a subscriber may sit with a full buffer before we
/// close it.
const SLOW_TICK_LIMIT: u32 = 5;

/// The frame sent to every subscriber on each tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedFrame {
    /// Epoch seconds.
    pub ts: f64,
    pub aircraft: Vec<AircraftSnapshot>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
    full_ticks: u32,
}

pub struct Publisher {
    listener: TcpListener,
}

impl Publisher {
    /// Bind the listening socket. Failure here is fatal init.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind publisher port {port}"))?;
        info!("publisher listening on port {}", listener.local_addr()?.port());
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept subscribers and broadcast a table snapshot every tick.
    pub async fn run(
        self,
        interval: Duration,
        snapshots: flume::Sender<oneshot::Sender<Vec<AircraftSnapshot>>>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut tick = tokio::time::interval(interval);
        // A missed tick is skipped, never made up.
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut subscribers: Vec<Subscriber> = Vec::new();
        let mut next_id: u64 = 0;
        let (joined_tx, joined_rx) = flume::unbounded::<Subscriber>();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            next_id += 1;
                            let id = next_id;
                            let joined_tx = joined_tx.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                match tokio_tungstenite::accept_async(stream).await {
                                    Ok(ws) => {
                                        info!("subscriber {id} connected from {peer}");
                                        let (tx, rx) = mpsc::channel::<String>(1);
                                        let _ = joined_tx.send(Subscriber {
                                            id,
                                            tx,
                                            full_ticks: 0,
                                        });
                                        connection_task(ws, rx, cancel).await;
                                        debug!("subscriber {id} connection task ended");
                                    }
                                    Err(e) => {
                                        warn!("websocket handshake with {peer} failed: {e}");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                        }
                    }
                }
                _ = tick.tick() => {
                    for subscriber in joined_rx.try_iter() {
                        subscribers.push(subscriber);
                    }

                    let (reply_tx, reply_rx) = oneshot::channel();
                    if snapshots.send_async(reply_tx).await.is_err() {
                        info!("tracker gone, publisher stopping");
                        break;
                    }
                    let rows = match reply_rx.await {
                        Ok(rows) => rows,
                        Err(_) => break,
                    };

                    let frame = PublishedFrame {
                        ts: Utc::now().timestamp_millis() as f64 / 1000.0,
                        aircraft: rows,
                    };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to serialize published frame: {e}");
                            continue;
                        }
                    };

                    fan_out(&mut subscribers, &text, &metrics);
                    metrics.inc(&metrics.frames_published, "publisher.frames.published_total");
                    metrics.set_subscribers(subscribers.len());
                }
            }
        }

        info!("publisher stopped");
        Ok(())
    }
}

/// Non-blocking delivery of one frame to every subscriber. Full buffers
/// drop the frame; persistently full or closed subscribers are removed.
fn fan_out(subscribers: &mut Vec<Subscriber>, text: &str, metrics: &Metrics) {
    subscribers.retain_mut(|subscriber| {
        match subscriber.tx.try_send(text.to_string()) {
            Ok(()) => {
                subscriber.full_ticks = 0;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                subscriber.full_ticks += 1;
                metrics.inc(
                    &metrics.subscriber_frames_dropped,
                    "publisher.frames.dropped_total",
                );
                if subscriber.full_ticks >= SLOW_TICK_LIMIT {
                    warn!(
                        "dropping slow subscriber {} after {} stalled ticks",
                        subscriber.id, subscriber.full_ticks
                    );
                    metrics.inc(
                        &metrics.slow_subscribers_dropped,
                        "publisher.subscribers.dropped_slow_total",
                    );
                    false
                } else {
                    true
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("subscriber {} went away", subscriber.id);
                false
            }
        }
    });
}

/// Per-connection writer: forwards buffered frames onto the socket and
/// watches the read side for the peer closing.
async fn connection_task(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut frames: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            frame = frames.recv() => match frame {
                Some(text) => {
                    if ws_tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Publisher dropped us (slow subscriber or shutdown).
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {} // subscribers have nothing to say to us
                Some(Err(_)) | None => break,
            },
        }
    }
}
