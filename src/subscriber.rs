//! Durable subscriber: WebSocket consumer feeding the persistence queue.
//!
//! Connects to the publisher, parses each published frame, and turns the
//! aircraft entries into path-sample candidates. The bounded channel to
//! the store worker is the backpressure point: when it is full, samples
//! are dropped and counted — persistence lag never stalls the live
//! stream.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cpr;
use crate::metrics::Metrics;
use crate::net::Backoff;
use crate::publisher::PublishedFrame;
use crate::store::{MIN_ALT_DELTA_FT, MIN_MOVE_METERS, PathSample, StoreCommand};
use crate::tracker::AircraftSnapshot;

pub struct SubscriberClient {
    uri: String,
    save_interval: TimeDelta,
    metrics: Arc<Metrics>,
}

impl SubscriberClient {
    pub fn new(uri: String, save_interval: std::time::Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            uri,
            save_interval: TimeDelta::from_std(save_interval).unwrap_or(TimeDelta::seconds(5)),
            metrics,
        }
    }

    /// Consume the published stream until cancelled, reconnecting with
    /// the shared backoff policy on any failure.
    pub async fn run(
        &self,
        commands: flume::Sender<StoreCommand>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::default();
        let mut last_emit: HashMap<String, LastEmit> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let connect = tokio::select! {
                _ = cancel.cancelled() => break,
                connect = connect_async(self.uri.as_str()) => connect,
            };

            let (mut ws, _) = match connect {
                Ok(ok) => {
                    info!("subscribed to {}", self.uri);
                    backoff.reset();
                    ok
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("subscribe to {} failed: {e}, retrying in {delay:?}", self.uri);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    message = ws.next() => message,
                };
                match message {
                    Some(Ok(message)) if message.is_text() => {
                        let Ok(text) = message.to_text() else {
                            continue;
                        };
                        match serde_json::from_str::<PublishedFrame>(text) {
                            Ok(frame) => {
                                self.metrics.inc(
                                    &self.metrics.updates_received,
                                    "subscriber.updates.received_total",
                                );
                                let samples =
                                    samples_from_frame(&frame, &mut last_emit, self.save_interval);
                                push_samples(samples, &commands, &self.metrics);
                            }
                            Err(e) => {
                                debug!("unparseable published frame: {e}");
                            }
                        }
                    }
                    Some(Ok(message)) if message.is_close() => {
                        info!("publisher closed the stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("stream error: {e}, reconnecting");
                        break;
                    }
                    None => {
                        info!("stream ended, reconnecting");
                        break;
                    }
                }
            }
        }

        info!("subscriber client stopped");
        Ok(())
    }
}

/// Last candidate emitted per aircraft: the throttle state.
#[derive(Debug, Clone, Copy)]
pub struct LastEmit {
    ts: DateTime<Utc>,
    lat: f64,
    lon: f64,
    alt_ft: Option<i32>,
}

/// Turn a published frame into path-sample candidates. Requires position
/// and velocity. Per aircraft, a candidate inside the save interval is
/// suppressed only while position and altitude sit still; a meaningful
/// move or climb goes through immediately.
pub fn samples_from_frame(
    frame: &PublishedFrame,
    last_emit: &mut HashMap<String, LastEmit>,
    save_interval: TimeDelta,
) -> Vec<PathSample> {
    let ts = DateTime::from_timestamp_millis((frame.ts * 1000.0) as i64).unwrap_or_else(Utc::now);

    frame
        .aircraft
        .iter()
        .filter(|aircraft| aircraft.ground_speed.is_some())
        .filter_map(|aircraft| {
            if let Some(previous) = last_emit.get(&aircraft.icao) {
                let within_interval = ts.signed_duration_since(previous.ts) < save_interval;
                if within_interval && !moved_meaningfully(previous, aircraft) {
                    return None;
                }
            }
            last_emit.insert(
                aircraft.icao.clone(),
                LastEmit {
                    ts,
                    lat: aircraft.lat,
                    lon: aircraft.lon,
                    alt_ft: aircraft.alt_ft,
                },
            );

            // The wire format carries no air/ground flag; zero altitude is
            // the surface signature.
            let kind = if aircraft.alt_ft == Some(0) {
                "surface"
            } else {
                "airborne"
            };

            Some(PathSample {
                icao: aircraft.icao.clone(),
                callsign: aircraft.callsign.clone(),
                ts,
                lat: aircraft.lat,
                lon: aircraft.lon,
                alt_ft: aircraft.alt_ft,
                velocity: aircraft.ground_speed,
                track_deg: aircraft.track_deg,
                vertical_rate_fpm: aircraft.vertical_rate_fpm,
                kind: kind.to_string(),
            })
        })
        .collect()
}

/// Position or altitude changed enough that the store would persist the
/// row even inside the save interval; same thresholds as its dedup gate.
fn moved_meaningfully(previous: &LastEmit, aircraft: &AircraftSnapshot) -> bool {
    let moved_m = cpr::haversine_km(
        &cpr::Position {
            latitude: previous.lat,
            longitude: previous.lon,
        },
        &cpr::Position {
            latitude: aircraft.lat,
            longitude: aircraft.lon,
        },
    ) * 1000.0;
    if moved_m > MIN_MOVE_METERS {
        return true;
    }
    match (previous.alt_ft, aircraft.alt_ft) {
        (Some(a), Some(b)) => (f64::from(b) - f64::from(a)).abs() > MIN_ALT_DELTA_FT,
        (None, None) => false,
        _ => true,
    }
}

/// Non-blocking enqueue toward the store worker; full queue drops the
/// sample and bumps the counter. Returns the number dropped.
pub fn push_samples(
    samples: Vec<PathSample>,
    commands: &flume::Sender<StoreCommand>,
    metrics: &Metrics,
) -> usize {
    let mut dropped = 0;
    for sample in samples {
        match commands.try_send(StoreCommand::Sample(sample)) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                dropped += 1;
                metrics.inc(&metrics.samples_dropped, "subscriber.samples.dropped_total");
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                dropped += 1;
                metrics.inc(&metrics.samples_dropped, "subscriber.samples.dropped_total");
            }
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AircraftSnapshot;

    fn snapshot(icao: &str, gs: Option<f64>, alt: Option<i32>) -> AircraftSnapshot {
        AircraftSnapshot {
            icao: icao.to_string(),
            callsign: Some("UAL123".to_string()),
            lat: 49.8,
            lon: 6.1,
            alt_ft: alt,
            ground_speed: gs,
            track_deg: Some(90.0),
            vertical_rate_fpm: Some(0),
            last_seen: 1717243200.0,
        }
    }

    fn frame(ts: f64, aircraft: Vec<AircraftSnapshot>) -> PublishedFrame {
        PublishedFrame { ts, aircraft }
    }

    #[test]
    fn requires_velocity() {
        let mut last_emit = HashMap::new();
        let samples = samples_from_frame(
            &frame(
                1717243200.0,
                vec![
                    snapshot("ABC123", Some(450.0), Some(39000)),
                    snapshot("DEF456", None, Some(1000)),
                ],
            ),
            &mut last_emit,
            TimeDelta::seconds(5),
        );
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].icao, "ABC123");
        assert_eq!(samples[0].kind, "airborne");
        assert_eq!(samples[0].velocity, Some(450.0));
    }

    #[test]
    fn throttles_per_aircraft() {
        let mut last_emit = HashMap::new();
        let interval = TimeDelta::seconds(5);

        let one = samples_from_frame(
            &frame(1000.0, vec![snapshot("ABC123", Some(450.0), Some(39000))]),
            &mut last_emit,
            interval,
        );
        assert_eq!(one.len(), 1);

        // One second later: suppressed.
        let two = samples_from_frame(
            &frame(1001.0, vec![snapshot("ABC123", Some(450.0), Some(39000))]),
            &mut last_emit,
            interval,
        );
        assert!(two.is_empty());

        // Past the interval: emitted again; other aircraft unaffected.
        let three = samples_from_frame(
            &frame(
                1006.0,
                vec![
                    snapshot("ABC123", Some(450.0), Some(39000)),
                    snapshot("DEF456", Some(200.0), Some(5000)),
                ],
            ),
            &mut last_emit,
            interval,
        );
        assert_eq!(three.len(), 2);
    }

    #[test]
    fn meaningful_change_overrides_throttle() {
        let mut last_emit = HashMap::new();
        let interval = TimeDelta::seconds(5);

        let mut moving = snapshot("ABC123", Some(450.0), Some(39000));
        let one = samples_from_frame(
            &frame(1000.0, vec![moving.clone()]),
            &mut last_emit,
            interval,
        );
        assert_eq!(one.len(), 1);

        // One second later but ~1.1 km further: persisted immediately.
        moving.lat += 0.01;
        let two = samples_from_frame(
            &frame(1001.0, vec![moving.clone()]),
            &mut last_emit,
            interval,
        );
        assert_eq!(two.len(), 1, "position move beats the throttle");

        // Another second, same spot, 20 ft higher: also persisted.
        moving.alt_ft = Some(39020);
        let three = samples_from_frame(
            &frame(1002.0, vec![moving.clone()]),
            &mut last_emit,
            interval,
        );
        assert_eq!(three.len(), 1, "altitude change beats the throttle");

        // Sitting still right after: suppressed until the interval passes.
        let four = samples_from_frame(
            &frame(1003.0, vec![moving.clone()]),
            &mut last_emit,
            interval,
        );
        assert!(four.is_empty());
    }

    #[test]
    fn surface_kind_from_zero_altitude() {
        let mut last_emit = HashMap::new();
        let samples = samples_from_frame(
            &frame(1000.0, vec![snapshot("ABC123", Some(8.0), Some(0))]),
            &mut last_emit,
            TimeDelta::seconds(5),
        );
        assert_eq!(samples[0].kind, "surface");
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let metrics = Metrics::new();
        let (tx, rx) = flume::bounded(8);

        let mut samples = Vec::new();
        for i in 0..1000 {
            samples.push(PathSample {
                icao: format!("{i:06X}"),
                callsign: None,
                ts: Utc::now(),
                lat: 49.8,
                lon: 6.1,
                alt_ft: Some(1000),
                velocity: Some(100.0),
                track_deg: None,
                vertical_rate_fpm: None,
                kind: "airborne".to_string(),
            });
        }

        let dropped = push_samples(samples, &tx, &metrics);
        assert_eq!(dropped, 1000 - 8);
        assert_eq!(rx.len(), 8);
        assert_eq!(
            metrics
                .samples_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            992
        );
    }
}
