//! Aircraft assembler.
//!
//! Owns the keyed table of partial aircraft states and merges decoded
//! messages into coherent track records. The table is mutated only by the
//! tracker task; other components talk to it through channels and get
//! value copies back (snapshots), never references.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReceiverPosition;
use crate::cpr::{self, CprFrame, Position};
use crate::metrics::Metrics;
use crate::modes::{DecodedMessage, VelocityKind};

/// Opposite-parity CPR frames must be this close to decode globally.
const CPR_PAIR_WINDOW_SECS: i64 = 10;

/// A recent own position may serve as a local-decoding reference this long.
const REFERENCE_MAX_AGE_SECS: i64 = 180;

/// A decoded position this far from the previous one is implausible.
const MAX_JUMP_KM: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct CprSlot {
    frame: CprFrame,
    rx_time: DateTime<Utc>,
}

/// Per-aircraft assembled state, keyed by the 24-bit ICAO address.
#[derive(Debug, Clone)]
pub struct AircraftState {
    pub icao: u32,
    pub callsign: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_ft: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    pub velocity_kind: Option<VelocityKind>,
    cpr_even: Option<CprSlot>,
    cpr_odd: Option<CprSlot>,
    position_time: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub assembly_complete_at: Option<DateTime<Utc>>,
    incomplete_reported: bool,
}

impl AircraftState {
    fn new(icao: u32, rx_time: DateTime<Utc>) -> Self {
        Self {
            icao,
            callsign: None,
            latitude: None,
            longitude: None,
            altitude_ft: None,
            ground_speed: None,
            track_deg: None,
            vertical_rate_fpm: None,
            velocity_kind: None,
            cpr_even: None,
            cpr_odd: None,
            position_time: None,
            first_seen: rx_time,
            last_seen: rx_time,
            assembly_complete_at: None,
            incomplete_reported: false,
        }
    }

    pub fn position(&self) -> Option<Position> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Position {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    /// Own position recent enough to anchor locally-unambiguous decoding.
    fn reference_position(&self, rx_time: DateTime<Utc>) -> Option<Position> {
        let position_time = self.position_time?;
        if rx_time.signed_duration_since(position_time) <= TimeDelta::seconds(REFERENCE_MAX_AGE_SECS)
        {
            self.position()
        } else {
            None
        }
    }

    fn is_complete(&self) -> bool {
        self.callsign.is_some()
            && self.latitude.is_some()
            && self.longitude.is_some()
            && self.altitude_ft.is_some()
            && self.ground_speed.is_some()
            && self.track_deg.is_some()
            && self.vertical_rate_fpm.is_some()
    }
}

/// Row handed to the publisher; value copy, serialized as-is onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AircraftSnapshot {
    pub icao: String,
    pub callsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    /// Epoch seconds.
    pub last_seen: f64,
}

/// Emitted toward the persistence worker when an aircraft expires.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionClose {
    pub icao: u32,
    pub last_seen: DateTime<Utc>,
}

pub struct Tracker {
    aircraft: HashMap<u32, AircraftState>,
    receiver: Option<ReceiverPosition>,
    expiry: TimeDelta,
    assembly_timeout: TimeDelta,
    metrics: Arc<Metrics>,
}

impl Tracker {
    pub fn new(
        receiver: Option<ReceiverPosition>,
        expiry: Duration,
        assembly_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aircraft: HashMap::new(),
            receiver,
            expiry: TimeDelta::from_std(expiry).unwrap_or(TimeDelta::seconds(120)),
            assembly_timeout: TimeDelta::from_std(assembly_timeout)
                .unwrap_or(TimeDelta::seconds(120)),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn get(&self, icao: u32) -> Option<&AircraftState> {
        self.aircraft.get(&icao)
    }

    /// Merge one decoded message. Never fails; bad data is counted and
    /// dropped.
    pub fn process(&mut self, message: DecodedMessage) {
        let icao = message.icao();
        let rx_time = message.rx_time();

        let receiver = self.receiver;
        let metrics = Arc::clone(&self.metrics);

        let state = self
            .aircraft
            .entry(icao)
            .or_insert_with(|| AircraftState::new(icao, rx_time));

        if rx_time < state.first_seen {
            // A receive timestamp before the first sighting means a clock
            // went backwards; keep the table monotonic.
            metrics.inc(
                &metrics.invariant_violations,
                "tracker.invariant_violations_total",
            );
            warn!(icao = %format!("{icao:06X}"), "dropping message with non-monotonic timestamp");
            return;
        }

        match message {
            DecodedMessage::Identification { callsign, .. } => {
                metrics.inc(
                    &metrics.messages_identification,
                    "tracker.messages.identification_total",
                );
                state.callsign = Some(callsign);
            }
            DecodedMessage::AirbornePosition {
                cpr, altitude_ft, ..
            } => {
                metrics.inc(
                    &metrics.messages_airborne_position,
                    "tracker.messages.airborne_position_total",
                );
                if let Some(alt) = altitude_ft {
                    state.altitude_ft = Some(alt);
                }
                merge_position(state, cpr, rx_time, false, receiver, &metrics);
            }
            DecodedMessage::SurfacePosition { cpr, .. } => {
                metrics.inc(
                    &metrics.messages_surface_position,
                    "tracker.messages.surface_position_total",
                );
                if merge_position(state, cpr, rx_time, true, receiver, &metrics) {
                    state.altitude_ft = Some(0);
                }
            }
            DecodedMessage::Velocity {
                ground_speed,
                track_deg,
                vertical_rate_fpm,
                kind,
                ..
            } => {
                metrics.inc(&metrics.messages_velocity, "tracker.messages.velocity_total");
                if let Some(gs) = ground_speed {
                    state.ground_speed = Some(gs);
                }
                if let Some(track) = track_deg {
                    state.track_deg = Some(track);
                }
                if let Some(vr) = vertical_rate_fpm {
                    state.vertical_rate_fpm = Some(vr);
                }
                state.velocity_kind = Some(kind);
            }
            DecodedMessage::Other { .. } => {
                metrics.inc(&metrics.messages_other, "tracker.messages.other_total");
            }
        }

        state.last_seen = std::cmp::max(state.last_seen, rx_time);

        if state.assembly_complete_at.is_none() && state.is_complete() {
            state.assembly_complete_at = Some(rx_time);
            let latency =
                rx_time.signed_duration_since(state.first_seen).num_milliseconds() as f64 / 1000.0;
            metrics.inc(
                &metrics.assemblies_completed,
                "tracker.assembly.completed_total",
            );
            metrics.observe_assembly_latency(latency);
            info!(
                icao = %format!("{icao:06X}"),
                latency_seconds = latency,
                "aircraft assembly complete"
            );
        }

        self.report_incomplete(icao, rx_time);
        self.metrics.set_tracked_aircraft(self.aircraft.len());
    }

    fn report_incomplete(&mut self, icao: u32, now: DateTime<Utc>) {
        if let Some(state) = self.aircraft.get_mut(&icao) {
            if state.assembly_complete_at.is_none()
                && !state.incomplete_reported
                && now.signed_duration_since(state.first_seen) > self.assembly_timeout
            {
                state.incomplete_reported = true;
                self.metrics.inc(
                    &self.metrics.incomplete_assemblies,
                    "tracker.assembly.incomplete_total",
                );
                debug!(icao = %format!("{icao:06X}"), "assembly timed out incomplete");
            }
        }
    }

    /// Expiry scan: evict entries idle past the expiry window, returning
    /// a session-close event per eviction. Also settles the incomplete
    /// bucket for aircraft that went quiet before assembling.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<SessionClose> {
        let timeout = self.assembly_timeout;
        let metrics = Arc::clone(&self.metrics);
        for state in self.aircraft.values_mut() {
            if state.assembly_complete_at.is_none()
                && !state.incomplete_reported
                && now.signed_duration_since(state.first_seen) > timeout
            {
                state.incomplete_reported = true;
                metrics.inc(
                    &metrics.incomplete_assemblies,
                    "tracker.assembly.incomplete_total",
                );
            }
        }

        let expiry = self.expiry;
        let mut closed = Vec::new();
        self.aircraft.retain(|icao, state| {
            let keep = now.signed_duration_since(state.last_seen) <= expiry;
            if !keep {
                closed.push(SessionClose {
                    icao: *icao,
                    last_seen: state.last_seen,
                });
                metrics.inc(&metrics.aircraft_expired, "tracker.expired_total");
            }
            keep
        });

        if !closed.is_empty() {
            debug!(count = closed.len(), "expired aircraft from table");
        }
        self.metrics.set_tracked_aircraft(self.aircraft.len());
        closed
    }

    /// Value copy of the rows eligible for publishing: decoded position
    /// and seen within the expiry window.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<AircraftSnapshot> {
        let mut rows: Vec<AircraftSnapshot> = self
            .aircraft
            .values()
            .filter(|state| {
                state.position().is_some()
                    && now.signed_duration_since(state.last_seen) <= self.expiry
            })
            .map(|state| AircraftSnapshot {
                icao: format!("{:06X}", state.icao),
                callsign: state.callsign.clone(),
                lat: state.latitude.unwrap_or_default(),
                lon: state.longitude.unwrap_or_default(),
                alt_ft: state.altitude_ft,
                ground_speed: state.ground_speed,
                track_deg: state.track_deg,
                vertical_rate_fpm: state.vertical_rate_fpm,
                last_seen: state.last_seen.timestamp_millis() as f64 / 1000.0,
            })
            .collect();
        rows.sort_by(|a, b| a.icao.cmp(&b.icao));
        rows
    }
}

/// Store the frame under its parity and try to turn the buffer into a
/// position: global pair first, then local decoding against a recent own
/// position or the configured receiver. Returns whether a position landed.
fn merge_position(
    state: &mut AircraftState,
    cpr: CprFrame,
    rx_time: DateTime<Utc>,
    surface: bool,
    receiver: Option<ReceiverPosition>,
    metrics: &Metrics,
) -> bool {
    use crate::cpr::CprFormat;

    // A same-parity frame already buffered means this message cannot be
    // the harmless first half of a pair.
    let had_same_parity = match cpr.format {
        CprFormat::Even => state.cpr_even.is_some(),
        CprFormat::Odd => state.cpr_odd.is_some(),
    };

    let slot = CprSlot {
        frame: cpr,
        rx_time,
    };
    match cpr.format {
        CprFormat::Even => state.cpr_even = Some(slot),
        CprFormat::Odd => state.cpr_odd = Some(slot),
    }

    let mut attempted = false;
    let mut position = None;

    if !surface {
        if let (Some(even), Some(odd)) = (state.cpr_even, state.cpr_odd) {
            let age = even.rx_time.signed_duration_since(odd.rx_time).abs();
            if age <= TimeDelta::seconds(CPR_PAIR_WINDOW_SECS) {
                let (oldest, latest) = if even.rx_time <= odd.rx_time {
                    (even, odd)
                } else {
                    (odd, even)
                };
                attempted = true;
                position = cpr::airborne_global(&oldest.frame, &latest.frame);
            }
        }
    }

    if position.is_none() {
        let reference = state.reference_position(rx_time).or_else(|| {
            receiver.map(|r| Position {
                latitude: r.latitude,
                longitude: r.longitude,
            })
        });
        if let Some(reference) = reference {
            attempted = true;
            position = if surface {
                cpr::surface_local(&cpr, reference.latitude, reference.longitude)
            } else {
                cpr::airborne_local(&cpr, reference.latitude, reference.longitude)
            };
        }
    }

    if let Some(pos) = position {
        if !pos.is_plausible() {
            position = None;
        } else if let Some(previous) = state.position() {
            if cpr::haversine_km(&previous, &pos) > MAX_JUMP_KM {
                position = None;
            }
        }
    }

    match position {
        Some(pos) => {
            state.latitude = Some(pos.latitude);
            state.longitude = Some(pos.longitude);
            state.position_time = Some(rx_time);
            metrics.inc(&metrics.positions_decoded, "tracker.positions.decoded_total");
            true
        }
        None => {
            // Only count genuine failures: a decode that was attempted
            // and came up empty or implausible, or a same-parity repeat.
            // A lone first frame with no reference is just waiting for
            // its opposite parity, not an error.
            if attempted || had_same_parity {
                metrics.inc(&metrics.cpr_failed, "tracker.cpr.failed_total");
            }
            false
        }
    }
}

/// Tracker task: the only writer of the table. Consumes decoded messages,
/// answers snapshot requests, runs the expiry timer.
pub async fn run_tracker(
    mut tracker: Tracker,
    messages: flume::Receiver<DecodedMessage>,
    snapshots: flume::Receiver<tokio::sync::oneshot::Sender<Vec<AircraftSnapshot>>>,
    closes: Option<flume::Sender<SessionClose>>,
    scan_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut scan = tokio::time::interval(scan_interval);
    scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tracker shutting down");
                break;
            }
            message = messages.recv_async() => {
                match message {
                    Ok(message) => tracker.process(message),
                    Err(_) => {
                        info!("message channel closed, tracker stopping");
                        break;
                    }
                }
            }
            request = snapshots.recv_async() => {
                if let Ok(reply) = request {
                    let _ = reply.send(tracker.snapshot(Utc::now()));
                }
            }
            _ = scan.tick() => {
                for close in tracker.expire(Utc::now()) {
                    if let Some(closes) = &closes {
                        if closes.send_async(close).await.is_err() {
                            warn!("session-close channel closed");
                        }
                    }
                }
            }
        }
    }

    // Final sweep so co-located persistence sees the sessions close.
    if let Some(closes) = &closes {
        for state in tracker.aircraft.values() {
            let _ = closes
                .send_async(SessionClose {
                    icao: state.icao,
                    last_seen: state.last_seen,
                })
                .await;
        }
    }

    Ok(())
}
