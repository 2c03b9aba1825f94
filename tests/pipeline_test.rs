//! End-to-end pipeline tests: real frames through decode, assembly,
//! sampling, and persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use skytrail::config::ReceiverPosition;
use skytrail::metrics::Metrics;
use skytrail::modes::{self, DecodedMessage, VelocityKind};
use skytrail::publisher::PublishedFrame;
use skytrail::store::{Database, PathSample, StoreCommand, StoreWorker};
use skytrail::subscriber::{push_samples, samples_from_frame};
use skytrail::tracker::Tracker;

const EVEN_FRAME: &str = "8D40058B58C901375147EFD09357";
const ODD_FRAME: &str = "8D40058B58C904A87F402D3B8C59";
const ICAO: u32 = 0x40058B;
const ICAO_HEX: &str = "40058B";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn tracker(metrics: Arc<Metrics>) -> Tracker {
    Tracker::new(
        None,
        Duration::from_secs(120),
        Duration::from_secs(120),
        metrics,
    )
}

fn worker() -> StoreWorker {
    StoreWorker::new(
        Database::open_in_memory().unwrap(),
        Duration::from_secs(120),
        Duration::from_secs(5),
        Arc::new(Metrics::new()),
    )
    .unwrap()
}

/// Feed one aircraft identification, a CPR pair, and velocity; expect a
/// complete track record, one open session, and a path row whose
/// coordinates match the CPR reference decode.
#[test]
fn single_aircraft_complete() {
    let metrics = Arc::new(Metrics::new());
    let mut tracker = tracker(Arc::clone(&metrics));

    tracker.process(DecodedMessage::Identification {
        icao: ICAO,
        callsign: "UAL123".to_string(),
        rx_time: t0(),
    });
    tracker.process(modes::decode(EVEN_FRAME, t0() + TimeDelta::seconds(1)).unwrap());
    tracker.process(modes::decode(ODD_FRAME, t0() + TimeDelta::seconds(2)).unwrap());
    tracker.process(DecodedMessage::Velocity {
        icao: ICAO,
        ground_speed: Some(450.0),
        track_deg: Some(90.0),
        vertical_rate_fpm: Some(0),
        kind: VelocityKind::Airborne,
        rx_time: t0() + TimeDelta::seconds(3),
    });

    let state = tracker.get(ICAO).expect("aircraft tracked");
    assert!(state.assembly_complete_at.is_some());
    assert_eq!(
        metrics
            .assemblies_completed
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // Snapshot -> published frame -> path samples -> store.
    let rows = tracker.snapshot(t0() + TimeDelta::seconds(4));
    assert_eq!(rows.len(), 1);
    let frame = PublishedFrame {
        ts: (t0() + TimeDelta::seconds(4)).timestamp() as f64,
        aircraft: rows,
    };

    let mut last_emit = HashMap::new();
    let samples = samples_from_frame(&frame, &mut last_emit, TimeDelta::seconds(5));
    assert_eq!(samples.len(), 1);

    let mut worker = worker();
    let mut batch: Vec<StoreCommand> = samples.into_iter().map(StoreCommand::Sample).collect();
    worker.flush_with_retry(&mut batch);

    let db = worker.into_database();
    let aircraft = db.aircraft().unwrap();
    assert_eq!(aircraft.len(), 1);
    assert_eq!(aircraft[0].icao, ICAO_HEX);
    assert_eq!(aircraft[0].callsign.as_deref(), Some("UAL123"));

    let sessions = db.sessions_for(ICAO_HEX).unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].end_time.is_none());

    let path = db.path_for(ICAO_HEX).unwrap();
    assert_eq!(path.len(), 1);
    // Reference decode of this even/odd pair.
    assert!((path[0].lat - 49.81755).abs() < 0.01, "lat {}", path[0].lat);
    assert!((path[0].lon - 6.08442).abs() < 0.01, "lon {}", path[0].lon);
    assert_eq!(path[0].velocity, Some(450.0));
    assert_eq!(path[0].session_id, sessions[0].id);
}

/// A quiet gap longer than the session gap closes the first session and
/// opens a second one.
#[test]
fn expiry_gap_reopens_session() {
    let metrics = Arc::new(Metrics::new());
    let mut tracker = tracker(Arc::clone(&metrics));
    let mut worker = worker();
    let mut last_emit = HashMap::new();

    // First sighting with a position.
    tracker.process(modes::decode(EVEN_FRAME, t0()).unwrap());
    tracker.process(modes::decode(ODD_FRAME, t0() + TimeDelta::seconds(1)).unwrap());
    tracker.process(DecodedMessage::Velocity {
        icao: ICAO,
        ground_speed: Some(450.0),
        track_deg: Some(90.0),
        vertical_rate_fpm: Some(0),
        kind: VelocityKind::Airborne,
        rx_time: t0() + TimeDelta::seconds(2),
    });

    let frame = PublishedFrame {
        ts: (t0() + TimeDelta::seconds(2)).timestamp() as f64,
        aircraft: tracker.snapshot(t0() + TimeDelta::seconds(2)),
    };
    let samples = samples_from_frame(&frame, &mut last_emit, TimeDelta::seconds(5));
    let mut batch: Vec<StoreCommand> = samples.into_iter().map(StoreCommand::Sample).collect();
    worker.flush_with_retry(&mut batch);

    // The tracker evicts the aircraft after the expiry window; the close
    // event reaches the store.
    let closed = tracker.expire(t0() + TimeDelta::seconds(140));
    assert_eq!(closed.len(), 1);
    let mut batch: Vec<StoreCommand> = closed
        .into_iter()
        .map(|close| StoreCommand::CloseSession {
            icao: format!("{:06X}", close.icao),
            end_time: close.last_seen,
        })
        .collect();
    worker.flush_with_retry(&mut batch);

    // The aircraft reappears later; a new session opens.
    let reappear = t0() + TimeDelta::seconds(300);
    let mut batch = vec![StoreCommand::Sample(PathSample {
        icao: ICAO_HEX.to_string(),
        callsign: None,
        ts: reappear,
        lat: 49.9,
        lon: 6.2,
        alt_ft: Some(37000),
        velocity: Some(440.0),
        track_deg: Some(92.0),
        vertical_rate_fpm: Some(0),
        kind: "airborne".to_string(),
    })];
    worker.flush_with_retry(&mut batch);

    let db = worker.into_database();
    let sessions = db.sessions_for(ICAO_HEX).unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions[0].end_time.is_some(), "first session closed");
    assert!(sessions[1].end_time.is_none(), "second session open");
}

/// Two same-parity frames never produce a position or a path row, and the
/// failure is counted.
#[test]
fn cpr_mismatch_yields_no_path() {
    let metrics = Arc::new(Metrics::new());
    let mut tracker = tracker(Arc::clone(&metrics));

    tracker.process(modes::decode(EVEN_FRAME, t0()).unwrap());
    tracker.process(modes::decode(EVEN_FRAME, t0() + TimeDelta::seconds(1)).unwrap());

    assert!(
        metrics.cpr_failed.load(std::sync::atomic::Ordering::Relaxed) > 0,
        "cpr failures counted"
    );
    assert!(tracker.snapshot(t0() + TimeDelta::seconds(2)).is_empty());
}

/// Round trip for multiple aircraft, one with a real CPR pair, the rest
/// synthetic: every aircraft lands in the store with a session and path.
#[test]
fn multi_aircraft_round_trip() {
    let metrics = Arc::new(Metrics::new());
    let mut tracker = tracker(Arc::clone(&metrics));
    let mut worker = worker();
    let mut last_emit = HashMap::new();

    // Real pair for 40058B.
    tracker.process(modes::decode(EVEN_FRAME, t0()).unwrap());
    tracker.process(modes::decode(ODD_FRAME, t0() + TimeDelta::seconds(1)).unwrap());
    tracker.process(DecodedMessage::Velocity {
        icao: ICAO,
        ground_speed: Some(450.0),
        track_deg: Some(90.0),
        vertical_rate_fpm: Some(0),
        kind: VelocityKind::Airborne,
        rx_time: t0() + TimeDelta::seconds(1),
    });

    // Second real pair for 4D224F.
    tracker.process(modes::decode("8d4d224f58bf07c2d41a9a353d70", t0()).unwrap());
    tracker.process(modes::decode("8d4d224f58bf003b221b34aa5b8d", t0() + TimeDelta::seconds(1)).unwrap());
    tracker.process(DecodedMessage::Velocity {
        icao: 0x4D224F,
        ground_speed: Some(300.0),
        track_deg: Some(180.0),
        vertical_rate_fpm: Some(-500),
        kind: VelocityKind::Airborne,
        rx_time: t0() + TimeDelta::seconds(1),
    });

    let rows = tracker.snapshot(t0() + TimeDelta::seconds(2));
    assert_eq!(rows.len(), 2);

    let frame = PublishedFrame {
        ts: (t0() + TimeDelta::seconds(2)).timestamp() as f64,
        aircraft: rows,
    };
    let samples = samples_from_frame(&frame, &mut last_emit, TimeDelta::seconds(5));
    assert_eq!(samples.len(), 2);

    let (tx, rx) = flume::bounded(1024);
    let dropped = push_samples(samples, &tx, &metrics);
    assert_eq!(dropped, 0);
    drop(tx);

    let mut batch: Vec<StoreCommand> = rx.drain().collect();
    worker.flush_with_retry(&mut batch);

    let db = worker.into_database();
    assert_eq!(db.aircraft().unwrap().len(), 2);
    for icao in [ICAO_HEX, "4D224F"] {
        assert_eq!(db.sessions_for(icao).unwrap().len(), 1, "{icao} session");
        assert_eq!(db.path_for(icao).unwrap().len(), 1, "{icao} path");
    }

    let second = &db.path_for("4D224F").unwrap()[0];
    assert!((second.lat - 42.346).abs() < 0.05, "lat {}", second.lat);
    assert!((second.lon - 0.4347).abs() < 0.01, "lon {}", second.lon);
}

/// Local decoding against a configured receiver position produces a fix
/// from a single frame.
#[test]
fn receiver_reference_enables_single_frame_fix() {
    let metrics = Arc::new(Metrics::new());
    let mut tracker = Tracker::new(
        Some(ReceiverPosition {
            latitude: 49.0,
            longitude: 6.0,
        }),
        Duration::from_secs(120),
        Duration::from_secs(120),
        metrics,
    );

    tracker.process(modes::decode(EVEN_FRAME, t0()).unwrap());
    let rows = tracker.snapshot(t0() + TimeDelta::seconds(1));
    assert_eq!(rows.len(), 1);
    assert!((rows[0].lat - 49.82410).abs() < 0.01);
}
