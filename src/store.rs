//! Single-writer persistence worker.
//!
//! One dedicated thread owns the only SQLite handle. Everything else
//! talks to it through a bounded channel of [`StoreCommand`]s. Writes are
//! batched into transactions (250 ms timer or 64 ops); a failed batch is
//! retried twice and then discarded — persistence lag must never stall
//! the live pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cpr;
use crate::metrics::Metrics;

/// Flush when the buffer reaches this many commands...
const MAX_BATCH: usize = 64;
/// ...or when this much time has passed, whichever comes first.
const BATCH_INTERVAL: Duration = Duration::from_millis(250);
/// A failed batch is retried this many times before being discarded.
const WRITE_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Position/altitude deltas below these are not worth a new path row.
/// The subscriber's candidate throttle applies the same thresholds.
pub(crate) const MIN_MOVE_METERS: f64 = 1.0;
pub(crate) const MIN_ALT_DELTA_FT: f64 = 10.0;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS aircraft (
    icao        TEXT PRIMARY KEY,
    callsign    TEXT,
    first_seen  REAL,
    last_seen   REAL
);
CREATE TABLE IF NOT EXISTS flight_session (
    id            TEXT PRIMARY KEY,
    aircraft_icao TEXT,
    start_time    REAL,
    end_time      REAL
);
CREATE TABLE IF NOT EXISTS path (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT,
    icao          TEXT,
    ts            REAL,
    ts_iso        TEXT,
    lat           REAL,
    lon           REAL,
    alt           REAL,
    velocity      REAL,
    track         REAL,
    vertical_rate REAL,
    type          TEXT
);
CREATE INDEX IF NOT EXISTS idx_path_icao_ts ON path(icao, ts);
CREATE INDEX IF NOT EXISTS idx_flight_session_aircraft ON flight_session(aircraft_icao);
";

/// One path-sample candidate, as produced by the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSample {
    /// Uppercase hex ICAO.
    pub icao: String,
    pub callsign: Option<String>,
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: Option<i32>,
    pub velocity: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    /// "airborne" or "surface".
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    Sample(PathSample),
    CloseSession {
        icao: String,
        end_time: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AircraftRow {
    pub icao: String,
    pub callsign: Option<String>,
    pub first_seen: f64,
    pub last_seen: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub aircraft_icao: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathRow {
    pub session_id: String,
    pub icao: String,
    pub ts: f64,
    pub ts_iso: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub velocity: Option<f64>,
    pub track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub kind: Option<String>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store. Failure here is fatal init.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize schema")?;
        Ok(Self { conn })
    }

    pub fn aircraft(&self) -> Result<Vec<AircraftRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT icao, callsign, first_seen, last_seen FROM aircraft ORDER BY icao")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AircraftRow {
                    icao: row.get(0)?,
                    callsign: row.get(1)?,
                    first_seen: row.get(2)?,
                    last_seen: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn sessions_for(&self, icao: &str) -> Result<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, aircraft_icao, start_time, end_time FROM flight_session
             WHERE aircraft_icao = ?1 ORDER BY start_time",
        )?;
        let rows = stmt
            .query_map([icao], |row| {
                Ok(SessionRow {
                    id: row.get(0)?,
                    aircraft_icao: row.get(1)?,
                    start_time: row.get(2)?,
                    end_time: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn path_for(&self, icao: &str) -> Result<Vec<PathRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, icao, ts, ts_iso, lat, lon, alt, velocity, track,
                    vertical_rate, type
             FROM path WHERE icao = ?1 ORDER BY ts",
        )?;
        let rows = stmt
            .query_map([icao], |row| {
                Ok(PathRow {
                    session_id: row.get(0)?,
                    icao: row.get(1)?,
                    ts: row.get(2)?,
                    ts_iso: row.get(3)?,
                    lat: row.get(4)?,
                    lon: row.get(5)?,
                    alt: row.get(6)?,
                    velocity: row.get(7)?,
                    track: row.get(8)?,
                    vertical_rate: row.get(9)?,
                    kind: row.get(10)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    id: String,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct LastPath {
    ts: DateTime<Utc>,
    lat: f64,
    lon: f64,
    alt_ft: Option<f64>,
}

pub struct StoreWorker {
    db: Database,
    open_sessions: HashMap<String, OpenSession>,
    last_path: HashMap<String, LastPath>,
    session_gap: TimeDelta,
    save_interval: TimeDelta,
    metrics: Arc<Metrics>,
}

impl StoreWorker {
    pub fn new(
        db: Database,
        session_gap: Duration,
        save_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut worker = Self {
            db,
            open_sessions: HashMap::new(),
            last_path: HashMap::new(),
            session_gap: TimeDelta::from_std(session_gap).unwrap_or(TimeDelta::seconds(120)),
            save_interval: TimeDelta::from_std(save_interval).unwrap_or(TimeDelta::seconds(5)),
            metrics,
        };
        worker.load_open_sessions()?;
        Ok(worker)
    }

    /// Resume sessions left open by a previous run.
    fn load_open_sessions(&mut self) -> Result<()> {
        let mut stmt = self.db.conn.prepare(
            "SELECT s.id, s.aircraft_icao, COALESCE(a.last_seen, s.start_time)
             FROM flight_session s LEFT JOIN aircraft a ON a.icao = s.aircraft_icao
             WHERE s.end_time IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for (id, icao, last_seen) in rows {
            self.open_sessions.insert(
                icao,
                OpenSession {
                    id,
                    last_seen: epoch_to_datetime(last_seen),
                },
            );
        }
        if !self.open_sessions.is_empty() {
            info!(count = self.open_sessions.len(), "resumed open flight sessions");
        }
        Ok(())
    }

    /// Drain the channel until every sender is gone, batching writes.
    pub fn run(mut self, commands: flume::Receiver<StoreCommand>) -> Result<()> {
        let mut batch: Vec<StoreCommand> = Vec::with_capacity(MAX_BATCH);
        let mut last_flush = Instant::now();

        loop {
            match commands.recv_timeout(BATCH_INTERVAL) {
                Ok(command) => {
                    batch.push(command);
                    if batch.len() >= MAX_BATCH || last_flush.elapsed() >= BATCH_INTERVAL {
                        self.flush_with_retry(&mut batch);
                        last_flush = Instant::now();
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    if !batch.is_empty() {
                        self.flush_with_retry(&mut batch);
                    }
                    self.sweep_idle_sessions(Utc::now());
                    last_flush = Instant::now();
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    if !batch.is_empty() {
                        self.flush_with_retry(&mut batch);
                    }
                    break;
                }
            }
        }

        self.finish()
    }

    /// Apply a batch in one transaction; on repeated failure the batch is
    /// logged and dropped so the worker keeps going.
    pub fn flush_with_retry(&mut self, batch: &mut Vec<StoreCommand>) {
        if batch.is_empty() {
            return;
        }
        let mut attempt = 0;
        loop {
            match self.flush(batch) {
                Ok(()) => {
                    debug!(ops = batch.len(), "committed batch");
                    batch.clear();
                    return;
                }
                Err(e) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    self.metrics
                        .inc(&self.metrics.db_write_retries, "store.write.retries_total");
                    warn!("batch write failed (attempt {attempt}): {e:#}");
                    std::thread::sleep(RETRY_BACKOFF);
                }
                Err(e) => {
                    error!(ops = batch.len(), "discarding batch after retries: {e:#}");
                    self.metrics.inc(
                        &self.metrics.db_batches_discarded,
                        "store.write.discarded_total",
                    );
                    batch.clear();
                    return;
                }
            }
        }
    }

    fn flush(&mut self, batch: &[StoreCommand]) -> Result<()> {
        // Session/dedup state only advances if the transaction commits.
        let mut sessions = self.open_sessions.clone();
        let mut last_path = self.last_path.clone();
        let mut inserted_paths = 0u64;
        let mut opened = 0u64;
        let mut closed = 0u64;

        let tx = self.db.conn.transaction()?;
        for command in batch {
            match command {
                StoreCommand::Sample(sample) => {
                    apply_sample(
                        &tx,
                        sample,
                        &mut sessions,
                        &mut last_path,
                        self.session_gap,
                        self.save_interval,
                        &mut inserted_paths,
                        &mut opened,
                        &mut closed,
                    )?;
                }
                StoreCommand::CloseSession { icao, end_time } => {
                    if let Some(session) = sessions.remove(icao) {
                        close_session(&tx, &session.id, *end_time)?;
                        closed += 1;
                    }
                }
            }
        }
        tx.commit()?;

        self.open_sessions = sessions;
        self.last_path = last_path;
        self.metrics
            .add(&self.metrics.path_rows_inserted, "store.path.inserted_total", inserted_paths);
        self.metrics
            .add(&self.metrics.sessions_opened, "store.sessions.opened_total", opened);
        self.metrics
            .add(&self.metrics.sessions_closed, "store.sessions.closed_total", closed);
        Ok(())
    }

    /// Close sessions whose aircraft has been quiet past the session gap.
    /// Covers the split deployment where the assembler's close events
    /// cannot reach this process.
    pub fn sweep_idle_sessions(&mut self, now: DateTime<Utc>) {
        let gap = self.session_gap;
        let stale: Vec<(String, OpenSession)> = self
            .open_sessions
            .iter()
            .filter(|(_, s)| now.signed_duration_since(s.last_seen) > gap)
            .map(|(icao, s)| (icao.clone(), s.clone()))
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut commands: Vec<StoreCommand> = stale
            .into_iter()
            .map(|(icao, session)| StoreCommand::CloseSession {
                icao,
                end_time: session.last_seen,
            })
            .collect();
        self.flush_with_retry(&mut commands);
    }

    /// Flush state, checkpoint the WAL, hand the database back.
    fn finish(mut self) -> Result<()> {
        let now = Utc::now();
        let mut open: Vec<StoreCommand> = self
            .open_sessions
            .iter()
            .map(|(icao, session)| StoreCommand::CloseSession {
                icao: icao.clone(),
                end_time: std::cmp::min(session.last_seen, now),
            })
            .collect();
        self.flush_with_retry(&mut open);

        self.db
            .conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .ok();
        info!("store worker stopped");
        Ok(())
    }

    /// The held database, for post-run inspection in tests.
    pub fn into_database(self) -> Database {
        self.db
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_sample(
    tx: &rusqlite::Transaction<'_>,
    sample: &PathSample,
    sessions: &mut HashMap<String, OpenSession>,
    last_path: &mut HashMap<String, LastPath>,
    session_gap: TimeDelta,
    save_interval: TimeDelta,
    inserted_paths: &mut u64,
    opened: &mut u64,
    closed: &mut u64,
) -> Result<()> {
    let ts = datetime_to_epoch(sample.ts);

    // 1. Upsert the aircraft row.
    tx.execute(
        "INSERT INTO aircraft (icao, callsign, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(icao) DO UPDATE SET
             last_seen = MAX(aircraft.last_seen, excluded.last_seen),
             callsign = COALESCE(excluded.callsign, aircraft.callsign)",
        params![sample.icao, sample.callsign, ts],
    )?;

    // 2. Session management.
    let session_id = match sessions.get_mut(&sample.icao) {
        Some(session) if sample.ts.signed_duration_since(session.last_seen) > session_gap => {
            close_session(tx, &session.id, session.last_seen)?;
            *closed += 1;
            let id = open_session(tx, &sample.icao, ts)?;
            *opened += 1;
            *session = OpenSession {
                id: id.clone(),
                last_seen: sample.ts,
            };
            id
        }
        Some(session) => {
            session.last_seen = std::cmp::max(session.last_seen, sample.ts);
            session.id.clone()
        }
        None => {
            let id = open_session(tx, &sample.icao, ts)?;
            *opened += 1;
            sessions.insert(
                sample.icao.clone(),
                OpenSession {
                    id: id.clone(),
                    last_seen: sample.ts,
                },
            );
            id
        }
    };

    // 3. Path row, only on meaningful change.
    let previous = match last_path.get(&sample.icao) {
        Some(previous) => Some(*previous),
        None => tx
            .query_row(
                "SELECT ts, lat, lon, alt FROM path WHERE icao = ?1
                 ORDER BY ts DESC LIMIT 1",
                [&sample.icao],
                |row| {
                    Ok(LastPath {
                        ts: epoch_to_datetime(row.get(0)?),
                        lat: row.get(1)?,
                        lon: row.get(2)?,
                        alt_ft: row.get(3)?,
                    })
                },
            )
            .optional()?,
    };

    if changed_meaningfully(previous, sample, save_interval) {
        tx.execute(
            "INSERT INTO path (session_id, icao, ts, ts_iso, lat, lon, alt,
                               velocity, track, vertical_rate, type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session_id,
                sample.icao,
                ts,
                sample.ts.to_rfc3339(),
                sample.lat,
                sample.lon,
                sample.alt_ft.map(f64::from),
                sample.velocity,
                sample.track_deg,
                sample.vertical_rate_fpm.map(f64::from),
                sample.kind,
            ],
        )?;
        *inserted_paths += 1;
        last_path.insert(
            sample.icao.clone(),
            LastPath {
                ts: sample.ts,
                lat: sample.lat,
                lon: sample.lon,
                alt_ft: sample.alt_ft.map(f64::from),
            },
        );
    }

    Ok(())
}

fn open_session(tx: &rusqlite::Transaction<'_>, icao: &str, start_time: f64) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO flight_session (id, aircraft_icao, start_time, end_time)
         VALUES (?1, ?2, ?3, NULL)",
        params![id, icao, start_time],
    )?;
    Ok(id)
}

fn close_session(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    end_time: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "UPDATE flight_session SET end_time = ?1 WHERE id = ?2 AND end_time IS NULL",
        params![datetime_to_epoch(end_time), id],
    )?;
    Ok(())
}

fn changed_meaningfully(
    previous: Option<LastPath>,
    sample: &PathSample,
    save_interval: TimeDelta,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    let moved_m = cpr::haversine_km(
        &cpr::Position {
            latitude: previous.lat,
            longitude: previous.lon,
        },
        &cpr::Position {
            latitude: sample.lat,
            longitude: sample.lon,
        },
    ) * 1000.0;
    if moved_m > MIN_MOVE_METERS {
        return true;
    }

    let alt_delta = match (previous.alt_ft, sample.alt_ft) {
        (Some(a), Some(b)) => (f64::from(b) - a).abs(),
        (None, Some(_)) | (Some(_), None) => f64::INFINITY,
        (None, None) => 0.0,
    };
    if alt_delta > MIN_ALT_DELTA_FT {
        return true;
    }

    sample.ts.signed_duration_since(previous.ts) >= save_interval
}

fn datetime_to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((epoch * 1000.0) as i64).unwrap_or_else(Utc::now)
}
