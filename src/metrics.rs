//! Passive in-process metrics.
//!
//! A single [`Metrics`] value is shared (via `Arc`) with every component;
//! counters are plain atomics so tests can read them back directly. Each
//! increment is mirrored to the `metrics` crate macros so an operator can
//! still install any recorder of their choosing. Export goes to flat files:
//! optional CSV rows while running, a JSON snapshot per kind on shutdown.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

/// Kinds of artifacts written on shutdown.
const KIND_COUNTERS: &str = "counters";
const KIND_ASSEMBLY: &str = "assembly_latency";
const KIND_RESOURCES: &str = "resources";

#[derive(Debug, Default)]
pub struct Metrics {
    // Feed (A) / decode (B).
    pub frames_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub decode_failed: AtomicU64,
    pub feed_reconnects: AtomicU64,

    // Assembler (C).
    pub messages_identification: AtomicU64,
    pub messages_airborne_position: AtomicU64,
    pub messages_surface_position: AtomicU64,
    pub messages_velocity: AtomicU64,
    pub messages_other: AtomicU64,
    pub positions_decoded: AtomicU64,
    pub cpr_failed: AtomicU64,
    pub assemblies_completed: AtomicU64,
    pub incomplete_assemblies: AtomicU64,
    pub aircraft_expired: AtomicU64,
    pub tracked_aircraft: AtomicU64,
    pub invariant_violations: AtomicU64,

    // Publisher (D).
    pub frames_published: AtomicU64,
    pub subscriber_frames_dropped: AtomicU64,
    pub slow_subscribers_dropped: AtomicU64,
    pub subscribers_connected: AtomicU64,

    // Subscriber (E) / store (F).
    pub updates_received: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub path_rows_inserted: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub db_write_retries: AtomicU64,
    pub db_batches_discarded: AtomicU64,

    /// Per-aircraft assembly latency samples, seconds.
    assembly_latencies: Mutex<Vec<f64>>,
    /// Latest resource sample (cpu percent, rss mb, tcp counters).
    resources: Mutex<ResourceSample>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub rss_mb: f64,
    pub tcp_retransmits: u64,
    pub tcp_out_of_order: u64,
    pub tcp_listen_drops: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(name).increment(1);
    }

    pub fn add(&self, counter: &AtomicU64, name: &'static str, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(name).increment(n);
    }

    pub fn set_tracked_aircraft(&self, n: usize) {
        self.tracked_aircraft.store(n as u64, Ordering::Relaxed);
        metrics::gauge!("tracker.aircraft").set(n as f64);
    }

    pub fn set_subscribers(&self, n: usize) {
        self.subscribers_connected.store(n as u64, Ordering::Relaxed);
        metrics::gauge!("publisher.subscribers").set(n as f64);
    }

    pub fn observe_assembly_latency(&self, seconds: f64) {
        if let Ok(mut latencies) = self.assembly_latencies.lock() {
            latencies.push(seconds);
        }
        metrics::histogram!("tracker.assembly_latency_seconds").record(seconds);
    }

    pub fn assembly_latency_stats(&self) -> LatencyStats {
        let latencies = self
            .assembly_latencies
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default();
        LatencyStats::from_samples(latencies)
    }

    pub fn record_resources(&self, sample: ResourceSample) {
        if let Ok(mut resources) = self.resources.lock() {
            *resources = sample;
        }
        metrics::gauge!("process.cpu_percent").set(sample.cpu_percent);
        metrics::gauge!("process.rss_mb").set(sample.rss_mb);
    }

    pub fn resources(&self) -> ResourceSample {
        self.resources.lock().map(|r| *r).unwrap_or_default()
    }

    /// Flat view of every counter, for CSV rows and the JSON artifact.
    pub fn counter_snapshot(&self) -> BTreeMap<&'static str, u64> {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BTreeMap::from([
            ("frames_received", read(&self.frames_received)),
            ("malformed_frames", read(&self.malformed_frames)),
            ("decode_failed", read(&self.decode_failed)),
            ("feed_reconnects", read(&self.feed_reconnects)),
            ("messages_identification", read(&self.messages_identification)),
            (
                "messages_airborne_position",
                read(&self.messages_airborne_position),
            ),
            (
                "messages_surface_position",
                read(&self.messages_surface_position),
            ),
            ("messages_velocity", read(&self.messages_velocity)),
            ("messages_other", read(&self.messages_other)),
            ("positions_decoded", read(&self.positions_decoded)),
            ("cpr_failed", read(&self.cpr_failed)),
            ("assemblies_completed", read(&self.assemblies_completed)),
            ("incomplete_assemblies", read(&self.incomplete_assemblies)),
            ("aircraft_expired", read(&self.aircraft_expired)),
            ("tracked_aircraft", read(&self.tracked_aircraft)),
            ("invariant_violations", read(&self.invariant_violations)),
            ("frames_published", read(&self.frames_published)),
            (
                "subscriber_frames_dropped",
                read(&self.subscriber_frames_dropped),
            ),
            (
                "slow_subscribers_dropped",
                read(&self.slow_subscribers_dropped),
            ),
            ("subscribers_connected", read(&self.subscribers_connected)),
            ("updates_received", read(&self.updates_received)),
            ("samples_dropped", read(&self.samples_dropped)),
            ("path_rows_inserted", read(&self.path_rows_inserted)),
            ("sessions_opened", read(&self.sessions_opened)),
            ("sessions_closed", read(&self.sessions_closed)),
            ("db_write_retries", read(&self.db_write_retries)),
            ("db_batches_discarded", read(&self.db_batches_discarded)),
        ])
    }

    /// Write the shutdown artifacts: one timestamped JSON file per kind.
    pub fn export_artifacts(&self, dir: &Path, component: &str) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create metrics directory {}", dir.display()))?;
        let ts = Utc::now().format("%Y%m%d_%H%M%S");

        let mut written = Vec::new();

        let counters = self.counter_snapshot();
        let path = dir.join(format!("{component}_{KIND_COUNTERS}_{ts}.json"));
        fs::write(&path, serde_json::to_string_pretty(&counters)?)?;
        written.push(path);

        let stats = self.assembly_latency_stats();
        let path = dir.join(format!("{component}_{KIND_ASSEMBLY}_{ts}.json"));
        fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "count": stats.count,
                "min_seconds": stats.min,
                "max_seconds": stats.max,
                "mean_seconds": stats.mean,
                "median_seconds": stats.median,
            }))?,
        )?;
        written.push(path);

        let resources = self.resources();
        let path = dir.join(format!("{component}_{KIND_RESOURCES}_{ts}.json"));
        fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "cpu_percent": resources.cpu_percent,
                "rss_mb": resources.rss_mb,
                "tcp_retransmits": resources.tcp_retransmits,
                "tcp_out_of_order": resources.tcp_out_of_order,
                "tcp_listen_drops": resources.tcp_listen_drops,
            }))?,
        )?;
        written.push(path);

        Ok(written)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = samples.len();
        let min = samples[0];
        let max = samples[count - 1];
        let mean = samples.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            samples[count / 2]
        } else {
            (samples[count / 2 - 1] + samples[count / 2]) / 2.0
        };
        Self {
            count,
            min,
            max,
            mean,
            median,
        }
    }
}

/// Background sampler: CPU %, RSS, and kernel TCP counters every 5 s,
/// plus optional CSV streaming of the counter snapshot.
pub async fn sampler_task(
    metrics: std::sync::Arc<Metrics>,
    dir: PathBuf,
    component: String,
    stream_csv: bool,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut cpu = CpuTracker::default();
    let mut csv_writer = if stream_csv {
        match open_csv(&dir, &component) {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("failed to open metrics CSV: {e:#}");
                None
            }
        }
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut sample = read_tcp_counters();
        sample.rss_mb = read_rss_mb();
        sample.cpu_percent = cpu.sample();
        metrics.record_resources(sample);

        if let Some(writer) = csv_writer.as_mut() {
            if let Err(e) = append_csv_row(writer, &metrics) {
                debug!("metrics CSV write failed: {e:#}");
            }
        }
    }
}

fn open_csv(dir: &Path, component: &str) -> Result<csv::Writer<fs::File>> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{component}_{KIND_COUNTERS}.csv"));
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(csv::Writer::from_writer(file))
}

fn append_csv_row(writer: &mut csv::Writer<fs::File>, metrics: &Metrics) -> Result<()> {
    let snapshot = metrics.counter_snapshot();
    let mut row = vec![Utc::now().to_rfc3339()];
    row.extend(snapshot.values().map(|v| v.to_string()));
    writer.write_record(&row)?;
    writer.flush()?;
    Ok(())
}

/// CPU usage from consecutive `/proc/self/stat` readings.
#[derive(Default)]
struct CpuTracker {
    last_ticks: Option<u64>,
    last_instant: Option<std::time::Instant>,
}

impl CpuTracker {
    fn sample(&mut self) -> f64 {
        let Some(ticks) = read_cpu_ticks() else {
            return 0.0;
        };
        let now = std::time::Instant::now();
        let percent = match (self.last_ticks, self.last_instant) {
            (Some(prev_ticks), Some(prev_instant)) => {
                let tick_hz = 100.0; // USER_HZ on effectively every Linux
                let elapsed = now.duration_since(prev_instant).as_secs_f64();
                if elapsed > 0.0 {
                    (ticks.saturating_sub(prev_ticks)) as f64 / tick_hz / elapsed * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.last_ticks = Some(ticks);
        self.last_instant = Some(now);
        percent
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    // utime and stime sit right after the parenthesized comm field.
    let rest = stat.rsplit(')').next()?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ticks() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_rss_mb() -> f64 {
    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if line.starts_with("VmRSS:") {
                if let Some(kb_str) = line.split_whitespace().nth(1) {
                    if let Ok(kb) = kb_str.parse::<f64>() {
                        return kb / 1024.0;
                    }
                }
                break;
            }
        }
    }
    0.0
}

#[cfg(not(target_os = "linux"))]
fn read_rss_mb() -> f64 {
    0.0
}

/// Retransmit / out-of-order / drop counters from the kernel, zero where
/// unavailable.
#[cfg(target_os = "linux")]
fn read_tcp_counters() -> ResourceSample {
    let mut sample = ResourceSample::default();
    if let Ok(snmp) = fs::read_to_string("/proc/net/snmp") {
        sample.tcp_retransmits = proc_table_field(&snmp, "Tcp:", "RetransSegs").unwrap_or(0);
    }
    if let Ok(netstat) = fs::read_to_string("/proc/net/netstat") {
        sample.tcp_out_of_order = proc_table_field(&netstat, "TcpExt:", "TCPOFOQueue").unwrap_or(0);
        sample.tcp_listen_drops = proc_table_field(&netstat, "TcpExt:", "ListenDrops").unwrap_or(0);
    }
    sample
}

#[cfg(not(target_os = "linux"))]
fn read_tcp_counters() -> ResourceSample {
    ResourceSample::default()
}

/// `/proc/net/{snmp,netstat}` come as header/value line pairs per protocol.
#[cfg(target_os = "linux")]
fn proc_table_field(content: &str, prefix: &str, field: &str) -> Option<u64> {
    let mut lines = content.lines().filter(|l| l.starts_with(prefix));
    let header = lines.next()?;
    let values = lines.next()?;
    let index = header.split_whitespace().position(|f| f == field)?;
    values.split_whitespace().nth(index)?.parse().ok()
}
