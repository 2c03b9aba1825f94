//! Environment-driven configuration.
//!
//! All recognized variables are read once at startup into an immutable
//! [`Config`] that gets passed by reference to every component. Components
//! never re-read the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Receiver reference position used for locally-unambiguous CPR decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverPosition {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream dump1090 feed.
    pub dump1090_host: String,
    pub dump1090_raw_port: u16,

    /// Publish/subscribe endpoints.
    pub ws_port: u16,
    pub ws_uri: String,

    /// Persisted state.
    pub db_path: PathBuf,

    /// Publisher tick.
    pub publish_interval: Duration,
    /// Persistence throttle.
    pub save_interval: Duration,

    /// Aircraft table expiry; also the session gap (the source does not
    /// distinguish them).
    pub expiry: Duration,
    /// Incomplete-assembly threshold.
    pub assembly_timeout: Duration,

    /// Optional local CPR reference.
    pub receiver: Option<ReceiverPosition>,

    /// Directory for log files (`tmp/logs` by default).
    pub log_dir: PathBuf,
    /// Directory for metrics artifacts.
    pub metrics_dir: PathBuf,
    /// Stream CSV metric rows while running.
    pub metrics_csv: bool,
}

impl Config {
    /// Build from the process environment (after `dotenvy` has run).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup, so tests never touch process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dump1090_host = lookup("DUMP1090_HOST").unwrap_or_else(|| "localhost".to_string());
        let dump1090_raw_port = parse_or(&lookup, "DUMP1090_RAW_PORT", 30002u16)?;

        let ws_port = parse_or(&lookup, "ADSB_WS_PORT", 8443u16)?;
        let ws_uri =
            lookup("ADSB_WS_URI").unwrap_or_else(|| format!("ws://localhost:{ws_port}"));

        let db_path = lookup("ADSB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./adsb_data.db"));

        let publish_interval = secs_f64_or(&lookup, "ADSB_PUBLISH_INTERVAL", 1.0)?;
        let save_interval = secs_f64_or(&lookup, "ADSB_SAVE_INTERVAL", 5.0)?;
        let expiry = secs_f64_or(&lookup, "ADSB_EXPIRY_SECONDS", 120.0)?;
        let assembly_timeout = secs_f64_or(&lookup, "MESSAGE_ASSEMBLY_TIMEOUT_SECONDS", 120.0)?;

        let receiver = match (lookup("RECEIVER_LAT"), lookup("RECEIVER_LON")) {
            (Some(lat), Some(lon)) => {
                let latitude: f64 = lat
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid RECEIVER_LAT: {lat:?}"))?;
                let longitude: f64 = lon
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid RECEIVER_LON: {lon:?}"))?;
                anyhow::ensure!(
                    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude),
                    "receiver position out of range: {latitude}, {longitude}"
                );
                Some(ReceiverPosition {
                    latitude,
                    longitude,
                })
            }
            (None, None) => None,
            _ => anyhow::bail!("RECEIVER_LAT and RECEIVER_LON must be set together"),
        };

        let log_dir = lookup("ADSB_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tmp/logs"));
        let metrics_dir = lookup("ADSB_METRICS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tmp/metrics"));
        let metrics_csv = lookup("ADSB_METRICS_CSV")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            dump1090_host,
            dump1090_raw_port,
            ws_port,
            ws_uri,
            db_path,
            publish_interval,
            save_interval,
            expiry,
            assembly_timeout,
            receiver,
            log_dir,
            metrics_dir,
            metrics_csv,
        })
    }

    /// Session gap defaults to the table expiry.
    pub fn session_gap(&self) -> Duration {
        self.expiry
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn secs_f64_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> Result<Duration> {
    let secs: f64 = parse_or(lookup, key, default)?;
    anyhow::ensure!(secs > 0.0, "{key} must be positive, got {secs}");
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults() {
        let map = HashMap::new();
        let config = Config::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(config.dump1090_host, "localhost");
        assert_eq!(config.dump1090_raw_port, 30002);
        assert_eq!(config.ws_port, 8443);
        assert_eq!(config.ws_uri, "ws://localhost:8443");
        assert_eq!(config.db_path, PathBuf::from("./adsb_data.db"));
        assert_eq!(config.publish_interval, Duration::from_secs(1));
        assert_eq!(config.save_interval, Duration::from_secs(5));
        assert_eq!(config.expiry, Duration::from_secs(120));
        assert_eq!(config.assembly_timeout, Duration::from_secs(120));
        assert!(config.receiver.is_none());
        assert!(!config.metrics_csv);
    }

    #[test]
    fn overrides() {
        let map = HashMap::from([
            ("DUMP1090_HOST", "feeder.local"),
            ("DUMP1090_RAW_PORT", "40002"),
            ("ADSB_WS_PORT", "9001"),
            ("ADSB_PUBLISH_INTERVAL", "0.5"),
            ("ADSB_SAVE_INTERVAL", "2"),
            ("RECEIVER_LAT", "48.36"),
            ("RECEIVER_LON", "2.37"),
            ("ADSB_METRICS_CSV", "1"),
        ]);
        let config = Config::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(config.dump1090_host, "feeder.local");
        assert_eq!(config.dump1090_raw_port, 40002);
        // Derived from the overridden port when ADSB_WS_URI is unset.
        assert_eq!(config.ws_uri, "ws://localhost:9001");
        assert_eq!(config.publish_interval, Duration::from_millis(500));
        let receiver = config.receiver.unwrap();
        assert!((receiver.latitude - 48.36).abs() < 1e-9);
        assert!(config.metrics_csv);
    }

    #[test]
    fn rejects_half_configured_receiver() {
        let map = HashMap::from([("RECEIVER_LAT", "48.36")]);
        assert!(Config::from_lookup(lookup_from(&map)).is_err());
    }

    #[test]
    fn rejects_garbage_port() {
        let map = HashMap::from([("DUMP1090_RAW_PORT", "not-a-port")]);
        assert!(Config::from_lookup(lookup_from(&map)).is_err());
    }

    #[test]
    fn rejects_non_positive_interval() {
        let map = HashMap::from([("ADSB_PUBLISH_INTERVAL", "0")]);
        assert!(Config::from_lookup(lookup_from(&map)).is_err());
    }
}
