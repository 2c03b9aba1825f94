//! Logging plane.
//!
//! Every process gets a named logger writing to stdout and to
//! `<log_dir>/<component>_<YYYYMMDD_HHMMSS>.log`. Levels are configurable
//! per component through `<COMPONENT>_LOG_LEVEL`, falling back to
//! `RUST_LOG`, then `info`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber for this process. Returns the log file
/// path so the caller can report it.
pub fn init(component: &str, log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let path = log_dir.join(log_file_name(component, Utc::now()));
    let file = fs::File::create(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;
    let file = Arc::new(file);

    let filter = EnvFilter::new(directives(component, |key| std::env::var(key).ok()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(file),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(path)
}

fn log_file_name(component: &str, now: chrono::DateTime<Utc>) -> String {
    format!("{component}_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// `INGEST_LOG_LEVEL=debug` beats `RUST_LOG`, which beats `info`.
fn directives(component: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let key = format!("{}_LOG_LEVEL", component.to_uppercase());
    lookup(&key)
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| "info".to_string())
}
