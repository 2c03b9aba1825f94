//! Command-line interface. No mandatory flags; configuration comes from
//! the environment.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "skytrail", version, about = "Real-time ADS-B telemetry pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ingest from dump1090, assemble aircraft, publish over WebSocket.
    Ingest,
    /// Subscribe to a published stream and persist history to SQLite.
    Record,
    /// Run the whole pipeline in one process (default).
    Run,
}

impl Command {
    /// Component name used for log files and metric artifacts.
    pub fn component(&self) -> &'static str {
        match self {
            Command::Ingest => "ingest",
            Command::Record => "record",
            Command::Run => "run",
        }
    }
}
