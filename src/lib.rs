//! skytrail - real-time ADS-B telemetry pipeline.
//!
//! Ingests raw Mode-S frames from a dump1090 feed, assembles per-aircraft
//! track records, republishes live JSON snapshots over WebSocket, and
//! persists a time-ordered history into a single-file SQLite store.

pub mod cli;
pub mod commands;
pub mod config;
pub mod cpr;
pub mod feed;
pub mod logging;
pub mod metrics;
pub mod modes;
pub mod net;
pub mod publisher;
pub mod store;
pub mod subscriber;
pub mod supervisor;
pub mod tracker;
