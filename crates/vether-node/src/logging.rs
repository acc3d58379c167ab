//! Tracing subscriber configuration for hosts embedding the engine.
//!
//! Level conventions:
//! - ERROR: unusable engine, host contract violations
//! - WARN: recoverable anomalies (bad signatures, rejected configs)
//! - INFO: lifecycle (identity generated, network joined, world upgraded)
//! - DEBUG: per-peer and per-network state changes
//! - TRACE: per-packet detail

use tracing_subscriber::EnvFilter;

/// Initialize with sensible defaults; `RUST_LOG` overrides, default `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Initialize with JSON output for structured log collection.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();
}

/// Initialize for tests; safe to call repeatedly.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
