//! Logging bootstrap for executables embedding agentwire.
//!
//! The library itself only emits `tracing` events; binaries decide where
//! they go by calling [`init_tracing`] once at startup.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable selecting the log format (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "AGENTWIRE_LOG_FORMAT";

/// Initialize the tracing/logging subsystem
///
/// The filter comes from `RUST_LOG` when set, otherwise `default_level`.
/// JSON output is the default; set `AGENTWIRE_LOG_FORMAT=pretty` for
/// development.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "json".to_string());

    let json_layer = (format == "json").then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let pretty_layer = (format == "pretty").then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
    });

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    info!(format = %format, "Tracing initialized");
    Ok(())
}
