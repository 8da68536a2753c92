//! Tracing setup for the server binary.
//!
//! Every process in the group logs to its own stderr, so the subscriber is
//! installed once per process before the role is resolved.
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Log filter (default: `info,molt_server=debug,molt_ecdysis=debug`)
//! - `MOLT_LOG_FORMAT`: `json` for one JSON object per line, anything else for
//!   human-readable output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,molt_server=debug,molt_ecdysis=debug";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("MOLT_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?,
    }

    tracing::debug!(?format, "Telemetry initialized");
    Ok(())
}
