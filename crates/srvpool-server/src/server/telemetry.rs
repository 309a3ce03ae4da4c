//! # Console logging
//!
//! Logs go to stdout through `tracing_subscriber::fmt`. The filter is read
//! from `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! RUST_LOG=srvpool=debug,srvpool_server=debug cargo run -- --server api=127.0.0.1:9001
//! ```
//!
//! The pool library emits its own events (merges, replacements, fan-out
//! budget expiry, received signals) because this binary enables its `tracing`
//! feature.

use crate::server::config::LogFormat;
use tracing_subscriber::{
    EnvFilter, Layer, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_line_number(true)
        .with_target(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_file(true);

    let layer = match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(layer)
        .try_init()?;

    Ok(())
}
