//! Tracing initialization.
//!
//! Sets up a fmt subscriber with an `RUST_LOG`-driven [`EnvFilter`]. OTLP or
//! other exporters are the embedding application's concern; this crate only
//! emits through the `tracing` facade.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize console tracing output.
///
/// Safe to call once per process; returns an error if a global subscriber is
/// already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
