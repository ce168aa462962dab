//! Unified logging initialization for Caldera binaries and tests
//!
//! Respects the following priority order:
//! 1. RUST_LOG environment variable
//! 2. The configured service log level

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the given default filter (e.g. "caldera=info").
///
/// RUST_LOG, when set, takes priority over the default.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true) // Show module path
                .compact(),
        )
        .try_init()?;

    Ok(())
}
