//! Provides helper functions for initializing telemetry collection.
use anyhow::Result;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

/// Initialize tracing
pub fn init_tracing() -> Result<()> {
    // Forward events emitted through the log facade into tracing.
    tracing_log::LogTracer::init()?;

    //// Setup log filter
    //// Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    // Setup logging to stdout
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_filter(log_filter);
    tracing_subscriber::registry().with(logger).init();
    Ok(())
}
