/*!
 * Logging functionality for starsync.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the starsync crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "starsync=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::other(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span scoped to a device
pub fn device_span(device_id: &str) -> Span {
    tracing::info_span!("device", id = %device_id)
}

/// Create a new span for an operation against a device
pub fn operation_span(name: &str, device_id: &str) -> Span {
    tracing::info_span!("operation", name = %name, device = %device_id)
}
