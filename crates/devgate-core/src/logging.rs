/*!
 * Logging setup for devgate.
 *
 * All crates log through `tracing`; the binary installs a subscriber once
 * at startup. `RUST_LOG` overrides the configured filter.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info", false)
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "devgate_devices=debug")
/// * `json` - Emit one JSON object per event instead of human-readable lines
pub fn init_with_filter(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    installed.map_err(|e| Error::other(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for a driver instance
pub fn driver_span(driver_type: &str) -> Span {
    tracing::info_span!("driver", driver = %driver_type)
}

/// Create a span for one device served by a driver
pub fn device_span(driver_type: &str, device: &str) -> Span {
    tracing::info_span!("device", driver = %driver_type, device = %device)
}
