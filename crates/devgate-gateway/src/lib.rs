/*!
 * devgate Gateway
 *
 * This crate composes drivers and message buses into a running gateway:
 * the [`Equipment`] registry, the file-driven [`DriverAgent`] and the
 * gateway settings.
 */

pub mod agent;
pub mod equipment;
pub mod error;
pub mod settings;

pub use agent::{AgentConfig, DriverAgent};
pub use equipment::Equipment;
pub use error::{GatewayError, Result};
pub use settings::{Settings, SettingsBuilder};

/// devgate gateway crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
