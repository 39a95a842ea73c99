/*!
 * devgate Devices
 *
 * This crate provides the protocol drivers and message buses of the
 * devgate device gateway.
 */

// Re-export core types
pub use devgate_core::prelude;

pub mod drivers;
pub mod messagebus;

#[cfg(feature = "mqtt")]
pub mod client;

pub use drivers::{Driver, DriverRegistry, SharedDriver};
pub use messagebus::{MessageBus, MessageBusRegistry, SharedMessageBus};

/// devgate devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Driver protocols compiled into this build
pub fn available_protocols() -> Vec<&'static str> {
    let mut protocols = Vec::new();

    #[cfg(feature = "mqtt")]
    protocols.push("mqtt");

    #[cfg(feature = "opcua")]
    protocols.push("opcua");

    protocols
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_protocols_match_registry() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.types(), available_protocols());
    }
}
