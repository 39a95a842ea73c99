/*!
 * Protocol drivers for devgate.
 *
 * A driver owns the connection to one field protocol and the devices
 * configured against it. Drivers are built from [`DriverConfig`] through a
 * [`DriverRegistry`] and receive the message buses they forward to.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use devgate_core::error::{Error, Result};
use devgate_core::types::{Command, DeviceConfig, DriverConfig, Properties, TelemetryResult};

use crate::messagebus::SharedMessageBus;

#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod opcua;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttDriver;
pub use opcua::OpcUaDriver;

/// Protocol driver capability set
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    /// The driver type, e.g. "mqtt"
    fn driver_type(&self) -> &str;

    /// Connect to the field protocol
    async fn start(&self) -> Result<()>;

    /// Disconnect and wait for every task of the driver to finish
    async fn stop(&self);

    /// Start serving a device
    async fn add_device(&self, device: DeviceConfig) -> Result<()>;

    /// Stop serving a device; unknown names are ignored
    async fn remove_device(&self, device_name: &str) -> Result<()>;

    /// Write path towards a device
    async fn run_command(&self, command: Command) -> Result<()>;
}

/// A thread-safe reference to a driver
pub type SharedDriver = Arc<dyn Driver>;

/// Builds a driver from its properties and the buses it forwards to
pub type DriverConstructor =
    Arc<dyn Fn(&Properties, Vec<SharedMessageBus>) -> Result<SharedDriver> + Send + Sync>;

/// Maps driver types to constructors
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every driver compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "mqtt")]
        registry.register("mqtt", |properties: &Properties, buses| {
            let driver: SharedDriver = Arc::new(MqttDriver::new(properties, buses)?);
            Ok(driver)
        });

        #[cfg(feature = "opcua")]
        registry.register("opcua", |properties: &Properties, buses| {
            let driver: SharedDriver = Arc::new(OpcUaDriver::new(properties, buses)?);
            Ok(driver)
        });

        registry
    }

    /// Register a constructor for a driver type
    pub fn register<S, F>(&mut self, driver_type: S, constructor: F)
    where
        S: Into<String>,
        F: Fn(&Properties, Vec<SharedMessageBus>) -> Result<SharedDriver> + Send + Sync + 'static,
    {
        self.constructors
            .insert(driver_type.into(), Arc::new(constructor));
    }

    /// Registered driver types
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build the driver described by `config`
    ///
    /// Unknown driver types yield `None`.
    pub fn build(
        &self,
        config: &DriverConfig,
        buses: Vec<SharedMessageBus>,
    ) -> Result<Option<SharedDriver>> {
        match self.constructors.get(&config.driver_type) {
            Some(constructor) => constructor(&config.properties, buses).map(Some),
            None => {
                warn!("unsupported driver type {}", config.driver_type);
                Ok(None)
            }
        }
    }
}

/// Reject devices that belong to another driver
pub fn ensure_driver_type(driver_type: &str, device: &DeviceConfig) -> Result<()> {
    if device.driver_type != driver_type {
        return Err(Error::config_invalid(format!(
            "device {} belongs to driver {}, not {}",
            device.name, device.driver_type, driver_type
        )));
    }
    Ok(())
}

/// Forward a result to every bus; bus failures are logged
pub async fn forward(buses: &[SharedMessageBus], device_name: &str, result: &TelemetryResult) {
    for bus in buses {
        if let Err(e) = bus.receive_data(device_name, result).await {
            error!(
                bus = bus.bus_type(),
                "failed to forward {} of device {}, {}", result.name, device_name, e
            );
        }
    }
}
