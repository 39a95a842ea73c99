/*!
 * Message buses for devgate.
 *
 * A message bus receives coerced telemetry from every driver and
 * republishes it externally. Buses are built from [`MessageBusConfig`]
 * through a [`MessageBusRegistry`].
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use devgate_core::error::Result;
use devgate_core::types::{MessageBusConfig, Properties, TelemetryResult};

#[cfg(feature = "mqtt")]
pub mod broker;
#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "mqtt")]
pub use broker::BrokerLifecycle;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttMessageBus, PayloadFormat};

/// Telemetry sink shared by all drivers
#[async_trait]
pub trait MessageBus: Send + Sync + Debug {
    /// The message bus type, e.g. "mqtt"
    fn bus_type(&self) -> &str;

    /// Connect the bus
    async fn start(&self) -> Result<()>;

    /// Disconnect the bus and release its resources
    async fn stop(&self);

    /// Republish one result of a device
    async fn receive_data(&self, device_name: &str, result: &TelemetryResult) -> Result<()>;

    /// Command path from the bus towards the drivers
    async fn send_data(&self) -> Result<()>;
}

/// A thread-safe reference to a message bus
pub type SharedMessageBus = Arc<dyn MessageBus>;

/// Builds a message bus from its properties
pub type MessageBusConstructor =
    Arc<dyn Fn(&Properties) -> Result<SharedMessageBus> + Send + Sync>;

/// Maps message bus types to constructors
#[derive(Clone, Default)]
pub struct MessageBusRegistry {
    constructors: HashMap<String, MessageBusConstructor>,
}

impl Debug for MessageBusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl MessageBusRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every message bus compiled into this build
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "mqtt")]
        registry.register("mqtt", |properties: &Properties| {
            let bus: SharedMessageBus = Arc::new(MqttMessageBus::new(properties)?);
            Ok(bus)
        });

        registry
    }

    /// Register a constructor for a message bus type
    pub fn register<S, F>(&mut self, bus_type: S, constructor: F)
    where
        S: Into<String>,
        F: Fn(&Properties) -> Result<SharedMessageBus> + Send + Sync + 'static,
    {
        self.constructors
            .insert(bus_type.into(), Arc::new(constructor));
    }

    /// Registered message bus types
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build the bus described by `config`
    ///
    /// Disabled configs and unknown types yield `None`.
    pub fn build(&self, config: &MessageBusConfig) -> Result<Option<SharedMessageBus>> {
        if !config.enabled {
            debug!(bus = %config.message_bus_type, "Message bus is disabled");
            return Ok(None);
        }

        match self.constructors.get(&config.message_bus_type) {
            Some(constructor) => constructor(&config.properties).map(Some),
            None => {
                warn!("unsupported message bus type {}", config.message_bus_type);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Message bus that records everything it receives
    #[derive(Debug, Default)]
    pub struct RecordingBus {
        pub received: Mutex<Vec<(String, TelemetryResult)>>,
    }

    impl RecordingBus {
        pub async fn received(&self) -> Vec<(String, TelemetryResult)> {
            self.received.lock().await.clone()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        fn bus_type(&self) -> &str {
            "recording"
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn receive_data(&self, device_name: &str, result: &TelemetryResult) -> Result<()> {
            self.received
                .lock()
                .await
                .push((device_name.to_string(), result.clone()));
            Ok(())
        }

        async fn send_data(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingBus;
    use super::*;
    use serde_json::json;

    fn bus_config(enabled: bool, bus_type: &str) -> MessageBusConfig {
        MessageBusConfig {
            enabled,
            message_bus_type: bus_type.to_string(),
            properties: Properties::new(),
        }
    }

    #[test]
    fn test_registry_builds_registered_type() {
        let mut registry = MessageBusRegistry::new();
        registry.register("recording", |_: &Properties| {
            let bus: SharedMessageBus = Arc::new(RecordingBus::default());
            Ok(bus)
        });

        let bus = registry.build(&bus_config(true, "recording")).unwrap();
        assert_eq!(bus.unwrap().bus_type(), "recording");
        assert_eq!(registry.types(), vec!["recording"]);
    }

    #[test]
    fn test_registry_skips_disabled_and_unknown() {
        let registry = MessageBusRegistry::with_defaults();
        assert!(registry.build(&bus_config(false, "mqtt")).unwrap().is_none());
        assert!(registry.build(&bus_config(true, "kafka")).unwrap().is_none());
    }

    #[cfg(feature = "mqtt")]
    #[test]
    fn test_registry_rejects_invalid_properties() {
        let registry = MessageBusRegistry::with_defaults();
        let mut config = bus_config(true, "mqtt");
        config.properties = json!({"payloadFormat": "xml"}).as_object().cloned().unwrap();
        assert!(registry.build(&config).is_err());
    }
}
