/*!
 * Equipment, the owner of every driver and message bus of a gateway.
 *
 * All lifecycle operations are serialized by one lock.
 */
use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use devgate_core::error::{Error, Result};
use devgate_core::types::{DriverConfig, MessageBusConfig};
use devgate_devices::drivers::{DriverRegistry, SharedDriver};
use devgate_devices::messagebus::{MessageBusRegistry, SharedMessageBus};

#[derive(Debug)]
struct InstalledDriver {
    config: DriverConfig,
    driver: SharedDriver,
}

#[derive(Debug, Default)]
struct State {
    buses: HashMap<String, SharedMessageBus>,
    drivers: HashMap<String, InstalledDriver>,
}

/// Composition root of drivers and message buses
#[derive(Debug)]
pub struct Equipment {
    drivers: DriverRegistry,
    buses: MessageBusRegistry,
    state: Mutex<State>,
}

impl Default for Equipment {
    fn default() -> Self {
        Self::new()
    }
}

impl Equipment {
    /// Create an equipment with every driver and bus compiled into this build
    pub fn new() -> Self {
        Self::with_registries(DriverRegistry::with_defaults(), MessageBusRegistry::with_defaults())
    }

    /// Create an equipment over custom registries
    pub fn with_registries(drivers: DriverRegistry, buses: MessageBusRegistry) -> Self {
        Self {
            drivers,
            buses,
            state: Mutex::new(State::default()),
        }
    }

    /// Start the enabled message buses
    ///
    /// The first construction or start failure aborts the call. A running bus
    /// is only replaced while no driver is installed, because drivers keep
    /// the buses they were built with.
    pub async fn start(&self, configs: &[MessageBusConfig]) -> Result<()> {
        let mut state = self.state.lock().await;

        for config in configs {
            if state.buses.contains_key(&config.message_bus_type) && !state.drivers.is_empty() {
                return Err(Error::config_invalid(format!(
                    "the message bus {} cannot be replaced while drivers are installed",
                    config.message_bus_type
                )));
            }

            let Some(bus) = self.buses.build(config)? else {
                continue;
            };

            if let Err(e) = bus.start().await {
                error!("failed to start message bus {}, {}", config.message_bus_type, e);
                bus.stop().await;
                return Err(e);
            }
            info!("The message bus {} is started", config.message_bus_type);

            if let Some(previous) = state.buses.insert(config.message_bus_type.clone(), bus) {
                previous.stop().await;
            }
        }

        Ok(())
    }

    /// Stop every driver, then every message bus
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        for (driver_type, installed) in state.drivers.drain() {
            installed.driver.stop().await;
            info!("The driver {} is stopped", driver_type);
        }
        for (bus_type, bus) in state.buses.drain() {
            bus.stop().await;
            info!("The message bus {} is stopped", bus_type);
        }
    }

    /// Install or reinstall the driver of `config.driver_type`
    ///
    /// An identical config is a no-op. A changed config stops the running
    /// driver before the new one starts.
    pub async fn install_driver(&self, config: DriverConfig) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(installed) = state.drivers.get(&config.driver_type) {
            if installed.config == config {
                info!("The driver {} already exists", config.driver_type);
                return Ok(());
            }
        }

        let buses: Vec<SharedMessageBus> = state.buses.values().cloned().collect();
        let Some(driver) = self.drivers.build(&config, buses)? else {
            return Ok(());
        };

        if let Some(previous) = state.drivers.remove(&config.driver_type) {
            info!("Reinstall the driver {}", config.driver_type);
            previous.driver.stop().await;
        }

        if let Err(e) = driver.start().await {
            error!("failed to start driver {}, {}", config.driver_type, e);
            driver.stop().await;
            return Err(e);
        }

        info!("The driver {} is installed", config.driver_type);
        state
            .drivers
            .insert(config.driver_type.clone(), InstalledDriver { config, driver });
        Ok(())
    }

    /// Stop and forget the driver of `config.driver_type`
    pub async fn uninstall_driver(&self, config: &DriverConfig) -> Result<()> {
        let mut state = self.state.lock().await;

        match state.drivers.remove(&config.driver_type) {
            Some(installed) => {
                installed.driver.stop().await;
                info!("The driver {} is uninstalled", config.driver_type);
            }
            None => info!("The driver {} does not exist", config.driver_type),
        }
        Ok(())
    }

    /// The installed driver of a type
    pub async fn get_driver(&self, driver_type: &str) -> Option<SharedDriver> {
        let state = self.state.lock().await;
        let driver = state
            .drivers
            .get(driver_type)
            .map(|installed| installed.driver.clone());
        if driver.is_none() {
            warn!("The driver {} is not installed", driver_type);
        }
        driver
    }

    /// Types of the installed drivers
    pub async fn driver_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.state.lock().await.drivers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Types of the running message buses
    pub async fn bus_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.state.lock().await.buses.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use devgate_core::types::{Command, DeviceConfig, Properties, TelemetryResult};
    use devgate_devices::drivers::Driver;
    use devgate_devices::messagebus::MessageBus;
    use serde_json::json;
    use std::sync::Arc;

    type Journal = Arc<std::sync::Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct JournalDriver {
        id: String,
        journal: Journal,
        buses: usize,
        fail_start: Option<String>,
    }

    #[async_trait]
    impl Driver for JournalDriver {
        fn driver_type(&self) -> &str {
            "journal"
        }

        async fn start(&self) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("start {} buses={}", self.id, self.buses));
            match self.fail_start.as_deref() {
                Some("config") => Err(Error::config_invalid("unknown security policy")),
                Some(_) => Err(Error::connection("refused")),
                None => Ok(()),
            }
        }

        async fn stop(&self) {
            self.journal.lock().unwrap().push(format!("stop {}", self.id));
        }

        async fn add_device(&self, _device: DeviceConfig) -> Result<()> {
            Ok(())
        }

        async fn remove_device(&self, _device_name: &str) -> Result<()> {
            Ok(())
        }

        async fn run_command(&self, _command: Command) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct JournalBus {
        journal: Journal,
        fail_start: bool,
    }

    #[async_trait]
    impl MessageBus for JournalBus {
        fn bus_type(&self) -> &str {
            "journal"
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::connection("broker unreachable"));
            }
            self.journal.lock().unwrap().push("bus start".to_string());
            Ok(())
        }

        async fn stop(&self) {
            self.journal.lock().unwrap().push("bus stop".to_string());
        }

        async fn receive_data(&self, _device_name: &str, _result: &TelemetryResult) -> Result<()> {
            Ok(())
        }

        async fn send_data(&self) -> Result<()> {
            Ok(())
        }
    }

    fn equipment(journal: &Journal) -> Equipment {
        let mut drivers = DriverRegistry::new();
        let driver_journal = journal.clone();
        drivers.register("journal", move |properties: &Properties, buses| {
            let driver: SharedDriver = Arc::new(JournalDriver {
                id: properties
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("default")
                    .to_string(),
                journal: driver_journal.clone(),
                buses: buses.len(),
                fail_start: properties
                    .get("failStart")
                    .map(|v| v.as_str().unwrap_or("connection").to_string()),
            });
            Ok(driver)
        });

        let mut buses = MessageBusRegistry::new();
        let bus_journal = journal.clone();
        buses.register("journal", move |properties: &Properties| {
            let bus: SharedMessageBus = Arc::new(JournalBus {
                journal: bus_journal.clone(),
                fail_start: properties.contains_key("failStart"),
            });
            Ok(bus)
        });

        Equipment::with_registries(drivers, buses)
    }

    fn driver_config(props: serde_json::Value) -> DriverConfig {
        DriverConfig::new("journal", props.as_object().cloned().unwrap())
    }

    fn bus_config(enabled: bool, props: serde_json::Value) -> MessageBusConfig {
        MessageBusConfig {
            enabled,
            message_bus_type: "journal".to_string(),
            properties: props.as_object().cloned().unwrap(),
        }
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_install_identical_config_starts_once() {
        let journal = Journal::default();
        let equipment = equipment(&journal);
        equipment.start(&[bus_config(true, json!({}))]).await.unwrap();

        tokio_test::assert_ok!(equipment.install_driver(driver_config(json!({"id": "a"}))).await);
        tokio_test::assert_ok!(equipment.install_driver(driver_config(json!({"id": "a"}))).await);

        assert_eq!(entries(&journal), vec!["bus start", "start a buses=1"]);
        assert!(equipment.get_driver("journal").await.is_some());
    }

    #[tokio::test]
    async fn test_reinstall_stops_old_driver_first() {
        let journal = Journal::default();
        let equipment = equipment(&journal);

        equipment.install_driver(driver_config(json!({"id": "a"}))).await.unwrap();
        equipment.install_driver(driver_config(json!({"id": "b"}))).await.unwrap();

        assert_eq!(
            entries(&journal),
            vec!["start a buses=0", "stop a", "start b buses=0"]
        );
        assert_eq!(equipment.driver_types().await, vec!["journal"]);
    }

    #[tokio::test]
    async fn test_driver_start_failure_keeps_its_kind() {
        let journal = Journal::default();
        let equipment = equipment(&journal);

        let result = equipment
            .install_driver(driver_config(json!({"id": "a", "failStart": true})))
            .await;
        assert!(matches!(result, Err(Error::ConnectionFailure(_))));
        assert!(equipment.get_driver("journal").await.is_none());

        let result = equipment
            .install_driver(driver_config(json!({"id": "b", "failStart": "config"})))
            .await;
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
        assert!(equipment.get_driver("journal").await.is_none());
        assert_eq!(
            entries(&journal),
            vec!["start a buses=0", "stop a", "start b buses=0", "stop b"]
        );
    }

    #[tokio::test]
    async fn test_unknown_driver_type_is_skipped() {
        let journal = Journal::default();
        let equipment = equipment(&journal);

        let config = DriverConfig::new("modbus", Properties::new());
        tokio_test::assert_ok!(equipment.install_driver(config).await);
        assert!(equipment.driver_types().await.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_never_installed_is_a_no_op() {
        let journal = Journal::default();
        let equipment = equipment(&journal);
        equipment.install_driver(driver_config(json!({"id": "a"}))).await.unwrap();

        let other = DriverConfig::new("opcua", Properties::new());
        equipment.uninstall_driver(&other).await.unwrap();

        assert_eq!(equipment.driver_types().await, vec!["journal"]);
        assert_eq!(entries(&journal), vec!["start a buses=0"]);

        equipment.uninstall_driver(&driver_config(json!({}))).await.unwrap();
        assert!(equipment.driver_types().await.is_empty());
        assert_eq!(entries(&journal), vec!["start a buses=0", "stop a"]);
    }

    #[tokio::test]
    async fn test_bus_start() {
        let journal = Journal::default();
        let equipment = equipment(&journal);

        equipment.start(&[bus_config(false, json!({}))]).await.unwrap();
        assert!(equipment.bus_types().await.is_empty());

        let result = equipment.start(&[bus_config(true, json!({"failStart": true}))]).await;
        assert!(matches!(result, Err(Error::ConnectionFailure(_))));
        assert!(equipment.bus_types().await.is_empty());
        // A bus that failed to start is stopped again
        assert_eq!(entries(&journal), vec!["bus stop"]);
    }

    #[tokio::test]
    async fn test_bus_replace() {
        let journal = Journal::default();
        let equipment = equipment(&journal);
        equipment.start(&[bus_config(true, json!({}))]).await.unwrap();

        // No driver holds the running bus yet
        equipment.start(&[bus_config(true, json!({}))]).await.unwrap();
        assert_eq!(entries(&journal), vec!["bus start", "bus start", "bus stop"]);

        equipment.install_driver(driver_config(json!({"id": "a"}))).await.unwrap();
        let result = equipment.start(&[bus_config(true, json!({}))]).await;
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
        assert_eq!(
            entries(&journal),
            vec!["bus start", "bus start", "bus stop", "start a buses=1"]
        );
        assert_eq!(equipment.bus_types().await, vec!["journal"]);
    }

    #[tokio::test]
    async fn test_stop_drivers_before_buses() {
        let journal = Journal::default();
        let equipment = equipment(&journal);
        equipment.start(&[bus_config(true, json!({}))]).await.unwrap();
        equipment.install_driver(driver_config(json!({"id": "a"}))).await.unwrap();

        equipment.stop().await;

        assert_eq!(
            entries(&journal),
            vec!["bus start", "start a buses=1", "stop a", "bus stop"]
        );
        assert!(equipment.driver_types().await.is_empty());
        assert!(equipment.bus_types().await.is_empty());
    }
}
