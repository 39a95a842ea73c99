/*!
 * File-driven driver agent.
 *
 * The agent reads `config.yaml`, `drivers.yaml` and `devices.yaml` from
 * one directory, brings up an [`Equipment`] with them and keeps it running
 * until shutdown.
 */
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};
use yaml_rust::{Yaml, YamlLoader};

use devgate_core::error::Error;
use devgate_core::types::{DeviceConfig, DriverConfig, MessageBusConfig};

use crate::equipment::Equipment;
use crate::error::{GatewayError, Result};

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const DRIVERS_CONFIG_FILE_NAME: &str = "drivers.yaml";
pub const DEVICES_CONFIG_FILE_NAME: &str = "devices.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBusList {
    #[serde(default)]
    message_buses: Vec<MessageBusConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct DriverList {
    #[serde(default)]
    drivers: Vec<DriverConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

/// Everything the agent loads from its config directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConfig {
    pub message_buses: Vec<MessageBusConfig>,
    pub drivers: Vec<DriverConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl AgentConfig {
    /// Load the three config files of `config_dir`
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let dir = config_dir.as_ref();
        let buses: MessageBusList = load_yaml(&dir.join(CONFIG_FILE_NAME))?;
        let drivers: DriverList = load_yaml(&dir.join(DRIVERS_CONFIG_FILE_NAME))?;
        let devices: DeviceList = load_yaml(&dir.join(DEVICES_CONFIG_FILE_NAME))?;

        Ok(Self {
            message_buses: buses.message_buses,
            drivers: drivers.drivers,
            devices: devices.devices,
        })
    }
}

/// Parse a YAML file into a serde type
///
/// An empty file yields the type's default.
pub fn load_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let file = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| GatewayError::Io {
        file: file.clone(),
        source,
    })?;
    let docs = YamlLoader::load_from_str(&content).map_err(|source| GatewayError::Yaml {
        file: file.clone(),
        source,
    })?;

    let Some(doc) = docs.first() else {
        return Ok(T::default());
    };
    let value = yaml_to_json(doc)
        .map_err(|e| Error::config_invalid(format!("{}: {}", file, e)))?;
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value)
        .map_err(|e| Error::config_invalid(format!("{}: {}", file, e)).into())
}

/// Convert a YAML document into JSON
pub fn yaml_to_json(yaml: &Yaml) -> std::result::Result<Value, String> {
    let value = match yaml {
        Yaml::Null => Value::Null,
        Yaml::Boolean(v) => Value::Bool(*v),
        Yaml::Integer(v) => Value::from(*v),
        Yaml::Real(_) => match yaml.as_f64() {
            Some(v) => Value::from(v),
            None => return Err(format!("invalid number {:?}", yaml)),
        },
        Yaml::String(v) => Value::String(v.clone()),
        Yaml::Array(items) => Value::Array(
            items
                .iter()
                .map(yaml_to_json)
                .collect::<std::result::Result<_, _>>()?,
        ),
        Yaml::Hash(hash) => {
            let mut map = serde_json::Map::new();
            for (key, value) in hash {
                let key = match key {
                    Yaml::String(k) | Yaml::Real(k) => k.clone(),
                    Yaml::Integer(k) => k.to_string(),
                    Yaml::Boolean(k) => k.to_string(),
                    other => return Err(format!("unsupported mapping key {:?}", other)),
                };
                map.insert(key, yaml_to_json(value)?);
            }
            Value::Object(map)
        }
        Yaml::Alias(_) | Yaml::BadValue => return Err(format!("unsupported value {:?}", yaml)),
    };
    Ok(value)
}

/// Runs an [`Equipment`] from a config directory
#[derive(Debug)]
pub struct DriverAgent {
    config_dir: PathBuf,
    equipment: Arc<Equipment>,
}

impl DriverAgent {
    /// Create an agent with the default equipment
    pub fn new<P: Into<PathBuf>>(config_dir: P) -> Self {
        Self::with_equipment(config_dir, Arc::new(Equipment::new()))
    }

    /// Create an agent over an existing equipment
    pub fn with_equipment<P: Into<PathBuf>>(config_dir: P, equipment: Arc<Equipment>) -> Self {
        Self {
            config_dir: config_dir.into(),
            equipment,
        }
    }

    /// The equipment driven by this agent
    pub fn equipment(&self) -> &Arc<Equipment> {
        &self.equipment
    }

    /// Bring the equipment up from the config directory
    pub async fn bootstrap(&self) -> Result<()> {
        let config = AgentConfig::load(&self.config_dir)?;
        info!(
            "Loaded {} message buses, {} drivers and {} devices from {}",
            config.message_buses.len(),
            config.drivers.len(),
            config.devices.len(),
            self.config_dir.display()
        );

        self.equipment.start(&config.message_buses).await?;
        for driver in config.drivers {
            self.equipment.install_driver(driver).await?;
        }

        for device in config.devices {
            let Some(driver) = self.equipment.get_driver(&device.driver_type).await else {
                warn!(
                    "No driver {} for device {}, skipped",
                    device.driver_type, device.name
                );
                continue;
            };
            let name = device.name.clone();
            if let Err(e) = driver.add_device(device).await {
                error!("failed to add device {}, {}", name, e);
            }
        }
        Ok(())
    }

    /// Bootstrap, wait for `shutdown`, then stop the equipment
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.bootstrap().await {
            self.equipment.stop().await;
            return Err(e);
        }

        info!("The driver agent is running");
        shutdown.await;

        info!("Shutting down the driver agent");
        self.equipment.stop().await;
        Ok(())
    }
}
