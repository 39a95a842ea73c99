/*!
 * MQTT driver.
 *
 * Subscribes to `subTopic` on a broker and turns every inbound JSON
 * payload into one result per known resource of the addressed device.
 */
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use devgate_core::coercion::coerce;
use devgate_core::error::{Error, Result};
use devgate_core::logging::driver_span;
use devgate_core::types::{from_properties, Command, DeviceConfig, Properties};

use super::{ensure_driver_type, forward, Driver};
use crate::client::{InboundMessage, MqttBrokerInfo, MqttConnection};
use crate::messagebus::SharedMessageBus;

const DRIVER_TYPE: &str = "mqtt";
const INBOUND_CAPACITY: usize = 256;

/// MQTT driver settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttDriverConfig {
    #[serde(flatten)]
    pub broker: MqttBrokerInfo,
    /// Filter the driver subscribes to; `+`/`#` levels name the device
    pub sub_topic: String,
    /// Command topic; `+` is replaced by the device name
    #[serde(default)]
    pub pub_topic: Option<String>,
}

type DeviceMap = Arc<Mutex<HashMap<String, DeviceConfig>>>;

/// Derive the device name of `topic` from the subscription filter
///
/// Literal levels of the filter are dropped, the levels matched by `+` and
/// `#` are joined into the device name.
pub fn device_name_from_topic(sub_topic: &str, topic: &str) -> Option<String> {
    let filter: Vec<&str> = sub_topic.split('/').collect();
    let levels: Vec<&str> = topic.split('/').collect();
    let mut captured: Vec<&str> = Vec::new();

    for (i, pattern) in filter.iter().enumerate() {
        match *pattern {
            "#" => {
                captured.extend(levels.iter().skip(i));
                return join_levels(&captured);
            }
            "+" => captured.push(*levels.get(i)?),
            literal => {
                if *levels.get(i)? != literal {
                    return None;
                }
            }
        }
    }

    if levels.len() != filter.len() {
        return None;
    }
    join_levels(&captured)
}

fn join_levels(levels: &[&str]) -> Option<String> {
    let name = levels.join("/");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Resolves inbound publishes to device results
#[derive(Debug, Clone)]
struct InboundHandler {
    sub_topic: String,
    devices: DeviceMap,
    buses: Vec<SharedMessageBus>,
}

impl InboundHandler {
    async fn handle(&self, message: &InboundMessage) {
        debug!(
            "Receive message [{}], payload={}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );

        let Some(device_name) = device_name_from_topic(&self.sub_topic, &message.topic) else {
            info!("Ignore the message on unmatched topic {}", message.topic);
            return;
        };

        let device = match self.devices.lock().await.get(&device_name) {
            Some(device) => device.clone(),
            None => {
                info!("Ignore the unknown device {}", device_name);
                return;
            }
        };

        let data: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(&message.payload) {
                Ok(data) => data,
                Err(e) => {
                    error!(
                        "failed to unmarshal incoming data for device {}, {}",
                        device_name, e
                    );
                    return;
                }
            };

        for (key, value) in &data {
            let Some(resource) = device.resource(key) else {
                warn!("The device {} attribute {} is unsupported", device_name, key);
                continue;
            };

            match coerce(resource, value) {
                Ok(result) => forward(&self.buses, &device_name, &result).await,
                Err(e) if e.is_per_reading() => {
                    error!("The device {} attribute {} is unsupported, {}", device_name, key, e)
                }
                Err(e) => {
                    error!("failed to handle the message of device {}, {}", device_name, e);
                    return;
                }
            }
        }
    }
}

#[derive(Debug)]
struct Running {
    connection: MqttConnection,
    reader: JoinHandle<()>,
}

/// Driver for devices publishing JSON over MQTT
#[derive(Debug)]
pub struct MqttDriver {
    config: MqttDriverConfig,
    handler: InboundHandler,
    running: Mutex<Option<Running>>,
}

impl MqttDriver {
    /// Create a driver from its properties
    pub fn new(properties: &Properties, buses: Vec<SharedMessageBus>) -> Result<Self> {
        let config: MqttDriverConfig = from_properties(properties)?;
        config.broker.address()?;
        config.broker.qos_level()?;

        Ok(Self {
            handler: InboundHandler {
                sub_topic: config.sub_topic.clone(),
                devices: Arc::new(Mutex::new(HashMap::new())),
                buses,
            },
            config,
            running: Mutex::new(None),
        })
    }

    /// Driver settings
    pub fn config(&self) -> &MqttDriverConfig {
        &self.config
    }

    /// Names of the registered devices
    pub async fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handler.devices.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn command_topic(&self, device_name: &str) -> Result<String> {
        let pub_topic = self
            .config
            .pub_topic
            .as_deref()
            .ok_or_else(|| Error::config_invalid("pubTopic is required to run commands"))?;
        Ok(pub_topic.replace('+', device_name))
    }
}

#[async_trait]
impl Driver for MqttDriver {
    fn driver_type(&self) -> &str {
        DRIVER_TYPE
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("MQTT driver is already started");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<InboundMessage>(INBOUND_CAPACITY);
        let subscriptions = [(self.config.sub_topic.clone(), self.config.broker.qos_level()?)];
        let connection = MqttConnection::connect(&self.config.broker, &subscriptions, Some(tx)).await?;

        let handler = self.handler.clone();
        let reader = tokio::spawn(
            async move {
                while let Some(message) = rx.recv().await {
                    handler.handle(&message).await;
                }
                debug!("MQTT inbound reader stopped");
            }
            .instrument(driver_span(DRIVER_TYPE)),
        );

        *running = Some(Running { connection, reader });
        Ok(())
    }

    async fn stop(&self) {
        let Some(Running { connection, reader }) = self.running.lock().await.take() else {
            return;
        };

        info!("driver is stopping, disconnect the MQTT conn");
        connection.disconnect().await;
        if let Err(e) = reader.await {
            error!("MQTT inbound reader failed: {}", e);
        }
    }

    async fn add_device(&self, device: DeviceConfig) -> Result<()> {
        ensure_driver_type(DRIVER_TYPE, &device)?;
        let mut devices = self.handler.devices.lock().await;
        if devices.contains_key(&device.name) {
            debug!("Device {} is already registered", device.name);
            return Ok(());
        }
        info!("Device {} is added", device.name);
        devices.insert(device.name.clone(), device);
        Ok(())
    }

    async fn remove_device(&self, device_name: &str) -> Result<()> {
        if self.handler.devices.lock().await.remove(device_name).is_some() {
            info!("Device {} is removed", device_name);
        }
        Ok(())
    }

    async fn run_command(&self, command: Command) -> Result<()> {
        if !self
            .handler
            .devices
            .lock()
            .await
            .contains_key(&command.device_name)
        {
            return Err(Error::unknown_entity(format!(
                "device {}",
                command.device_name
            )));
        }

        let topic = self.command_topic(&command.device_name)?;
        let mut payload = serde_json::Map::new();
        payload.insert(command.resource_name.clone(), command.value.clone());
        let payload = serde_json::to_vec(&payload)?;

        let running = self.running.lock().await;
        let connection = running
            .as_ref()
            .map(|r| &r.connection)
            .ok_or_else(|| Error::connection("the MQTT driver is not started"))?;
        connection
            .publish(&topic, self.config.broker.qos_level()?, payload)
            .await?;
        debug!("Command {} sent to {}", command.resource_name, topic);
        Ok(())
    }
}
