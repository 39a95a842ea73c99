/*!
 * MQTT message bus.
 *
 * Publishes every result to a topic rendered from `dataTopic`. Without a
 * `host` property the bus runs its own embedded broker.
 */
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use devgate_core::error::{Error, Result};
use devgate_core::types::{from_properties, Properties, TelemetryResult};

use super::broker::{parse_broker_addr, BrokerLifecycle, DEFAULT_BROKER_ADDR};
use super::MessageBus;
use crate::client::{MqttBrokerInfo, MqttConnection};

/// Default publish topic template
pub const DEFAULT_DATA_TOPIC: &str = "devices/+/data/+";

const PUB_CLIENT_ID: &str = "msgbus-mqtt-pub-client";
const PUB_KEEP_ALIVE: u16 = 3600;

/// Serialization of published results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PayloadFormat {
    /// The whole result object
    #[serde(rename = "jsonObj")]
    JsonObj,
    /// `{name: value}`
    #[default]
    #[serde(rename = "jsonMap")]
    JsonMap,
}

impl PayloadFormat {
    /// Serialize a result in this format
    pub fn encode(&self, result: &TelemetryResult) -> Result<Vec<u8>> {
        let payload = match self {
            Self::JsonObj => serde_json::to_vec(result)?,
            Self::JsonMap => {
                let mut map = serde_json::Map::new();
                map.insert(result.name.clone(), result.value.to_json());
                serde_json::to_vec(&map)?
            }
        };
        Ok(payload)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MqttBusConfig {
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_data_topic")]
    data_topic: String,
    #[serde(default)]
    payload_format: PayloadFormat,
    #[serde(default)]
    embedded_broker_addr: Option<String>,
}

fn default_data_topic() -> String {
    DEFAULT_DATA_TOPIC.to_string()
}

/// Publish topic with positional `+` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    levels: Vec<String>,
}

impl TopicTemplate {
    /// Parse a template; at most two `+` levels and no `#`
    pub fn parse(template: &str) -> Result<Self> {
        let levels: Vec<String> = template.split('/').map(str::to_string).collect();
        if levels.iter().any(|level| level == "#") {
            return Err(Error::config_invalid(format!(
                "dataTopic {} must not contain #",
                template
            )));
        }
        if levels.iter().filter(|level| *level == "+").count() > 2 {
            return Err(Error::config_invalid(format!(
                "dataTopic {} has more than two + levels",
                template
            )));
        }
        Ok(Self { levels })
    }

    /// Fill the placeholders with the device and resource names
    pub fn render(&self, device_name: &str, resource_name: &str) -> String {
        let mut fillers = [device_name, resource_name].into_iter();
        self.levels
            .iter()
            .map(|level| {
                if level == "+" {
                    fillers.next().unwrap_or(level.as_str())
                } else {
                    level.as_str()
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Message bus that republishes telemetry over MQTT
#[derive(Debug)]
pub struct MqttMessageBus {
    host: String,
    data_topic: TopicTemplate,
    payload_format: PayloadFormat,
    broker: Option<Arc<dyn BrokerLifecycle>>,
    connection: Mutex<Option<MqttConnection>>,
}

impl MqttMessageBus {
    /// Create a bus from its properties
    ///
    /// Without `host` the default embedded broker is used.
    pub fn new(properties: &Properties) -> Result<Self> {
        let config: MqttBusConfig = from_properties(properties)?;
        let broker = match &config.host {
            Some(_) => None,
            None => {
                let addr = parse_broker_addr(
                    config
                        .embedded_broker_addr
                        .as_deref()
                        .unwrap_or(DEFAULT_BROKER_ADDR),
                )?;
                Some(default_broker(addr)?)
            }
        };
        Self::from_config(config, broker)
    }

    /// Create a bus that owns the given broker instead of the default one
    pub fn with_broker(properties: &Properties, broker: Arc<dyn BrokerLifecycle>) -> Result<Self> {
        let mut config: MqttBusConfig = from_properties(properties)?;
        config.host = None;
        Self::from_config(config, Some(broker))
    }

    fn from_config(
        config: MqttBusConfig,
        broker: Option<Arc<dyn BrokerLifecycle>>,
    ) -> Result<Self> {
        let host = match (&config.host, &broker) {
            (Some(host), _) => host.clone(),
            (None, Some(broker)) => broker.address().to_string(),
            (None, None) => {
                return Err(Error::config_invalid(
                    "the MQTT message bus requires a host or a broker",
                ))
            }
        };
        if broker.is_some() {
            info!("Using the built-in MQTT broker on {}", host);
        }

        Ok(Self {
            host,
            data_topic: TopicTemplate::parse(&config.data_topic)?,
            payload_format: config.payload_format,
            broker,
            connection: Mutex::new(None),
        })
    }

    /// Broker address the publishing client connects to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Selected payload format
    pub fn payload_format(&self) -> PayloadFormat {
        self.payload_format
    }
}

#[cfg(feature = "embedded-broker")]
fn default_broker(addr: std::net::SocketAddr) -> Result<Arc<dyn BrokerLifecycle>> {
    Ok(Arc::new(super::broker::EmbeddedBroker::new(addr)))
}

#[cfg(not(feature = "embedded-broker"))]
fn default_broker(addr: std::net::SocketAddr) -> Result<Arc<dyn BrokerLifecycle>> {
    Err(Error::config_invalid(format!(
        "no host configured and the embedded broker ({}) is not compiled in",
        addr
    )))
}

#[async_trait]
impl MessageBus for MqttMessageBus {
    fn bus_type(&self) -> &str {
        "mqtt"
    }

    async fn start(&self) -> Result<()> {
        if let Some(broker) = &self.broker {
            broker.start().await?;
        }

        let info = MqttBrokerInfo::new(self.host.clone())
            .with_client_id(PUB_CLIENT_ID)
            .with_keep_alive(PUB_KEEP_ALIVE);
        let connection = match MqttConnection::connect(&info, &[], None).await {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(broker) = &self.broker {
                    broker.close().await;
                }
                return Err(e);
            }
        };
        *self.connection.lock().await = Some(connection);

        info!("Connected to MQTT message bus {}", self.host);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.disconnect().await;
        }
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
        info!("MQTT message bus is stopped");
    }

    async fn receive_data(&self, device_name: &str, result: &TelemetryResult) -> Result<()> {
        let topic = self.data_topic.render(device_name, &result.name);
        let payload = self.payload_format.encode(result)?;
        debug!(
            "Send data to MQTT message bus, [{}] [{}] {}",
            topic,
            device_name,
            String::from_utf8_lossy(&payload)
        );

        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) => {
                if let Err(e) = connection.publish(&topic, QoS::AtMostOnce, payload).await {
                    error!("failed to send data, {}", e);
                }
            }
            None => error!("failed to send data to {}, the message bus is not started", topic),
        }
        Ok(())
    }

    async fn send_data(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgate_core::types::{TypedValue, ValueType};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn result() -> TelemetryResult {
        TelemetryResult {
            name: "temp".to_string(),
            value_type: ValueType::Float64,
            value: TypedValue::Float64(21.5),
            create_timestamp: 42,
        }
    }

    #[derive(Debug)]
    struct FakeBroker {
        addr: SocketAddr,
        refuse: bool,
        started: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl BrokerLifecycle for FakeBroker {
        async fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(Error::connection("fake broker refuses to start"));
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn address(&self) -> SocketAddr {
            self.addr
        }
    }

    #[test]
    fn test_topic_template() {
        let template = TopicTemplate::parse(DEFAULT_DATA_TOPIC).unwrap();
        assert_eq!(template.render("d1", "temp"), "devices/d1/data/temp");

        let template = TopicTemplate::parse("telemetry/+").unwrap();
        assert_eq!(template.render("d1", "temp"), "telemetry/d1");

        let template = TopicTemplate::parse("telemetry").unwrap();
        assert_eq!(template.render("d1", "temp"), "telemetry");

        assert!(TopicTemplate::parse("a/+/+/+").is_err());
        assert!(TopicTemplate::parse("a/#").is_err());
    }

    #[test]
    fn test_payload_formats() {
        let map = PayloadFormat::JsonMap.encode(&result()).unwrap();
        let map: serde_json::Value = serde_json::from_slice(&map).unwrap();
        assert_eq!(map, json!({"temp": 21.5}));

        let obj = PayloadFormat::JsonObj.encode(&result()).unwrap();
        let obj: serde_json::Value = serde_json::from_slice(&obj).unwrap();
        assert_eq!(
            obj,
            json!({"name": "temp", "type": "Float64", "value": 21.5, "createTimestamp": 42})
        );
    }

    #[test]
    fn test_external_host_config() {
        let bus = MqttMessageBus::new(&props(json!({
            "host": "broker.local:1884",
            "payloadFormat": "jsonObj"
        })))
        .unwrap();
        assert_eq!(bus.host(), "broker.local:1884");
        assert_eq!(bus.payload_format(), PayloadFormat::JsonObj);
        assert!(bus.broker.is_none());
    }

    #[cfg(feature = "embedded-broker")]
    #[test]
    fn test_embedded_broker_default_addr() {
        let bus = MqttMessageBus::new(&Properties::new()).unwrap();
        assert_eq!(bus.host(), DEFAULT_BROKER_ADDR);
        assert_eq!(bus.payload_format(), PayloadFormat::JsonMap);

        let bus = MqttMessageBus::new(&props(json!({"embeddedBrokerAddr": "127.0.0.1:21883"})))
            .unwrap();
        assert_eq!(bus.host(), "127.0.0.1:21883");
    }

    #[test]
    fn test_invalid_payload_format() {
        let err = MqttMessageBus::new(&props(json!({"host": "h", "payloadFormat": "xml"})))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    fn fake_broker(refuse: bool) -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            // Nothing listens on port 1 of the loopback interface
            addr: "127.0.0.1:1".parse().unwrap(),
            refuse,
            started: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_broker_start_failure_is_returned() {
        let broker = fake_broker(true);
        let bus = MqttMessageBus::with_broker(&Properties::new(), broker.clone()).unwrap();
        assert_eq!(bus.host(), "127.0.0.1:1");

        assert!(matches!(bus.start().await, Err(Error::ConnectionFailure(_))));
        assert_eq!(broker.started.load(Ordering::SeqCst), 1);

        bus.stop().await;
        assert_eq!(broker.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_the_broker() {
        let broker = fake_broker(false);
        let bus = MqttMessageBus::with_broker(&Properties::new(), broker.clone()).unwrap();

        assert!(matches!(bus.start().await, Err(Error::ConnectionFailure(_))));
        assert_eq!(broker.started.load(Ordering::SeqCst), 1);
        assert_eq!(broker.closed.load(Ordering::SeqCst), 1);
        assert!(bus.connection.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_receive_data_before_start_is_not_fatal() {
        let bus = MqttMessageBus::new(&props(json!({"host": "127.0.0.1:1"}))).unwrap();
        assert!(bus.receive_data("d1", &result()).await.is_ok());
    }
}
