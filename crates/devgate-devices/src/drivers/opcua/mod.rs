/*!
 * OPC-UA driver.
 *
 * Every device gets its own supervised subscription task with an
 * independent cancellation token. The protocol binding sits behind
 * [`OpcUaConnector`] and [`OpcUaSession`]; the binding over the `opcua`
 * crate lives in [`client`] and is compiled with the `opcua` feature.
 */
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use devgate_core::coercion::coerce;
use devgate_core::error::{Error, Result};
use devgate_core::logging::device_span;
use devgate_core::types::{from_properties, Command, DeviceConfig, DeviceResource, Properties};

use super::{ensure_driver_type, forward, Driver};
use crate::messagebus::SharedMessageBus;

#[cfg(feature = "opcua")]
pub mod client;

const DRIVER_TYPE: &str = "opcua";
const ENDPOINT: &str = "endpoint";
const NODE: &str = "nodeId";
const HANDLE_OFFSET: u32 = 42;

/// Publishing interval of every device subscription
pub const SUBSCRIPTION_INTERVAL: Duration = Duration::from_millis(500);

/// OPC-UA driver settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcUaConfig {
    /// None, Basic128Rsa15, Basic256, Basic256Sha256, Aes128Sha256RsaOaep, Aes256Sha256RsaPss
    #[serde(default = "default_security")]
    pub security_policy: String,
    /// None, Sign, SignAndEncrypt
    #[serde(default = "default_security")]
    pub security_mode: String,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    /// How long `add_device` waits for the first connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_security() -> String {
    "None".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            security_policy: default_security(),
            security_mode: default_security(),
            cert_file: None,
            key_file: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl OpcUaConfig {
    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Identifier part of a node id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeIdentifier {
    Numeric(u32),
    String(String),
    Guid(uuid::Uuid),
    Opaque(Vec<u8>),
}

/// An OPC-UA node id, `ns=<n>;{i|s|g|b}=<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: NodeIdentifier,
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| Error::config_invalid(format!("invalid node id {}: {}", s, reason));

        let (namespace, identifier) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, identifier) = rest
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace"))?;
                let ns = ns.parse::<u16>().map_err(|_| invalid("invalid namespace index"))?;
                (ns, identifier)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier.strip_prefix("i=") {
            NodeIdentifier::Numeric(id.parse().map_err(|_| invalid("invalid numeric identifier"))?)
        } else if let Some(id) = identifier.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier.strip_prefix("g=") {
            NodeIdentifier::Guid(uuid::Uuid::parse_str(id).map_err(|e| invalid(&e.to_string()))?)
        } else if let Some(id) = identifier.strip_prefix("b=") {
            NodeIdentifier::Opaque(BASE64.decode(id).map_err(|e| invalid(&e.to_string()))?)
        } else {
            return Err(invalid("unknown identifier type"));
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};", self.namespace)?;
        match &self.identifier {
            NodeIdentifier::Numeric(v) => write!(f, "i={}", v),
            NodeIdentifier::String(v) => write!(f, "s={}", v),
            NodeIdentifier::Guid(v) => write!(f, "g={}", v),
            NodeIdentifier::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

/// A monitored item of one device resource
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredRequest {
    pub node_id: NodeId,
    /// Synthetic client handle, resource index + 42
    pub handle: u32,
    pub resource: DeviceResource,
}

/// One changed value reported by a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeItem {
    pub client_handle: u32,
    pub value: serde_json::Value,
}

/// Notification delivered by a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    DataChange(Vec<DataChangeItem>),
    Event,
    Error(String),
}

/// A connected OPC-UA session
#[async_trait]
pub trait OpcUaSession: Send + Sync {
    /// Create a subscription monitoring `items`; notifications arrive in source order
    async fn subscribe(
        &mut self,
        interval: Duration,
        items: &[MonitoredRequest],
    ) -> Result<mpsc::UnboundedReceiver<Notification>>;

    /// Close the session
    async fn close(&mut self);
}

/// Opens OPC-UA sessions
#[async_trait]
pub trait OpcUaConnector: Send + Sync + Debug {
    /// Discover the endpoints of `endpoint`, select one matching the
    /// configured security and connect to it
    async fn connect(&self, endpoint: &str, config: &OpcUaConfig) -> Result<Box<dyn OpcUaSession>>;
}

/// Resolve the monitored items of a device
pub fn resolve_requests(device: &DeviceConfig) -> Result<Vec<MonitoredRequest>> {
    device
        .profile
        .device_resources
        .iter()
        .enumerate()
        .map(|(index, resource)| {
            let node_id = resource.attribute_str(NODE).ok_or_else(|| {
                Error::config_invalid(format!(
                    "attribute {} does not exist on resource {}",
                    NODE, resource.name
                ))
            })?;
            Ok(MonitoredRequest {
                node_id: node_id.parse()?,
                handle: index as u32 + HANDLE_OFFSET,
                resource: resource.clone(),
            })
        })
        .collect()
}

fn find_endpoint(device: &DeviceConfig) -> Result<String> {
    device
        .protocol_properties
        .get(ENDPOINT)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::config_invalid(format!(
                "endpoint not found in the opcua protocol properties of device {}",
                device.name
            ))
        })
}

fn upsert_requests(requests: &mut Vec<MonitoredRequest>, fresh: &[MonitoredRequest]) {
    for request in fresh {
        match requests.iter_mut().find(|r| r.handle == request.handle) {
            Some(existing) => *existing = request.clone(),
            None => requests.push(request.clone()),
        }
    }
}

#[derive(Debug)]
struct DeviceEntry {
    config: DeviceConfig,
    requests: Vec<MonitoredRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    generation: u64,
}

type DeviceMap = Arc<Mutex<HashMap<String, DeviceEntry>>>;

/// Everything a subscription task needs
struct DeviceTask {
    device: DeviceConfig,
    carried: Vec<MonitoredRequest>,
    generation: u64,
    config: OpcUaConfig,
    connector: Arc<dyn OpcUaConnector>,
    devices: DeviceMap,
    buses: Vec<SharedMessageBus>,
    cancel: CancellationToken,
}

impl DeviceTask {
    async fn run(self, ready: oneshot::Sender<Result<()>>) {
        info!("Start device {}", self.device.name);

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("The device {} is done", self.device.name);
                return;
            }
            connected = self.connect() => connected,
        };

        let (mut session, mut notifications, requests) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                error!("failed to start device {}, {}", self.device.name, e);
                self.forget().await;
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(Notification::DataChange(items)) => self.handle_data_change(&requests, items).await,
                    Some(Notification::Error(e)) => error!("{}", e),
                    Some(other) => debug!("Ignore the notification {:?}", other),
                    None => {
                        warn!("The subscription of device {} is closed", self.device.name);
                        break;
                    }
                },
            }
        }

        session.close().await;
        info!("The device {} is done", self.device.name);
    }

    async fn connect(
        &self,
    ) -> Result<(
        Box<dyn OpcUaSession>,
        mpsc::UnboundedReceiver<Notification>,
        HashMap<u32, MonitoredRequest>,
    )> {
        let endpoint = find_endpoint(&self.device)?;
        let fresh = resolve_requests(&self.device)?;

        let mut session = self.connector.connect(&endpoint, &self.config).await?;
        info!("Connected to opcua server {}", endpoint);

        let notifications = match session.subscribe(SUBSCRIPTION_INTERVAL, &fresh).await {
            Ok(notifications) => notifications,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        debug!("Monitoring {} items of device {}", fresh.len(), self.device.name);

        let mut known = self.carried.clone();
        upsert_requests(&mut known, &fresh);
        if let Some(entry) = self.devices.lock().await.get_mut(&self.device.name) {
            if entry.generation == self.generation {
                entry.requests = known.clone();
            }
        }

        let requests = known.into_iter().map(|r| (r.handle, r)).collect();
        Ok((session, notifications, requests))
    }

    async fn handle_data_change(
        &self,
        requests: &HashMap<u32, MonitoredRequest>,
        items: Vec<DataChangeItem>,
    ) {
        for item in items {
            debug!(
                "MonitoredItem with client handle {} = {}",
                item.client_handle, item.value
            );
            let Some(request) = requests.get(&item.client_handle) else {
                continue;
            };

            match coerce(&request.resource, &item.value) {
                Ok(result) => forward(&self.buses, &self.device.name, &result).await,
                Err(e) => error!(
                    "The device {} attribute {} is unsupported, {}",
                    self.device.name, request.resource.name, e
                ),
            }
        }
    }

    /// Drop the registry entry of this task after a failed start
    async fn forget(&self) {
        let mut devices = self.devices.lock().await;
        if devices
            .get(&self.device.name)
            .map(|entry| entry.generation == self.generation)
            .unwrap_or(false)
        {
            devices.remove(&self.device.name);
        }
    }
}

/// Driver for OPC-UA servers
#[derive(Debug)]
pub struct OpcUaDriver {
    config: OpcUaConfig,
    buses: Vec<SharedMessageBus>,
    connector: Arc<dyn OpcUaConnector>,
    devices: DeviceMap,
    next_generation: AtomicU64,
}

impl OpcUaDriver {
    /// Create a driver connecting through the `opcua` crate
    #[cfg(feature = "opcua")]
    pub fn new(properties: &Properties, buses: Vec<SharedMessageBus>) -> Result<Self> {
        Self::with_connector(properties, buses, Arc::new(client::ClientConnector::default()))
    }

    /// Create a driver connecting through `connector`
    pub fn with_connector(
        properties: &Properties,
        buses: Vec<SharedMessageBus>,
        connector: Arc<dyn OpcUaConnector>,
    ) -> Result<Self> {
        let config: OpcUaConfig = from_properties(properties)?;
        Ok(Self {
            config,
            buses,
            connector,
            devices: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Driver settings
    pub fn config(&self) -> &OpcUaConfig {
        &self.config
    }

    /// Names of the tracked devices
    pub async fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Monitored items known for a device
    pub async fn device_requests(&self, device_name: &str) -> Option<Vec<MonitoredRequest>> {
        self.devices
            .lock()
            .await
            .get(device_name)
            .map(|entry| entry.requests.clone())
    }

    async fn join(device_name: &str, task: JoinHandle<()>) {
        if let Err(e) = task.await {
            error!("The subscription task of device {} failed: {}", device_name, e);
        }
    }
}

#[async_trait]
impl Driver for OpcUaDriver {
    fn driver_type(&self) -> &str {
        DRIVER_TYPE
    }

    async fn start(&self) -> Result<()> {
        info!(
            "OPC-UA driver started, security {}/{}",
            self.config.security_policy, self.config.security_mode
        );
        Ok(())
    }

    async fn stop(&self) {
        let entries: Vec<(String, DeviceEntry)> = self.devices.lock().await.drain().collect();
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        join_all(
            entries
                .into_iter()
                .map(|(name, entry)| async move { Self::join(&name, entry.task).await }),
        )
        .await;
    }

    async fn add_device(&self, device: DeviceConfig) -> Result<()> {
        ensure_driver_type(DRIVER_TYPE, &device)?;
        let name = device.name.clone();

        let mut devices = self.devices.lock().await;
        let previous = match devices.get(&name) {
            Some(entry) if entry.config == device => {
                info!("The device {} already exists", name);
                return Ok(());
            }
            Some(_) => {
                info!("Restart the device {}", name);
                devices.remove(&name)
            }
            None => None,
        };

        let carried = previous
            .as_ref()
            .map(|entry| entry.requests.clone())
            .unwrap_or_default();
        if let Some(entry) = &previous {
            entry.cancel.cancel();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = DeviceTask {
            device: device.clone(),
            carried: carried.clone(),
            generation,
            config: self.config.clone(),
            connector: self.connector.clone(),
            devices: self.devices.clone(),
            buses: self.buses.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(ready_tx).instrument(device_span(DRIVER_TYPE, &name)));

        // The entry is in place before the task can observe the registry
        devices.insert(
            name.clone(),
            DeviceEntry {
                config: device,
                requests: carried,
                cancel,
                task: handle,
                generation,
            },
        );
        drop(devices);
        info!("The device {} is starting", name);

        if let Some(entry) = previous {
            Self::join(&name, entry.task).await;
        }

        match tokio::time::timeout(self.config.connect_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            // The task was cancelled before it connected
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                warn!(
                    "The device {} is not connected after {:?}, still trying",
                    name,
                    self.config.connect_timeout()
                );
                Ok(())
            }
        }
    }

    async fn remove_device(&self, device_name: &str) -> Result<()> {
        let Some(entry) = self.devices.lock().await.remove(device_name) else {
            debug!("The device {} is already removed", device_name);
            return Ok(());
        };

        info!("Remove the device {}", device_name);
        entry.cancel.cancel();
        Self::join(device_name, entry.task).await;
        Ok(())
    }

    async fn run_command(&self, command: Command) -> Result<()> {
        debug!(
            "Commands are not supported by the OPC-UA driver, ignore {} of device {}",
            command.resource_name, command.device_name
        );
        Ok(())
    }
}
