/*!
 * Session binding over the `opcua` crate.
 *
 * The crate's client API is synchronous, so every call runs on the
 * blocking pool.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use opcua::client::prelude::{
    AttributeId, ClientBuilder, DataChangeCallback, ExtensionObject, IdentityToken,
    MessageSecurityMode, MonitoredItemCreateRequest, MonitoredItemService, MonitoringMode,
    MonitoringParameters, QualifiedName, ReadValueId, SecurityPolicy, Session, SessionCommand,
    SubscriptionService, TimestampsToReturn, UAString, Variant,
};
use opcua::sync::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use devgate_core::error::{Error, Result};

use super::{
    DataChangeItem, MonitoredRequest, NodeId, NodeIdentifier, Notification, OpcUaConfig,
    OpcUaConnector, OpcUaSession,
};

const APPLICATION_NAME: &str = "devgate";
const APPLICATION_URI: &str = "urn:devgate";

fn security_policy(name: &str) -> Result<SecurityPolicy> {
    match name {
        "None" => Ok(SecurityPolicy::None),
        "Basic128Rsa15" => Ok(SecurityPolicy::Basic128Rsa15),
        "Basic256" => Ok(SecurityPolicy::Basic256),
        "Basic256Sha256" => Ok(SecurityPolicy::Basic256Sha256),
        "Aes128Sha256RsaOaep" => Ok(SecurityPolicy::Aes128Sha256RsaOaep),
        "Aes256Sha256RsaPss" => Ok(SecurityPolicy::Aes256Sha256RsaPss),
        other => Err(Error::config_invalid(format!("unknown security policy {}", other))),
    }
}

fn security_mode(name: &str) -> Result<MessageSecurityMode> {
    match name {
        "None" => Ok(MessageSecurityMode::None),
        "Sign" => Ok(MessageSecurityMode::Sign),
        "SignAndEncrypt" => Ok(MessageSecurityMode::SignAndEncrypt),
        other => Err(Error::config_invalid(format!("unknown security mode {}", other))),
    }
}

fn to_opcua_node_id(node_id: &NodeId) -> opcua::types::NodeId {
    match &node_id.identifier {
        NodeIdentifier::Numeric(v) => opcua::types::NodeId::new(node_id.namespace, *v),
        NodeIdentifier::String(v) => opcua::types::NodeId::new(node_id.namespace, v.clone()),
        NodeIdentifier::Guid(v) => {
            opcua::types::NodeId::new(node_id.namespace, opcua::types::Guid::from(*v))
        }
        NodeIdentifier::Opaque(v) => opcua::types::NodeId::new(
            node_id.namespace,
            opcua::types::ByteString::from(v.as_slice()),
        ),
    }
}

/// Convert a variant into the JSON value handed to coercion
pub fn variant_to_json(variant: &Variant) -> Value {
    match variant {
        Variant::Empty => Value::Null,
        Variant::Boolean(v) => Value::Bool(*v),
        Variant::SByte(v) => Value::from(*v),
        Variant::Byte(v) => Value::from(*v),
        Variant::Int16(v) => Value::from(*v),
        Variant::UInt16(v) => Value::from(*v),
        Variant::Int32(v) => Value::from(*v),
        Variant::UInt32(v) => Value::from(*v),
        Variant::Int64(v) => Value::from(*v),
        Variant::UInt64(v) => Value::from(*v),
        Variant::Float(v) => Value::from(*v as f64),
        Variant::Double(v) => Value::from(*v),
        Variant::String(v) => Value::String(v.as_ref().to_string()),
        Variant::DateTime(v) => Value::String(v.as_chrono().to_rfc3339()),
        Variant::Guid(v) => Value::String(uuid::Uuid::from_bytes(*v.as_bytes()).to_string()),
        Variant::ByteString(v) => match &v.value {
            Some(bytes) => Value::String(BASE64.encode(bytes)),
            None => Value::Null,
        },
        Variant::Array(array) => Value::Array(array.values.iter().map(variant_to_json).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}

fn connect_blocking(endpoint: &str, config: &OpcUaConfig) -> Result<Arc<RwLock<Session>>> {
    let policy = security_policy(&config.security_policy)?;
    let mode = security_mode(&config.security_mode)?;

    let mut builder = ClientBuilder::new()
        .application_name(APPLICATION_NAME)
        .application_uri(APPLICATION_URI)
        .session_retry_limit(0)
        .trust_server_certs(true);
    if let Some(cert) = &config.cert_file {
        builder = builder.certificate_path(cert);
    }
    if let Some(key) = &config.key_file {
        builder = builder.private_key_path(key);
    }
    let mut client = builder
        .client()
        .ok_or_else(|| Error::config_invalid("invalid OPC-UA client configuration"))?;

    let endpoints = client
        .get_server_endpoints_from_url(endpoint)
        .map_err(|e| Error::connection(format!("failed to get endpoints of {}: {}", endpoint, e)))?;
    let selected = endpoints
        .into_iter()
        .find(|e| e.security_policy_uri.as_ref() == policy.to_uri() && e.security_mode == mode)
        .ok_or_else(|| {
            Error::connection(format!(
                "failed to find suitable endpoint on {} for {}/{}",
                endpoint, config.security_policy, config.security_mode
            ))
        })?;

    client
        .connect_to_endpoint(selected, IdentityToken::Anonymous)
        .map_err(|e| Error::connection(format!("failed to connect to {}: {}", endpoint, e)))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::other(format!("OPC-UA worker failed: {}", e)))?
}

/// Connector over the `opcua` client
#[derive(Debug, Default)]
pub struct ClientConnector;

#[async_trait]
impl OpcUaConnector for ClientConnector {
    async fn connect(&self, endpoint: &str, config: &OpcUaConfig) -> Result<Box<dyn OpcUaSession>> {
        let endpoint = endpoint.to_string();
        let config = config.clone();
        let session = blocking(move || connect_blocking(&endpoint, &config)).await?;
        Ok(Box::new(ClientSession {
            session,
            runner: None,
        }))
    }
}

struct ClientSession {
    session: Arc<RwLock<Session>>,
    runner: Option<oneshot::Sender<SessionCommand>>,
}

#[async_trait]
impl OpcUaSession for ClientSession {
    async fn subscribe(
        &mut self,
        interval: Duration,
        items: &[MonitoredRequest],
    ) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // The client reassigns item handles, so changes are matched by node
        let mut handles = HashMap::new();
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            let node_id = to_opcua_node_id(&item.node_id);
            handles.insert(node_id.clone(), item.handle);
            requests.push(MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId {
                    node_id,
                    attribute_id: AttributeId::Value as u32,
                    index_range: UAString::null(),
                    data_encoding: QualifiedName::null(),
                },
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    client_handle: item.handle,
                    sampling_interval: interval.as_millis() as f64,
                    filter: ExtensionObject::null(),
                    queue_size: 10,
                    discard_oldest: true,
                },
            });
        }

        let session = self.session.clone();
        let runner = blocking(move || {
            let subscription_id = {
                let session = session.read();
                let subscription_id = session
                    .create_subscription(
                        interval.as_millis() as f64,
                        10,
                        30,
                        0,
                        0,
                        true,
                        DataChangeCallback::new(move |changed| {
                            let items = changed
                                .iter()
                                .filter_map(|item| {
                                    let client_handle =
                                        *handles.get(&item.item_to_monitor().node_id)?;
                                    let value = item
                                        .last_value()
                                        .value
                                        .as_ref()
                                        .map(variant_to_json)
                                        .unwrap_or(Value::Null);
                                    Some(DataChangeItem {
                                        client_handle,
                                        value,
                                    })
                                })
                                .collect();
                            if tx.send(Notification::DataChange(items)).is_err() {
                                debug!("The subscription consumer is gone");
                            }
                        }),
                    )
                    .map_err(|e| Error::connection(format!("failed to create subscription: {}", e)))?;

                let results = session
                    .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                    .map_err(|e| {
                        Error::connection(format!("failed to create monitored items: {}", e))
                    })?;
                for (request, result) in requests.iter().zip(results.iter()) {
                    if !result.status_code.is_good() {
                        warn!(
                            "failed to monitor {}: {}",
                            request.item_to_monitor.node_id, result.status_code
                        );
                    }
                }
                subscription_id
            };
            debug!("Created subscription {}", subscription_id);
            Ok(Session::run_async(session))
        })
        .await?;

        self.runner = Some(runner);
        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some(runner) = self.runner.take() {
            let _ = runner.send(SessionCommand::Stop);
        }
        let session = self.session.clone();
        let closed = blocking(move || {
            session.read().disconnect();
            Ok(())
        })
        .await;
        if let Err(e) = closed {
            warn!("failed to close the OPC-UA session, {}", e);
        }
    }
}
