/*!
 * Shared MQTT client for devgate.
 *
 * Both the MQTT driver and the MQTT message bus connect through this
 * module. A connection owns a network pump task that drives the rumqttc
 * event loop and forwards inbound publishes to an optional channel.
 */
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devgate_core::error::{Error, Result};
use devgate_core::utils::{with_retry, with_timeout, RetryPolicy};

/// Default MQTT port when the host omits one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

const DEFAULT_RETRY_INTERVAL_MS: u64 = 10_000;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttBrokerInfo {
    /// `host[:port]`, optionally prefixed by `tcp://` or `mqtt://`
    pub host: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub qos: u8,
    /// Keep-alive in seconds, 0 keeps the client default
    #[serde(default)]
    pub keep_alive: u16,
    #[serde(default)]
    pub conn_establishing_retry: usize,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub credential_dir: Option<String>,
}

fn default_retry_interval_ms() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

impl MqttBrokerInfo {
    /// Settings for an anonymous client of the given broker
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            client_id: None,
            qos: 0,
            keep_alive: 0,
            conn_establishing_retry: 0,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            auth_mode: AuthMode::Anonymous,
            credential_dir: None,
        }
    }

    /// Set the client id
    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the keep-alive in seconds
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Split the host into address and port
    pub fn address(&self) -> Result<(String, u16)> {
        parse_host(&self.host)
    }

    /// The configured QoS level
    pub fn qos_level(&self) -> Result<QoS> {
        qos_from_level(self.qos)
    }
}

/// Authentication mode of a broker connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Anonymous,
    Basic,
}

/// An inbound publish
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Parse `host[:port]` with an optional scheme
pub fn parse_host(host: &str) -> Result<(String, u16)> {
    let trimmed = host
        .strip_prefix("tcp://")
        .or_else(|| host.strip_prefix("mqtt://"))
        .unwrap_or(host)
        .trim_end_matches('/');

    if trimmed.is_empty() {
        return Err(Error::config_invalid("the MQTT broker host is required"));
    }

    match trimmed.rsplit_once(':') {
        Some((name, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                Error::config_invalid(format!("invalid MQTT broker port in {}", host))
            })?;
            Ok((name.to_string(), port))
        }
        None => Ok((trimmed.to_string(), DEFAULT_MQTT_PORT)),
    }
}

/// Map a numeric QoS level to the client representation
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::config_invalid(format!("invalid MQTT QoS {}", other))),
    }
}

async fn read_credentials(info: &MqttBrokerInfo) -> Result<Option<(String, String)>> {
    match info.auth_mode {
        AuthMode::Anonymous => Ok(None),
        AuthMode::Basic => {
            let dir = info.credential_dir.as_deref().ok_or_else(|| {
                Error::config_invalid("credentialDir is required for the basic auth mode")
            })?;
            let username = tokio::fs::read_to_string(Path::new(dir).join("username")).await?;
            let password = tokio::fs::read_to_string(Path::new(dir).join("password")).await?;
            Ok(Some((username.trim().to_string(), password.trim().to_string())))
        }
    }
}

async fn mqtt_options(info: &MqttBrokerInfo) -> Result<MqttOptions> {
    let (host, port) = info.address()?;
    let client_id = info
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("devgate-{}", uuid::Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_clean_session(true);
    if info.keep_alive > 0 {
        options.set_keep_alive(Duration::from_secs(u64::from(info.keep_alive)));
    }
    if let Some((username, password)) = read_credentials(info).await? {
        options.set_credentials(username, password);
    }
    Ok(options)
}

/// Poll the event loop until the broker acknowledges the packet selected by `done`
async fn poll_until<F>(eventloop: &mut EventLoop, host: &str, done: F) -> Result<()>
where
    F: Fn(&Packet) -> bool,
{
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) if done(&packet) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(Error::connection(format!(
                    "failed to connect to MQTT broker {}, {}",
                    host, e
                )))
            }
        }
    }
}

/// A live broker connection and its network pump
#[derive(Debug)]
pub struct MqttConnection {
    client: AsyncClient,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl MqttConnection {
    /// Connect to the broker and subscribe to `subscriptions`
    ///
    /// Failed handshakes are retried `connEstablishingRetry` times with a
    /// fixed backoff. The call returns once every subscription is
    /// acknowledged, so no publish routed by them can be missed.
    pub async fn connect(
        info: &MqttBrokerInfo,
        subscriptions: &[(String, QoS)],
        inbound: Option<mpsc::Sender<InboundMessage>>,
    ) -> Result<Self> {
        let policy = RetryPolicy::new(
            info.conn_establishing_retry,
            Duration::from_millis(info.retry_interval_ms),
        );

        let (client, eventloop) = with_retry(policy, || handshake(info, subscriptions))
            .await
            .map_err(|e| match e {
                Error::ConnectionFailure(_) => e,
                Error::Timeout(msg) => Error::connection(msg),
                other => other,
            })?;

        info!("MQTT client is connected to {}", info.host);

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_pump(
            eventloop,
            Resubscriber {
                client: client.clone(),
                subscriptions: subscriptions.to_vec(),
            },
            inbound,
            cancel.clone(),
        ));

        Ok(Self {
            client,
            cancel,
            pump,
        })
    }

    /// The client handle used to publish
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Publish a payload
    pub async fn publish<P: Into<Vec<u8>>>(&self, topic: &str, qos: QoS, payload: P) -> Result<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| Error::connection(format!("failed to publish to {}, {}", topic, e)))
    }

    /// Disconnect from the broker and wait for the pump to exit
    pub async fn disconnect(self) {
        let Self {
            client,
            cancel,
            mut pump,
        } = self;

        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect request was not queued: {}", e);
        }

        if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
            cancel.cancel();
            let _ = pump.await;
        }
        debug!("MQTT pump stopped");
    }
}

async fn handshake(
    info: &MqttBrokerInfo,
    subscriptions: &[(String, QoS)],
) -> Result<(AsyncClient, EventLoop)> {
    let options = mqtt_options(info).await?;
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    with_timeout(
        HANDSHAKE_TIMEOUT,
        poll_until(&mut eventloop, &info.host, |p| matches!(p, Packet::ConnAck(_))),
    )
    .await?;

    for (topic, qos) in subscriptions {
        client
            .subscribe(topic.as_str(), *qos)
            .await
            .map_err(|e| Error::connection(format!("failed to subscribe to {}, {}", topic, e)))?;
        with_timeout(
            HANDSHAKE_TIMEOUT,
            poll_until(&mut eventloop, &info.host, |p| matches!(p, Packet::SubAck(_))),
        )
        .await?;
        info!("Subscribing to {}", topic);
    }

    Ok((client, eventloop))
}

/// Restores the subscriptions of a connection after the broker forgot them
#[derive(Debug)]
struct Resubscriber {
    client: AsyncClient,
    subscriptions: Vec<(String, QoS)>,
}

impl Resubscriber {
    fn resubscribe(&self) {
        for (topic, qos) in &self.subscriptions {
            // The pump drains the request queue, so an awaiting send could deadlock here
            match self.client.try_subscribe(topic.as_str(), *qos) {
                Ok(()) => info!("Resubscribing to {}", topic),
                Err(e) => error!("failed to resubscribe to {}, {}", topic, e),
            }
        }
    }
}

async fn run_pump(
    mut eventloop: EventLoop,
    resubscriber: Resubscriber,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(tx) = &inbound {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    };
                    if tx.send(message).await.is_err() {
                        debug!("Inbound MQTT receiver dropped");
                    }
                }
            }
            // The handshake consumed the first ConnAck, this one follows a reconnect
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT client is reconnected");
                if !ack.session_present {
                    resubscriber.resubscribe();
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_host() {
        assert_eq!(
            parse_host("127.0.0.1:1884").unwrap(),
            ("127.0.0.1".to_string(), 1884)
        );
        assert_eq!(
            parse_host("tcp://broker.local").unwrap(),
            ("broker.local".to_string(), DEFAULT_MQTT_PORT)
        );
        assert_eq!(
            parse_host("mqtt://broker.local:8883/").unwrap(),
            ("broker.local".to_string(), 8883)
        );
        assert!(matches!(parse_host(""), Err(Error::ConfigInvalid(_))));
        assert!(matches!(parse_host("host:port"), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_broker_info_defaults() {
        let info: MqttBrokerInfo =
            serde_json::from_value(json!({"host": "127.0.0.1:1883"})).unwrap();
        assert_eq!(info, MqttBrokerInfo::new("127.0.0.1:1883"));
        assert_eq!(info.retry_interval_ms, 10_000);
        assert_eq!(info.auth_mode, AuthMode::Anonymous);
        assert_eq!(info.qos_level().unwrap(), QoS::AtMostOnce);
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    #[tokio::test]
    async fn test_basic_auth_reads_credential_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("username"), "gateway\n").unwrap();
        std::fs::write(dir.path().join("password"), "s3cret\n").unwrap();

        let mut info = MqttBrokerInfo::new("127.0.0.1");
        info.auth_mode = AuthMode::Basic;
        info.credential_dir = Some(dir.path().to_string_lossy().to_string());

        let credentials = read_credentials(&info).await.unwrap();
        assert_eq!(
            credentials,
            Some(("gateway".to_string(), "s3cret".to_string()))
        );

        info.credential_dir = None;
        assert!(matches!(
            read_credentials(&info).await,
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_failure_after_retries() {
        // Nothing listens on port 1 of the loopback interface
        let mut info = MqttBrokerInfo::new("127.0.0.1:1");
        info.conn_establishing_retry = 1;
        info.retry_interval_ms = 10;

        let result = MqttConnection::connect(&info, &[], None).await;
        assert!(matches!(result, Err(Error::ConnectionFailure(_))));
    }

    /// Forwards loopback connections to `upstream` until they are cut
    #[cfg(feature = "embedded-broker")]
    struct FlakyProxy {
        port: u16,
        generation: std::sync::Arc<std::sync::Mutex<CancellationToken>>,
    }

    #[cfg(feature = "embedded-broker")]
    impl FlakyProxy {
        async fn start(upstream: std::net::SocketAddr) -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let generation = std::sync::Arc::new(std::sync::Mutex::new(CancellationToken::new()));

            let current = generation.clone();
            tokio::spawn(async move {
                while let Ok((mut downstream, _)) = listener.accept().await {
                    let cut = current.lock().unwrap().clone();
                    tokio::spawn(async move {
                        let Ok(mut upstream) = tokio::net::TcpStream::connect(upstream).await else {
                            return;
                        };
                        tokio::select! {
                            _ = cut.cancelled() => {}
                            _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream) => {}
                        }
                    });
                }
            });

            Self { port, generation }
        }

        /// Drop every open connection; new ones are accepted again
        fn cut(&self) {
            let mut generation = self.generation.lock().unwrap();
            generation.cancel();
            *generation = CancellationToken::new();
        }
    }

    /// Publish until one message is routed to the subscriber
    #[cfg(feature = "embedded-broker")]
    async fn publish_until_delivered(
        publisher: &MqttConnection,
        rx: &mut mpsc::Receiver<InboundMessage>,
    ) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                publisher
                    .publish("devices/d1", QoS::AtLeastOnce, b"{}".to_vec())
                    .await
                    .unwrap();
                if let Ok(Some(message)) =
                    tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
                {
                    return message;
                }
            }
        })
        .await
        .unwrap()
    }

    #[cfg(feature = "embedded-broker")]
    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_subscriptions_survive_reconnect() {
        use crate::messagebus::broker::{BrokerLifecycle, EmbeddedBroker};

        let broker = EmbeddedBroker::new("127.0.0.1:21885".parse().unwrap());
        broker.start().await.unwrap();
        let proxy = FlakyProxy::start(broker.address()).await;

        let (tx, mut rx) = mpsc::channel(16);
        let mut info = MqttBrokerInfo::new(format!("127.0.0.1:{}", proxy.port));
        info.keep_alive = 5;
        let subscriber = MqttConnection::connect(
            &info,
            &[("devices/#".to_string(), QoS::AtMostOnce)],
            Some(tx),
        )
        .await
        .unwrap();
        let publisher = MqttConnection::connect(
            &MqttBrokerInfo::new(broker.address().to_string()),
            &[],
            None,
        )
        .await
        .unwrap();

        let message = publish_until_delivered(&publisher, &mut rx).await;
        assert_eq!(message.topic, "devices/d1");

        proxy.cut();
        // Let the pump notice the drop, then discard what arrived before it
        tokio::time::sleep(Duration::from_millis(300)).await;
        while rx.try_recv().is_ok() {}

        let message = publish_until_delivered(&publisher, &mut rx).await;
        assert_eq!(message.topic, "devices/d1");

        subscriber.disconnect().await;
        publisher.disconnect().await;
        broker.close().await;
    }
}
