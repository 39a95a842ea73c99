/*!
 * Embedded MQTT broker.
 *
 * The MQTT message bus starts a local broker when no external `host` is
 * configured. The broker sits behind [`BrokerLifecycle`] so that tests can
 * substitute their own.
 */
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use devgate_core::error::{Error, Result};

/// Default listen address of the embedded broker
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";

/// Lifecycle of a broker owned by a message bus
#[async_trait]
pub trait BrokerLifecycle: Send + Sync + Debug {
    /// Start the broker and wait until it accepts connections
    async fn start(&self) -> Result<()>;

    /// Close the broker
    async fn close(&self);

    /// Address clients should connect to
    fn address(&self) -> SocketAddr;
}

/// Parse a broker listen address
pub fn parse_broker_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::config_invalid(format!("invalid embedded broker address {}: {}", addr, e)))
}

/// Wait until something accepts TCP connections on `addr`
pub async fn wait_until_listening(addr: SocketAddr, limit: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::connection(format!(
                "embedded broker on {} did not start within {:?}",
                addr, limit
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(feature = "embedded-broker")]
pub use embedded::EmbeddedBroker;

#[cfg(feature = "embedded-broker")]
mod embedded {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::{error, info, warn};

    use devgate_core::error::Result;

    use super::{wait_until_listening, BrokerLifecycle};

    const STARTUP_LIMIT: Duration = Duration::from_secs(5);

    /// Permissive rumqttd broker running on a background thread
    ///
    /// rumqttd offers no shutdown handle, so `close` only stops tracking the
    /// broker; its thread ends with the process.
    #[derive(Debug)]
    pub struct EmbeddedBroker {
        addr: SocketAddr,
        running: Arc<AtomicBool>,
    }

    impl EmbeddedBroker {
        /// Create a broker listening on `addr`
        pub fn new(addr: SocketAddr) -> Self {
            Self {
                addr,
                running: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Whether the broker thread is running
        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }

        fn config(addr: SocketAddr) -> rumqttd::Config {
            let mut config = rumqttd::Config {
                id: 0,
                router: rumqttd::RouterConfig {
                    max_connections: 1000,
                    max_outgoing_packet_count: 200,
                    max_segment_size: 1048576,
                    max_segment_count: 10,
                    custom_segment: None,
                    initialized_filters: None,
                    ..Default::default()
                },
                v4: None,
                v5: None,
                ws: None,
                cluster: None,
                console: None,
                bridge: None,
                prometheus: None,
                metrics: None,
            };

            let mut v4 = HashMap::new();
            v4.insert(
                "main".to_string(),
                rumqttd::ServerSettings {
                    name: "devgate-msgbus".to_string(),
                    listen: addr,
                    tls: None,
                    next_connection_delay_ms: 1,
                    connections: rumqttd::ConnectionSettings {
                        connection_timeout_ms: 60000,
                        max_payload_size: 1048576,
                        max_inflight_count: 200,
                        auth: None,
                        external_auth: None,
                        dynamic_filters: true,
                    },
                },
            );
            config.v4 = Some(v4);
            config
        }
    }

    #[async_trait]
    impl BrokerLifecycle for EmbeddedBroker {
        async fn start(&self) -> Result<()> {
            if self.is_running() {
                warn!("Embedded broker is already running");
                return Ok(());
            }

            if tokio::net::TcpStream::connect(self.addr).await.is_ok() {
                info!(
                    "Embedded broker address {} already in use, assuming already running",
                    self.addr
                );
                self.running.store(true, Ordering::Relaxed);
                return Ok(());
            }

            let addr = self.addr;
            let running = self.running.clone();
            running.store(true, Ordering::Relaxed);

            thread::Builder::new()
                .name("devgate-broker".to_string())
                .spawn(move || {
                    info!("Starting embedded MQTT broker on {}", addr);
                    let mut broker = rumqttd::Broker::new(Self::config(addr));
                    match broker.start() {
                        Ok(_) => info!("Embedded MQTT broker stopped"),
                        Err(e) => error!("Embedded MQTT broker error: {}", e),
                    }
                    running.store(false, Ordering::Relaxed);
                })?;

            wait_until_listening(self.addr, STARTUP_LIMIT).await?;
            info!("MQTT message bus broker is started on {}", self.addr);
            Ok(())
        }

        async fn close(&self) {
            if self.running.swap(false, Ordering::Relaxed) {
                info!("Embedded MQTT broker on {} released", self.addr);
            }
        }

        fn address(&self) -> SocketAddr {
            self.addr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_addr() {
        let addr = parse_broker_addr(DEFAULT_BROKER_ADDR).unwrap();
        assert_eq!(addr.port(), 1883);
        assert!(addr.ip().is_loopback());
        assert!(matches!(
            parse_broker_addr("localhost"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_until_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        wait_until_listening(addr, Duration::from_secs(1)).await.unwrap();

        drop(listener);
        let result = wait_until_listening(addr, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::ConnectionFailure(_))));
    }
}
