use std::{
    fs,
    sync::Arc,
    time::{Duration, SystemTime},
};

use rumqttc::{
    v5::{
        mqttbytes::{v5::Packet, QoS},
        AsyncClient, Event, EventLoop, MqttOptions,
    },
    TlsConfiguration, Transport,
};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::PublishableMessage;

/// Problems with the broker settings, found at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker address {0}, expected host:port")]
    BrokerAddress(String),
    #[error("could not read {path}: {source}")]
    TlsFile {
        path: String,
        source: std::io::Error,
    },
    #[error("a client certificate and key must be given together")]
    IncompleteClientAuth,
}

/// The chief processor of mqtt traffic, this handles
/// - mqtt state
/// - reception of the telemetry topic, forwarding each payload in arrival order
/// - publishing of anything sent on `mqtt_sender_rx`
pub struct MqttProcessor {
    cancel_token: CancellationToken,
    mqtt_sender_rx: Receiver<PublishableMessage>,
    payload_tx: Sender<Vec<u8>>,
    opts: MqttProcessorOptions,
}

/// processor options, these are static immutable settings
#[derive(Debug, Clone)]
pub struct MqttProcessorOptions {
    /// host:port of the mqtt broker
    pub mqtt_path: String,
    /// client id, a timestamped one is generated if None
    pub client_id: Option<String>,
    /// the telemetry topic to subscribe to
    pub topic: String,
    /// CA certificate (PEM) of the broker, enables TLS
    pub ca_path: Option<String>,
    /// client certificate (PEM) for mutual TLS
    pub cert_path: Option<String>,
    /// client private key (PEM) for mutual TLS
    pub key_path: Option<String>,
}

impl MqttProcessor {
    /// Creates a new mqtt receiver and sender
    pub fn new(
        cancel_token: CancellationToken,
        mqtt_sender_rx: Receiver<PublishableMessage>,
        payload_tx: Sender<Vec<u8>>,
        opts: MqttProcessorOptions,
    ) -> Result<(MqttProcessor, MqttOptions), ConfigError> {
        let (host, port) = parse_broker(&opts.mqtt_path)?;
        let client_id = opts.client_id.clone().unwrap_or_else(|| {
            format!(
                "Parkwatch-{:?}",
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis()
            )
        });

        // create the mqtt client and configure it
        let mut mqtt_opts = MqttOptions::new(client_id, host, port);
        mqtt_opts
            .set_keep_alive(Duration::from_secs(30))
            .set_clean_start(true)
            .set_connection_timeout(3);
        if let Some(transport) = tls_transport(&opts)? {
            mqtt_opts.set_transport(transport);
        }

        Ok((
            MqttProcessor {
                cancel_token,
                mqtt_sender_rx,
                payload_tx,
                opts,
            },
            mqtt_opts,
        ))
    }

    /// This handles the reception and sending of mqtt messages, returns on cancellation
    /// * `eventloop` - The eventloop returned by ::new to connect to.  The loop isnt sync so this is the best that can be done
    /// * `client` - The async mqttt v5 client to use for subscriptions
    pub async fn process_mqtt(mut self, client: Arc<AsyncClient>, mut eventloop: EventLoop) {
        // nothing more to publish once every sender is gone
        let mut sender_open = true;
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Shutting down MQTT processor!");
                    if let Err(err) = client.disconnect().await {
                        trace!("Disconnect failed: {}", err);
                    }
                    break;
                },
                msg = eventloop.poll() => match msg {
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        trace!("Received {} bytes on {:?}", msg.payload.len(), msg.topic);
                        if let Err(err) = self.payload_tx.send(msg.payload.to_vec()).await {
                            warn!("Error forwarding message received! {}", err);
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // clean start drops subscriptions, so renew them on every connect
                        info!("Connected to {}, subscribing to {}", self.opts.mqtt_path, self.opts.topic);
                        if let Err(err) = client.subscribe(self.opts.topic.clone(), QoS::AtMostOnce).await {
                            warn!("Could not subscribe to {}: {}", self.opts.topic, err);
                        }
                    }
                    Err(e) => {
                        trace!("Recieved error: {}", e);
                        // back off so a dead broker does not spin the loop
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    _ => {}
                },
                sendable = self.mqtt_sender_rx.recv(), if sender_open => {
                    match sendable {
                        Some(sendable) => {
                            trace!("Sending {:?}", sendable.topic);
                            let Ok(_) = client.publish(sendable.topic, QoS::AtLeastOnce, false, sendable.payload).await else {
                                warn!("Failed to send MQTT message!");
                                continue;
                            };
                        },
                        None => {
                            debug!("No publishers left");
                            sender_open = false;
                        },
                    }
                }
            }
        }
    }
}

/// Splits host:port
pub fn parse_broker(mqtt_path: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = mqtt_path
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::BrokerAddress(mqtt_path.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::BrokerAddress(mqtt_path.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::BrokerAddress(mqtt_path.to_string()));
    }
    Ok((host.to_string(), port))
}

fn read_pem(path: &str) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::TlsFile {
        path: path.to_string(),
        source,
    })
}

/// TLS settings, None when no CA is configured
fn tls_transport(opts: &MqttProcessorOptions) -> Result<Option<Transport>, ConfigError> {
    let Some(ca_path) = &opts.ca_path else {
        return Ok(None);
    };
    let client_auth = match (&opts.cert_path, &opts.key_path) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        (None, None) => None,
        _ => return Err(ConfigError::IncompleteClientAuth),
    };

    Ok(Some(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: read_pem(ca_path)?,
        alpn: None,
        client_auth,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> MqttProcessorOptions {
        MqttProcessorOptions {
            mqtt_path: "localhost:1883".to_string(),
            client_id: None,
            topic: "vehicle/telemetry".to_string(),
            ca_path: None,
            cert_path: None,
            key_path: None,
        }
    }

    #[test]
    fn parses_broker_address() {
        assert_eq!(
            parse_broker("localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("a1b2c3-ats.iot.ap-northeast-2.amazonaws.com:8883").unwrap(),
            ("a1b2c3-ats.iot.ap-northeast-2.amazonaws.com".to_string(), 8883)
        );
        assert!(parse_broker("localhost").is_err());
        assert!(parse_broker("localhost:port").is_err());
        assert!(parse_broker(":1883").is_err());
    }

    #[test]
    fn plain_transport_without_ca() {
        assert!(tls_transport(&opts()).unwrap().is_none());
    }

    #[test]
    fn client_auth_needs_both_halves() {
        let mut opts = opts();
        opts.ca_path = Some("/nonexistent/ca.pem".to_string());
        opts.cert_path = Some("/nonexistent/cert.pem".to_string());
        assert!(matches!(
            tls_transport(&opts),
            Err(ConfigError::IncompleteClientAuth)
        ));
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let mut opts = opts();
        opts.ca_path = Some("/nonexistent/ca.pem".to_string());
        assert!(matches!(
            tls_transport(&opts),
            Err(ConfigError::TlsFile { .. })
        ));
    }
}
