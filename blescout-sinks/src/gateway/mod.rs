//! Where snapshots get forwarded to: an HTTP endpoint or an MQTT broker.

pub mod http;
pub mod mqtt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use blescout_domain::advertising::AdvertisingPayload;
use blescout_domain::device::Device;

pub const DEFAULT_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    Http {
        endpoint: String,
    },
    Mqtt {
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        topic: String,
        #[serde(default)]
        tls: bool,
    },
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_interval_seconds() -> u64 {
    DEFAULT_INTERVAL_SECONDS
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub transport: Transport,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl GatewayConfig {
    pub fn http(endpoint: impl Into<String>) -> GatewayConfig {
        GatewayConfig::new(Transport::Http {
            endpoint: endpoint.into(),
        })
    }

    pub fn mqtt(
        broker: impl Into<String>,
        port: u16,
        topic: impl Into<String>,
        tls: bool,
    ) -> GatewayConfig {
        GatewayConfig::new(Transport::Mqtt {
            broker: broker.into(),
            port,
            topic: topic.into(),
            tls,
        })
    }

    fn new(transport: Transport) -> GatewayConfig {
        GatewayConfig {
            transport,
            username: None,
            password: None,
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: Option<String>,
        password: Option<String>,
    ) -> GatewayConfig {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> GatewayConfig {
        self.interval_seconds = seconds;
        self
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.interval_seconds == 0 {
            return Err(GatewayError::InvalidConfig(
                "interval must be at least one second".to_string(),
            ));
        }
        match &self.transport {
            Transport::Http { endpoint } => {
                let url = reqwest::Url::parse(endpoint).map_err(|err| {
                    GatewayError::InvalidConfig(format!("endpoint {endpoint}: {err}"))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(GatewayError::InvalidConfig(format!(
                        "endpoint {endpoint}: unsupported scheme {}",
                        url.scheme()
                    )));
                }
            }
            Transport::Mqtt {
                broker, port, topic, ..
            } => {
                if broker.trim().is_empty() {
                    return Err(GatewayError::InvalidConfig("missing MQTT broker".to_string()));
                }
                if *port == 0 {
                    return Err(GatewayError::InvalidConfig("MQTT port 0".to_string()));
                }
                if topic.trim().is_empty() {
                    return Err(GatewayError::InvalidConfig("missing MQTT topic".to_string()));
                }
            }
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(GatewayError::InvalidConfig(
                "password given without a username".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid gateway config: {0}")]
    InvalidConfig(String),
    #[error("gateway answered HTTP {0}")]
    Status(u16),
    #[error("disconnected")]
    NotConnected,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mqtt: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// State of the link to the gateway, as seen by its publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    Connecting,
    Up,
    Down(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, body: Vec<u8>) -> Result<(), GatewayError>;
    async fn close(&self);
    fn link(&self) -> watch::Receiver<Link>;
}

/// Opens a publisher for `config`. Validates first.
pub fn connect(config: &GatewayConfig) -> Result<Arc<dyn Publisher>, GatewayError> {
    config.validate()?;
    match &config.transport {
        Transport::Http { endpoint } => Ok(Arc::new(http::HttpPublisher::new(
            endpoint,
            config.username.clone(),
            config.password.clone(),
        )?)),
        Transport::Mqtt {
            broker,
            port,
            topic,
            tls,
        } => Ok(Arc::new(mqtt::MqttPublisher::connect(
            broker,
            *port,
            topic,
            *tls,
            config.username.clone(),
            config.password.clone(),
        ))),
    }
}

/// One device as the gateway receives it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GatewayDevice {
    #[serde(rename = "id")]
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertising: AdvertisingPayload,
}

impl From<&Device> for GatewayDevice {
    fn from(device: &Device) -> GatewayDevice {
        GatewayDevice {
            address: device.address.clone(),
            name: device.name.clone(),
            rssi: device.rssi,
            advertising: device.advertising.trimmed(),
        }
    }
}

/// JSON array body for one publish.
pub fn encode(devices: &[Device]) -> Result<Vec<u8>, GatewayError> {
    let devices: Vec<GatewayDevice> = devices.iter().map(GatewayDevice::from).collect();
    Ok(serde_json::to_vec(&devices)?)
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    use blescout_domain::advertising::AdvertisingPayload;
    use blescout_domain::device::Device;
    use blescout_domain::discover::DiscoveryEvent;

    use super::{GatewayConfig, GatewayError, Transport, encode};

    #[test]
    fn body_uses_id_and_trims_padding() {
        let advertising = AdvertisingPayload {
            local_name: Some("Tag".to_string()),
            manufacturer_data: Some(vec![0x4C, 0x00, 0x12, 0x00, 0x00]),
            raw_data: Some(vec![0x02, 0x01, 0x06, 0x00]),
            ..AdvertisingPayload::default()
        };
        let event = DiscoveryEvent::new(
            Utc.timestamp_opt(1, 0).unwrap(),
            "AA:BB:CC:DD:EE:FF",
            -48,
            advertising,
        );
        let device = Device::from_event(&event, 0);

        let body: Value = serde_json::from_slice(&encode(&[device]).unwrap()).unwrap();
        let first = &body[0];
        assert_eq!(first["id"], json!("AA:BB:CC:DD:EE:FF"));
        assert_eq!(first["name"], json!("Tag"));
        assert_eq!(first["rssi"], json!(-48));
        assert_eq!(first["advertising"]["manufacturerData"], json!([0x4C, 0x00, 0x12]));
        assert_eq!(first["advertising"]["rawData"], json!([0x02, 0x01, 0x06]));
        assert!(first.get("address").is_none());
    }

    #[test]
    fn empty_snapshot_is_an_empty_array() {
        assert_eq!(encode(&[]).unwrap(), b"[]");
    }

    #[test]
    fn config_defaults_from_json() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"transport":{"kind":"mqtt","broker":"localhost","topic":"ble/scan"}}"#,
        )
        .unwrap();
        assert_eq!(config.interval_seconds, 10);
        assert_eq!(
            config.transport,
            Transport::Mqtt {
                broker: "localhost".to_string(),
                port: 1883,
                topic: "ble/scan".to_string(),
                tls: false,
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_config() {
        let bad = [
            GatewayConfig::http("not a url"),
            GatewayConfig::http("ftp://example.com/in"),
            GatewayConfig::http("http://example.com/in").with_interval_seconds(0),
            GatewayConfig::mqtt("", 1883, "t", false),
            GatewayConfig::mqtt("broker", 1883, " ", false),
            GatewayConfig::http("http://example.com/in")
                .with_credentials(None, Some("secret".to_string())),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(GatewayError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn blank_credentials_are_dropped() {
        let config = GatewayConfig::http("https://example.com/in")
            .with_credentials(Some(String::new()), Some(String::new()));
        assert_eq!(config.username, None);
        assert_eq!(config.password, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn status_error_names_the_code() {
        assert_eq!(GatewayError::Status(500).to_string(), "gateway answered HTTP 500");
        assert_eq!(GatewayError::NotConnected.to_string(), "disconnected");
    }
}
