//! Configuration loading and validation
//!
//! The native format is TOML. A legacy `configuration.json` (selected by the
//! `.json` extension) is converted into the same structure.

use anyhow::{bail, Context, Result};
use localizer_core::{DispatcherConfig, SensorIdentity, OREGON_FAMILY_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Time-series sink; the bridge runs MQTT-only when absent
    #[serde(default)]
    pub influx: Option<InfluxConfig>,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Topic rtl_433 publishes decoded events on
    #[serde(default = "default_subscribe_topic")]
    pub subscribe_topic: String,
    /// Prefix of every republished `<floor>/<location>/<metric>` topic
    #[serde(default = "default_publish_topic_base")]
    pub publish_topic_base: String,
    /// Republish per-metric documents (disable for an InfluxDB-only bridge)
    #[serde(default = "default_true")]
    pub republish: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            subscribe_topic: default_subscribe_topic(),
            publish_topic_base: default_publish_topic_base(),
            republish: true,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "DFS-low_energy_sensor_localizer".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_subscribe_topic() -> String {
    "rtl_433/events".to_string()
}

fn default_publish_topic_base() -> String {
    "home".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Model name prefix of the supported sensor family
    #[serde(default = "default_family_prefix")]
    pub family_prefix: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            family_prefix: default_family_prefix(),
        }
    }
}

fn default_family_prefix() -> String {
    OREGON_FAMILY_PREFIX.to_string()
}

/// InfluxDB v2 write configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Server URL (e.g., "http://localhost:8086")
    pub url: String,
    pub organization: String,
    pub bucket: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// API token; usually supplied with `-t` or `INFLUX_TOKEN` instead
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_measurement() -> String {
    "oregon".to_string()
}

impl Config {
    /// Dispatcher settings derived from this configuration
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            topic_base: self.mqtt.publish_topic_base.clone(),
            measurement: self
                .influx
                .as_ref()
                .map(|i| i.measurement.clone())
                .unwrap_or_else(default_measurement),
            retain: true,
        }
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            bail!("mqtt.host must not be empty");
        }
        if self.mqtt.subscribe_topic.is_empty() {
            bail!("mqtt.subscribe_topic must not be empty");
        }
        if self.mqtt.keep_alive_secs < 5 {
            bail!("mqtt.keep_alive_secs must be at least 5");
        }
        if let Some(influx) = &self.influx {
            for (name, value) in [
                ("url", &influx.url),
                ("organization", &influx.organization),
                ("bucket", &influx.bucket),
                ("measurement", &influx.measurement),
            ] {
                if value.is_empty() {
                    bail!("influx.{} must not be empty", name);
                }
            }
        }
        if !self.mqtt.republish && self.influx.is_none() {
            bail!("Nothing to publish to: mqtt.republish is off and no [influx] section is configured");
        }
        Ok(())
    }

    /// Fill in the InfluxDB token, failing if a storage sink needs one and none is known
    pub fn resolve_influx_token(&mut self, token: Option<String>) -> Result<()> {
        let Some(influx) = self.influx.as_mut() else {
            return Ok(());
        };
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            influx.token = Some(token);
        }
        if influx.token.as_deref().map_or(true, str::is_empty) {
            bail!("InfluxDB token not found (use -t or the INFLUX_TOKEN environment variable)");
        }
        Ok(())
    }
}

/// `configuration.json` layout used by earlier deployments
#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    oregon: Vec<LegacySensor>,
    mqtt_server: String,
    rtl_433_topic: String,
    mqtt_send_topic_base: String,
    #[serde(default)]
    influx_server: Option<String>,
    #[serde(default)]
    influx_organization: String,
    #[serde(default)]
    influx_bucket: String,
    #[serde(default)]
    influx_measurement: String,
}

#[derive(Debug, Deserialize)]
struct LegacySensor {
    channel: i64,
    id: i64,
    floor: String,
    location: String,
}

impl LegacyConfig {
    fn into_config(self) -> Result<Config> {
        let (host, port) = parse_broker_url(&self.mqtt_server)?;
        let influx = self
            .influx_server
            .filter(|s| !s.is_empty())
            .map(|url| InfluxConfig {
                url,
                organization: self.influx_organization,
                bucket: self.influx_bucket,
                measurement: self.influx_measurement,
                token: None,
            });

        Ok(Config {
            mqtt: MqttConfig {
                host,
                port,
                subscribe_topic: self.rtl_433_topic,
                publish_topic_base: self.mqtt_send_topic_base,
                ..MqttConfig::default()
            },
            classifier: ClassifierConfig::default(),
            influx,
            sensors: self
                .oregon
                .into_iter()
                .map(|s| SensorIdentity {
                    channel: s.channel,
                    id: s.id,
                    floor: s.floor,
                    location: s.location,
                    id_display: None,
                })
                .collect(),
        })
    }
}

/// Split a broker URL like `tcp://host:1883` into host and port
///
/// Only plaintext schemes are accepted; `ssl://`, `mqtts://` and websocket
/// URLs are rejected rather than silently connected without TLS.
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let rest = match url.split_once("://") {
        Some((scheme, rest)) => {
            if !(scheme.eq_ignore_ascii_case("tcp") || scheme.eq_ignore_ascii_case("mqtt")) {
                bail!("Unsupported broker URL scheme {:?} in {:?}", scheme, url);
            }
            rest
        }
        None => url,
    }
    .trim_end_matches('/');

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .with_context(|| format!("Unterminated IPv6 address in broker URL {:?}", url))?;
        let port = match after {
            "" => None,
            p => Some(
                p.strip_prefix(':')
                    .with_context(|| format!("Invalid broker URL {:?}", url))?,
            ),
        };
        (host, port)
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        bail!("Missing host in broker URL {:?}", url);
    }
    let port = match port {
        Some(p) => p
            .parse()
            .with_context(|| format!("Invalid port in broker URL {:?}", url))?,
        None => default_port(),
    };
    Ok((host.to_string(), port))
}

/// Load configuration from file
///
/// A missing or malformed file is an error; the daemon cannot run without
/// a sensor list.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config = if is_json {
        let legacy: LegacyConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        legacy.into_config()?
    } else {
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
    };

    config.validate()?;
    info!(
        path = %path.display(),
        sensors = config.sensors.len(),
        influx = config.influx.is_some(),
        "Loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const FULL: &str = r#"
[mqtt]
host = "broker.lan"
port = 1884
subscribe_topic = "rtl_433/+/events"
publish_topic_base = "home/"

[influx]
url = "http://influx.lan:8086"
organization = "home"
bucket = "sensors"
measurement = "climate"

[[sensor]]
channel = 2
id = 5
floor = "2"
location = "office"
id_display = 42
"#;

    #[test]
    fn test_load_toml() {
        let file = write_temp(".toml", FULL);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.client_id, "DFS-low_energy_sensor_localizer");
        assert!(config.mqtt.republish);
        assert_eq!(config.classifier.family_prefix, "Oregon");
        assert_eq!(config.sensors.len(), 1);
        assert_eq!(config.sensors[0].id_display, Some(42));

        let d = config.dispatcher_config();
        assert_eq!(d.topic_base, "home/");
        assert_eq!(d.measurement, "climate");
        assert!(d.retain);
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(include_str!("../../../localizer.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensors.len(), 2);
        assert!(config.influx.is_some());
    }

    #[test]
    fn test_defaults_without_influx() {
        let file = write_temp(".toml", "[[sensor]]\nchannel = 1\nid = 3\nfloor = \"0\"\nlocation = \"hall\"\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.subscribe_topic, "rtl_433/events");
        assert!(config.influx.is_none());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        assert!(load_config(Path::new("/nonexistent/localizer.toml")).is_err());
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let file = write_temp(".toml", "[mqtt\nhost = ");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_validation() {
        let file = write_temp(
            ".toml",
            "[influx]\nurl = \"\"\norganization = \"o\"\nbucket = \"b\"\n",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("influx.url"));

        let file = write_temp(".toml", "[mqtt]\nrepublish = false\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_legacy_json() {
        let json = r#"{
            "oregon": [
                {"channel": 1, "id": 12, "floor": "0", "location": "kitchen"},
                {"channel": 2, "id": 5, "floor": "2", "location": "office"}
            ],
            "mqtt_server": "tcp://192.168.1.10:1883",
            "rtl_433_topic": "rtl_433/events",
            "mqtt_send_topic_base": "home",
            "influx_server": "http://192.168.1.10:8086",
            "influx_organization": "home",
            "influx_bucket": "oregon",
            "influx_measurement": "sensors"
        }"#;
        let file = write_temp(".json", json);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.mqtt.host, "192.168.1.10");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.publish_topic_base, "home");
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].id_display, None);

        let influx = config.influx.unwrap();
        assert_eq!(influx.bucket, "oregon");
        assert_eq!(influx.measurement, "sensors");
    }

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://broker:1883").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt.lan").unwrap(),
            ("mqtt.lan".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.lan/").unwrap(),
            ("broker.lan".to_string(), 1883)
        );
        assert!(parse_broker_url("tcp://broker:abc").is_err());
        assert!(parse_broker_url("").is_err());
        assert!(parse_broker_url("tcp://:1883").is_err());
    }

    #[test]
    fn test_parse_broker_url_rejects_tls_schemes() {
        for url in ["ssl://broker:8883", "mqtts://broker:8883", "ws://broker:80", "tls://broker"] {
            let err = parse_broker_url(url).unwrap_err();
            assert!(err.to_string().contains("Unsupported broker URL scheme"), "{}", url);
        }
    }

    #[test]
    fn test_parse_broker_url_ipv6() {
        assert_eq!(
            parse_broker_url("tcp://[fd00::1]:1884").unwrap(),
            ("fd00::1".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_url("[::1]").unwrap(),
            ("::1".to_string(), 1883)
        );
        assert!(parse_broker_url("tcp://[::1").is_err());
        assert!(parse_broker_url("tcp://[::1]1883").is_err());
    }

    #[test]
    fn test_resolve_influx_token() {
        let file = write_temp(".toml", FULL);
        let mut config = load_config(file.path()).unwrap();

        assert!(config.clone().resolve_influx_token(None).is_err());
        assert!(config.clone().resolve_influx_token(Some(String::new())).is_err());

        config.resolve_influx_token(Some("secret".to_string())).unwrap();
        assert_eq!(config.influx.unwrap().token.as_deref(), Some("secret"));

        // No influx section, no token needed
        let mut config = Config::default();
        config.resolve_influx_token(None).unwrap();
    }
}
