//! Bridge configuration, loaded from YAML with environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::topic::DEVICE_PLACEHOLDER;
use crate::triggers::DEFAULT_TRIGGERS;

pub const DEFAULT_NAME: &str = "SleepAsHA";
pub const CONFIG_ENV: &str = "SLEEP_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "sleep_bridge.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "sleep-bridge".to_string(),
            keep_alive_secs: 60,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Instance name, the prefix of every unique id.
    pub name: String,
    pub topic_template: String,
    pub device_placeholder: String,
    pub qos: u8,
    pub mqtt: MqttSettings,
    pub http_port: u16,
    pub db_path: PathBuf,
    pub retention_days: u32,
    /// Trigger types fired on the bus when matched.
    pub triggers: Vec<String>,
    /// Payload key → attribute name copied from tracker state payloads.
    pub attributes: BTreeMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let attributes = [("value1", "timestamp"), ("value2", "label"), ("value3", "value")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            name: DEFAULT_NAME.to_string(),
            topic_template: format!("{}/{}", DEFAULT_NAME, DEVICE_PLACEHOLDER),
            device_placeholder: DEVICE_PLACEHOLDER.to_string(),
            qos: 0,
            mqtt: MqttSettings::default(),
            http_port: 8125,
            db_path: PathBuf::from("sleep_bridge.db"),
            retention_days: 10,
            triggers: DEFAULT_TRIGGERS.iter().map(|t| t.to_string()).collect(),
            attributes,
        }
    }
}

impl BridgeConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Path named by `SLEEP_BRIDGE_CONFIG`, or the default file name.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SLEEP_BRIDGE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SLEEP_BRIDGE_HTTP_PORT") {
            self.http_port = parse_port("SLEEP_BRIDGE_HTTP_PORT", &port)?;
        }
        if let Some(host) = lookup("SLEEP_BRIDGE_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("SLEEP_BRIDGE_MQTT_PORT") {
            self.mqtt.port = parse_port("SLEEP_BRIDGE_MQTT_PORT", &port)?;
        }
        if let Some(db) = lookup("SLEEP_BRIDGE_DB") {
            self.db_path = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.topic_template.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "topic_template must not be empty".to_string(),
            ));
        }
        if self.device_placeholder.is_empty() {
            return Err(ConfigError::Invalid(
                "device_placeholder must not be empty".to_string(),
            ));
        }
        if self
            .topic_template
            .split('/')
            .any(|segment| segment == "+" || segment == "#")
        {
            return Err(ConfigError::Invalid(format!(
                "topic_template '{}' must not contain MQTT wildcards",
                self.topic_template
            )));
        }
        if self.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        Ok(())
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

fn parse_port(key: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} is not a valid port: '{}'", key, raw)))
}
