//! Application configuration file
//!
//! A single TOML file, by default `<config dir>/navwatch/config.toml`.
//! Missing keys fall back to their defaults, so a file containing only
//! `[broker]\naddress = "..."` is valid.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};

use crate::mqtt::{ConnectOptions, MqttConfig, TransportKind};

const CONFIG_DIR: &str = "navwatch";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// tracing level: trace, debug, info, warn or error
    pub log_level: String,
    /// Topics subscribed right after connecting
    pub topics: Vec<String>,
    pub broker: BrokerConfig,
    pub mqtt: MqttConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            topics: vec!["esp32/gps".to_string()],
            broker: BrokerConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

/// Broker the binary connects to on startup.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<TransportKind>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "ws://localhost:9001".to_string(),
            port: None,
            username: None,
            password: None,
            transport: None,
        }
    }
}

impl BrokerConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            transport: self.transport,
            reconnect: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .ok_or_else(|| eyre!("Could not determine a configuration directory"))?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))
    }

    /// Loads `path`, writing a default file first if none exists.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        if !exists {
            warn!(
                "Config file {} does not exist, writing defaults",
                path.display()
            );
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let config = Self::load(path).await?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn log_level(&self) -> Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| eyre!("Invalid log level '{}'", self.log_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::PositionShape;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::load_or_create(&path).await.unwrap();

        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
        assert_eq!(AppConfig::load(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
topics = ["esp32/navire/gps"]

[broker]
address = "mqtts://broker.fleet.local"
username = "bridge"
password = "s3cret"

[mqtt]
default_transport = "secured-socket"

[mqtt.reconnect]
max_retries = 5

[[mqtt.payload.shapes]]
latitude = "y"
longitude = ["x"]
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();

        assert_eq!(config.topics, vec!["esp32/navire/gps".to_string()]);
        assert_eq!(config.broker.username.as_deref(), Some("bridge"));
        assert_eq!(config.mqtt.default_transport, TransportKind::SecuredSocket);
        assert_eq!(config.mqtt.reconnect.max_retries, Some(5));
        assert_eq!(config.mqtt.reconnect.initial_delay_ms, 3000);
        assert_eq!(
            config.mqtt.payload.shapes,
            vec![PositionShape {
                latitude: "y".to_string(),
                longitude: vec!["x".to_string()],
            }]
        );
        assert_eq!(config.mqtt.payload.topic_marker, "gps");
        assert_eq!(config.log_level().unwrap(), Level::INFO);
    }

    #[tokio::test]
    async fn invalid_file_reports_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "topics = 42").await.unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[test]
    fn broker_section_maps_to_connect_options() {
        let broker = BrokerConfig {
            port: Some(8883),
            transport: Some(TransportKind::Secured),
            ..Default::default()
        };
        let options = broker.connect_options();
        assert_eq!(options.port, Some(8883));
        assert_eq!(options.transport, Some(TransportKind::Secured));
        assert_eq!(options.reconnect, None);
    }
}
