use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// MQTT broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Optional username for broker authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for broker authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Capacity of the outgoing request queue.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    /// Reconnection behaviour after the broker connection drops.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "maison-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    10
}

impl MqttConfig {
    /// Create a configuration for a broker with every other field defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
            request_capacity: default_request_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Validate broker settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::validation("mqtt.host cannot be empty"));
        }
        if self.client_id.is_empty() {
            return Err(Error::validation("mqtt.client_id cannot be empty"));
        }
        if self.keep_alive_secs < 5 {
            return Err(Error::validation(format!(
                "mqtt.keep_alive_secs must be at least 5 (got {})",
                self.keep_alive_secs
            )));
        }
        if self.request_capacity == 0 {
            return Err(Error::validation("mqtt.request_capacity must be positive"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::validation("mqtt.password requires mqtt.username"));
        }
        Ok(())
    }
}

/// Reconnection settings for the broker connection.
///
/// The defaults reconnect immediately and forever, which is only sensible
/// for a single broker on the local network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before each reconnection attempt, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,

    /// Give up after this many consecutive failed attempts.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Trait for bridge configuration types.
///
/// Implementors get JSON5 loading with validation and access to the shared
/// broker and logging sections.
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the MQTT broker configuration.
    fn mqtt(&self) -> &MqttConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Validate the configuration.
    ///
    /// Called automatically after loading.
    fn validate(&self) -> Result<()> {
        self.mqtt().validate()
    }

    /// Load configuration from a JSON5 file and validate it.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");

        Ok(config)
    }
}

/// Load a configuration file in JSON5 format without validation.
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: DeserializeOwned>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    impl BridgeConfig for TestConfig {
        fn mqtt(&self) -> &MqttConfig {
            &self.mqtt
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }
    }

    #[test]
    fn test_parse_mqtt_config() {
        let json5 = r#"
        {
            mqtt: {
                host: "192.168.101.39",
                port: 8883,
                username: "bridge",
                password: "secret",
                reconnect: { delay_ms: 500, max_attempts: 20 },
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();

        assert_eq!(config.mqtt.host, "192.168.101.39");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.mqtt.reconnect.delay_ms, 500);
        assert_eq!(config.mqtt.reconnect.max_attempts, Some(20));
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config: TestConfig = parse_config(r#"{ mqtt: { host: "localhost" } }"#).unwrap();

        assert_eq!(config.mqtt, MqttConfig::new("localhost"));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.reconnect, ReconnectConfig::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_json_logging_format() {
        let json5 = r#"
        {
            mqtt: { host: "localhost" },
            logging: {
                level: "debug",
                format: "json",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_keep_alive() {
        let mut mqtt = MqttConfig::new("localhost");
        mqtt.keep_alive_secs = 2;
        assert!(matches!(mqtt.validate(), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_password_without_username() {
        let mut mqtt = MqttConfig::new("localhost");
        mqtt.password = Some("secret".to_string());
        assert!(mqtt.validate().is_err());
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }
}
