//! Configuration for the Modbus bridge.

use maison_common::topics::{self, COMMAND_TOPIC, RESPONSE_TOPIC, STATUS_TOPIC};
use maison_common::{BridgeConfig, Error, LoggingConfig, MqttConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusBridgeConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// Modbus device settings
    pub modbus: ModbusConfig,

    /// Topic names
    #[serde(default)]
    pub topics: TopicConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the single field device behind the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-transaction timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Holding register written by commands
    #[serde(default)]
    pub command_register: u16,

    /// Holding register read by the status poller
    #[serde(default)]
    pub status_register: u16,

    /// Status poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_poll_interval() -> u64 {
    5
}

impl ModbusConfig {
    /// Transaction timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/serial0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Topics used by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Inbound commands
    #[serde(default = "default_command_topic")]
    pub command: String,

    /// Command outcomes
    #[serde(default = "default_response_topic")]
    pub response: String,

    /// Periodic status samples
    #[serde(default = "default_status_topic")]
    pub status: String,
}

fn default_command_topic() -> String {
    COMMAND_TOPIC.to_string()
}

fn default_response_topic() -> String {
    RESPONSE_TOPIC.to_string()
}

fn default_status_topic() -> String {
    STATUS_TOPIC.to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            command: default_command_topic(),
            response: default_response_topic(),
            status: default_status_topic(),
        }
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> maison_common::Result<()> {
        self.mqtt.validate()?;

        let modbus = &self.modbus;
        if modbus.unit_id == 0 || modbus.unit_id > 247 {
            return Err(Error::validation(format!(
                "modbus.unit_id must be 1-247 (got {})",
                modbus.unit_id
            )));
        }

        if modbus.timeout_ms == 0 {
            return Err(Error::validation("modbus.timeout_ms must be positive"));
        }

        if modbus.poll_interval_secs == 0 {
            return Err(Error::validation(
                "modbus.poll_interval_secs must be positive",
            ));
        }

        match &modbus.connection {
            ConnectionConfig::Tcp { host, .. } => {
                if host.is_empty() {
                    return Err(Error::validation("modbus.connection.host cannot be empty"));
                }
            }
            ConnectionConfig::Rtu {
                port,
                data_bits,
                parity,
                stop_bits,
                ..
            } => {
                if port.is_empty() {
                    return Err(Error::validation("modbus.connection.port cannot be empty"));
                }
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(Error::validation(format!(
                            "invalid parity '{}' (use none, even, or odd)",
                            parity
                        )));
                    }
                }
                if !(5..=8).contains(data_bits) {
                    return Err(Error::validation(format!(
                        "data_bits must be 5-8 (got {})",
                        data_bits
                    )));
                }
                if !matches!(stop_bits, 1 | 2) {
                    return Err(Error::validation(format!(
                        "stop_bits must be 1 or 2 (got {})",
                        stop_bits
                    )));
                }
            }
        }

        for (name, topic) in [
            ("command", &self.topics.command),
            ("response", &self.topics.response),
            ("status", &self.topics.status),
        ] {
            if !topics::is_valid_topic(topic) {
                return Err(Error::validation(format!(
                    "topics.{} '{}' must be non-empty and contain no wildcards",
                    name, topic
                )));
            }
        }

        Ok(())
    }
}
