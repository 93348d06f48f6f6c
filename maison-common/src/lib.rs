//! Maison Common Library
//!
//! Shared pieces of the maison MQTT bridge:
//!
//! - [`config`] - Configuration loading (JSON5 format) and the [`BridgeConfig`] trait
//! - [`topics`] - Topic names and the response/status payload vocabulary
//! - [`args`] - Command-line arguments
//! - [`error`] - Error types

pub mod args;
pub mod config;
pub mod error;
pub mod topics;

pub use args::BridgeArgs;
pub use config::{
    BridgeConfig, LogFormat, LoggingConfig, MqttConfig, ReconnectConfig, load_config,
    parse_config,
};
pub use error::{Error, Result};
pub use topics::{COMMAND_TOPIC, RESPONSE_TOPIC, Response, STATUS_TOPIC};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use maison_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
