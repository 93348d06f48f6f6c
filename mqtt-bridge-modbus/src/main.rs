//! MQTT bridge for a Modbus field device.
//!
//! Writes commands received over MQTT to the device and publishes its
//! temperature reading periodically.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_modbus::client::Context as ModbusContext;
use tracing::{error, info};

use maison_common::{BridgeArgs, BridgeConfig, LoggingConfig};
use mqtt_bridge_modbus::bus::{BusClient, MqttBus};
use mqtt_bridge_modbus::config::ModbusBridgeConfig;
use mqtt_bridge_modbus::fieldbus::open_link;
use mqtt_bridge_modbus::supervisor::{StopReason, Supervisor, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("maison-bridge.json5");

    // Load configuration
    let config = ModbusBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    maison_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting mqtt-bridge-modbus");
    info!("Loaded configuration from {:?}", args.config);

    let (bus, mut bus_loop) = MqttBus::new(&config.mqtt);
    let mut supervisor: Supervisor<ModbusContext, BusClient> = Supervisor::new(&config, bus);

    bus_loop.route(
        config.topics.command.clone(),
        Arc::new(supervisor.translator()),
    );
    supervisor.attach_bus(bus_loop.spawn());

    let modbus = &config.modbus;
    if let Err(e) = supervisor
        .connect_field_bus(open_link(
            &modbus.connection,
            modbus.unit_id,
            modbus.timeout(),
        ))
        .await
    {
        error!("Unable to reach the field device, not starting");
        return Err(e).context("Field bus connection failed");
    }

    supervisor.start_polling()?;

    let reason = supervisor.run_until(shutdown_signal()).await;
    supervisor.shutdown().await;

    if reason == StopReason::BusLost {
        anyhow::bail!("MQTT broker unreachable, reconnection limit reached");
    }

    Ok(())
}
