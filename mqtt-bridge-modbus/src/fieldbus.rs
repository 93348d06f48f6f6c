//! Serialized register transactions against the single field device.
//!
//! The serial line is half-duplex, so every read or write goes through one
//! lock around the link and is bounded by the configured transaction timeout.

use crate::config::ConnectionConfig;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// Error type for field-bus operations.
#[derive(Debug, thiserror::Error)]
pub enum FieldBusError {
    #[error("Link unavailable: {0}")]
    Link(String),
    #[error("Link not connected")]
    NotConnected,
    #[error("Transaction failed: {0}")]
    Transaction(String),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),
}

impl FieldBusError {
    /// Whether the transport itself could not be opened.
    pub fn is_link(&self) -> bool {
        matches!(self, FieldBusError::Link(_))
    }
}

/// One open connection to the device, able to run single-register
/// transactions.
pub trait RegisterLink: Send + 'static {
    /// Read one holding register.
    fn read_holding(
        &mut self,
        register: u16,
    ) -> impl Future<Output = Result<u16, FieldBusError>> + Send;

    /// Write one holding register.
    fn write_holding(
        &mut self,
        register: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), FieldBusError>> + Send;

    /// Release the underlying transport.
    fn close(&mut self) -> impl Future<Output = Result<(), FieldBusError>> + Send;
}

impl RegisterLink for Context {
    async fn read_holding(&mut self, register: u16) -> Result<u16, FieldBusError> {
        let words = self
            .read_holding_registers(register, 1)
            .await
            .map_err(|e| FieldBusError::Transaction(e.to_string()))?
            .map_err(|e| FieldBusError::Exception(format!("{:?}", e)))?;

        words
            .first()
            .copied()
            .ok_or_else(|| FieldBusError::Transaction("empty register response".to_string()))
    }

    async fn write_holding(&mut self, register: u16, value: u16) -> Result<(), FieldBusError> {
        self.write_single_register(register, value)
            .await
            .map_err(|e| FieldBusError::Transaction(e.to_string()))?
            .map_err(|e| FieldBusError::Exception(format!("{:?}", e)))
    }

    async fn close(&mut self) -> Result<(), FieldBusError> {
        self.disconnect()
            .await
            .map(|_| ())
            .map_err(|e| FieldBusError::Link(e.to_string()))
    }
}

/// Field-bus client shared by the command translator and the status poller.
///
/// Holds at most one link; every transaction takes the link lock for its
/// whole duration, so transactions never interleave.
pub struct FieldBusClient<L> {
    link: Mutex<Option<L>>,
    timeout: Duration,
}

impl<L: RegisterLink> FieldBusClient<L> {
    /// Create a client with no link attached yet.
    pub fn new(timeout: Duration) -> Self {
        Self {
            link: Mutex::new(None),
            timeout,
        }
    }

    /// Per-transaction timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the link with `open` and attach it.
    pub async fn connect<F>(&self, open: F) -> Result<(), FieldBusError>
    where
        F: Future<Output = Result<L, FieldBusError>>,
    {
        let link = open.await?;
        self.attach(link).await;
        Ok(())
    }

    /// Attach an already opened link, replacing any previous one.
    pub async fn attach(&self, link: L) {
        *self.link.lock().await = Some(link);
    }

    /// Read one holding register.
    pub async fn read_register(&self, register: u16) -> Result<u16, FieldBusError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(FieldBusError::NotConnected)?;

        let value = tokio::time::timeout(self.timeout, link.read_holding(register))
            .await
            .map_err(|_| FieldBusError::Timeout(self.timeout))??;

        debug!(register, value, "Read holding register");
        Ok(value)
    }

    /// Write one holding register.
    pub async fn write_register(&self, register: u16, value: u16) -> Result<(), FieldBusError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(FieldBusError::NotConnected)?;

        tokio::time::timeout(self.timeout, link.write_holding(register, value))
            .await
            .map_err(|_| FieldBusError::Timeout(self.timeout))??;

        debug!(register, value, "Wrote holding register");
        Ok(())
    }

    /// Detach and close the link. Waits for any in-flight transaction.
    pub async fn close(&self) -> Result<(), FieldBusError> {
        let link = self.link.lock().await.take();
        match link {
            Some(mut link) => link.close().await,
            None => Ok(()),
        }
    }
}

/// Open a Modbus link to the configured device.
pub async fn open_link(
    connection: &ConnectionConfig,
    unit_id: u8,
    timeout: Duration,
) -> Result<Context, FieldBusError> {
    let slave = Slave(unit_id);

    match connection {
        ConnectionConfig::Tcp { host, port } => {
            let addr = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| FieldBusError::Link(format!("Invalid address: {}", e)))?
                .next()
                .ok_or_else(|| FieldBusError::Link(format!("No address for {}", host)))?;

            let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                .await
                .map_err(|_| FieldBusError::Link("Connection timeout".to_string()))?
                .map_err(|e| FieldBusError::Link(e.to_string()))?;

            info!(%addr, unit_id, "Connected to Modbus TCP device");
            Ok(ctx)
        }
        ConnectionConfig::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let parity = match parity.to_lowercase().as_str() {
                "even" => tokio_serial::Parity::Even,
                "odd" => tokio_serial::Parity::Odd,
                _ => tokio_serial::Parity::None,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(port, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits);

            let serial = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| FieldBusError::Link(format!("Serial open failed: {}", e)))?;

            info!(port = %port, baud_rate, unit_id, "Opened Modbus RTU link");
            Ok(rtu::attach_slave(serial, slave))
        }
    }
}
