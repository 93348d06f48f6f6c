//! Bridge lifecycle: startup ordering, idle wait and ordered shutdown.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusHandle, MessageBus};
use crate::config::ModbusBridgeConfig;
use crate::error::{BridgeError, Result};
use crate::fieldbus::{FieldBusClient, FieldBusError, RegisterLink};
use crate::poller::StatusPoller;
use crate::translator::CommandTranslator;

/// Wake-up period of the idle main task.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Init,
    ConnectingBus,
    ConnectingFieldBus,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Init => "init",
            BridgeState::ConnectingBus => "connecting to broker",
            BridgeState::ConnectingFieldBus => "connecting to field bus",
            BridgeState::Running => "running",
            BridgeState::ShuttingDown => "shutting down",
            BridgeState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why the idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Interrupt signal.
    Signal,
    /// The bus loop exited on its own after giving up reconnecting.
    BusLost,
}

/// Owns the bridge components and drives the lifecycle.
///
/// # Example
///
/// ```ignore
/// let (bus, mut bus_loop) = MqttBus::new(&config.mqtt);
/// let mut supervisor = Supervisor::new(&config, bus);
/// bus_loop.route(&config.topics.command, Arc::new(supervisor.translator()));
/// supervisor.attach_bus(bus_loop.spawn());
/// supervisor.connect_field_bus(open_link(...)).await?;
/// supervisor.start_polling()?;
/// supervisor.run_until(shutdown_signal()).await;
/// supervisor.shutdown().await;
/// ```
pub struct Supervisor<L, B> {
    config: ModbusBridgeConfig,
    field_bus: Arc<FieldBusClient<L>>,
    bus: B,
    bus_handle: Option<BusHandle>,
    state: BridgeState,
    field_bus_ready: bool,
    shutdown_tx: watch::Sender<bool>,
    poller: Option<JoinHandle<()>>,
}

impl<L: RegisterLink, B: MessageBus> Supervisor<L, B> {
    /// Build the components from configuration.
    pub fn new(config: &ModbusBridgeConfig, bus: B) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: config.clone(),
            field_bus: Arc::new(FieldBusClient::new(config.modbus.timeout())),
            bus,
            bus_handle: None,
            state: BridgeState::Init,
            field_bus_ready: false,
            shutdown_tx,
            poller: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Whether the status poller task is alive.
    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn transition(&mut self, to: BridgeState) {
        info!(from = %self.state, to = %to, "Bridge state change");
        self.state = to;
    }

    fn expect_state(&self, allowed: &[BridgeState], expected: BridgeState) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                expected,
                found: self.state,
            })
        }
    }

    /// Command translator wired to this bridge's field bus and broker.
    pub fn translator(&self) -> CommandTranslator<L, B> {
        CommandTranslator::new(
            self.field_bus.clone(),
            self.bus.clone(),
            self.config.modbus.command_register,
            self.config.topics.response.clone(),
        )
    }

    /// Take ownership of the running bus loop.
    ///
    /// The loop keeps connecting in the background; the broker does not
    /// have to be reachable yet.
    pub fn attach_bus(&mut self, handle: BusHandle) {
        self.transition(BridgeState::ConnectingBus);
        self.bus_handle = Some(handle);
    }

    /// Open the field-bus link. Failure is fatal: the bridge terminates and
    /// never starts polling.
    pub async fn connect_field_bus<F>(&mut self, open: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<L, FieldBusError>>,
    {
        self.expect_state(
            &[BridgeState::Init, BridgeState::ConnectingBus],
            BridgeState::ConnectingBus,
        )?;
        self.transition(BridgeState::ConnectingFieldBus);

        match self.field_bus.connect(open).await {
            Ok(()) => {
                info!("Connected to field device");
                self.field_bus_ready = true;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Unable to connect to field device");
                if let Some(handle) = self.bus_handle.take() {
                    if let Err(e) = handle.stop().await {
                        warn!(error = %e, "Error stopping MQTT client");
                    }
                }
                self.transition(BridgeState::Terminated);
                Err(e.into())
            }
        }
    }

    /// Start the status poller on its own task.
    pub fn start_polling(&mut self) -> Result<()> {
        if !self.field_bus_ready || self.state != BridgeState::ConnectingFieldBus {
            return Err(BridgeError::InvalidState {
                expected: BridgeState::ConnectingFieldBus,
                found: self.state,
            });
        }

        let poller = StatusPoller::new(
            self.field_bus.clone(),
            self.bus.clone(),
            self.config.modbus.status_register,
            self.config.topics.status.clone(),
            self.config.modbus.poll_interval(),
        );
        self.poller = Some(tokio::spawn(poller.run(self.shutdown_tx.subscribe())));
        self.transition(BridgeState::Running);
        Ok(())
    }

    /// Idle until `signal` completes or the bus loop gives up.
    pub async fn run_until<S>(&mut self, signal: S) -> StopReason
    where
        S: Future<Output = ()>,
    {
        info!("Bridge running. Press Ctrl+C to stop.");

        tokio::pin!(signal);
        let mut idle = tokio::time::interval(IDLE_TICK);
        let mut last_bus_state = self.bus_handle.as_ref().map(BusHandle::state);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Received shutdown signal");
                    return StopReason::Signal;
                }
                _ = idle.tick() => {
                    let Some(handle) = self.bus_handle.as_ref() else {
                        continue;
                    };
                    if handle.is_finished() {
                        error!("MQTT client stopped");
                        return StopReason::BusLost;
                    }
                    let state = handle.state();
                    if last_bus_state != Some(state) {
                        debug!(bus = %state, "Broker connection state");
                        last_bus_state = Some(state);
                    }
                }
            }
        }
    }

    /// Ordered, best-effort shutdown: bus loop, broker, then field bus.
    pub async fn shutdown(mut self) {
        if self.state == BridgeState::Terminated {
            return;
        }
        self.transition(BridgeState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.bus_handle.take() {
            match handle.stop().await {
                Ok(()) => info!("MQTT client stopped"),
                Err(e) => warn!(error = %e, "Error stopping MQTT client"),
            }
        }

        if let Some(mut poller) = self.poller.take() {
            // An in-flight read finishes or times out before the poller exits.
            let grace = self.field_bus.timeout() + IDLE_TICK;
            if tokio::time::timeout(grace, &mut poller).await.is_err() {
                warn!("Status poller did not stop in time");
                poller.abort();
            }
        }

        match self.field_bus.close().await {
            Ok(()) => info!("Field bus closed"),
            Err(e) => warn!(error = %e, "Error closing field bus"),
        }

        self.transition(BridgeState::Terminated);
        info!("Goodbye!");
    }
}

/// Resolve on Ctrl+C. Other signals keep their default disposition.
pub async fn shutdown_signal() {
    wait_for_interrupt(tokio::signal::ctrl_c()).await
}

/// Resolve once `interrupt` fires. A listener that cannot be installed never
/// resolves, so the bridge keeps running instead of shutting down.
async fn wait_for_interrupt<F>(interrupt: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = interrupt.await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
