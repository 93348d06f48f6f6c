//! MQTT session: publishing, topic dispatch and reconnection.
//!
//! The rumqttc event loop runs on its own task. Inbound publishes are
//! dispatched to their handler inline on that task, so a handler delays
//! further bus I/O until it returns.

use maison_common::{MqttConfig, ReconnectConfig};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a stopping event loop waits for DISCONNECT to reach the broker.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised by the message-bus client.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Request rejected: {0}")]
    Request(String),
    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Gave up reconnecting after {0} consecutive failures")]
    ReconnectLimit(u32),
}

/// Publish/subscribe surface used by the bridge components.
///
/// Both calls only enqueue a request; delivery is best effort.
pub trait MessageBus: Clone + Send + Sync + 'static {
    /// Queue a publish of `payload` on `topic`.
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;

    /// Queue a subscription to `topic`.
    fn subscribe(&self, topic: &str) -> Result<(), BusError>;
}

/// Handle to the broker, cheap to clone and safe to use from any task.
#[derive(Clone, Debug)]
pub struct BusClient {
    client: AsyncClient,
}

impl BusClient {
    fn disconnect(&self) -> Result<(), BusError> {
        self.client
            .try_disconnect()
            .map_err(|e| BusError::Request(e.to_string()))
    }
}

impl MessageBus for BusClient {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BusError::Request(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| BusError::Request(e.to_string()))
    }
}

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Boxed future returned by message handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receiver of messages published on a routed topic.
pub trait MessageHandler: Send + Sync {
    fn on_message<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> HandlerFuture<'a>;
}

/// Topic to handler dispatch table.
#[derive(Clone, Default)]
pub struct Dispatcher {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages on `topic` to `handler`, replacing any previous route.
    pub fn route(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.routes.insert(topic.into(), handler);
    }

    /// Topics that have a handler.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Run the handler for `topic`. Returns false when no route matches.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        match self.routes.get(topic) {
            Some(handler) => {
                handler.on_message(topic, payload).await;
                true
            }
            None => false,
        }
    }
}

/// What to do after the broker connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reconnect after the given delay.
    Retry(Duration),
    /// Stop trying.
    GiveUp,
}

/// Reconnection policy for the broker connection.
///
/// The default reconnects immediately and without limit. That suits one
/// broker on the local network; set a delay and a limit anywhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Decide after `failures` consecutive failed connections.
    pub fn decide(&self, failures: u32) -> ReconnectDecision {
        match self.max_attempts {
            Some(max) if failures > max => ReconnectDecision::GiveUp,
            _ => ReconnectDecision::Retry(self.delay),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

/// Connection-level event handling, independent of the network loop.
pub struct BusSession<B> {
    bus: B,
    dispatcher: Dispatcher,
    policy: ReconnectPolicy,
    failures: u32,
    state: watch::Sender<ConnectionState>,
}

impl<B: MessageBus> BusSession<B> {
    pub fn new(bus: B, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            bus,
            dispatcher: Dispatcher::new(),
            policy,
            failures: 0,
            state,
        }
    }

    /// Route `topic` to `handler`. Routed topics are subscribed on connect.
    pub fn route(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.route(topic, handler);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Consecutive failed connections since the last successful one.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Broker connection state changed");
        }
    }

    /// Connection attempt started.
    pub fn on_connecting(&self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// Broker acknowledged the connection with `code`. Any code other than
    /// success is returned as [`BusError::Refused`] and leaves routes unsubscribed.
    pub fn on_connect(&mut self, code: ConnectReturnCode) -> Result<(), BusError> {
        if code != ConnectReturnCode::Success {
            return Err(BusError::Refused(code));
        }

        info!("Connected to MQTT broker");
        self.failures = 0;
        self.set_state(ConnectionState::Connected);

        for topic in self.dispatcher.topics() {
            match self.bus.subscribe(topic) {
                Ok(()) => info!(topic, "Subscribed to topic"),
                Err(e) => warn!(topic, error = %e, "Failed to subscribe"),
            }
        }
        Ok(())
    }

    /// Dispatch an inbound publish.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) {
        debug!(topic, bytes = payload.len(), "Message received");
        if !self.dispatcher.dispatch(topic, payload).await {
            debug!(topic, "No handler for topic");
        }
    }

    /// The connection failed or dropped.
    pub fn on_disconnect(&mut self, reason: &str) -> ReconnectDecision {
        self.failures = self.failures.saturating_add(1);
        self.set_state(ConnectionState::Disconnected);

        let decision = self.policy.decide(self.failures);
        match decision {
            ReconnectDecision::Retry(delay) => {
                warn!(
                    reason,
                    attempt = self.failures,
                    delay_ms = delay.as_millis() as u64,
                    "Disconnected from MQTT broker, reconnecting"
                );
                self.set_state(ConnectionState::Connecting);
            }
            ReconnectDecision::GiveUp => {
                error!(
                    reason,
                    failures = self.failures,
                    "Disconnected from MQTT broker, giving up"
                );
            }
        }
        decision
    }

    /// Mark the session closed.
    pub fn on_closed(&self) {
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Build rumqttc options from the broker configuration.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or(""));
    }
    options
}

/// Constructor for the rumqttc-backed client and its event loop.
pub struct MqttBus;

impl MqttBus {
    /// Create the client handle and the (not yet running) event loop.
    pub fn new(config: &MqttConfig) -> (BusClient, BusLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), config.request_capacity);
        let bus = BusClient { client };
        let session = BusSession::new(bus.clone(), ReconnectPolicy::from(&config.reconnect));

        info!(
            host = %config.host,
            port = config.port,
            keep_alive_secs = config.keep_alive_secs,
            "MQTT client configured"
        );

        (bus, BusLoop { eventloop, session })
    }
}

/// The MQTT network loop, driven on its own task once spawned.
pub struct BusLoop {
    eventloop: EventLoop,
    session: BusSession<BusClient>,
}

impl BusLoop {
    /// Route `topic` to `handler`.
    pub fn route(&mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.session.route(topic, handler);
    }

    /// Start the loop on a dedicated task.
    pub fn spawn(self) -> BusHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = self.session.watch_state();
        let task = tokio::spawn(self.run(stop_rx));

        BusHandle {
            stop: stop_tx,
            state,
            task,
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), BusError> {
        self.session.on_connecting();

        loop {
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if let Err(e) = self.session.on_connect(ack.code) {
                        warn!(error = %e, "MQTT connection not established");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.session
                        .on_message(&publish.topic, &publish.payload)
                        .await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, codes = ?ack.return_codes, "Subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => match self.session.on_disconnect(&e.to_string()) {
                    ReconnectDecision::Retry(delay) => {
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = stop.changed() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                    ReconnectDecision::GiveUp => {
                        return Err(BusError::ReconnectLimit(self.session.failures()));
                    }
                },
            }
        }

        self.disconnect().await;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.session.state() != ConnectionState::Connected {
            self.session.on_closed();
            return;
        }

        if let Err(e) = self.session.bus.disconnect() {
            warn!(error = %e, "Failed to queue broker disconnect");
            self.session.on_closed();
            return;
        }

        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("Timed out waiting for broker disconnect");
        } else {
            info!("Disconnected from MQTT broker");
        }
        self.session.on_closed();
    }
}

/// Handle to a running bus loop.
pub struct BusHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<Result<(), BusError>>,
}

impl BusHandle {
    /// Current broker connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the loop has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dispatching, disconnect from the broker and wait for the loop
    /// to exit.
    pub async fn stop(mut self) -> Result<(), BusError> {
        let _ = self.stop.send(true);

        match tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT * 2, &mut self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BusError::Connection(format!("bus task failed: {}", e))),
            Err(_) => {
                self.task.abort();
                Err(BusError::Connection("bus task did not stop in time".to_string()))
            }
        }
    }
}
