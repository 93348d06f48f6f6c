//! Periodic status sampling and publishing.

use crate::bus::MessageBus;
use crate::fieldbus::{FieldBusClient, FieldBusError, RegisterLink};
use maison_common::topics::{scale_status, status_payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reads the status register on a fixed period and publishes the scaled value.
pub struct StatusPoller<L, B> {
    field_bus: Arc<FieldBusClient<L>>,
    bus: B,
    register: u16,
    topic: String,
    interval: Duration,
}

impl<L: RegisterLink, B: MessageBus> StatusPoller<L, B> {
    pub fn new(
        field_bus: Arc<FieldBusClient<L>>,
        bus: B,
        register: u16,
        topic: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            field_bus,
            bus,
            register,
            topic: topic.into(),
            interval,
        }
    }

    /// Run the polling loop until `shutdown` turns true.
    ///
    /// The sleep between cycles is the same whether the read succeeded or
    /// not, and is checked for shutdown only between cycles.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            register = self.register,
            topic = %self.topic,
            interval_secs = self.interval.as_secs_f64(),
            "Starting status poller"
        );

        while !*shutdown.borrow() {
            if let Err(e) = self.poll_once().await {
                warn!(register = self.register, error = %e, "Status read failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Status poller stopped");
    }

    /// Perform a single poll cycle, returning the published value.
    pub async fn poll_once(&self) -> Result<f64, FieldBusError> {
        let raw = self.field_bus.read_register(self.register).await?;
        let celsius = scale_status(raw);
        info!(raw, celsius, "Temperature read");

        if let Err(e) = self.bus.publish(&self.topic, status_payload(celsius)) {
            warn!(topic = %self.topic, error = %e, "Failed to publish status");
        } else {
            debug!(topic = %self.topic, "Published status");
        }

        Ok(celsius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLink, RecordingBus};

    async fn poller(
        link: &MockLink,
        bus: &RecordingBus,
    ) -> StatusPoller<MockLink, RecordingBus> {
        let field_bus = Arc::new(FieldBusClient::new(Duration::from_secs(3)));
        field_bus.attach(link.clone()).await;
        StatusPoller::new(
            field_bus,
            bus.clone(),
            0,
            "maison/statut",
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_poll_once_scales_and_publishes() {
        let link = MockLink::new();
        link.set_register(0, 257);
        let bus = RecordingBus::new();

        let value = poller(&link, &bus).await.poll_once().await.unwrap();
        assert_eq!(value, 25.7);
        assert_eq!(bus.published_on("maison/statut"), vec!["Température: 25.7°C"]);
    }

    #[tokio::test]
    async fn test_poll_once_failure_publishes_nothing() {
        let link = MockLink::new();
        link.fail_next_reads(1);
        let bus = RecordingBus::new();

        assert!(poller(&link, &bus).await.poll_once().await.is_err());
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_cadence() {
        let link = MockLink::new();
        link.set_register(0, 200);
        let bus = RecordingBus::new();
        let poller = poller(&link, &bus).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(poller.run(shutdown_rx));
        // Samples at t = 0, 5, 10.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(bus.published_on("maison/statut").len(), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(link.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_polling() {
        let link = MockLink::new();
        link.set_register(0, 215);
        link.fail_next_reads(1);
        let bus = RecordingBus::new();
        let poller = poller(&link, &bus).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(poller.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(link.reads(), 3);
        assert_eq!(
            bus.published_on("maison/statut"),
            vec!["Température: 21.5°C", "Température: 21.5°C"]
        );
    }

    #[tokio::test]
    async fn test_already_shut_down_never_polls() {
        let link = MockLink::new();
        let bus = RecordingBus::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        poller(&link, &bus).await.run(shutdown_rx).await;
        assert_eq!(link.reads(), 0);
    }
}
