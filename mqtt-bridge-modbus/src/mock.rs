//! In-memory stand-ins for the field device and the broker, used by tests.

use crate::bus::{BusError, MessageBus};
use crate::fieldbus::{FieldBusError, RegisterLink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Mock register link backed by a register map.
#[derive(Clone, Default)]
pub struct MockLink {
    inner: Arc<Mutex<MockLinkInner>>,
}

#[derive(Default)]
struct MockLinkInner {
    registers: HashMap<u16, u16>,
    writes: Vec<(u16, u16)>,
    reads: usize,
    failing_reads: usize,
    failing_writes: usize,
    latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
    closed: bool,
}

impl MockLink {
    /// Create an empty mock link; unset registers read as zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockLinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the value of a register.
    pub fn set_register(&self, register: u16, value: u16) {
        self.lock().registers.insert(register, value);
    }

    /// Delay every transaction by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.lock().failing_reads = count;
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// All writes received so far, as `(register, value)`.
    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.lock().writes.clone()
    }

    /// Number of read attempts so far.
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    /// Number of completed transactions of either kind.
    pub fn transactions(&self) -> usize {
        let inner = self.lock();
        inner.reads + inner.writes.len()
    }

    /// Highest number of transactions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Whether the link was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn begin(&self) -> Duration {
        let mut inner = self.lock();
        inner.in_flight += 1;
        inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        inner.latency
    }

    async fn settle(&self) {
        let latency = self.begin();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl RegisterLink for MockLink {
    async fn read_holding(&mut self, register: u16) -> Result<u16, FieldBusError> {
        self.settle().await;

        let mut inner = self.lock();
        inner.in_flight -= 1;
        inner.reads += 1;
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(FieldBusError::Transaction("injected read failure".to_string()));
        }
        Ok(inner.registers.get(&register).copied().unwrap_or(0))
    }

    async fn write_holding(&mut self, register: u16, value: u16) -> Result<(), FieldBusError> {
        self.settle().await;

        let mut inner = self.lock();
        inner.in_flight -= 1;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(FieldBusError::Exception("IllegalDataValue".to_string()));
        }
        inner.writes.push((register, value));
        inner.registers.insert(register, value);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FieldBusError> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Message bus that records everything instead of talking to a broker.
#[derive(Clone, Default)]
pub struct RecordingBus {
    inner: Arc<Mutex<RecordingBusInner>>,
}

#[derive(Default)]
struct RecordingBusInner {
    published: Vec<(String, String)>,
    subscriptions: Vec<String>,
    reject_publish: bool,
}

impl RecordingBus {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingBusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject every publish, as a full request queue would.
    pub fn reject_publish(&self, reject: bool) {
        self.lock().reject_publish = reject;
    }

    /// Every publish so far, as `(topic, payload)`.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Payloads published on `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Every subscribe request so far, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        let mut inner = self.lock();
        if inner.reject_publish {
            return Err(BusError::Request("request queue full".to_string()));
        }
        inner.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.lock().subscriptions.push(topic.to_string());
        Ok(())
    }
}
