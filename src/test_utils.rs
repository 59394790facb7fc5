//! Test utilities and mock implementations.
//!
//! Mock handlers, publishers, and subscribers for exercising the core
//! without a real transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::context::Context;
use crate::event::Event;
use crate::handlers::{EventHandler, HandlerError};
use crate::transport::{Publisher, Result as TransportResult, Subscriber, TransportError};

/// Handler counting its invocations.
pub struct CountingHandler {
    name: String,
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter, for asserting after dispatch.
    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: Arc<Context>, _event: Arc<Event>) -> Result<Value, HandlerError> {
        let seen = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!(seen))
    }
}

/// Handler recording every event it receives.
pub struct RecordingHandler {
    name: String,
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared record of received events.
    pub fn events(&self) -> Arc<Mutex<Vec<Event>>> {
        self.events.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*event).clone());
        Ok(Value::Null)
    }
}

/// Publisher recording what it was asked to publish.
pub struct RecordingPublisher {
    name: String,
    published: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl RecordingPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared record of `(channel, payload)` pairs.
    pub fn published(&self) -> Arc<Mutex<Vec<(String, Bytes)>>> {
        self.published.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> TransportResult<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_string(), payload));
        Ok(())
    }
}

/// Publisher that always fails, for fan-out isolation tests.
pub struct FailingPublisher {
    name: String,
}

impl FailingPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Publisher for FailingPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, _channel: &str, _payload: Bytes) -> TransportResult<()> {
        Err(TransportError::Send("publisher is down".to_string()))
    }
}

/// Subscriber yielding a preset batch once, then nothing.
pub struct StaticSubscriber {
    name: String,
    batch: Mutex<Option<Vec<Event>>>,
}

impl StaticSubscriber {
    pub fn new(name: impl Into<String>, batch: Vec<Event>) -> Self {
        Self {
            name: name.into(),
            batch: Mutex::new(Some(batch)),
        }
    }
}

#[async_trait]
impl Subscriber for StaticSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> TransportResult<Vec<Event>> {
        Ok(self
            .batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default())
    }
}

/// Subscriber that always fails, for poll isolation tests.
pub struct FailingSubscriber {
    name: String,
}

impl FailingSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Subscriber for FailingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> TransportResult<Vec<Event>> {
        Err(TransportError::Recv("subscriber is down".to_string()))
    }
}
