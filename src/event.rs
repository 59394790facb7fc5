//! Event record: the typed, addressed unit of work flowing through the system.
//!
//! Events are immutable after construction from the perspective of handlers.
//! Only the owning queue and trigger logic mutate scheduling state
//! (`next_fire_time`, trigger counters), and always on a fresh copy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::trigger::Trigger;

/// Well-known channel and event-type names.
///
/// Names starting with a single underscore are reserved for the broker's
/// internal namespace; clients publishing to them get an error ack.
pub mod well_known {
    /// Control channel for broker-internal events.
    pub const BROKER_CHANNEL: &str = "__BROKER__";
    /// Virtual channel clients address RPC requests to.
    pub const RPC_CHANNEL: &str = "__RPC__";
    /// Acknowledgement event type sent back to front-end clients.
    pub const ACK: &str = "__ACK__";
    /// Submitted once on activation so handlers can perform lazy setup.
    pub const INIT: &str = "__init__";
    /// Recurring broker tick driving subscriber polling.
    pub const EVERY_TICK: &str = "__EVERYTICK__";
    /// Client readiness probe.
    pub const READY: &str = "__READY__";
    /// Request for the broker's RPC route table.
    pub const GET_RPC_METHODS: &str = "__GET_RPCMETHODS__";
    /// Announcement of served RPC methods (method -> channel map).
    pub const RPC_METHODS: &str = "__RPC_METHODS__";
    /// Synthesized on a back-end subscribe control frame.
    pub const ON_SUBSCRIBE: &str = "__ON_SUBSCRIBE__";
    /// Synthesized on a back-end unsubscribe control frame.
    pub const ON_UNSUBSCRIBE: &str = "__ON_UNSUBSCRIBE__";
    /// Prefix of channels used to route RPC replies back to one backend.
    pub const RPC_TOKEN_PREFIX: &str = "rpc_";
    /// Prefix marking the internal namespace.
    pub const INTERNAL_PREFIX: &str = "_";
}

/// Default event priority. Lower values are dispatched first.
pub const DEFAULT_PRIORITY: i64 = 10;

/// A typed, addressed unit of work.
///
/// `id` is generated at construction and never changes. `next_fire_time` is
/// a computed field owned by the queue/trigger logic; handlers must treat the
/// whole record as read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique id, also the RPC correlation key.
    pub id: Uuid,
    /// Dispatch key consulted by the handler registries.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Routing key for pub/sub addressing.
    #[serde(default)]
    pub channel: String,
    /// Correlation target for RPC replies; empty when not expecting one.
    #[serde(default)]
    pub reply_to: String,
    /// Lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Re-arming policy, if the event recurs or fires in the future.
    #[serde(default)]
    pub trigger: Option<Trigger>,
    /// Absolute fire timestamp, computed by the owning queue.
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl Event {
    /// Create an event of the given type with a fresh id and defaults.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: Value::Null,
            channel: String::new(),
            reply_to: String::new(),
            priority: DEFAULT_PRIORITY,
            trigger: None,
            next_fire_time: None,
        }
    }

    /// Set the payload.
    pub fn data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the routing channel.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the reply correlation target.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }

    /// Set the priority (lower = more urgent).
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a trigger.
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// True if the event addresses the internal namespace.
    pub fn is_internal(&self) -> bool {
        self.channel.starts_with(well_known::INTERNAL_PREFIX)
    }

    /// Copy handed to handlers: scheduling state stripped so in-flight
    /// invocations never observe queue-owned fields.
    pub fn dispatched(&self) -> Self {
        let mut copy = self.clone();
        copy.trigger = None;
        copy
    }

    /// Serialize for the wire. Pure function of the event, lossless for all
    /// fields including absent optionals.
    pub fn pack(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Deserialize from the wire.
    pub fn unpack(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Event pack/unpack failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Event serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("ping");
        assert_eq!(event.event_type, "ping");
        assert_eq!(event.priority, DEFAULT_PRIORITY);
        assert!(event.channel.is_empty());
        assert!(event.reply_to.is_empty());
        assert!(event.trigger.is_none());
        assert!(event.next_fire_time.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Event::new("a").id, Event::new("a").id);
    }

    #[test]
    fn test_pack_round_trip() {
        let event = Event::new("order.created")
            .data(json!({"qty": 3, "sku": "A-17"}))
            .channel("orders")
            .reply_to("client-1")
            .priority(1);

        let packed = event.pack().unwrap();
        let restored = Event::unpack(&packed).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn test_pack_round_trip_with_trigger_and_fire_time() {
        let fire_at = Utc::now() + ChronoDuration::seconds(5);
        let mut event = Event::new("tick")
            .channel("clock")
            .trigger(Trigger::interval(Duration::from_secs(1)));
        event.next_fire_time = Some(fire_at);

        let restored = Event::unpack(&event.pack().unwrap()).unwrap();
        assert_eq!(restored.next_fire_time, Some(fire_at));
        assert!(restored.trigger.is_some());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(Event::unpack(b"not json").is_err());
    }

    #[test]
    fn test_dispatched_strips_trigger() {
        let event = Event::new("tick").trigger(Trigger::interval(Duration::from_secs(1)));
        let dispatched = event.dispatched();
        assert!(dispatched.trigger.is_none());
        assert_eq!(dispatched.id, event.id);
    }

    #[test]
    fn test_is_internal() {
        assert!(Event::new("x").channel("__BROKER__").is_internal());
        assert!(Event::new("x").channel("_private").is_internal());
        assert!(!Event::new("x").channel("orders").is_internal());
    }
}
