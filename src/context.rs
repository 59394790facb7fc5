//! Shared state passed to every handler.
//!
//! The context is owned by the engine/broker instance and exposes only
//! add/remove/query operations; handlers never see the raw maps, so all
//! mutation goes through the locking discipline here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::event::Event;
use crate::queue::{EventQueue, QueueError};
use crate::transport::{Publisher, Subscriber};

/// Default bound on the reply dedupe cache.
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 1024;

/// Bounded FIFO cache of recent replies keyed by request id.
///
/// Makes at-least-once delivery look idempotent to callers: a redelivered
/// request is answered from here instead of re-invoking its handler.
struct ReplyCache {
    entries: HashMap<String, Event>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReplyCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: String, reply: Event) {
        if self.entries.insert(key.clone(), reply).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, key: &str) -> Option<&Event> {
        self.entries.get(key)
    }
}

/// Shared engine/broker state with lifecycle tied to the owning instance.
pub struct Context {
    name: String,
    queue: Arc<EventQueue>,
    replies: Mutex<VecDeque<Event>>,
    reply_cache: Mutex<ReplyCache>,
    rpc_routes: RwLock<HashMap<String, String>>,
    transfer_outs: RwLock<HashMap<String, Vec<Arc<dyn Publisher>>>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl Context {
    /// Create a context bound to the owning instance's event queue.
    pub fn new(name: impl Into<String>, queue: Arc<EventQueue>, reply_cache_capacity: usize) -> Self {
        Self {
            name: name.into(),
            queue,
            replies: Mutex::new(VecDeque::new()),
            reply_cache: Mutex::new(ReplyCache::new(reply_cache_capacity)),
            rpc_routes: RwLock::new(HashMap::new()),
            transfer_outs: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Name of the owning engine/broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit an event onto the owning queue.
    ///
    /// If a reply for this event id is already cached, the cached reply is
    /// re-queued instead and no handler will run again (idempotent replay).
    pub fn submit(&self, event: Event) -> Result<(), QueueError> {
        if let Some(mut cached) = self.cached_reply(&event.id.to_string()) {
            if !event.reply_to.is_empty() {
                cached.channel = event.reply_to;
            }
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate submit, re-sending cached reply"
            );
            self.queue_reply(cached);
            return Ok(());
        }
        self.queue.put(event)
    }

    /// Queue a reply for the outbound reply loop.
    pub fn queue_reply(&self, reply: Event) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Pop the next queued reply, if any.
    pub fn try_pop_reply(&self) -> Option<Event> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Remember a reply under its correlation key.
    pub fn cache_reply(&self, key: impl Into<String>, reply: Event) {
        self.reply_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), reply);
    }

    /// Look up a cached reply by correlation key.
    pub fn cached_reply(&self, key: &str) -> Option<Event> {
        self.reply_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Record that `method` is served on `channel`.
    pub async fn add_rpc_route(&self, method: impl Into<String>, channel: impl Into<String>) {
        let method = method.into();
        let channel = channel.into();
        info!(method = %method, channel = %channel, "RPC route registered");
        self.rpc_routes.write().await.insert(method, channel);
    }

    /// Merge a method -> channel announcement into the route table.
    pub async fn merge_rpc_routes(&self, routes: HashMap<String, String>) {
        if routes.is_empty() {
            return;
        }
        let mut table = self.rpc_routes.write().await;
        for (method, channel) in routes {
            info!(method = %method, channel = %channel, "RPC route registered");
            table.insert(method, channel);
        }
    }

    /// Channel serving a method, if announced.
    pub async fn rpc_route(&self, method: &str) -> Option<String> {
        self.rpc_routes.read().await.get(method).cloned()
    }

    /// Snapshot of the full route table.
    pub async fn rpc_routes(&self) -> HashMap<String, String> {
        self.rpc_routes.read().await.clone()
    }

    /// Drop every route served by `channel` (backend went away).
    pub async fn remove_routes_to(&self, channel: &str) {
        let mut table = self.rpc_routes.write().await;
        table.retain(|method, served_on| {
            let keep = served_on != channel;
            if !keep {
                info!(method = %method, channel = %channel, "RPC route removed");
            }
            keep
        });
    }

    /// Register an additional publisher duplicating `channel`'s traffic.
    ///
    /// Idempotent by publisher name.
    pub async fn add_transfer_out(&self, channel: impl Into<String>, publisher: Arc<dyn Publisher>) {
        let channel = channel.into();
        let mut outs = self.transfer_outs.write().await;
        let targets = outs.entry(channel.clone()).or_default();
        if targets.iter().any(|p| p.name() == publisher.name()) {
            return;
        }
        info!(channel = %channel, publisher = %publisher.name(), "Transfer-out registered");
        targets.push(publisher);
    }

    /// Publishers duplicating `channel`'s traffic, in registration order.
    pub async fn transfer_outs_for(&self, channel: &str) -> Vec<Arc<dyn Publisher>> {
        self.transfer_outs
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Register an external event source. Idempotent by subscriber name.
    pub async fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        let mut subs = self.subscribers.write().await;
        if subs.iter().any(|s| s.name() == subscriber.name()) {
            return;
        }
        info!(subscriber = %subscriber.name(), "Subscriber registered");
        subs.push(subscriber);
    }

    /// Snapshot of registered subscribers.
    pub async fn subscribers(&self) -> Vec<Arc<dyn Subscriber>> {
        self.subscribers.read().await.clone()
    }
}
