//! Scheduler engine: owns an event queue and handler registries, runs the
//! dispatch loop.
//!
//! Lifecycle is `Created -> Active -> Stopped`. While active, each tick
//! polls registered subscribers, drains ready events, dispatches them
//! (inline or on a bounded worker pool), and re-arms recurring triggers by
//! re-queueing a fresh copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{Context, DEFAULT_REPLY_CACHE_CAPACITY};
use crate::event::{well_known, Event};
use crate::handlers::{HandlerRegistry, RpcRegistry};
use crate::queue::{EventQueue, QueueError};
use crate::transport::reconnect::TransportBackoff;
use crate::transport::WorkerTransport;

/// Default bound on concurrently dispatching handlers in pooled mode.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

/// Default idle backoff between dispatch ticks.
pub const DEFAULT_DISPATCH_BACKOFF: Duration = Duration::from_millis(100);

/// Default bounded poll timeout for transport receives.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// How handler dispatch executes. Chosen at construction, not per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One loop task runs polling, draining, and handlers serially.
    /// Simplest correctness story for non-reentrant handlers.
    Inline,
    /// Handlers run on spawned tasks bounded by a semaphore of this size.
    Pooled { workers: usize },
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Pooled {
            workers: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Active,
    Stopped,
}

/// Construction-time engine options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Inline or pooled handler dispatch.
    pub dispatch_mode: DispatchMode,
    /// Bounded timeout for link receives, so loops observe shutdown.
    pub poll_timeout: Duration,
    /// Sleep between ticks when nothing was ready.
    pub dispatch_backoff: Duration,
    /// Per-handler wall-clock warning threshold.
    pub handler_time_budget: Duration,
    /// Bound on the reply dedupe cache.
    pub reply_cache_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            dispatch_backoff: DEFAULT_DISPATCH_BACKOFF,
            handler_time_budget: crate::handlers::registry::DEFAULT_TIME_BUDGET,
            reply_cache_capacity: DEFAULT_REPLY_CACHE_CAPACITY,
        }
    }
}

/// Fatal engine failures.
///
/// Anything escaping the isolation boundaries inside the dispatch loop
/// itself. The instance ends in `Stopped`; embedders should treat this as a
/// crash to be supervised externally.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine '{name}' dispatch loop failed: {message}")]
    Fatal { name: String, message: String },
}

/// Scheduler engine instance.
///
/// Explicitly constructed and owned by the embedding application; tests
/// build fresh isolated instances rather than sharing globals.
pub struct Engine {
    name: String,
    rpc_token: String,
    queue: Arc<EventQueue>,
    context: Arc<Context>,
    handlers: Arc<HandlerRegistry>,
    rpc: Arc<RpcRegistry>,
    active: Arc<AtomicBool>,
    state: Mutex<EngineState>,
    options: EngineOptions,
    dispatch_permits: Option<Arc<Semaphore>>,
    link: Option<Arc<dyn WorkerTransport>>,
}

impl Engine {
    /// Engine with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, EngineOptions::default())
    }

    /// Engine with explicit options.
    pub fn with_options(name: impl Into<String>, options: EngineOptions) -> Self {
        let name = name.into();
        let queue = Arc::new(EventQueue::new());
        let context = Arc::new(Context::new(
            name.clone(),
            queue.clone(),
            options.reply_cache_capacity,
        ));
        let dispatch_permits = match options.dispatch_mode {
            DispatchMode::Inline => None,
            DispatchMode::Pooled { workers } => Some(Arc::new(Semaphore::new(workers.max(1)))),
        };
        Self {
            rpc_token: format!(
                "{}{}",
                well_known::RPC_TOKEN_PREFIX,
                Uuid::new_v4().simple()
            ),
            queue,
            context,
            handlers: Arc::new(HandlerRegistry::with_time_budget(
                options.handler_time_budget,
            )),
            rpc: Arc::new(RpcRegistry::with_time_budget(options.handler_time_budget)),
            active: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(EngineState::Created),
            options,
            dispatch_permits,
            link: None,
            name,
        }
    }

    /// Attach a broker back-end link. The engine will subscribe its own
    /// channel, the wildcard, and its RPC token channel, and announce its
    /// RPC methods.
    pub fn with_link(mut self, link: Arc<dyn WorkerTransport>) -> Self {
        self.link = Some(link);
        self
    }

    /// Engine name, doubling as its subscription channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel this engine's RPC replies are routed through.
    pub fn rpc_token(&self) -> &str {
        &self.rpc_token
    }

    /// Event handler registry.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// RPC method registry.
    pub fn rpc(&self) -> &Arc<RpcRegistry> {
        &self.rpc
    }

    /// Shared context passed to handlers.
    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an external event source polled by the dispatch loop.
    pub async fn subscribe(&self, subscriber: Arc<dyn crate::transport::Subscriber>) {
        self.context.add_subscriber(subscriber).await;
    }

    /// Submit an event for dispatch.
    ///
    /// Accepted before activation; such events run once the engine starts.
    pub fn submit_event(&self, event: Event) -> Result<(), QueueError> {
        debug!(
            engine = %self.name,
            event_type = %event.event_type,
            event_id = %event.id,
            "Event submitted"
        );
        let result = self.context.submit(event);
        if result.is_ok() && !self.active.load(Ordering::SeqCst) {
            warn!(
                engine = %self.name,
                "Engine not active; event runs after activation"
            );
        }
        result
    }

    /// Move `Created -> Active` and submit the `__init__` event.
    pub fn activate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != EngineState::Created {
            return;
        }
        *state = EngineState::Active;
        drop(state);

        self.active.store(true, Ordering::SeqCst);
        if let Err(e) = self.context.submit(Event::new(well_known::INIT)) {
            warn!(engine = %self.name, error = %e, "Could not submit init event");
        }
        info!(engine = %self.name, "Engine activated");
    }

    /// Flip the active flag and close the queue. Loops exit within one poll
    /// interval; in-flight handlers complete.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.close();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = EngineState::Stopped;
        info!(engine = %self.name, "Engine stopped");
    }

    /// Run until [`stop`](Self::stop) is called or a fatal loop error occurs.
    pub async fn run(&self) -> Result<(), EngineError> {
        self.activate();

        let link_task = self.link.as_ref().map(|link| self.spawn_link(link.clone()));

        let result = self.dispatch_loop().await;
        if let Err(e) = &result {
            error!(engine = %self.name, error = %e, "Dispatch loop terminated");
        }
        self.stop();

        // In-flight pooled handlers complete before shutdown finishes.
        if let (Some(permits), DispatchMode::Pooled { workers }) =
            (&self.dispatch_permits, self.options.dispatch_mode)
        {
            let _ = permits.acquire_many(workers.max(1) as u32).await;
        }

        if let Some(task) = link_task {
            let _ = task.await;
        }
        result
    }

    async fn dispatch_loop(&self) -> Result<(), EngineError> {
        info!(
            engine = %self.name,
            mode = ?self.options.dispatch_mode,
            "Dispatch loop running"
        );

        while self.active.load(Ordering::SeqCst) {
            let polled = self.poll_subscribers().await;
            let ready = self.queue.drain_ready(Utc::now());

            if ready.is_empty() && polled == 0 {
                self.queue.wait_ready(self.options.dispatch_backoff).await;
                continue;
            }

            for event in ready {
                self.rearm(&event);
                self.dispatch(event).await?;
            }
        }
        Ok(())
    }

    /// Poll every registered subscriber; an error from one source never
    /// kills the loop or starves the others. Returns the number of events
    /// submitted.
    async fn poll_subscribers(&self) -> usize {
        let mut submitted = 0;
        for subscriber in self.context.subscribers().await {
            match subscriber.poll().await {
                Ok(events) => {
                    for event in events {
                        match self.context.submit(event) {
                            Ok(()) => submitted += 1,
                            Err(e) => {
                                debug!(
                                    engine = %self.name,
                                    subscriber = %subscriber.name(),
                                    error = %e,
                                    "Dropping polled event"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(
                        engine = %self.name,
                        subscriber = %subscriber.name(),
                        error = %e,
                        "Subscriber poll failed"
                    );
                }
            }
        }
        submitted
    }

    /// Re-queue the next occurrence of a recurring event as a fresh copy,
    /// so nothing mutates state an in-flight handler can observe.
    fn rearm(&self, event: &Event) {
        if event.trigger.is_none() {
            return;
        }
        match self.queue.put(event.clone()) {
            Ok(()) => debug!(
                engine = %self.name,
                event_type = %event.event_type,
                "Recurring event re-armed"
            ),
            Err(QueueError::TriggerExhausted(_)) => debug!(
                engine = %self.name,
                event_type = %event.event_type,
                "Trigger exhausted, event retired"
            ),
            Err(QueueError::Closed) => debug!(
                engine = %self.name,
                event_type = %event.event_type,
                "Queue closed, dropping re-arm"
            ),
        }
    }

    async fn dispatch(&self, event: Event) -> Result<(), EngineError> {
        let event = Arc::new(event.dispatched());
        match &self.dispatch_permits {
            None => {
                self.handlers.trigger(self.context.clone(), event).await;
            }
            Some(permits) => {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Fatal {
                        name: self.name.clone(),
                        message: format!("worker pool unavailable: {e}"),
                    })?;
                let handlers = self.handlers.clone();
                let ctx = self.context.clone();
                tokio::spawn(async move {
                    handlers.trigger(ctx, event).await;
                    drop(permit);
                });
            }
        }
        Ok(())
    }

    fn spawn_link(&self, link: Arc<dyn WorkerTransport>) -> JoinHandle<()> {
        let name = self.name.clone();
        let token = self.rpc_token.clone();
        let active = self.active.clone();
        let context = self.context.clone();
        let rpc = self.rpc.clone();
        let poll_timeout = self.options.poll_timeout;

        tokio::spawn(async move {
            run_link(name, token, active, context, rpc, link, poll_timeout).await;
        })
    }
}

/// Back-end link loop: subscribe this engine's channels, announce RPC
/// methods, serve RPC calls, forward ordinary events into the local queue.
async fn run_link(
    name: String,
    token: String,
    active: Arc<AtomicBool>,
    context: Arc<Context>,
    rpc: Arc<RpcRegistry>,
    link: Arc<dyn WorkerTransport>,
    poll_timeout: Duration,
) {
    for channel in [name.as_str(), "*", token.as_str()] {
        if let Err(e) = link.subscribe(channel).await {
            error!(engine = %name, channel = %channel, error = %e, "Subscribe failed");
            return;
        }
        debug!(engine = %name, channel = %channel, "Subscribed");
    }

    if !rpc.is_empty().await {
        context.queue_reply(announce_methods(&rpc, &token, well_known::BROKER_CHANNEL).await);
        let methods = rpc.methods().await;
        info!(engine = %name, methods = ?methods, "Announced RPC methods");
    }

    let mut backoff = TransportBackoff::new();
    info!(engine = %name, token = %token, "Back-end link running");

    while active.load(Ordering::SeqCst) {
        while let Some(reply) = context.try_pop_reply() {
            let payload = match reply.pack() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(engine = %name, error = %e, "Dropping unpackable reply");
                    continue;
                }
            };
            if let Err(e) = link.send(payload).await {
                error!(engine = %name, error = %e, "Reply send failed, re-queueing");
                context.queue_reply(reply);
                tokio::time::sleep(backoff.delay()).await;
                break;
            }
        }

        match link.recv(poll_timeout).await {
            Ok(Some(payload)) => {
                backoff.reset();
                match Event::unpack(&payload) {
                    Ok(event) => {
                        handle_link_event(&name, &token, &context, &rpc, event).await;
                    }
                    Err(e) => warn!(engine = %name, error = %e, "Discarding malformed frame"),
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(engine = %name, error = %e, "Link receive failed");
                tokio::time::sleep(backoff.delay()).await;
            }
        }
    }

    info!(engine = %name, "Back-end link stopped");
}

async fn handle_link_event(
    name: &str,
    token: &str,
    context: &Arc<Context>,
    rpc: &Arc<RpcRegistry>,
    event: Event,
) {
    debug!(
        engine = %name,
        channel = %event.channel,
        event_type = %event.event_type,
        reply_to = %event.reply_to,
        "Link event received"
    );

    if event.channel == token && event.event_type == well_known::GET_RPC_METHODS {
        let target = if event.reply_to.is_empty() {
            well_known::BROKER_CHANNEL
        } else {
            event.reply_to.as_str()
        };
        context.queue_reply(announce_methods(rpc, token, target).await);
    } else if event.channel == token && !event.reply_to.is_empty() {
        let request = Arc::new(event);
        let reply = rpc.execute(context.clone(), request.clone()).await;
        let reply_event = Event::new(request.event_type.clone())
            .data(reply.into_value())
            .channel(request.reply_to.clone())
            .reply_to(request.id.to_string());
        info!(
            engine = %name,
            method = %request.event_type,
            request_id = %request.id,
            "RPC served"
        );
        context.queue_reply(reply_event);
    } else if event.reply_to.is_empty() {
        if let Err(e) = context.submit(event) {
            debug!(engine = %name, error = %e, "Dropping link event");
        }
    } else {
        warn!(
            engine = %name,
            event_type = %event.event_type,
            channel = %event.channel,
            "Illegal link event"
        );
    }
}

async fn announce_methods(rpc: &Arc<RpcRegistry>, token: &str, target: &str) -> Event {
    let routes: serde_json::Map<String, serde_json::Value> = rpc
        .methods()
        .await
        .into_iter()
        .map(|method| (method, json!(token)))
        .collect();
    Event::new(well_known::RPC_METHODS)
        .data(serde_json::Value::Object(routes))
        .channel(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CountingHandler, FailingSubscriber, StaticSubscriber};
    use crate::trigger::{Repeat, Trigger};
    use serde_json::Value;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn inline_options() -> EngineOptions {
        EngineOptions {
            dispatch_mode: DispatchMode::Inline,
            dispatch_backoff: Duration::from_millis(10),
            ..EngineOptions::default()
        }
    }

    async fn run_briefly(engine: Arc<Engine>, millis: u64) {
        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(millis)).await;
        engine.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let engine = Engine::new("test");
        assert_eq!(engine.state(), EngineState::Created);
        engine.activate();
        assert_eq!(engine.state(), EngineState::Active);
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_init_event_dispatched_on_start() {
        let engine = Arc::new(Engine::with_options("test", inline_options()));
        let handler = CountingHandler::new("init-probe");
        let count = handler.count();
        engine
            .handlers()
            .register(well_known::INIT, Arc::new(handler))
            .await
            .unwrap();

        run_briefly(engine, 50).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submitted_event_reaches_handler() {
        let engine = Arc::new(Engine::with_options("test", inline_options()));
        let handler = CountingHandler::new("ping-handler");
        let count = handler.count();
        engine
            .handlers()
            .register("ping", Arc::new(handler))
            .await
            .unwrap();

        engine.submit_event(Event::new("ping")).unwrap();
        run_briefly(engine, 50).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pooled_dispatch_also_delivers() {
        let options = EngineOptions {
            dispatch_mode: DispatchMode::Pooled { workers: 4 },
            dispatch_backoff: Duration::from_millis(10),
            ..EngineOptions::default()
        };
        let engine = Arc::new(Engine::with_options("test", options));
        let handler = CountingHandler::new("ping-handler");
        let count = handler.count();
        engine
            .handlers()
            .register("ping", Arc::new(handler))
            .await
            .unwrap();

        for _ in 0..5 {
            engine.submit_event(Event::new("ping")).unwrap();
        }
        run_briefly(engine, 80).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_recurring_event_fires_to_exhaustion() {
        let engine = Arc::new(Engine::with_options("test", inline_options()));
        let handler = CountingHandler::new("tick-handler");
        let count = handler.count();
        engine
            .handlers()
            .register("tick", Arc::new(handler))
            .await
            .unwrap();

        engine
            .submit_event(Event::new("tick").trigger(Trigger::interval_with(
                Duration::from_millis(20),
                None,
                Repeat::Times(3),
            )))
            .unwrap();

        run_briefly(engine.clone(), 200).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        assert!(engine.queue.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_events_are_polled_in() {
        let engine = Arc::new(Engine::with_options("test", inline_options()));
        let handler = CountingHandler::new("ext-handler");
        let count = handler.count();
        engine
            .handlers()
            .register("external", Arc::new(handler))
            .await
            .unwrap();

        engine
            .subscribe(Arc::new(FailingSubscriber::new("broken-source")))
            .await;
        engine
            .subscribe(Arc::new(StaticSubscriber::new(
                "feed",
                vec![Event::new("external"), Event::new("external")],
            )))
            .await;

        run_briefly(engine, 80).await;
        // The failing subscriber is isolated; the healthy one still lands.
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails_with_queue_closed() {
        let engine = Engine::new("test");
        engine.activate();
        engine.stop();
        assert!(matches!(
            engine.submit_event(Event::new("late")),
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rpc_token_shape() {
        let engine = Engine::new("test");
        assert!(engine.rpc_token().starts_with(well_known::RPC_TOKEN_PREFIX));
        assert_ne!(engine.rpc_token(), Engine::new("test").rpc_token());
    }

    #[tokio::test]
    async fn test_trigger_returns_results_in_order() {
        // Registry-level ordering is covered in registry tests; this pins
        // the engine passing its own context through.
        let engine = Engine::with_options("test", inline_options());
        let ctx = engine.context();
        assert_eq!(ctx.name(), "test");
        let results: Vec<Value> = engine
            .handlers()
            .trigger(ctx, Arc::new(Event::new("unknown")))
            .await;
        assert!(results.is_empty());
    }
}
