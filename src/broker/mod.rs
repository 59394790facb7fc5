//! Event broker: front-end client termination, back-end pub/sub fan-out,
//! and RPC bridging.
//!
//! A specialized engine that additionally terminates a network-facing
//! front-end (multiplexed client requests) and back-end (channel fan-out to
//! subscribed consumers), maintains the RPC route table, and bridges
//! request/reply semantics over the asynchronous substrate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::context::{Context, DEFAULT_REPLY_CACHE_CAPACITY};
use crate::engine::{EngineError, EngineState, DEFAULT_WORKER_POOL_SIZE};
use crate::event::{well_known, Event};
use crate::handlers::{HandlerRegistry, RegistryError, RpcReply};
use crate::queue::{EventQueue, QueueError};
use crate::transport::reconnect::TransportBackoff;
use crate::transport::{
    BackendFrame, BackendTransport, FrontendMessage, FrontendTransport, Publisher, Subscriber,
};

pub mod control;

/// Default period of the broker's internal subscriber-polling tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Default bounded poll timeout for broker transport receives.
pub const DEFAULT_BROKER_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Construction-time broker options.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Bounded timeout for front-/back-end receives.
    pub poll_timeout: Duration,
    /// Bound on concurrently handled inbound messages.
    pub worker_pool_size: usize,
    /// Period of the internal `__EVERYTICK__` event.
    pub tick_interval: Duration,
    /// Per-handler wall-clock warning threshold.
    pub handler_time_budget: Duration,
    /// Bound on the reply dedupe cache.
    pub reply_cache_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_BROKER_POLL_TIMEOUT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            handler_time_budget: crate::handlers::registry::DEFAULT_TIME_BUDGET,
            reply_cache_capacity: DEFAULT_REPLY_CACHE_CAPACITY,
        }
    }
}

/// The broker instance.
///
/// Owns the publish queue, the control handler registry, and the routing
/// state; terminates one front-end and one back-end transport.
pub struct Broker {
    queue: Arc<EventQueue>,
    context: Arc<Context>,
    handlers: Arc<HandlerRegistry>,
    frontend: Arc<dyn FrontendTransport>,
    backend: Arc<dyn BackendTransport>,
    active: Arc<AtomicBool>,
    state: Mutex<EngineState>,
    permits: Arc<Semaphore>,
    options: BrokerOptions,
}

impl Broker {
    /// Build a broker over the given transports and register the internal
    /// control handlers plus the recurring subscriber-polling tick.
    pub async fn new(
        frontend: Arc<dyn FrontendTransport>,
        backend: Arc<dyn BackendTransport>,
        options: BrokerOptions,
    ) -> Result<Self, RegistryError> {
        let queue = Arc::new(EventQueue::new());
        let context = Arc::new(Context::new(
            "broker",
            queue.clone(),
            options.reply_cache_capacity,
        ));
        let handlers = Arc::new(HandlerRegistry::with_time_budget(
            options.handler_time_budget,
        ));
        control::register_control_handlers(&handlers).await?;

        let broker = Self {
            queue,
            context,
            handlers,
            frontend,
            backend,
            active: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(EngineState::Created),
            permits: Arc::new(Semaphore::new(options.worker_pool_size.max(1))),
            options,
        };

        let tick = Event::new(well_known::EVERY_TICK)
            .channel(well_known::BROKER_CHANNEL)
            .trigger(crate::trigger::Trigger::interval(
                broker.options.tick_interval,
            ));
        if let Err(e) = broker.queue.put(tick) {
            warn!(error = %e, "Could not schedule subscriber-polling tick");
        }

        Ok(broker)
    }

    /// Control handler registry, for registering additional `__BROKER__`
    /// channel handlers.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Shared routing context.
    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Duplicate `channel`'s outgoing traffic to an additional publisher.
    pub async fn transfer_out(&self, channel: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.context.add_transfer_out(channel, publisher).await;
    }

    /// Register an external event source polled on the broker tick.
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.context.add_subscriber(subscriber).await;
    }

    /// Submit an event for fan-out (or internal dispatch when addressed to
    /// `__BROKER__`). Duplicate ids with a cached reply short-circuit.
    pub fn submit_event(&self, event: Event) -> Result<(), QueueError> {
        self.context.submit(event)
    }

    /// Run front-end and back-end loops until [`stop`](Self::stop).
    pub async fn serve(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == EngineState::Active {
                warn!("Broker already serving");
                return Ok(());
            }
            *state = EngineState::Active;
        }
        self.active.store(true, Ordering::SeqCst);
        if let Err(e) = self.context.submit(
            Event::new(well_known::INIT).channel(well_known::BROKER_CHANNEL),
        ) {
            warn!(error = %e, "Could not submit init event");
        }
        info!("Broker serving");

        let frontend_task = tokio::spawn(run_frontend(
            self.frontend.clone(),
            self.context.clone(),
            self.handlers.clone(),
            self.active.clone(),
            self.permits.clone(),
            self.options.poll_timeout,
        ));

        let result = self.run_backend().await;
        if let Err(e) = &result {
            error!(error = %e, "Backend loop terminated");
        }
        self.stop();
        let _ = frontend_task.await;

        // In-flight message handlers complete before shutdown finishes.
        let _ = self
            .permits
            .acquire_many(self.options.worker_pool_size.max(1) as u32)
            .await;

        info!("Broker stopped");
        result
    }

    /// Flip the active flag and close the queue. Loops exit within one poll
    /// interval; in-flight handlers complete.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.close();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = EngineState::Stopped;
    }

    async fn run_backend(&self) -> Result<(), EngineError> {
        let mut backoff = TransportBackoff::new();

        while self.active.load(Ordering::SeqCst) {
            match self.backend.recv(self.options.poll_timeout).await {
                Ok(Some(frame)) => {
                    backoff.reset();
                    self.handle_backend_frame(frame).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Backend receive failed");
                    tokio::time::sleep(backoff.delay()).await;
                }
            }

            for event in self.queue.drain_ready(Utc::now()) {
                self.rearm(&event);
                let outgoing = event.dispatched();
                if outgoing.channel == well_known::BROKER_CHANNEL {
                    self.dispatch_internal(outgoing).await?;
                } else {
                    self.publish_out(outgoing).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_backend_frame(&self, frame: BackendFrame) {
        match frame {
            BackendFrame::Subscribe(channel) => {
                let event = Event::new(well_known::ON_SUBSCRIBE)
                    .data(json!(channel))
                    .channel(well_known::BROKER_CHANNEL);
                self.handlers
                    .trigger(self.context.clone(), Arc::new(event))
                    .await;
            }
            BackendFrame::Unsubscribe(channel) => {
                let event = Event::new(well_known::ON_UNSUBSCRIBE)
                    .data(json!(channel))
                    .channel(well_known::BROKER_CHANNEL);
                self.handlers
                    .trigger(self.context.clone(), Arc::new(event))
                    .await;
            }
            BackendFrame::Frame(payload) => match Event::unpack(&payload) {
                Ok(event) if event.channel == well_known::BROKER_CHANNEL => {
                    self.handlers
                        .trigger(self.context.clone(), Arc::new(event))
                        .await;
                }
                Ok(event)
                    if !event
                        .event_type
                        .starts_with(well_known::INTERNAL_PREFIX) =>
                {
                    // A reply from a serving backend, destined for the
                    // front-end correlation loop.
                    debug!(
                        event_type = %event.event_type,
                        reply_to = %event.reply_to,
                        "Backend reply received"
                    );
                    self.context.queue_reply(event);
                }
                Ok(event) => {
                    warn!(
                        event_type = %event.event_type,
                        channel = %event.channel,
                        "Unexpected backend event"
                    );
                }
                Err(e) => warn!(error = %e, "Discarding malformed backend frame"),
            },
        }
    }

    /// Dispatch an internal event on the worker pool.
    async fn dispatch_internal(&self, event: Event) -> Result<(), EngineError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Fatal {
                name: "broker".to_string(),
                message: format!("worker pool unavailable: {e}"),
            })?;
        let handlers = self.handlers.clone();
        let ctx = self.context.clone();
        tokio::spawn(async move {
            handlers.trigger(ctx, Arc::new(event)).await;
            drop(permit);
        });
        Ok(())
    }

    /// Publish an event on its channel, then duplicate it to every
    /// registered transfer-out publisher.
    ///
    /// The publisher list is resolved fresh for each event and every target
    /// runs isolated: one failing transfer never blocks the others or the
    /// primary publish.
    async fn publish_out(&self, event: Event) {
        let payload = match event.pack() {
            Ok(payload) => payload,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Dropping unpackable event");
                return;
            }
        };

        if let Err(e) = self.backend.publish(&event.channel, payload.clone()).await {
            error!(
                channel = %event.channel,
                event_id = %event.id,
                error = %e,
                "Backend publish failed"
            );
        } else {
            debug!(
                channel = %event.channel,
                event_type = %event.event_type,
                "Event published"
            );
        }

        for publisher in self.context.transfer_outs_for(&event.channel).await {
            let payload = payload.clone();
            let channel = event.channel.clone();
            let event_id = event.id;
            tokio::spawn(async move {
                if let Err(e) = publisher.publish(&channel, payload).await {
                    error!(
                        publisher = %publisher.name(),
                        channel = %channel,
                        event_id = %event_id,
                        error = %e,
                        "Transfer-out failed"
                    );
                }
            });
        }
    }

    fn rearm(&self, event: &Event) {
        if event.trigger.is_none() {
            return;
        }
        match self.queue.put(event.clone()) {
            Ok(()) => debug!(event_type = %event.event_type, "Recurring event re-armed"),
            Err(e) => debug!(event_type = %event.event_type, error = %e, "Event retired"),
        }
    }
}

/// Front-end loop: receive client requests, route them, and flush addressed
/// replies (caching each under its correlation id for replay dedupe).
async fn run_frontend(
    frontend: Arc<dyn FrontendTransport>,
    context: Arc<Context>,
    handlers: Arc<HandlerRegistry>,
    active: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    poll_timeout: Duration,
) {
    let mut backoff = TransportBackoff::new();
    info!("Frontend loop running");

    while active.load(Ordering::SeqCst) {
        match frontend.recv(poll_timeout).await {
            Ok(Some(msg)) => {
                backoff.reset();
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let context = context.clone();
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    handle_frontend_message(context, handlers, msg).await;
                    drop(permit);
                });
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Frontend receive failed");
                tokio::time::sleep(backoff.delay()).await;
            }
        }

        flush_replies(frontend.as_ref(), &context).await;
    }

    // Final flush so accepted requests still get their replies on shutdown.
    flush_replies(frontend.as_ref(), &context).await;
    info!("Frontend loop stopped");
}

/// Route one inbound client request.
async fn handle_frontend_message(
    context: Arc<Context>,
    handlers: Arc<HandlerRegistry>,
    msg: FrontendMessage,
) {
    let client_addr = String::from_utf8_lossy(&msg.client).to_string();
    let mut event = match Event::unpack(&msg.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(client = %client_addr, error = %e, "Discarding malformed request");
            return;
        }
    };

    // At-least-once replay guard: answer duplicates from the reply cache
    // without re-invoking any handler.
    if let Some(mut cached) = context.cached_reply(&event.id.to_string()) {
        warn!(
            client = %client_addr,
            event_id = %event.id,
            "Duplicate request, re-sending cached reply"
        );
        cached.channel = client_addr;
        context.queue_reply(cached);
        return;
    }

    if event.channel == well_known::BROKER_CHANNEL {
        event.reply_to = client_addr.clone();
        info!(
            client = %client_addr,
            event_type = %event.event_type,
            "Broker control event"
        );
        handlers.trigger(context, Arc::new(event)).await;
    } else if event.channel == well_known::RPC_CHANNEL {
        match context.rpc_route(&event.event_type).await {
            Some(serving_channel) => {
                event.channel = serving_channel;
                event.reply_to = client_addr.clone();
                event.trigger = None;
                info!(
                    client = %client_addr,
                    method = %event.event_type,
                    channel = %event.channel,
                    "RPC call routed"
                );
                if let Err(e) = context.submit(event) {
                    warn!(client = %client_addr, error = %e, "RPC submit failed");
                }
            }
            None => {
                warn!(
                    client = %client_addr,
                    method = %event.event_type,
                    "RPC call for unknown method"
                );
                context.queue_reply(
                    Event::new(event.event_type.clone())
                        .data(RpcReply::method_not_found(&event.event_type).into_value())
                        .channel(client_addr)
                        .reply_to(event.id.to_string()),
                );
            }
        }
    } else if !event.channel.is_empty() && !event.is_internal() {
        // Ordinary publish: ack immediately, then fan out.
        context.queue_reply(
            Event::new(well_known::ACK)
                .data(json!("OK"))
                .channel(client_addr.clone())
                .reply_to(event.id.to_string()),
        );
        event.reply_to.clear();
        info!(
            client = %client_addr,
            channel = %event.channel,
            event_type = %event.event_type,
            "Publish accepted"
        );
        if let Err(e) = context.submit(event) {
            warn!(client = %client_addr, error = %e, "Publish submit failed");
        }
    } else {
        warn!(
            client = %client_addr,
            channel = %event.channel,
            "Illegal channel, rejecting"
        );
        context.queue_reply(
            Event::new(well_known::ACK)
                .data(json!({"error": format!("unsupported channel '{}'", event.channel)}))
                .channel(client_addr)
                .reply_to(event.id.to_string()),
        );
    }
}

/// Send queued replies back over the front-end, caching each under its
/// correlation id first.
async fn flush_replies(frontend: &dyn FrontendTransport, context: &Arc<Context>) {
    while let Some(mut reply) = context.try_pop_reply() {
        if !reply.reply_to.is_empty() {
            context.cache_reply(reply.reply_to.clone(), reply.clone());
        }

        let client = std::mem::take(&mut reply.channel);
        reply.reply_to = String::new();

        let payload = match reply.pack() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Dropping unpackable reply");
                continue;
            }
        };
        match frontend.send(client.as_bytes(), payload).await {
            Ok(()) => info!(
                client = %client,
                event_type = %reply.event_type,
                "Reply sent"
            ),
            Err(e) => error!(client = %client, error = %e, "Reply send failed"),
        }
    }
}
