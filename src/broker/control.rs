//! Broker-internal control handlers.
//!
//! Registered at construction against the reserved `__*__` event types;
//! everything flowing on the `__BROKER__` channel is dispatched here instead
//! of being fanned out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::event::{well_known, Event};
use crate::handlers::{EventHandler, HandlerError, HandlerRegistry, RegistryError};

/// Register the broker's control handlers.
pub async fn register_control_handlers(
    registry: &HandlerRegistry,
) -> Result<(), RegistryError> {
    registry
        .register(well_known::EVERY_TICK, Arc::new(PollSubscribers))
        .await?;
    registry
        .register(well_known::READY, Arc::new(AckReady))
        .await?;
    registry
        .register(well_known::GET_RPC_METHODS, Arc::new(ReplyRpcMethods))
        .await?;
    registry
        .register(well_known::RPC_METHODS, Arc::new(MergeRpcMethods))
        .await?;
    registry
        .register(well_known::ON_SUBSCRIBE, Arc::new(OnSubscribe))
        .await?;
    registry
        .register(well_known::ON_UNSUBSCRIBE, Arc::new(OnUnsubscribe))
        .await?;
    Ok(())
}

/// Polls every registered external subscriber on each broker tick and
/// submits what they produced.
struct PollSubscribers;

#[async_trait]
impl EventHandler for PollSubscribers {
    fn name(&self) -> &str {
        "broker.poll-subscribers"
    }

    async fn handle(&self, ctx: Arc<Context>, _event: Arc<Event>) -> Result<Value, HandlerError> {
        let subscribers = ctx.subscribers().await;
        let polls = join_all(subscribers.iter().map(|s| s.poll())).await;

        let mut fetched = 0usize;
        for (subscriber, polled) in subscribers.iter().zip(polls) {
            match polled {
                Ok(events) => {
                    for event in events {
                        debug!(
                            subscriber = %subscriber.name(),
                            event_type = %event.event_type,
                            "External event fetched"
                        );
                        if let Err(e) = ctx.submit(event) {
                            debug!(
                                subscriber = %subscriber.name(),
                                error = %e,
                                "Dropping fetched event"
                            );
                        } else {
                            fetched += 1;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        subscriber = %subscriber.name(),
                        error = %e,
                        "Subscriber poll failed"
                    );
                }
            }
        }
        Ok(json!(fetched))
    }
}

/// Answers a client readiness probe with an ack.
struct AckReady;

#[async_trait]
impl EventHandler for AckReady {
    fn name(&self) -> &str {
        "broker.ready"
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        ctx.queue_reply(
            Event::new(well_known::ACK)
                .data(json!("READY"))
                .channel(event.reply_to.clone())
                .reply_to(event.id.to_string()),
        );
        Ok(Value::Null)
    }
}

/// Replies with the current RPC route table.
struct ReplyRpcMethods;

#[async_trait]
impl EventHandler for ReplyRpcMethods {
    fn name(&self) -> &str {
        "broker.reply-rpc-methods"
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        let routes = ctx.rpc_routes().await;
        ctx.queue_reply(
            Event::new(well_known::RPC_METHODS)
                .data(json!(routes))
                .channel(event.reply_to.clone())
                .reply_to(event.id.to_string()),
        );
        Ok(Value::Null)
    }
}

/// Merges a backend's `__RPC_METHODS__` announcement into the route table.
struct MergeRpcMethods;

#[async_trait]
impl EventHandler for MergeRpcMethods {
    fn name(&self) -> &str {
        "broker.merge-rpc-methods"
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        let routes: HashMap<String, String> = serde_json::from_value(event.data.clone())
            .map_err(|e| HandlerError::msg(format!("malformed announcement: {e}")))?;
        info!(count = routes.len(), "RPC methods announced");
        ctx.merge_rpc_routes(routes).await;
        Ok(Value::Null)
    }
}

/// Reacts to a back-end subscribe control frame.
///
/// A subscription to an `rpc_`-prefixed channel means an RPC-serving backend
/// came up; solicit its method announcement over that channel.
struct OnSubscribe;

#[async_trait]
impl EventHandler for OnSubscribe {
    fn name(&self) -> &str {
        "broker.on-subscribe"
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        let channel = event.data.as_str().unwrap_or_default().to_string();
        info!(channel = %channel, "Backend subscribed");

        if channel.starts_with(well_known::RPC_TOKEN_PREFIX) {
            let solicit = Event::new(well_known::GET_RPC_METHODS).channel(channel);
            if let Err(e) = ctx.submit(solicit) {
                warn!(error = %e, "Could not solicit RPC methods");
            }
        }
        Ok(Value::Null)
    }
}

/// Reacts to a back-end unsubscribe control frame: routes served over the
/// dropped channel are removed.
struct OnUnsubscribe;

#[async_trait]
impl EventHandler for OnUnsubscribe {
    fn name(&self) -> &str {
        "broker.on-unsubscribe"
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        let channel = event.data.as_str().unwrap_or_default().to_string();
        warn!(channel = %channel, "Backend unsubscribed");

        if channel.starts_with(well_known::RPC_TOKEN_PREFIX) {
            ctx.remove_routes_to(&channel).await;
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::test_utils::StaticSubscriber;

    fn ctx() -> Arc<Context> {
        Arc::new(Context::new("broker", Arc::new(EventQueue::new()), 16))
    }

    async fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        register_control_handlers(&registry).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_tick_polls_subscribers_into_queue() {
        let registry = registry().await;
        let queue = Arc::new(EventQueue::new());
        let ctx = Arc::new(Context::new("broker", queue.clone(), 16));
        ctx.add_subscriber(Arc::new(StaticSubscriber::new(
            "feed",
            vec![Event::new("external").channel("orders")],
        )))
        .await;

        registry
            .trigger(ctx, Arc::new(Event::new(well_known::EVERY_TICK)))
            .await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_ready_probe_is_acked() {
        let registry = registry().await;
        let ctx = ctx();
        let probe = Event::new(well_known::READY).reply_to("client-7");
        let probe_id = probe.id;

        registry.trigger(ctx.clone(), Arc::new(probe)).await;

        let ack = ctx.try_pop_reply().unwrap();
        assert_eq!(ack.event_type, well_known::ACK);
        assert_eq!(ack.channel, "client-7");
        assert_eq!(ack.reply_to, probe_id.to_string());
    }

    #[tokio::test]
    async fn test_announcement_merges_routes() {
        let registry = registry().await;
        let ctx = ctx();

        let announce = Event::new(well_known::RPC_METHODS)
            .data(json!({"add": "rpc_abc", "sub": "rpc_abc"}));
        registry.trigger(ctx.clone(), Arc::new(announce)).await;

        assert_eq!(ctx.rpc_route("add").await.as_deref(), Some("rpc_abc"));
        assert_eq!(ctx.rpc_route("sub").await.as_deref(), Some("rpc_abc"));
    }

    #[tokio::test]
    async fn test_rpc_subscribe_solicits_announcement() {
        let registry = registry().await;
        let queue = Arc::new(EventQueue::new());
        let ctx = Arc::new(Context::new("broker", queue.clone(), 16));

        let event = Event::new(well_known::ON_SUBSCRIBE).data(json!("rpc_deadbeef"));
        registry.trigger(ctx, Arc::new(event)).await;

        let solicit = queue.pop_ready(chrono::Utc::now()).unwrap();
        assert_eq!(solicit.event_type, well_known::GET_RPC_METHODS);
        assert_eq!(solicit.channel, "rpc_deadbeef");
    }

    #[tokio::test]
    async fn test_plain_subscribe_does_not_solicit() {
        let registry = registry().await;
        let queue = Arc::new(EventQueue::new());
        let ctx = Arc::new(Context::new("broker", queue.clone(), 16));

        let event = Event::new(well_known::ON_SUBSCRIBE).data(json!("orders"));
        registry.trigger(ctx, Arc::new(event)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_served_routes() {
        let registry = registry().await;
        let ctx = ctx();
        ctx.add_rpc_route("add", "rpc_abc").await;

        let event = Event::new(well_known::ON_UNSUBSCRIBE).data(json!("rpc_abc"));
        registry.trigger(ctx.clone(), Arc::new(event)).await;
        assert!(ctx.rpc_route("add").await.is_none());
    }
}
