//! Event handler registry: string type -> ordered handler list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{EventHandler, RegistryError};
use crate::context::Context;
use crate::event::Event;

/// Default wall-clock budget per handler invocation before a warning.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(1);

/// Maps event types to ordered lists of handlers.
///
/// Multiple independent subsystems can observe the same event type;
/// dispatch is in registration order and a failing handler never prevents
/// its siblings from running.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    time_budget: Duration,
}

impl HandlerRegistry {
    /// Registry with the default time budget.
    pub fn new() -> Self {
        Self::with_time_budget(DEFAULT_TIME_BUDGET)
    }

    /// Registry warning when a handler exceeds `time_budget`.
    pub fn with_time_budget(time_budget: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            time_budget,
        }
    }

    /// Register a handler for an event type.
    ///
    /// Idempotent by handler name: registering the same name twice for one
    /// type is a no-op. Empty names fail fast.
    pub async fn register(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(RegistryError::InvalidHandler(
                "event type must not be empty".to_string(),
            ));
        }
        if handler.name().is_empty() {
            return Err(RegistryError::InvalidHandler(
                "handler name must not be empty".to_string(),
            ));
        }

        let mut handlers = self.handlers.write().await;
        let entries = handlers.entry(event_type.clone()).or_default();
        if entries.iter().any(|h| h.name() == handler.name()) {
            debug!(
                event_type = %event_type,
                handler = %handler.name(),
                "Handler already registered, ignoring"
            );
            return Ok(());
        }

        info!(
            event_type = %event_type,
            handler = %handler.name(),
            "Handler registered"
        );
        entries.push(handler);
        Ok(())
    }

    /// Unregister one handler by name, or all handlers for the type when
    /// `handler_name` is `None`.
    pub async fn unregister(&self, event_type: &str, handler_name: Option<&str>) {
        let mut handlers = self.handlers.write().await;
        match handler_name {
            None => {
                handlers.remove(event_type);
                info!(event_type = %event_type, "All handlers unregistered");
            }
            Some(name) => {
                if let Some(entries) = handlers.get_mut(event_type) {
                    entries.retain(|h| h.name() != name);
                    if entries.is_empty() {
                        handlers.remove(event_type);
                    }
                    info!(event_type = %event_type, handler = %name, "Handler unregistered");
                }
            }
        }
    }

    /// Remove a handler from every type it was registered under.
    ///
    /// Used when a subsystem is torn down.
    pub async fn unregister_handler(&self, handler_name: &str) {
        let mut handlers = self.handlers.write().await;
        handlers.retain(|event_type, entries| {
            let before = entries.len();
            entries.retain(|h| h.name() != handler_name);
            if entries.len() < before {
                info!(
                    event_type = %event_type,
                    handler = %handler_name,
                    "Handler unregistered"
                );
            }
            !entries.is_empty()
        });
    }

    /// Number of handlers registered for a type.
    pub async fn count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invoke every handler registered for `event.event_type`, in
    /// registration order.
    ///
    /// An error from one handler is logged with the handler's identity and
    /// the event, and does not prevent the remaining handlers from running.
    /// Returns the successful results only; an unknown event type is a
    /// silent no-op yielding an empty list.
    pub async fn trigger(&self, ctx: Arc<Context>, event: Arc<Event>) -> Vec<Value> {
        let entries: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };

        let mut results = Vec::with_capacity(entries.len());
        for handler in entries {
            let started = Instant::now();
            match handler.handle(ctx.clone(), event.clone()).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    error!(
                        handler = %handler.name(),
                        event_type = %event.event_type,
                        event_id = %event.id,
                        error = %e,
                        "Handler failed"
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.time_budget {
                warn!(
                    handler = %handler.name(),
                    event_type = %event.event_type,
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = self.time_budget.as_millis() as u64,
                    "Handler exceeded time budget"
                );
            }
        }
        results
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{handler_fn, HandlerError};
    use crate::queue::EventQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Arc<Context> {
        Arc::new(Context::new("test", Arc::new(EventQueue::new()), 16))
    }

    #[tokio::test]
    async fn test_trigger_invokes_in_registration_order() {
        let registry = HandlerRegistry::new();
        for name in ["first", "second", "third"] {
            let tag = name.to_string();
            registry
                .register(
                    "ping",
                    handler_fn(name, move |_ctx, _event| {
                        let tag = tag.clone();
                        async move { Ok(json!(tag)) }
                    }),
                )
                .await
                .unwrap();
        }

        let results = registry.trigger(ctx(), Arc::new(Event::new("ping"))).await;
        assert_eq!(results, vec![json!("first"), json!("second"), json!("third")]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let registry = HandlerRegistry::new();
        let make = || handler_fn("echo", |_ctx, _event| async { Ok(json!(1)) });
        registry.register("ping", make()).await.unwrap();
        registry.register("ping", make()).await.unwrap();

        assert_eq!(registry.count("ping").await, 1);
    }

    #[tokio::test]
    async fn test_empty_names_fail_fast() {
        let registry = HandlerRegistry::new();
        let handler = handler_fn("h", |_ctx, _event| async { Ok(Value::Null) });
        assert!(matches!(
            registry.register("", handler.clone()).await,
            Err(RegistryError::InvalidHandler(_))
        ));

        let unnamed = handler_fn("", |_ctx, _event| async { Ok(Value::Null) });
        assert!(matches!(
            registry.register("ping", unnamed).await,
            Err(RegistryError::InvalidHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_siblings() {
        let registry = HandlerRegistry::new();
        let invoked = Arc::new(AtomicUsize::new(0));

        for (name, fails) in [("a", false), ("b", true), ("c", false)] {
            let invoked = invoked.clone();
            registry
                .register(
                    "ping",
                    handler_fn(name, move |_ctx, _event| {
                        let invoked = invoked.clone();
                        async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            if fails {
                                Err(HandlerError::msg("boom"))
                            } else {
                                Ok(json!("ok"))
                            }
                        }
                    }),
                )
                .await
                .unwrap();
        }

        let results = registry.trigger(ctx(), Arc::new(Event::new("ping"))).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_is_silent_noop() {
        let registry = HandlerRegistry::new();
        let results = registry
            .trigger(ctx(), Arc::new(Event::new("nobody-listens")))
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_variants() {
        let registry = HandlerRegistry::new();
        let noop = |name: &str| handler_fn(name, |_ctx, _event| async { Ok(Value::Null) });
        registry.register("ping", noop("a")).await.unwrap();
        registry.register("ping", noop("b")).await.unwrap();
        registry.register("pong", noop("a")).await.unwrap();

        registry.unregister("ping", Some("a")).await;
        assert_eq!(registry.count("ping").await, 1);

        registry.unregister_handler("a").await;
        assert_eq!(registry.count("pong").await, 0);

        registry.unregister("ping", None).await;
        assert_eq!(registry.count("ping").await, 0);
    }
}
