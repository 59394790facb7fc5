//! RPC method registry: request/reply semantics over pub/sub.
//!
//! RPC failures are data, not exceptions: `execute` always produces a
//! [`RpcReply`] so the remote caller can inspect the outcome, and nothing
//! propagates to the transport layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::registry::DEFAULT_TIME_BUDGET;
use super::RpcHandler;
use crate::context::Context;
use crate::event::Event;

/// Machine-readable fault kinds carried in reply payloads.
pub mod fault_kind {
    /// The requested method is not registered anywhere.
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    /// The serving handler returned an error.
    pub const HANDLER_ERROR: &str = "handler_error";
}

/// Structured error carried inside a reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcFault {
    /// One of the [`fault_kind`] constants.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

/// Outcome of an RPC call, serialized as the reply event's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcReply {
    /// True when `value` holds the method's result.
    pub ok: bool,
    /// Method result; `null` on failure.
    #[serde(default)]
    pub value: Value,
    /// Failure details; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

impl RpcReply {
    /// Successful reply.
    pub fn ok(value: Value) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    /// Reply carrying a fault.
    pub fn fault(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: Value::Null,
            error: Some(RpcFault {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Reply for an unregistered method.
    pub fn method_not_found(method: &str) -> Self {
        Self::fault(
            fault_kind::METHOD_NOT_FOUND,
            format!("method '{method}' is not registered"),
        )
    }

    /// Serialize into an event payload.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse from an event payload.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Maps method names to their single serving handler.
pub struct RpcRegistry {
    methods: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    time_budget: Duration,
}

impl RpcRegistry {
    /// Registry with the default time budget.
    pub fn new() -> Self {
        Self::with_time_budget(DEFAULT_TIME_BUDGET)
    }

    /// Registry warning when a method exceeds `time_budget`.
    pub fn with_time_budget(time_budget: Duration) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            time_budget,
        }
    }

    /// Register a method. A re-register replaces the previous handler.
    pub async fn register(&self, method: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let method = method.into();
        info!(method = %method, handler = %handler.name(), "RPC method registered");
        if self
            .methods
            .write()
            .await
            .insert(method.clone(), handler)
            .is_some()
        {
            warn!(method = %method, "Replaced previously registered RPC method");
        }
    }

    /// Remove a method.
    pub async fn unregister(&self, method: &str) {
        if self.methods.write().await.remove(method).is_some() {
            info!(method = %method, "RPC method unregistered");
        }
    }

    /// Names of all registered methods, for `__RPC_METHODS__` announcements.
    pub async fn methods(&self) -> Vec<String> {
        self.methods.read().await.keys().cloned().collect()
    }

    /// True if no methods are registered.
    pub async fn is_empty(&self) -> bool {
        self.methods.read().await.is_empty()
    }

    /// Execute the method named by `event.event_type`.
    ///
    /// Never fails out of this call: an unregistered method or a handler
    /// error is rendered into the returned reply.
    pub async fn execute(&self, ctx: Arc<Context>, event: Arc<Event>) -> RpcReply {
        let handler = {
            let methods = self.methods.read().await;
            methods.get(&event.event_type).cloned()
        };

        let Some(handler) = handler else {
            warn!(method = %event.event_type, "RPC call for unregistered method");
            return RpcReply::method_not_found(&event.event_type);
        };

        let started = Instant::now();
        let reply = match handler.call(ctx, event.clone()).await {
            Ok(value) => RpcReply::ok(value),
            Err(e) => {
                error!(
                    method = %event.event_type,
                    event_id = %event.id,
                    error = %e,
                    "RPC handler failed"
                );
                RpcReply::fault(fault_kind::HANDLER_ERROR, e.to_string())
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.time_budget {
            warn!(
                method = %event.event_type,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.time_budget.as_millis() as u64,
                "RPC method exceeded time budget"
            );
        }
        reply
    }
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}
