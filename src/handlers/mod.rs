//! Handler traits and registries.
//!
//! This module contains:
//! - `EventHandler` trait: fire-and-forget multi-dispatch callbacks
//! - `RpcHandler` trait: single-handler request/reply methods
//! - `HandlerRegistry`: event type -> ordered handler list
//! - `RpcRegistry`: method name -> handler, errors surfaced as reply data

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::event::Event;

pub mod registry;
pub mod rpc;

pub use registry::HandlerRegistry;
pub use rpc::{RpcFault, RpcRegistry, RpcReply};

/// Failure raised inside a handler.
///
/// Always contained at the registry boundary: logged with the handler's
/// identity and the event, never propagated to the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Build a failure from any displayable message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Registration-time failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Empty event type or handler name; rejected at registration, never at
    /// dispatch.
    #[error("Invalid handler registration: {0}")]
    InvalidHandler(String),
}

/// Callback observing events of a registered type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used for idempotent registration and in logs.
    fn name(&self) -> &str;

    /// Process one event. The returned value is collected by
    /// [`HandlerRegistry::trigger`]; failures are logged and dropped.
    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError>;
}

/// Callback serving one RPC method.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Identity used in logs.
    fn name(&self) -> &str;

    /// Execute the method; the result (or error) becomes the reply payload.
    async fn call(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Context>, Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        (self.f)(ctx, event).await
    }
}

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Arc<Context>, Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: Arc<Context>, event: Arc<Event>) -> Result<Value, HandlerError> {
        (self.f)(ctx, event).await
    }
}

/// Wrap an async closure as a named [`EventHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Context>, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Wrap an async closure as a named [`RpcHandler`].
pub fn rpc_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn RpcHandler>
where
    F: Fn(Arc<Context>, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
