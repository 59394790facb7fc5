//! Switchyard - event broker and scheduler core
//!
//! Receives events from many producers, applies trigger-based scheduling
//! (immediate, interval, one-shot, cron), routes events to subscribed
//! consumers over a pub/sub transport, and bridges synchronous RPC
//! semantics on top of the asynchronous substrate.

pub mod broker;
pub mod config;
pub mod context;
pub mod engine;
pub mod event;
pub mod handlers;
pub mod queue;
pub mod transport;
pub mod trigger;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{Broker, BrokerOptions};
pub use context::Context;
pub use engine::{DispatchMode, Engine, EngineError, EngineOptions, EngineState};
pub use event::Event;
pub use handlers::{
    handler_fn, rpc_fn, EventHandler, HandlerError, HandlerRegistry, RpcHandler, RpcRegistry,
    RpcReply,
};
pub use queue::{EventQueue, QueueError};
pub use trigger::{Repeat, Trigger, TriggerStatus};
