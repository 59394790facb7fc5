//! Transport boundary the core consumes.
//!
//! The wire transport itself (socket library, handshake, encryption) lives
//! outside this crate. The broker and engines only require the trait
//! contracts here: publish bytes on a channel, receive bytes with a channel
//! tag, multiplex front-end clients. The in-memory [`channel`] hub implements
//! all of them for tests and standalone mode.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::event::Event;

pub mod channel;
pub mod frame;
pub mod reconnect;

pub use channel::{ChannelClient, ChannelHub, ChannelWorker};
pub use frame::{BackendFrame, ControlTag};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Network-level failures from the transport collaborator.
///
/// The broker catches these around each send/receive attempt, logs, and
/// backs off before retrying; they never crash a loop.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Recv(String),

    #[error("Malformed frame: {0}")]
    Frame(String),
}

/// One inbound front-end request: the multiplexed client address plus the
/// packed event bytes.
#[derive(Debug, Clone)]
pub struct FrontendMessage {
    /// Opaque client address the reply must be routed back to.
    pub client: Bytes,
    /// Packed [`Event`].
    pub payload: Bytes,
}

/// External publisher the broker fans events out to.
///
/// Best-effort: a failed publish is logged and isolated, never retried by
/// the broker itself. Must be safe to call from multiple worker tasks.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Identity used in logs and for duplicate-registration checks.
    fn name(&self) -> &str;

    /// Publish a packed event on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
}

/// External event source polled by the dispatch loop.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Identity used in logs and for duplicate-registration checks.
    fn name(&self) -> &str;

    /// Non-blocking poll; empty when no events are pending.
    async fn poll(&self) -> Result<Vec<Event>>;
}

/// Front-end termination: multiplexed client requests in, addressed replies
/// out.
#[async_trait]
pub trait FrontendTransport: Send + Sync {
    /// Receive the next client request, or `None` on timeout.
    async fn recv(&self, timeout: Duration) -> Result<Option<FrontendMessage>>;

    /// Send a reply payload back to a specific client.
    async fn send(&self, client: &[u8], payload: Bytes) -> Result<()>;
}

/// Back-end termination: pub/sub fan-out plus subscription control frames.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Receive the next control or reply frame, or `None` on timeout.
    async fn recv(&self, timeout: Duration) -> Result<Option<BackendFrame>>;

    /// Publish a packed event tagged with its routing channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
}

/// Engine side of a broker back-end connection.
///
/// Mirrors the subscriber socket an engine opens toward the broker:
/// announce subscriptions, receive published payloads for them, and send
/// raw frames (replies, announcements) upstream.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Subscribe to a channel on the broker back-end.
    async fn subscribe(&self, channel: &str) -> Result<()>;

    /// Receive the next published payload, or `None` on timeout.
    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Send a packed event frame upstream to the broker.
    async fn send(&self, payload: Bytes) -> Result<()>;
}
