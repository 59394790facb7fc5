//! In-memory transport hub.
//!
//! Wires front-end clients, the broker, and back-end workers together with
//! tokio channels inside one process. This is the standalone-mode transport
//! and the substrate for integration tests; real deployments implement the
//! same traits over a network transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::debug;

use super::frame::{self, BackendFrame};
use super::{FrontendMessage, FrontendTransport, BackendTransport, Result, TransportError, WorkerTransport};
use crate::event::Event;

/// Capacity of each hub channel.
const HUB_CAPACITY: usize = 1024;

/// In-memory hub implementing both broker-side transports.
///
/// Create one hub per process, hand it to the broker, and mint
/// [`ChannelClient`]s / [`ChannelWorker`]s from it for the peers.
pub struct ChannelHub {
    frontend_tx: mpsc::Sender<FrontendMessage>,
    frontend_rx: Mutex<mpsc::Receiver<FrontendMessage>>,
    clients: RwLock<HashMap<Vec<u8>, mpsc::Sender<Bytes>>>,
    backend_tx: mpsc::Sender<Bytes>,
    backend_rx: Mutex<mpsc::Receiver<Bytes>>,
    subscriptions: SubscriptionMap,
}

type SubscriptionMap = Arc<RwLock<HashMap<String, broadcast::Sender<Bytes>>>>;

/// Get or create the broadcast sender for a channel.
async fn subscription_sender(
    subscriptions: &SubscriptionMap,
    channel: &str,
) -> broadcast::Sender<Bytes> {
    if let Some(sender) = subscriptions.read().await.get(channel) {
        return sender.clone();
    }
    let mut subs = subscriptions.write().await;
    subs.entry(channel.to_string())
        .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
        .clone()
}

impl ChannelHub {
    /// Create a hub with empty routing state.
    pub fn new() -> Arc<Self> {
        let (frontend_tx, frontend_rx) = mpsc::channel(HUB_CAPACITY);
        let (backend_tx, backend_rx) = mpsc::channel(HUB_CAPACITY);
        Arc::new(Self {
            frontend_tx,
            frontend_rx: Mutex::new(frontend_rx),
            clients: RwLock::new(HashMap::new()),
            backend_tx,
            backend_rx: Mutex::new(backend_rx),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Register a front-end client under an address.
    pub async fn client(&self, addr: impl Into<String>) -> ChannelClient {
        let addr = Bytes::from(addr.into());
        let (reply_tx, reply_rx) = mpsc::channel(HUB_CAPACITY);
        self.clients.write().await.insert(addr.to_vec(), reply_tx);
        ChannelClient {
            addr,
            requests: self.frontend_tx.clone(),
            replies: Mutex::new(reply_rx),
        }
    }

    /// Create a back-end worker connection.
    pub fn worker(&self) -> ChannelWorker {
        let (inbox_tx, inbox_rx) = mpsc::channel(HUB_CAPACITY);
        ChannelWorker {
            subscriptions: self.subscriptions.clone(),
            upstream: self.backend_tx.clone(),
            inbox_tx,
            inbox: Mutex::new(inbox_rx),
        }
    }
}

#[async_trait]
impl FrontendTransport for ChannelHub {
    async fn recv(&self, timeout: Duration) -> Result<Option<FrontendMessage>> {
        let mut rx = self.frontend_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, client: &[u8], payload: Bytes) -> Result<()> {
        let tx = {
            let clients = self.clients.read().await;
            clients.get(client).cloned()
        };
        match tx {
            Some(tx) => tx
                .send(payload)
                .await
                .map_err(|_| TransportError::Send("client receiver dropped".to_string())),
            None => Err(TransportError::Send(format!(
                "unknown client {:?}",
                String::from_utf8_lossy(client)
            ))),
        }
    }
}

#[async_trait]
impl BackendTransport for ChannelHub {
    async fn recv(&self, timeout: Duration) -> Result<Option<BackendFrame>> {
        let mut rx = self.backend_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(raw)) => frame::decode_backend(raw).map(Some),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let framed = frame::encode_published(channel, &payload);
        let sender = {
            let subs = self.subscriptions.read().await;
            subs.get(channel).cloned()
        };
        match sender {
            // A send error only means no receiver is currently subscribed;
            // pub/sub delivery is best-effort.
            Some(sender) => {
                if sender.send(framed).is_err() {
                    debug!(channel = %channel, "Published with no live subscribers");
                }
                Ok(())
            }
            None => {
                debug!(channel = %channel, "Published to channel with no subscribers");
                Ok(())
            }
        }
    }
}

/// Front-end client handle: send requests, receive addressed replies.
pub struct ChannelClient {
    addr: Bytes,
    requests: mpsc::Sender<FrontendMessage>,
    replies: Mutex<mpsc::Receiver<Bytes>>,
}

impl ChannelClient {
    /// This client's address as the broker sees it.
    pub fn addr(&self) -> &Bytes {
        &self.addr
    }

    /// Pack and send an event to the broker front-end.
    pub async fn send(&self, event: &Event) -> Result<()> {
        let payload = event
            .pack()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        self.requests
            .send(FrontendMessage {
                client: self.addr.clone(),
                payload,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Receive the next reply event, or `None` on timeout.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<Event>> {
        let mut rx = self.replies.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(raw)) => Event::unpack(&raw)
                .map(Some)
                .map_err(|e| TransportError::Frame(e.to_string())),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    /// Send a request and wait for the next reply.
    pub async fn request(&self, event: &Event, timeout: Duration) -> Result<Option<Event>> {
        self.send(event).await?;
        self.recv(timeout).await
    }
}

/// Back-end worker handle: subscribe to channels, receive published
/// payloads, send frames upstream.
pub struct ChannelWorker {
    subscriptions: SubscriptionMap,
    upstream: mpsc::Sender<Bytes>,
    inbox_tx: mpsc::Sender<Bytes>,
    inbox: Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl WorkerTransport for ChannelWorker {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let mut receiver = subscription_sender(&self.subscriptions, channel)
            .await
            .subscribe();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if inbox.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Worker subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Announce the subscription so the broker learns about this consumer.
        self.upstream
            .send(frame::encode_subscribe(channel))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut rx = self.inbox.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(framed)) => {
                let (_channel, _tag, payload) = frame::decode_published(&framed)?;
                Ok(Some(payload))
            }
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.upstream
            .send(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl ChannelWorker {
    /// Announce an unsubscribe for a channel.
    ///
    /// The local forwarding task keeps draining until the worker drops; the
    /// broker-side bookkeeping is what the control frame updates.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.upstream
            .send(frame::encode_unsubscribe(channel))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frontend_request_reaches_broker_side() {
        let hub = ChannelHub::new();
        let client = hub.client("client-a").await;

        let event = Event::new("ping").data(json!("x")).channel("orders");
        client.send(&event).await.unwrap();

        let msg = FrontendTransport::recv(hub.as_ref(), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.client, Bytes::from("client-a"));
        assert_eq!(Event::unpack(&msg.payload).unwrap(), event);
    }

    #[tokio::test]
    async fn test_reply_routed_to_correct_client() {
        let hub = ChannelHub::new();
        let client_a = hub.client("a").await;
        let client_b = hub.client("b").await;

        let reply = Event::new("__ACK__").data(json!("OK"));
        FrontendTransport::send(hub.as_ref(), b"b", reply.pack().unwrap())
            .await
            .unwrap();

        assert_eq!(
            client_b
                .recv(Duration::from_millis(100))
                .await
                .unwrap()
                .unwrap()
                .event_type,
            "__ACK__"
        );
        assert!(client_a
            .recv(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_subscribe_announces_and_receives() {
        let hub = ChannelHub::new();
        let worker = hub.worker();
        worker.subscribe("orders").await.unwrap();

        // The broker side sees the control frame.
        let frame = BackendTransport::recv(hub.as_ref(), Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, BackendFrame::Subscribe("orders".to_string()));

        // Published payloads for the channel arrive at the worker.
        let payload = Event::new("order.created").pack().unwrap();
        BackendTransport::publish(hub.as_ref(), "orders", payload.clone())
            .await
            .unwrap();
        let received = worker.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(received, Some(payload));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_best_effort() {
        let hub = ChannelHub::new();
        let payload = Event::new("nobody").pack().unwrap();
        assert!(BackendTransport::publish(hub.as_ref(), "empty", payload)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_none() {
        let hub = ChannelHub::new();
        let got = FrontendTransport::recv(hub.as_ref(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
