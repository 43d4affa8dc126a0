//! Message-bus contract and the publish/retry primitive
//!
//! The transport is an external collaborator; [`MessageBus`] is the
//! request/reply + subscribe surface the core needs. [`Publisher`] wraps
//! request/reply with the run's fixed timeout: a genuine timeout is
//! transient and retried indefinitely, any other failure is fatal for the
//! run and returned to the caller.
//!
//! Subjects are job-scoped by a prefix: `{subject}_full`,
//! `{subject}_full_complete`, `{subject}_incr_hete`, `{subject}_progress`,
//! `{subject}_restart`, `{subject}_error`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use crate::common::{ExtractError, Result, Shutdown};

/// A message delivered to a subscriber.
pub struct BusMessage {
    pub payload: Bytes,
    reply: Option<oneshot::Sender<Bytes>>,
}

impl BusMessage {
    pub fn new(payload: Bytes, reply: Option<oneshot::Sender<Bytes>>) -> Self {
        Self { payload, reply }
    }

    /// Answer a request/reply message. A second call is a no-op.
    pub fn respond(&mut self, payload: Bytes) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(payload);
        }
    }
}

/// An active subscription: an ordered stream of [`BusMessage`]s.
pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the bus side closes.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Request/reply publish + subscribe, as provided by the transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and wait for the consumer's acknowledgement.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription>;

    /// Cumulative bytes handed to the transport.
    fn out_bytes(&self) -> u64;

    /// The address this bus advertises (host:port).
    fn server_addr(&self) -> &str;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Builds a [`MessageBus`] once the coordinator has resolved the address.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn MessageBus>>;
}

// ============================================================================
// Correlation framing
// ============================================================================

/// Causal-correlation metadata carried ahead of a wire body for external
/// observability tooling. Not required for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub id: Uuid,
    /// Subject of the publish that caused this one, if any
    pub causation: Option<String>,
}

impl Correlation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            causation: None,
        }
    }

    pub fn caused_by(subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            causation: Some(subject.into()),
        }
    }
}

impl Default for Correlation {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix a body with its optional correlation metadata.
///
/// Layout: `u32 big-endian header length | header JSON | body`. A zero
/// header length means no metadata.
pub fn frame(correlation: Option<&Correlation>, body: &[u8]) -> Result<Bytes> {
    let header = match correlation {
        Some(c) => serde_json::to_vec(c)
            .map_err(|e| ExtractError::serialization(format!("correlation header: {e}")))?,
        None => Vec::new(),
    };
    let mut out = BytesMut::with_capacity(4 + header.len() + body.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Inverse of [`frame`].
pub fn unframe(framed: &[u8]) -> Result<(Option<Correlation>, Bytes)> {
    if framed.len() < 4 {
        return Err(ExtractError::serialization("framed payload too short"));
    }
    let header_len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    if framed.len() < 4 + header_len {
        return Err(ExtractError::serialization("framed payload truncated"));
    }
    let correlation = if header_len == 0 {
        None
    } else {
        Some(
            serde_json::from_slice(&framed[4..4 + header_len])
                .map_err(|e| ExtractError::serialization(format!("correlation header: {e}")))?,
        )
    };
    Ok((correlation, Bytes::copy_from_slice(&framed[4 + header_len..])))
}

// ============================================================================
// Publish/retry primitive
// ============================================================================

/// Request/reply with timeout retry.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
    shutdown: Shutdown,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration, shutdown: Shutdown) -> Self {
        Self {
            bus,
            timeout,
            shutdown,
        }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Publish `body` on `subject` and wait for the acknowledgement.
    ///
    /// Timeouts retry indefinitely; the loop only exits on success, on a
    /// non-timeout error (fatal for the run) or on shutdown.
    pub async fn publish(
        &self,
        subject: &str,
        body: Bytes,
        correlation: Option<&Correlation>,
    ) -> Result<()> {
        let framed = frame(correlation, &body)?;
        loop {
            debug!(subject, len = framed.len(), "publish");
            let attempt = self
                .shutdown
                .guard(self.bus.request(subject, framed.clone(), self.timeout))
                .await?;
            match attempt {
                Ok(_ack) => return Ok(()),
                Err(e) if e.is_retriable() => {
                    debug!(subject, error = %e, "publish timeout, retrying");
                }
                Err(e) => {
                    error!(subject, error = %e, "unexpected error on publish");
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// In-memory bus
// ============================================================================

/// In-process [`MessageBus`] with deterministic request/reply, for tests and
/// embedded runs. Every request body is also recorded for inspection.
pub struct InMemoryBus {
    addr: String,
    subs: parking_lot::Mutex<HashMap<String, mpsc::Sender<BusMessage>>>,
    published: parking_lot::Mutex<Vec<(String, Bytes)>>,
    out_bytes: AtomicU64,
    /// Acknowledge subjects nobody subscribes to instead of timing out
    ack_unrouted: bool,
}

impl InMemoryBus {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            subs: parking_lot::Mutex::new(HashMap::new()),
            published: parking_lot::Mutex::new(Vec::new()),
            out_bytes: AtomicU64::new(0),
            ack_unrouted: true,
        })
    }

    /// Like [`InMemoryBus::new`], but unrouted requests time out.
    pub fn strict(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            subs: parking_lot::Mutex::new(HashMap::new()),
            published: parking_lot::Mutex::new(Vec::new()),
            out_bytes: AtomicU64::new(0),
            ack_unrouted: false,
        })
    }

    /// Send a fire-and-forget message to a subscriber (control signals).
    pub async fn send(&self, subject: &str, payload: Bytes) -> Result<()> {
        let tx = self.subs.lock().get(subject).cloned();
        match tx {
            Some(tx) => tx
                .send(BusMessage::new(payload, None))
                .await
                .map_err(|_| ExtractError::bus(format!("subscriber gone: {subject}"))),
            None => Err(ExtractError::bus(format!("no subscriber: {subject}"))),
        }
    }

    /// Request/reply from the consumer side (position-sync probes).
    pub async fn request_reply(&self, subject: &str, payload: Bytes) -> Result<Bytes> {
        self.request(subject, payload, Duration::from_secs(1)).await
    }

    /// Recorded request bodies for `subject`, correlation frames stripped.
    pub fn published_bodies(&self, subject: &str) -> Vec<Bytes> {
        self.published
            .lock()
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, framed)| unframe(framed).map(|(_, body)| body).unwrap_or_default())
            .collect()
    }

    pub fn published_count(&self, subject: &str) -> usize {
        self.published.lock().iter().filter(|(s, _)| s == subject).count()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        self.out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.published
            .lock()
            .push((subject.to_string(), payload.clone()));

        let tx = self.subs.lock().get(subject).cloned();
        match tx {
            Some(tx) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                tx.send(BusMessage::new(payload, Some(reply_tx)))
                    .await
                    .map_err(|_| ExtractError::bus(format!("subscriber gone: {subject}")))?;
                match tokio::time::timeout(timeout, reply_rx).await {
                    Ok(Ok(ack)) => Ok(ack),
                    Ok(Err(_)) => Err(ExtractError::timeout(format!("no reply on {subject}"))),
                    Err(_) => Err(ExtractError::timeout(format!("request on {subject}"))),
                }
            }
            None if self.ack_unrouted => Ok(Bytes::new()),
            None => {
                // Nobody to answer: behave like the transport and let the
                // request run out its clock.
                tokio::time::sleep(timeout).await;
                Err(ExtractError::timeout(format!("no responder on {subject}")))
            }
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        let (tx, rx) = mpsc::channel(64);
        self.subs.lock().insert(subject.to_string(), tx);
        Ok(BusSubscription::new(rx))
    }

    fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    fn server_addr(&self) -> &str {
        &self.addr
    }

    async fn close(&self) -> Result<()> {
        self.subs.lock().clear();
        Ok(())
    }
}

/// Connector handing out one shared [`InMemoryBus`] regardless of address.
pub struct InMemoryBusConnector {
    bus: Arc<InMemoryBus>,
}

impl InMemoryBusConnector {
    pub fn new(bus: Arc<InMemoryBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl BusConnector for InMemoryBusConnector {
    async fn connect(&self, _addr: &str) -> Result<Arc<dyn MessageBus>> {
        Ok(self.bus.clone())
    }
}

// ============================================================================
// NATS adapter (feature "nats")
// ============================================================================

/// `async-nats`-backed [`MessageBus`].
#[cfg(feature = "nats")]
pub struct NatsBus {
    client: async_nats::Client,
    addr: String,
    out_bytes: AtomicU64,
}

#[cfg(feature = "nats")]
impl NatsBus {
    /// Connect to a NATS server at `host:port`.
    pub async fn connect(addr: &str) -> Result<Arc<Self>> {
        let url = format!("nats://{addr}");
        let client = async_nats::connect(url.as_str())
            .await
            .map_err(|e| ExtractError::bus(format!("NATS connect {url}: {e}")))?;
        debug!(%url, "connected to NATS");
        Ok(Arc::new(Self {
            client,
            addr: addr.to_string(),
            out_bytes: AtomicU64::new(0),
        }))
    }
}

#[cfg(feature = "nats")]
#[async_trait]
impl MessageBus for NatsBus {
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        self.out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        let fut = self.client.request(subject.to_string(), payload);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(msg)) => Ok(msg.payload),
            // No responder yet behaves like a timeout: the consumer may still
            // be starting up.
            Ok(Err(e)) => Err(ExtractError::timeout(format!("request on {subject}: {e}"))),
            Err(_) => Err(ExtractError::timeout(format!("request on {subject}"))),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        use futures::StreamExt;

        let mut sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| ExtractError::bus(format!("subscribe {subject}: {e}")))?;
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let reply = msg.reply.clone().map(|reply_subject| {
                    let (reply_tx, reply_rx) = oneshot::channel::<Bytes>();
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Ok(ack) = reply_rx.await {
                            let _ = client.publish(reply_subject, ack).await;
                        }
                    });
                    reply_tx
                });
                if tx.send(BusMessage::new(msg.payload, reply)).await.is_err() {
                    break;
                }
            }
        });
        Ok(BusSubscription::new(rx))
    }

    fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    fn server_addr(&self) -> &str {
        &self.addr
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| ExtractError::bus(format!("flush: {e}")))
    }
}

/// Connector for [`NatsBus`].
#[cfg(feature = "nats")]
#[derive(Default)]
pub struct NatsBusConnector;

#[cfg(feature = "nats")]
#[async_trait]
impl BusConnector for NatsBusConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn MessageBus>> {
        let bus = NatsBus::connect(addr).await?;
        Ok(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_with_correlation() {
        let correlation = Correlation::caused_by("job1_full");
        let framed = frame(Some(&correlation), b"payload").unwrap();
        let (back, body) = unframe(&framed).unwrap();
        assert_eq!(back, Some(correlation));
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_frame_roundtrip_without_correlation() {
        let framed = frame(None, b"payload").unwrap();
        let (back, body) = unframe(&framed).unwrap();
        assert!(back.is_none());
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn test_unframe_rejects_truncation() {
        assert!(unframe(b"\x00").is_err());
        assert!(unframe(&[0, 0, 0, 9, b'x']).is_err());
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let bus = InMemoryBus::new("127.0.0.1:4222");
        let mut sub = bus.subscribe("job1_full").await.unwrap();

        let responder = tokio::spawn(async move {
            let mut msg = sub.recv().await.unwrap();
            msg.respond(Bytes::from_static(b"ack"));
            msg.payload
        });

        let ack = bus
            .request(
                "job1_full",
                Bytes::from_static(b"hello"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(&ack[..], b"ack");
        assert_eq!(&responder.await.unwrap()[..], b"hello");
        assert_eq!(bus.out_bytes(), 5);
    }

    #[tokio::test]
    async fn test_publisher_retries_timeouts_then_succeeds() {
        let bus = InMemoryBus::new("127.0.0.1:4222");
        let mut sub = bus.subscribe("job1_incr_hete").await.unwrap();

        // Ignore two requests (they time out), acknowledge the third.
        tokio::spawn(async move {
            for attempt in 0..3 {
                let mut msg = sub.recv().await.unwrap();
                if attempt == 2 {
                    msg.respond(Bytes::new());
                }
            }
        });

        let publisher = Publisher::new(
            bus.clone(),
            Duration::from_millis(20),
            Shutdown::new(),
        );
        publisher
            .publish("job1_incr_hete", Bytes::from_static(b"batch"), None)
            .await
            .unwrap();
        assert_eq!(bus.published_count("job1_incr_hete"), 3);
    }

    #[tokio::test]
    async fn test_publisher_fatal_on_non_timeout_error() {
        let bus = InMemoryBus::new("127.0.0.1:4222");
        // Subscribe then drop the subscription: sends fail outright.
        drop(bus.subscribe("job1_full").await.unwrap());

        let publisher = Publisher::new(bus, Duration::from_millis(20), Shutdown::new());
        let err = publisher
            .publish("job1_full", Bytes::from_static(b"entry"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Bus(_)));
    }

    #[tokio::test]
    async fn test_publisher_exits_on_shutdown() {
        let bus = InMemoryBus::strict("127.0.0.1:4222");
        let shutdown = Shutdown::new();
        let publisher = Publisher::new(bus, Duration::from_millis(5), shutdown.clone());

        let handle = tokio::spawn(async move {
            publisher
                .publish("job1_full", Bytes::from_static(b"entry"), None)
                .await
        });
        tokio::task::yield_now().await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ExtractError::Shutdown)));
    }
}
