//! In-process broker transport.
//!
//! `MemoryTransport` behaves like a set of brokers living inside the process.
//! Connections subscribe to topics and receive whatever is published through
//! the transport handle, which also lets callers refuse connections, drop
//! them from the broker side, or stall their close handshake.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::traits::{
    ConnectTarget, Connection, ConnectionId, InboundMessage, Transport, TransportError,
};

/// What the broker side pushes to a connection.
#[derive(Debug)]
enum Delivery {
    Message(InboundMessage),
    Dropped(String),
    Rejected(String),
    Closed,
}

/// Broker-side view of one open connection.
#[derive(Debug)]
struct Peer {
    authority: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct MemoryBroker {
    peers: DashMap<ConnectionId, Peer>,
    refused: DashMap<String, String>,
    denied_filters: DashMap<String, ()>,
    connect_delay_ms: AtomicU64,
    stall_close: AtomicBool,
    connects: AtomicU64,
}

impl MemoryBroker {
    fn matching_peers(&self, authority: &str) -> Vec<ConnectionId> {
        self.peers
            .iter()
            .filter(|p| p.authority == authority)
            .map(|p| p.key().clone())
            .collect()
    }

    fn release(&self, id: &ConnectionId) {
        if self.peers.remove(id).is_some() {
            debug!(connection = %id, "Memory broker released connection");
        }
    }
}

/// An in-process broker transport.
///
/// Cloning the handle shares the same brokers.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    /// Create a new in-memory transport with every broker reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connection attempts to `host:port` fail with `reason`.
    pub fn refuse(&self, host: &str, port: u16, reason: impl Into<String>) {
        self.broker
            .refused
            .insert(format!("{host}:{port}"), reason.into());
    }

    /// Accept connection attempts to `host:port` again.
    pub fn accept(&self, host: &str, port: u16) {
        self.broker.refused.remove(&format!("{host}:{port}"));
    }

    /// Make the broker at `host:port` refuse subscriptions to `filter`.
    ///
    /// The subscribe call itself succeeds; the refusal arrives on the next
    /// `recv()`, as a broker's SUBACK would.
    pub fn deny_subscription(&self, host: &str, port: u16, filter: &str) {
        self.broker
            .denied_filters
            .insert(format!("{host}:{port}/{filter}"), ());
    }

    /// Delay every connection attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.broker.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// When set, `close()` on any connection never completes.
    pub fn set_stall_close(&self, stall: bool) {
        self.broker.stall_close.store(stall, Ordering::SeqCst);
    }

    /// Publish a message on the broker at `host:port`.
    ///
    /// Returns the number of connections the message was delivered to.
    pub fn publish(&self, host: &str, port: u16, topic: &str, payload: impl Into<Bytes>) -> usize {
        let authority = format!("{host}:{port}");
        let payload = payload.into();
        let mut delivered = 0;

        for peer in self.broker.peers.iter() {
            if peer.authority != authority
                || !peer.filters.iter().any(|f| topic_matches(f, topic))
            {
                continue;
            }
            let message = InboundMessage::new(topic, payload.clone());
            if peer.tx.send(Delivery::Message(message)).is_ok() {
                delivered += 1;
            }
        }

        trace!(broker = %authority, topic = %topic, delivered, "Memory broker published");
        delivered
    }

    /// Drop every connection to `host:port` from the broker side.
    ///
    /// With a reason the connections fail with that error; without one they
    /// end cleanly. Returns the number of connections dropped.
    pub fn drop_connections(&self, host: &str, port: u16, reason: Option<&str>) -> usize {
        let ids = self.broker.matching_peers(&format!("{host}:{port}"));
        for id in &ids {
            if let Some((_, peer)) = self.broker.peers.remove(id) {
                let delivery = match reason {
                    Some(r) => Delivery::Dropped(r.to_string()),
                    None => Delivery::Closed,
                };
                let _ = peer.tx.send(delivery);
            }
        }
        ids.len()
    }

    /// Number of open connections to `host:port` subscribed to `filter`.
    #[must_use]
    pub fn subscriber_count(&self, host: &str, port: u16, filter: &str) -> usize {
        let authority = format!("{host}:{port}");
        self.broker
            .peers
            .iter()
            .filter(|p| p.authority == authority && p.filters.iter().any(|f| f == filter))
            .count()
    }

    /// Number of open connections to `host:port`.
    #[must_use]
    pub fn connection_count(&self, host: &str, port: u16) -> usize {
        self.broker
            .matching_peers(&format!("{host}:{port}"))
            .len()
    }

    /// Total connection attempts that reached the broker.
    #[must_use]
    pub fn total_connects(&self) -> u64 {
        self.broker.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Connection>, TransportError> {
        let delay = self.broker.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let authority = target.authority();
        self.broker.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.broker.refused.get(&authority) {
            return Err(TransportError::ConnectFailed(reason.clone()));
        }

        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.peers.insert(
            id.clone(),
            Peer {
                authority: authority.clone(),
                filters: Vec::new(),
                tx,
            },
        );

        debug!(connection = %id, broker = %authority, "Memory broker accepted connection");

        Ok(Box::new(MemoryConnection {
            id,
            broker: Arc::clone(&self.broker),
            rx,
            is_open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A connection to the in-process broker.
pub struct MemoryConnection {
    id: ConnectionId,
    broker: Arc<MemoryBroker>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    is_open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        match self.broker.peers.get_mut(&self.id) {
            Some(mut peer) if self.is_open => {
                let key = format!("{}/{}", peer.authority, topic);
                if self.broker.denied_filters.contains_key(&key) {
                    let _ = peer.tx.send(Delivery::Rejected(topic.to_string()));
                } else {
                    peer.filters.push(topic.to_string());
                }
                Ok(())
            }
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        match self.rx.recv().await {
            Some(Delivery::Message(message)) => Ok(Some(message)),
            Some(Delivery::Dropped(reason)) => {
                self.is_open = false;
                Err(TransportError::Disconnected(reason))
            }
            Some(Delivery::Rejected(topic)) => {
                self.is_open = false;
                Err(TransportError::Subscribe(format!(
                    "broker rejected subscription to '{topic}'"
                )))
            }
            Some(Delivery::Closed) | None => {
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.broker.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.is_open = false;
        self.broker.release(&self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.release(&self.id);
    }
}

/// Match a topic against an MQTT topic filter (`+` and `#` wildcards).
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
