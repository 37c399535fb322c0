//! # Internal Message Bus
//!
//! A bounded FIFO of messages that have no explicit remote target, plus
//! aggregate and per-peer statistics. Mirrors the teacher's
//! "track everything, guard the stats with one lock that's never held across
//! a channel send" shape, applied to message counting instead of latency
//! sampling.

use crate::error::{BrokerError, BrokerResult};
use crate::message::{Message, MessageType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Aggregate and per-peer counters tracked by the [`Bus`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    pub total_sent: u64,
    pub total_received: u64,
    pub by_type: HashMap<&'static str, u64>,
    pub first_message_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub per_peer: HashMap<String, PeerStats>,
}

/// Per-peer breakdown of sent/received counts.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PeerStats {
    pub sent: u64,
    pub received: u64,
}

struct StatsInner {
    stats: BusStats,
}

impl StatsInner {
    fn record(&mut self, msg: &Message, as_send: bool) {
        let now = Utc::now();
        if self.stats.first_message_time.is_none() {
            self.stats.first_message_time = Some(now);
        }
        self.stats.last_message_time = Some(now);

        let type_key = match msg.message_type {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Error => "error",
        };
        *self.stats.by_type.entry(type_key).or_insert(0) += 1;

        let peer = if as_send { &msg.target } else { &msg.source };
        let peer_entry = self
            .stats
            .per_peer
            .entry(peer.clone())
            .or_insert_with(PeerStats::default);

        if as_send {
            self.stats.total_sent += 1;
            peer_entry.sent += 1;
        } else {
            self.stats.total_received += 1;
            peer_entry.received += 1;
        }
    }
}

/// Bounded internal FIFO for messages with no explicit remote target.
///
/// `Send`/`Receive` block on a shared `tokio::sync::Mutex`-free channel pair;
/// the stats lock below is `parking_lot`, held only across the synchronous
/// bookkeeping in [`StatsInner::record`], never across an `.await`.
pub struct Bus {
    tx: mpsc::Sender<Message>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    stats: Mutex<StatsInner>,
    closed: AtomicBool,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stats: Mutex::new(StatsInner {
                stats: BusStats::default(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// A message is classified as a *send* if it carries a non-empty target
    /// other than `"broker"`, else as a *receive*.
    fn is_send(msg: &Message) -> bool {
        !msg.target.is_empty() && msg.target != "broker"
    }

    /// Enqueue `msg`, waiting for space or for `cancel` to fire.
    pub async fn send(&self, msg: Message, cancel: &CancellationToken) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::illegal_state("bus is closed"));
        }
        let as_send = Self::is_send(&msg);
        tokio::select! {
            result = self.tx.send(msg.clone()) => {
                result.map_err(|_| BrokerError::illegal_state("bus channel closed"))?;
                self.stats.lock().record(&msg, as_send);
                Ok(())
            }
            _ = cancel.cancelled() => Err(BrokerError::cancelled("bus send cancelled")),
        }
    }

    /// Non-blocking, best-effort enqueue for broker-internal emitters (e.g.
    /// `process_exited` events). Drops silently on a full or closed bus.
    pub fn send_internal(&self, msg: Message) {
        let as_send = Self::is_send(&msg);
        match self.tx.try_send(msg.clone()) {
            Ok(()) => self.stats.lock().record(&msg, as_send),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Wait for the next message or for `cancel` to fire.
    pub async fn receive(&self, cancel: &CancellationToken) -> BrokerResult<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::illegal_state("bus is closed"));
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg.ok_or_else(|| BrokerError::illegal_state("bus channel closed")),
            _ = cancel.cancelled() => Err(BrokerError::cancelled("bus receive cancelled")),
        }
    }

    /// Close the bus. Concurrent senders observe a typed "channel closed"
    /// error on their next call rather than panicking.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> BusStats {
        self.stats.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(target: &str) -> Message {
        let mut msg = Message::new_event("evt", "p1", &json!({})).unwrap();
        msg.target = target.to_string();
        msg
    }

    #[tokio::test]
    async fn send_then_receive_round_trips() {
        let bus = Bus::new(4);
        let cancel = CancellationToken::new();
        bus.send(event(""), &cancel).await.unwrap();
        let received = bus.receive(&cancel).await.unwrap();
        assert_eq!(received.id, "evt");
    }

    #[tokio::test]
    async fn stats_are_monotonic_and_first_time_is_stable() {
        let bus = Bus::new(4);
        let cancel = CancellationToken::new();
        bus.send(event(""), &cancel).await.unwrap();
        let first = bus.stats().first_message_time.unwrap();
        bus.send(event(""), &cancel).await.unwrap();
        let stats = bus.stats();
        assert_eq!(stats.first_message_time.unwrap(), first);
        assert!(stats.last_message_time.unwrap() >= first);
        assert_eq!(stats.total_received, 2);
    }

    #[tokio::test]
    async fn send_classifies_by_target() {
        let bus = Bus::new(4);
        let cancel = CancellationToken::new();
        bus.send(event("worker-1"), &cancel).await.unwrap();
        bus.send(event(""), &cancel).await.unwrap();
        bus.send(event("broker"), &cancel).await.unwrap();
        let stats = bus.stats();
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.total_received, 2);
    }

    #[tokio::test]
    async fn send_internal_drops_silently_when_full() {
        let bus = Bus::new(1);
        let cancel = CancellationToken::new();
        bus.send(event(""), &cancel).await.unwrap();
        bus.send_internal(event(""));
        assert_eq!(bus.stats().total_received, 1);
    }

    #[tokio::test]
    async fn closed_bus_surfaces_typed_error_instead_of_panicking() {
        let bus = Bus::new(4);
        let cancel = CancellationToken::new();
        bus.close();
        let err = bus.send(event(""), &cancel).await.unwrap_err();
        assert!(matches!(err, BrokerError::IllegalState(_)));
    }
}
