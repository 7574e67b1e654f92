//! Event Hub
//!
//! Fans traffic and interception events out to live observers. A single task
//! owns the subscriber set and handles register, unregister and broadcast
//! commands in arrival order, so no subscriber is written by two broadcasts
//! at once and an unregister is never lost mid-broadcast.
//!
//! Broadcasting is non-blocking: when the command queue is full the message
//! is dropped and logged rather than slowing the proxy down.

use crate::breakpoint::{BreakpointKind, BreakpointView};
use crate::metrics::Metrics;
use crate::model::TrafficEntry;
use crate::pipeline::{EntryCallback, InterceptCallback};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Event hub stopped")]
    Stopped,
}

/// Why a message could not be handed to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Subscriber is backed up; this message is skipped
    Full,

    /// Subscriber is gone and will be dropped
    Closed,
}

/// A live observer connection.
///
/// Delivery must not block: the hub task serves every subscriber.
pub trait Subscriber: Send + 'static {
    fn try_deliver(&mut self, message: &Bytes) -> Result<(), DeliveryError>;
}

/// Channel-backed subscriber; the connection task drains the receiver
impl Subscriber for mpsc::Sender<Bytes> {
    fn try_deliver(&mut self, message: &Bytes) -> Result<(), DeliveryError> {
        self.try_send(message.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Wire format of hub messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage<'a> {
    Traffic {
        entry: &'a TrafficEntry,
    },
    Intercepted {
        intercept_type: BreakpointKind,
        id: &'a str,
        entry: &'a TrafficEntry,
    },
}

impl HubMessage<'_> {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

enum HubCommand {
    Register(SubscriberId, Box<dyn Subscriber>),
    Unregister(SubscriberId),
    Broadcast(Bytes),
    Count(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    /// Create the hub and start its coordinating task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(queue_capacity: usize) -> Self {
        let (commands, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(run_hub(rx));

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn register(&self, subscriber: impl Subscriber) -> Result<SubscriberId, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(HubCommand::Register(id, Box::new(subscriber)))
            .await
            .map_err(|_| HubError::Stopped)?;
        Ok(id)
    }

    pub async fn unregister(&self, id: SubscriberId) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Unregister(id))
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (ack, count) = oneshot::channel();
        self.commands
            .send(HubCommand::Count(ack))
            .await
            .map_err(|_| HubError::Stopped)?;
        count.await.map_err(|_| HubError::Stopped)
    }

    /// Publish a finalized entry
    pub fn broadcast_entry(&self, entry: &TrafficEntry) {
        self.broadcast_message(&HubMessage::Traffic { entry });
    }

    /// Publish a newly suspended exchange
    pub fn broadcast_intercept(&self, view: &BreakpointView) {
        self.broadcast_message(&HubMessage::Intercepted {
            intercept_type: view.kind,
            id: &view.id,
            entry: &view.entry,
        });
    }

    /// Publish pre-encoded bytes; dropped with a warning when the queue is full
    pub fn broadcast_raw(&self, message: Bytes) {
        match self.commands.try_send(HubCommand::Broadcast(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                Metrics::record_hub_drop("queue_full");
                warn!("Event hub queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                Metrics::record_hub_drop("stopped");
                debug!("Event hub stopped, message dropped");
            }
        }
    }

    /// Callback for the pipeline's finalized-entry hook
    pub fn entry_callback(&self) -> EntryCallback {
        let hub = self.clone();
        Arc::new(move |entry: &TrafficEntry| hub.broadcast_entry(entry))
    }

    /// Callback for the pipeline's intercepted hook
    pub fn intercept_callback(&self) -> InterceptCallback {
        let hub = self.clone();
        Arc::new(move |view: &BreakpointView| hub.broadcast_intercept(view))
    }

    fn broadcast_message(&self, message: &HubMessage<'_>) {
        match message.encode() {
            Ok(bytes) => self.broadcast_raw(bytes),
            Err(e) => warn!(error = %e, "Failed to encode hub message"),
        }
    }
}

async fn run_hub(mut rx: mpsc::Receiver<HubCommand>) {
    let mut subscribers: HashMap<SubscriberId, Box<dyn Subscriber>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register(id, subscriber) => {
                subscribers.insert(id, subscriber);
                Metrics::set_hub_subscribers(subscribers.len());
                info!(subscriber = id, total = subscribers.len(), "Subscriber registered");
            }
            HubCommand::Unregister(id) => {
                if subscribers.remove(&id).is_some() {
                    Metrics::set_hub_subscribers(subscribers.len());
                    info!(subscriber = id, total = subscribers.len(), "Subscriber unregistered");
                }
            }
            HubCommand::Broadcast(message) => {
                subscribers.retain(|id, subscriber| match subscriber.try_deliver(&message) {
                    Ok(()) => true,
                    Err(DeliveryError::Full) => {
                        Metrics::record_hub_drop("subscriber_full");
                        warn!(subscriber = *id, "Subscriber backed up, message skipped");
                        true
                    }
                    Err(DeliveryError::Closed) => {
                        Metrics::record_hub_drop("subscriber_closed");
                        info!(subscriber = *id, "Subscriber unreachable, dropping");
                        false
                    }
                });
                Metrics::set_hub_subscribers(subscribers.len());
            }
            HubCommand::Count(ack) => {
                let _ = ack.send(subscribers.len());
            }
        }
    }

    debug!("Event hub stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let hub = EventHub::new(16);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(tx_a).await.unwrap();
        hub.register(tx_b).await.unwrap();

        hub.broadcast_raw(Bytes::from_static(b"hello"));

        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let hub = EventHub::new(16);
        let (tx_gone, rx_gone) = mpsc::channel(4);
        let (tx_live, mut rx_live) = mpsc::channel(4);
        hub.register(tx_gone).await.unwrap();
        hub.register(tx_live).await.unwrap();
        drop(rx_gone);

        hub.broadcast_raw(Bytes::from_static(b"one"));

        // Remaining subscribers still receive the broadcast
        assert_eq!(rx_live.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(hub.subscriber_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::channel(4);
        let id = hub.register(tx).await.unwrap();
        hub.unregister(id).await.unwrap();

        hub.broadcast_raw(Bytes::from_static(b"ignored"));
        assert_eq!(hub.subscriber_count().await.unwrap(), 0);
        // Sender was dropped with the subscriber
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_subscriber_is_kept() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::channel(1);
        hub.register(tx).await.unwrap();

        hub.broadcast_raw(Bytes::from_static(b"first"));
        hub.broadcast_raw(Bytes::from_static(b"second"));
        assert_eq!(hub.subscriber_count().await.unwrap(), 1);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        hub.broadcast_raw(Bytes::from_static(b"third"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"third"));
    }

    #[tokio::test]
    async fn test_message_wire_format() {
        let hub = EventHub::new(16);
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(tx).await.unwrap();

        let entry = TrafficEntry::new("GET", "http://example.com/");
        hub.broadcast_entry(&entry);
        hub.broadcast_intercept(&BreakpointView {
            id: entry.id.clone(),
            kind: BreakpointKind::Response,
            entry: entry.clone(),
            registered_at: Utc::now(),
        });

        let traffic: serde_json::Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(traffic["type"], "traffic");
        assert_eq!(traffic["entry"]["id"], entry.id.as_str());

        let intercepted: serde_json::Value =
            serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(intercepted["type"], "intercepted");
        assert_eq!(intercepted["intercept_type"], "response");
        assert_eq!(intercepted["id"], entry.id.as_str());
        assert_eq!(intercepted["entry"]["url"], "http://example.com/");
    }
}
