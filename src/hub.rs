//! Broadcast hub for real-time viewers
//!
//! One hub is built at startup and shared through [`crate::AppState`]. Every
//! subscriber owns an unbounded queue; a failed send means the subscriber is
//! gone and it is pruned on the spot.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Event catalog of the real-time channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewDelivery,
    UpdateDelivery,
    FeedbackReceived,
    ExecutionEventsUpdated,
    SettingsUpdated,
    DesignUpdated,
    Pong,
}

/// One frame on the wire: `{"event": .., "data": ..}`
#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    pub event: EventKind,
    pub data: Value,
}

impl HubEvent {
    pub fn new(event: EventKind, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize {:?} payload: {}", event, e);
            Value::Null
        });
        Self { event, data }
    }
}

/// Receiving end handed to a connected viewer
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    backlog: VecDeque<HubEvent>,
    rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Subscription {
    /// Queue `events` ahead of every live event, including ones that arrived
    /// since `connect`.
    pub fn replay(&mut self, events: Vec<HubEvent>) {
        for event in events.into_iter().rev() {
            self.backlog.push_front(event);
        }
    }

    /// Next frame for this viewer. `None` once the hub dropped the sender.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }
}

#[derive(Debug, Default)]
pub struct BroadcastHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<HubEvent>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Live events are queued from this point on, so
    /// state loaded afterwards for [`Subscription::replay`] leaves no gap.
    pub fn connect(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.lock().insert(id, tx);
        tracing::debug!(subscriber = id, "Subscriber connected");

        Subscription {
            id,
            backlog: VecDeque::new(),
            rx,
        }
    }

    pub fn disconnect(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "Subscriber disconnected");
        }
    }

    /// Send an event to every subscriber, pruning the dead ones.
    /// Returns the number of subscribers reached.
    pub fn broadcast(&self, event: HubEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|id, tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(subscriber = id, "Pruned dead subscriber");
                false
            }
        });
        subscribers.len()
    }

    pub fn emit(&self, kind: EventKind, data: impl Serialize) -> usize {
        self.broadcast(HubEvent::new(kind, data))
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<HubEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
