//! Mutation notifications.
//!
//! Stores publish a [`StoreEvent`] after every successful mutation onto an
//! [`EventBus`] built on [`tokio::sync::broadcast`]. Listener registries and
//! anything that reacts to the events live outside this crate; the bus only
//! fans events out.
//!
//! ```rust,no_run
//! # use coffer_store::events::EventBus;
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//! // ... hand `bus.clone()` to a store ...
//! let event = rx.recv().await.unwrap();
//! println!("{} {}", event.change, event.path);
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// What kind of mutation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Set,
    Add,
    Subtract,
    Push,
    Pull,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    /// The operation that ran.
    pub change: ChangeKind,
    /// Owner-scope id (guild).
    pub guild_id: String,
    /// Entity-scope id (member), if the document is member-scoped.
    pub member_id: Option<String>,
    /// Dot-path of the mutated slot, relative to the owner/entity scope
    /// for cached documents and absolute for the flat-file store.
    pub path: String,
    /// Amount for add/subtract.
    pub amount: Option<f64>,
    /// Value of the slot after the mutation (for numeric slots, the balance).
    pub value: Value,
    /// Free-text reason supplied by the caller.
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Publish/subscribe bus for [`StoreEvent`]s.
///
/// Cheaply cloneable; subscribers receive `Arc<StoreEvent>` so payloads are
/// not cloned per receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<StoreEvent>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers and return how many will see it.
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: StoreEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "store event published");
                n
            }
            Err(_) => {
                tracing::trace!("store event published but no active receivers");
                0
            }
        }
    }

    /// Subscribe to future events. Earlier events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoreEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
