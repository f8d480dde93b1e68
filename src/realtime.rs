//! Insert notifications: one broadcast channel per (table, duel) filter.
//!
//! ## Design
//! - ChangeFeed: Arc<Mutex<HashMap<ChannelKey, broadcast::Sender>>> shared by
//!   the data service (publisher) and every subscriber
//! - A channel is created by the first `subscribe` for its key and removed
//!   when the last `Subscription` for that key is dropped
//! - Publishing to a key nobody listens to is a silent no-op
//! - Delivery order follows publish order per channel; lagging receivers skip
//!   what they missed and keep going

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::models::{Clip, Message, Reaction, Table};

/// Default per-channel buffer (events in flight per filter).
pub const DEFAULT_CHANNEL_CAP: usize = 256;

/// The row carried by an insert notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "table", content = "row", rename_all = "lowercase")]
pub enum Record {
    Reactions(Reaction),
    Messages(Message),
    Clips(Clip),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::Reactions(_) => Table::Reactions,
            Record::Messages(_) => Table::Messages,
            Record::Clips(_) => Table::Clips,
        }
    }

    pub fn duel_id(&self) -> &str {
        match self {
            Record::Reactions(r) => &r.duel_id,
            Record::Messages(m) => &m.duel_id,
            Record::Clips(c) => &c.duel_id,
        }
    }
}

/// A change notification. Only inserts are ever published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "new", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert(Record),
}

impl ChangeEvent {
    pub fn record(&self) -> &Record {
        match self {
            ChangeEvent::Insert(record) => record,
        }
    }
}

/// Equality filter a subscription listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub table: Table,
    pub duel_id: String,
}

impl ChannelKey {
    pub fn new(table: Table, duel_id: &str) -> Self {
        ChannelKey {
            table,
            duel_id: duel_id.to_string(),
        }
    }
}

type Channels = Arc<Mutex<HashMap<ChannelKey, broadcast::Sender<ChangeEvent>>>>;

/// Registry of open notification channels.
#[derive(Clone)]
pub struct ChangeFeed {
    channels: Channels,
    capacity: usize,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        ChangeFeed::new(DEFAULT_CHANNEL_CAP)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        ChangeFeed {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Listen for inserts into `table` whose `duel_id` equals `duel_id`.
    pub fn subscribe(&self, table: Table, duel_id: &str) -> Subscription {
        let key = ChannelKey::new(table, duel_id);
        let rx = match self.channels.lock() {
            Ok(mut guard) => {
                guard.retain(|_, tx| tx.receiver_count() > 0);
                guard
                    .entry(key.clone())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe()
            }
            Err(_) => {
                // Poisoned registry: hand out an already-closed receiver.
                tracing::error!(%table, duel_id, "change feed lock poisoned");
                broadcast::channel(1).1
            }
        };
        tracing::debug!(%table, duel_id, "subscribed");
        Subscription {
            key,
            rx: Some(rx),
            feed: self.clone(),
        }
    }

    /// Fan an insert out to the matching channel. Returns how many
    /// subscribers received it.
    pub fn publish(&self, record: Record) -> usize {
        let key = ChannelKey::new(record.table(), record.duel_id());
        let tx = match self.channels.lock() {
            Ok(guard) => guard.get(&key).cloned(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(ChangeEvent::Insert(record)).unwrap_or(0),
            None => 0,
        }
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Number of live subscriptions on one filter.
    pub fn subscriber_count(&self, table: Table, duel_id: &str) -> usize {
        let key = ChannelKey::new(table, duel_id);
        self.channels
            .lock()
            .ok()
            .and_then(|g| g.get(&key).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Drop `rx` under the registry lock, then remove the channel if no
    /// receiver is left. Concurrent releases on one key serialize here, so
    /// the last one always sees a zero count.
    fn release(&self, key: &ChannelKey, rx: Option<broadcast::Receiver<ChangeEvent>>) {
        if let Ok(mut guard) = self.channels.lock() {
            drop(rx);
            let last = guard
                .get(key)
                .map(|tx| tx.receiver_count() == 0)
                .unwrap_or(false);
            if last {
                guard.remove(key);
                tracing::debug!(table = %key.table, duel_id = %key.duel_id, "channel removed");
            }
        }
    }
}

/// A live listener on one channel. Dropping it unsubscribes.
pub struct Subscription {
    key: ChannelKey,
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    feed: ChangeFeed,
}

impl Subscription {
    /// Next pending event, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(table = %self.key.table, duel_id = %self.key.duel_id, skipped, "subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the next event. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(table = %self.key.table, duel_id = %self.key.duel_id, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let rx = self.rx.take();
        self.feed.release(&self.key, rx);
    }
}
