//! In-memory message store.
//!
//! Owns the set of captured messages and the id-to-position index. All
//! operations go through a single reader-writer lock; writers (insert,
//! delete, the TTL sweep) take it exclusively, readers share it. On each
//! insert the store publishes a `MessageEvent` to its subscribers on a
//! best-effort broadcast channel; a lagging subscriber loses events rather
//! than slowing the store down.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::message::Message;

/// Interval between TTL sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the insert-notification channel, per subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by store operations.
///
/// The in-memory backend has exactly one failure mode; everything else is
/// infallible.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,
}

/// Notification published on every successful insert.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageEvent {
    pub id: String,
    pub created: DateTime<Utc>,
}

/// The search dimensions understood by [`InMemory::search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    To,
    From,
    Containing,
}

impl SearchKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "to" => Some(SearchKind::To),
            "from" => Some(SearchKind::From),
            "containing" => Some(SearchKind::Containing),
            _ => None,
        }
    }
}

/// State behind the store's lock. The index invariant holds at every
/// release of the write guard: `index[m.id] == i` iff `messages[i] == m`.
#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
}

impl Inner {
    /// Removes the message at `position`, shifting every index above it
    /// down by one. Callers hold the write guard.
    fn remove(&mut self, position: usize, id: &str) {
        self.index.remove(id);
        for value in self.index.values_mut() {
            if *value > position {
                *value -= 1;
            }
        }
        self.messages.remove(position);
    }
}

/// In-memory, TTL-expiring message store.
pub struct InMemory {
    ttl: Option<chrono::Duration>,
    inner: RwLock<Inner>,
    events: broadcast::Sender<MessageEvent>,
}

impl InMemory {
    /// Creates a store. A positive `ttl_seconds` starts a background sweep
    /// that evicts expired messages every 30 seconds; zero keeps messages
    /// until deleted. Must be called from within a Tokio runtime.
    pub fn new(ttl_seconds: u64) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = Arc::new(InMemory {
            ttl: (ttl_seconds > 0).then(|| chrono::Duration::seconds(ttl_seconds as i64)),
            inner: RwLock::new(Inner::default()),
            events,
        });

        if store.ttl.is_some() {
            info!("Message TTL set to {}s, starting sweep task", ttl_seconds);
            spawn_sweeper(Arc::downgrade(&store));
        }

        store
    }

    /// Inserts a message and returns its storage id. Publishes a
    /// `MessageEvent` to subscribers; delivery is best-effort.
    pub async fn insert(&self, message: Message) -> String {
        let id = message.id.clone();
        let event = MessageEvent {
            id: id.clone(),
            created: message.created,
        };

        {
            let mut inner = self.inner.write().await;
            inner.messages.push(message);
            let position = inner.messages.len() - 1;
            inner.index.insert(id.clone(), position);
        }

        debug!("Stored message {}", id);
        let _ = self.events.send(event);
        id
    }

    /// Number of currently stored messages.
    pub async fn count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Loads a message by storage id.
    pub async fn load(&self, id: &str) -> Option<Message> {
        let inner = self.inner.read().await;
        inner
            .index
            .get(id)
            .map(|&position| inner.messages[position].clone())
    }

    /// Lists messages newest-first. `start` skips that many from the
    /// newest, `limit` caps the slice. Returns the slice and the total
    /// stored count.
    pub async fn list(&self, start: usize, limit: usize) -> (Vec<Message>, usize) {
        let inner = self.inner.read().await;
        paginate(inner.messages.iter(), inner.messages.len(), start, limit)
    }

    /// Finds messages matching `query` under the given kind, paginated
    /// like [`list`](Self::list). An unknown kind yields an empty result.
    ///
    /// Matching is plain substring comparison after ASCII lower-casing;
    /// headers are compared as received, without MIME decoding.
    pub async fn search(
        &self,
        kind: &str,
        query: &str,
        start: usize,
        limit: usize,
    ) -> (Vec<Message>, usize) {
        let kind = match SearchKind::parse(kind) {
            Some(kind) => kind,
            None => return (Vec::new(), 0),
        };
        let query = query.to_ascii_lowercase();

        let inner = self.inner.read().await;
        let matched: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| matches(m, kind, &query))
            .collect();
        let total = matched.len();
        paginate(matched.into_iter(), total, start, limit)
    }

    /// Deletes a single message by storage id.
    pub async fn delete_one(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let position = *inner.index.get(id).ok_or(StoreError::NotFound)?;
        inner.remove(position, id);
        debug!("Deleted message {}", id);
        Ok(())
    }

    /// Deletes every stored message.
    pub async fn delete_all(&self) {
        let mut inner = self.inner.write().await;
        inner.messages.clear();
        inner.index.clear();
        debug!("Deleted all messages");
    }

    /// Registers a subscriber for insert notifications. A subscriber that
    /// falls more than the channel capacity behind sees a lag error on its
    /// receiver, never backpressure on the store.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    /// Evicts every message older than the configured TTL. No-op when no
    /// TTL is set.
    async fn sweep_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        let cutoff = Utc::now() - ttl;

        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .messages
            .iter()
            .filter(|m| m.created < cutoff)
            .map(|m| m.id.clone())
            .collect();

        for id in &expired {
            if let Some(&position) = inner.index.get(id) {
                inner.remove(position, id);
            }
        }

        if !expired.is_empty() {
            info!("TTL sweep evicted {} message(s)", expired.len());
        }
    }
}

/// Runs the periodic TTL sweep until the store is dropped.
fn spawn_sweeper(store: Weak<InMemory>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; skip it so the first sweep
        // happens one full interval after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.upgrade() {
                Some(store) => store.sweep_expired().await,
                None => break,
            }
        }
    });
}

/// Newest-first slice of `total` items: skip `start` from the newest, take
/// at most `limit`. `start >= total` yields an empty slice with the true
/// total; an overlong `limit` is clamped.
fn paginate<'a>(
    messages: impl DoubleEndedIterator<Item = &'a Message>,
    total: usize,
    start: usize,
    limit: usize,
) -> (Vec<Message>, usize) {
    let slice = messages.rev().skip(start).take(limit).cloned().collect();
    (slice, total)
}

fn matches(message: &Message, kind: SearchKind, query: &str) -> bool {
    let contains = |value: &str| value.to_ascii_lowercase().contains(query);

    match kind {
        SearchKind::To => {
            message.to.iter().any(|path| contains(&path.address()))
                || message.content.get("To").iter().any(|v| contains(v))
        }
        SearchKind::From => {
            contains(&message.from.address())
                || message.content.get("From").iter().any(|v| contains(v))
        }
        SearchKind::Containing => {
            contains(&message.content.body)
                || message
                    .content
                    .headers
                    .iter()
                    .any(|header| contains(&header.value))
        }
    }
}
