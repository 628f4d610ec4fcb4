//! In-process publish/subscribe fan-out bus.
//!
//! Each subscription owns a bounded channel. A subscription may listen on any number of topics,
//! and receives each publication at most once even when it matches several of the listed topics.
//! A subscription removed from its last topic is closed and can not be reused.
//!
//! Slow subscribers never block publishers indefinitely: `publish` waits at most the configured
//! timeout on a full buffer before dropping the message for that subscriber, and `try_publish`
//! drops immediately.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

const METRIC_BUS_DROPPED: &str = "shadow_bus_messages_dropped";

/// A topic based fan-out bus.
pub struct Bus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

struct BusInner<T> {
    capacity: usize,
    publish_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<BusState<T>>,
}

struct BusState<T> {
    /// Subscription IDs by topic.
    topics: HashMap<String, BTreeSet<u64>>,
    /// Subscriptions by ID.
    subs: HashMap<u64, Subscriber<T>>,
}

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    topics: BTreeSet<String>,
}

/// A handle to a bus subscription, which is removed from the bus when dropped.
pub struct SubscriptionGuard<T> {
    id: u64,
    bus: Bus<T>,
}

impl<T> Drop for SubscriptionGuard<T> {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}

impl<T> SubscriptionGuard<T> {
    /// The ID of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: Clone + Send + 'static> Bus<T> {
    /// Create a new bus whose subscriptions buffer up to `capacity` messages each.
    pub fn new(capacity: usize, publish_timeout: Duration) -> Self {
        metrics::register_counter!(METRIC_BUS_DROPPED, metrics::Unit::Count, "the number of bus messages dropped on full subscriber buffers");
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                publish_timeout,
                next_id: AtomicU64::new(0),
                state: Mutex::new(BusState {
                    topics: HashMap::new(),
                    subs: HashMap::new(),
                }),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState<T>> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a new subscription listening on the given topics.
    pub fn sub(&self, topics: &[&str]) -> (SubscriptionGuard<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.lock_state();
            state.subs.insert(
                id,
                Subscriber {
                    tx,
                    topics: BTreeSet::new(),
                },
            );
            state.add_topics(id, topics);
        }
        (SubscriptionGuard { id, bus: self.clone() }, rx)
    }

    /// Add topics to an existing subscription.
    ///
    /// Fails if the subscription has been closed by removing all of its topics.
    pub fn add_sub(&self, sub: &SubscriptionGuard<T>, topics: &[&str]) -> Result<()> {
        let mut state = self.lock_state();
        if !state.subs.contains_key(&sub.id) {
            bail!("bus subscription {} is closed", sub.id);
        }
        state.add_topics(sub.id, topics);
        Ok(())
    }

    /// Remove topics from a subscription, closing it when no topic remains.
    pub fn unsub(&self, sub: &SubscriptionGuard<T>, topics: &[&str]) {
        let mut state = self.lock_state();
        let is_empty = match state.subs.get_mut(&sub.id) {
            Some(subscriber) => {
                for topic in topics {
                    subscriber.topics.remove(*topic);
                }
                subscriber.topics.is_empty()
            }
            None => return,
        };
        for topic in topics {
            state.remove_from_topic(topic, sub.id);
        }
        if is_empty {
            state.subs.remove(&sub.id);
        }
    }

    /// Whether the given subscription is still open.
    pub fn is_subscribed(&self, sub: &SubscriptionGuard<T>) -> bool {
        self.lock_state().subs.contains_key(&sub.id)
    }

    /// Deliver a message to every subscription of any of the given topics.
    ///
    /// Waits up to the configured publish timeout on each full subscriber buffer, then drops the
    /// message for that subscriber. Returns the number of subscriptions the message reached.
    pub async fn publish(&self, msg: T, topics: &[&str]) -> usize {
        let mut delivered = 0;
        for (id, tx) in self.targets(topics) {
            match tx.send_timeout(msg.clone(), self.inner.publish_timeout).await {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    metrics::increment_counter!(METRIC_BUS_DROPPED);
                    tracing::warn!(subscription = id, "bus subscriber buffer full past timeout, message dropped");
                }
                Err(SendTimeoutError::Closed(_)) => (),
            }
        }
        delivered
    }

    /// Deliver a message to every subscription of any of the given topics without waiting.
    ///
    /// Subscribers with a full buffer miss the message. Returns the number of subscriptions the
    /// message reached.
    pub fn try_publish(&self, msg: T, topics: &[&str]) -> usize {
        let mut delivered = 0;
        for (id, tx) in self.targets(topics) {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    metrics::increment_counter!(METRIC_BUS_DROPPED);
                    tracing::debug!(subscription = id, "bus subscriber buffer full, message dropped");
                }
                Err(TrySendError::Closed(_)) => (),
            }
        }
        delivered
    }

    /// Collect the deduplicated senders of all subscriptions of the given topics.
    fn targets(&self, topics: &[&str]) -> Vec<(u64, mpsc::Sender<T>)> {
        let state = self.lock_state();
        let mut ids = BTreeSet::new();
        for topic in topics {
            if let Some(subs) = state.topics.get(*topic) {
                ids.extend(subs.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| state.subs.get(&id).map(|sub| (id, sub.tx.clone())))
            .collect()
    }
}

impl<T> Bus<T> {
    /// Remove a subscription from every topic.
    fn remove(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sub) = state.subs.remove(&id) {
            for topic in sub.topics.iter() {
                state.remove_from_topic(topic, id);
            }
        }
    }
}

impl<T> BusState<T> {
    fn add_topics(&mut self, id: u64, topics: &[&str]) {
        if let Some(sub) = self.subs.get_mut(&id) {
            for topic in topics {
                sub.topics.insert(topic.to_string());
                self.topics.entry(topic.to_string()).or_default().insert(id);
            }
        }
    }

    fn remove_from_topic(&mut self, topic: &str, id: u64) {
        if let Some(subs) = self.topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}
