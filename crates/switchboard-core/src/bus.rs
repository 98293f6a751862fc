//! Topic-keyed publish/subscribe bus.
//!
//! The bus is independent of sessions and rooms. Every subscriber owns a
//! bounded queue; publishing never waits on a slow consumer, it skips it.
//!
//! Each subscriber's lifetime is bound to a [`CancellationToken`] derived from
//! the caller's scope. Once the scope is cancelled the subscriber receives
//! nothing more, even before [`Bus::unsubscribe`] runs. Its registry entry is
//! kept (and still counted by [`Bus::subscriber_count`]) until it is
//! unsubscribed or reaped with [`Bus::prune_cancelled`].

use crate::event::Event;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default per-subscriber queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// A topic name.
pub type Topic = String;

/// A caller-chosen subscriber label.
pub type SubscriberId = String;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue capacity for each subscriber. Zero selects the default.
    pub buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    /// Number of topics with at least one subscriber.
    pub topics: usize,
    /// Publish calls since start.
    pub published: u64,
    /// Events queued to subscribers since start.
    pub delivered: u64,
    /// Events dropped because a subscriber queue was full.
    pub dropped: u64,
}

/// Registry key. Distinguishes subscribers that share a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriberKey(u64);

struct Slot {
    id: SubscriberId,
    sender: mpsc::Sender<Event>,
    token: CancellationToken,
}

struct BusInner {
    /// Topic -> subscribers. The registry holds the only senders.
    topics: DashMap<Topic, HashMap<SubscriberKey, Slot>>,
    buffer_size: usize,
    next_key: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the publish/subscribe bus.
///
/// Cloning is cheap; clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// The registration half of a subscriber.
///
/// This is what [`Bus::unsubscribe`] needs; it can be cloned and kept apart
/// from the queue, e.g. by a worker pool whose tasks share the queue.
#[derive(Debug, Clone)]
pub struct Subscription {
    key: SubscriberKey,
    id: SubscriberId,
    topics: Arc<[Topic]>,
    token: CancellationToken,
}

impl Subscription {
    /// Get the subscriber label.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the subscribed topics, in subscription order.
    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Get the subscriber's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Check if the subscriber's scope has ended.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A bus subscriber: its registration plus its event queue.
pub struct Subscriber {
    subscription: Subscription,
    receiver: mpsc::Receiver<Event>,
}

impl Subscriber {
    /// Get the registration.
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Get the subscriber label.
    #[must_use]
    pub fn id(&self) -> &str {
        self.subscription.id()
    }

    /// Get the subscribed topics.
    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        self.subscription.topics()
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscriber is unsubscribed and drained, or as
    /// soon as its scope is cancelled.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            _ = self.subscription.token.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Receive an event without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if no event is queued, `Disconnected` if the queue is
    /// closed or the scope is cancelled.
    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        if self.subscription.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        self.receiver.try_recv()
    }

    /// Split into the registration and the raw queue.
    #[must_use]
    pub fn into_parts(self) -> (Subscription, mpsc::Receiver<Event>) {
        (self.subscription, self.receiver)
    }
}

impl Bus {
    /// Create a bus with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with custom configuration.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        let buffer_size = if config.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            config.buffer_size
        };
        info!(buffer_size, "Creating bus");

        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                buffer_size,
                next_key: AtomicU64::new(0),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to one or more topics.
    ///
    /// The subscriber's token is a child of `parent`: cancelling the parent
    /// ends the subscription's delivery.
    pub fn subscribe<I, T>(
        &self,
        parent: &CancellationToken,
        id: impl Into<SubscriberId>,
        topics: I,
    ) -> Subscriber
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let id = id.into();
        let topics: Arc<[Topic]> = topics.into_iter().map(Into::into).collect();
        let key = SubscriberKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        let token = parent.child_token();
        let (sender, receiver) = mpsc::channel(self.inner.buffer_size);

        for topic in topics.iter() {
            self.inner.topics.entry(topic.clone()).or_default().insert(
                key,
                Slot {
                    id: id.clone(),
                    sender: sender.clone(),
                    token: token.clone(),
                },
            );
        }

        info!(subscriber = %id, topics = ?topics, "Subscriber added");

        Subscriber {
            subscription: Subscription {
                key,
                id,
                topics,
                token,
            },
            receiver,
        }
    }

    /// Remove a subscriber from every topic it holds.
    ///
    /// Cancels its token and drops the registry's senders, which closes the
    /// queue once any queued events are drained. Returns `false` if it was
    /// already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.token.cancel();

        let mut removed = false;
        for topic in subscription.topics.iter() {
            if let Entry::Occupied(mut entry) = self.inner.topics.entry(topic.clone()) {
                removed |= entry.get_mut().remove(&subscription.key).is_some();
                if entry.get().is_empty() {
                    entry.remove();
                    debug!(topic = %topic, "Deleted empty topic");
                }
            }
        }

        if removed {
            info!(subscriber = %subscription.id, "Subscriber removed");
        }
        removed
    }

    /// Publish a payload to a topic.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.publish_event(Event::new(topic, payload))
    }

    /// Publish a prepared event to its topic.
    ///
    /// Subscribers whose scope is cancelled or whose queue is full are
    /// skipped and not counted.
    pub fn publish_event(&self, event: Event) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let Some(subscribers) = self.inner.topics.get(event.topic()) else {
            trace!(topic = %event.topic(), "Publish to topic without subscribers");
            return 0;
        };

        let mut sent = 0;
        for slot in subscribers.values() {
            if slot.token.is_cancelled() {
                continue;
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = %slot.id,
                        topic = %event.topic(),
                        "Subscriber buffer full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(subscriber = %slot.id, "Subscriber queue dropped without unsubscribe");
                }
            }
        }

        self.inner
            .delivered
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Publish from a background task.
    ///
    /// The event is stamped now; delivery happens on the spawned task. The
    /// returned handle yields the delivered count and may be ignored.
    pub fn publish_async(&self, topic: &str, payload: impl Into<Bytes>) -> JoinHandle<usize> {
        let event = Event::new(topic, payload);
        let bus = self.clone();
        tokio::spawn(async move { bus.publish_event(event) })
    }

    /// Get the number of subscribers registered for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |s| s.len())
    }

    /// Get all topics with at least one subscriber.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.inner.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove every subscriber whose scope has been cancelled.
    ///
    /// Returns the labels of the removed subscribers.
    pub fn prune_cancelled(&self) -> Vec<SubscriberId> {
        let mut pruned: HashMap<SubscriberKey, SubscriberId> = HashMap::new();

        self.inner.topics.retain(|_, subscribers| {
            subscribers.retain(|key, slot| {
                if slot.token.is_cancelled() {
                    pruned.insert(*key, slot.id.clone());
                    false
                } else {
                    true
                }
            });
            !subscribers.is_empty()
        });

        for id in pruned.values() {
            debug!(subscriber = %id, "Pruned cancelled subscriber");
        }
        pruned.into_values().collect()
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            topics: self.inner.topics.len(),
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
