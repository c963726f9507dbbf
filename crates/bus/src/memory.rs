//! In-process bus with per-group committed offsets.
//!
//! Messages are appended to a per-topic log and stay there after delivery;
//! a consumer group only moves forward by committing, so a subscriber that
//! drops without committing sees the same messages again on re-subscribe.
//! This mirrors the at-least-once contract of the external broker closely
//! enough to exercise consumer idempotency in tests and dry-run mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::{
    Delivery, EventPublisher, EventStream, Header, PublishError, Receipt, StreamError, Topic,
};

const DEFAULT_TOPIC_CAPACITY: usize = 10_000;

#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

struct Shared {
    topics: RwLock<HashMap<String, TopicLog>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

#[derive(Default)]
struct TopicLog {
    messages: Vec<StoredMessage>,
    /// Next offset to deliver, per consumer group.
    committed: HashMap<String, usize>,
}

struct StoredMessage {
    payload: String,
    headers: Vec<Header>,
    published_at: DateTime<Utc>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Bus whose topics reject publishes beyond `capacity` messages with
    /// `PublishError::QueueFull`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: RwLock::new(HashMap::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Attach a consumer group to a topic, starting from the group's
    /// committed offset (zero for a group the bus has not seen before).
    /// One active subscription per group is assumed.
    pub async fn subscribe(&self, topic: &Topic, group: &str) -> GroupSubscription {
        let mut topics = self.shared.topics.write().await;
        let log = topics.entry(topic.as_str().to_string()).or_default();
        let position = log.committed.get(group).copied().unwrap_or(0);

        debug!(%topic, group, position, "Subscribed consumer group");

        GroupSubscription {
            bus: self.clone(),
            topic: topic.clone(),
            group: group.to_string(),
            position,
        }
    }

    /// Stop accepting publishes and wake blocked subscribers. Subscribers
    /// drain whatever is already in the log before seeing `Closed`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub async fn message_count(&self, topic: &Topic) -> usize {
        let topics = self.shared.topics.read().await;
        topics.get(topic.as_str()).map_or(0, |log| log.messages.len())
    }

    /// Snapshot of everything published to a topic, oldest first.
    pub async fn published(&self, topic: &Topic) -> Vec<Delivery> {
        let topics = self.shared.topics.read().await;
        let Some(log) = topics.get(topic.as_str()) else {
            return Vec::new();
        };

        log.messages
            .iter()
            .enumerate()
            .map(|(offset, msg)| Delivery {
                topic: topic.clone(),
                payload: msg.payload.clone(),
                headers: msg.headers.clone(),
                offset: offset as u64,
                published_at: msg.published_at,
            })
            .collect()
    }

    /// Number of messages a group has committed past on a topic.
    pub async fn committed_offset(&self, topic: &Topic, group: &str) -> u64 {
        let topics = self.shared.topics.read().await;
        topics
            .get(topic.as_str())
            .and_then(|log| log.committed.get(group))
            .map_or(0, |position| *position as u64)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(
        &self,
        topic: &Topic,
        payload: &str,
        headers: &[Header],
    ) -> Result<Receipt, PublishError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("bus closed".to_string()));
        }

        let offset = {
            let mut topics = self.shared.topics.write().await;
            let log = topics.entry(topic.as_str().to_string()).or_default();

            if log.messages.len() >= self.shared.capacity {
                return Err(PublishError::QueueFull {
                    topic: topic.as_str().to_string(),
                });
            }

            log.messages.push(StoredMessage {
                payload: payload.to_string(),
                headers: headers.to_vec(),
                published_at: Utc::now(),
            });
            log.messages.len() - 1
        };

        self.shared.notify.notify_waiters();
        debug!(%topic, offset, "Published message");

        Ok(Receipt {
            topic: topic.clone(),
            offset: offset as u64,
        })
    }
}

/// Live subscription of one consumer group to one topic.
pub struct GroupSubscription {
    bus: InMemoryBus,
    topic: Topic,
    group: String,
    position: usize,
}

#[async_trait]
impl EventStream for GroupSubscription {
    async fn recv(&mut self) -> Result<Delivery, StreamError> {
        loop {
            // Register for wakeup before checking the log so a publish that
            // lands between the check and the await still wakes us.
            let notified = self.bus.shared.notify.notified();

            {
                let topics = self.bus.shared.topics.read().await;
                if let Some(log) = topics.get(self.topic.as_str())
                    && let Some(msg) = log.messages.get(self.position)
                {
                    let delivery = Delivery {
                        topic: self.topic.clone(),
                        payload: msg.payload.clone(),
                        headers: msg.headers.clone(),
                        offset: self.position as u64,
                        published_at: msg.published_at,
                    };
                    self.position += 1;
                    return Ok(delivery);
                }

                if self.bus.shared.closed.load(Ordering::SeqCst) {
                    return Err(StreamError::Closed);
                }
            }

            notified.await;
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), StreamError> {
        let mut topics = self.bus.shared.topics.write().await;
        let log = topics.entry(self.topic.as_str().to_string()).or_default();

        let next = usize::try_from(offset.saturating_add(1)).unwrap_or(usize::MAX);
        let committed = log.committed.entry(self.group.clone()).or_insert(0);
        if next > *committed {
            *committed = next;
        }

        debug!(topic = %self.topic, group = %self.group, offset, "Committed offset");
        Ok(())
    }
}
