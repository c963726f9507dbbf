use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Display;

pub mod memory;
pub mod mock;

pub use memory::{GroupSubscription, InMemoryBus};
pub use mock::MockPublisher;

/// Topic name newtype wrapper with validation
///
/// Enforces the broker-side naming rules (non-empty, at most 249 characters,
/// alphanumeric plus `.`, `_` and `-`) so invalid names fail at construction
/// instead of at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Create a new topic with validation
    ///
    /// # Errors
    /// Returns `InvalidTopicError` if the name is empty, too long, or contains
    /// characters outside `[A-Za-z0-9._-]`
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTopicError> {
        const MAX_TOPIC_LEN: usize = 249;

        let name = name.into();
        if name.is_empty() {
            return Err(InvalidTopicError {
                name,
                reason: "topic cannot be empty",
            });
        }
        if name.len() > MAX_TOPIC_LEN {
            return Err(InvalidTopicError {
                name,
                reason: "topic exceeds 249 characters",
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(InvalidTopicError {
                name,
                reason: "topic may only contain alphanumerics, '.', '_' and '-'",
            });
        }

        Ok(Self(name))
    }

    /// Companion dead-letter topic for undeliverable messages
    pub fn dead_letter(&self) -> Self {
        Self(format!("{}.dlq", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid topic '{name}': {reason}")]
pub struct InvalidTopicError {
    pub name: String,
    pub reason: &'static str,
}

/// Key/value metadata attached to a message, carried verbatim to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Bus confirmation that a published message has been durably accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub topic: Topic,
    pub offset: u64,
}

/// One message handed to a subscriber. `offset` is the position to pass back
/// to `commit` once processing succeeded.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub payload: String,
    pub headers: Vec<Header>,
    pub offset: u64,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Queue full for topic {topic}")]
    QueueFull { topic: String },
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Bus closed")]
    Closed,
}

/// Producer half of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one message and wait for the bus to confirm persistence.
    /// A returned `Receipt` means the message is durably accepted; anything
    /// else must be treated as not delivered.
    async fn publish(
        &self,
        topic: &Topic,
        payload: &str,
        headers: &[Header],
    ) -> Result<Receipt, PublishError>;
}

/// Consumer half of the bus, bound to one topic and one consumer group.
#[async_trait]
pub trait EventStream: Send {
    /// Wait for the next message at or after the group's position.
    /// Returns `StreamError::Closed` once the bus shuts down and the log is
    /// drained.
    async fn recv(&mut self) -> Result<Delivery, StreamError>;

    /// Durably advance the group's committed offset past `offset`. Messages
    /// up to and including `offset` will not be redelivered to this group.
    async fn commit(&mut self, offset: u64) -> Result<(), StreamError>;
}
