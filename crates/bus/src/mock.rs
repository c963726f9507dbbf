use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::warn;

use crate::{EventPublisher, Header, PublishError, Receipt, Topic};

/// Test publisher that records publishes without a real bus behind it.
/// Failure injection covers both permanent outages and transient ones that
/// clear after a fixed number of rejected publishes.
#[derive(Debug, Clone)]
pub struct MockPublisher {
    publish_counter: Arc<AtomicU64>,
    fail_remaining: Arc<AtomicU64>,
    failure_message: String,
}

const ALWAYS_FAIL: u64 = u64::MAX;

impl MockPublisher {
    pub fn new() -> Self {
        Self {
            publish_counter: Arc::new(AtomicU64::new(0)),
            fail_remaining: Arc::new(AtomicU64::new(0)),
            failure_message: String::new(),
        }
    }

    /// Publisher whose every publish fails with `message`.
    pub fn with_failure(message: impl Into<String>) -> Self {
        Self {
            publish_counter: Arc::new(AtomicU64::new(0)),
            fail_remaining: Arc::new(AtomicU64::new(ALWAYS_FAIL)),
            failure_message: message.into(),
        }
    }

    /// Publisher that rejects the first `times` publishes with `message`,
    /// then accepts everything.
    pub fn failing_times(times: u64, message: impl Into<String>) -> Self {
        Self {
            publish_counter: Arc::new(AtomicU64::new(0)),
            fail_remaining: Arc::new(AtomicU64::new(times)),
            failure_message: message.into(),
        }
    }

    /// Total publish attempts, including rejected ones.
    pub fn publish_count(&self) -> u64 {
        self.publish_counter.load(Ordering::SeqCst)
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for MockPublisher {
    async fn publish(
        &self,
        topic: &Topic,
        payload: &str,
        _headers: &[Header],
    ) -> Result<Receipt, PublishError> {
        let attempt = self.publish_counter.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != ALWAYS_FAIL {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            }
            warn!("[TEST] Rejecting publish to {topic}: {}", self.failure_message);
            return Err(PublishError::Unavailable(self.failure_message.clone()));
        }

        warn!(
            "[TEST] Would deliver {} bytes to topic {topic} (attempt {attempt})",
            payload.len()
        );

        Ok(Receipt {
            topic: topic.clone(),
            offset: attempt,
        })
    }
}
