use tokio::sync::broadcast;
use tracing::error;

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Conditions that need operator attention.
///
/// Alerts are fan-out notifications, losing one to a lagging subscriber is
/// acceptable. The authoritative record stays in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineAlert {
    /// An outbox record exhausted its publish attempts and was parked as
    /// `permanently_failed`.
    PublishFailedPermanently {
        record_id: i64,
        topic: String,
        error: String,
        retry_count: i64,
    },
}

/// Cloneable sender half of the alert channel.
#[derive(Debug, Clone)]
pub struct AlertSender {
    sender: broadcast::Sender<PipelineAlert>,
}

impl AlertSender {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineAlert> {
        self.sender.subscribe()
    }

    pub(crate) fn publish_failed_permanently(
        &self,
        record_id: i64,
        topic: &str,
        error_text: &str,
        retry_count: i64,
    ) {
        error!(
            record_id,
            topic, retry_count, "Outbox record permanently failed: {error_text}"
        );
        let _ = self.sender.send(PipelineAlert::PublishFailedPermanently {
            record_id,
            topic: topic.to_string(),
            error: error_text.to_string(),
            retry_count,
        });
    }
}

impl Default for AlertSender {
    fn default() -> Self {
        Self::new()
    }
}
