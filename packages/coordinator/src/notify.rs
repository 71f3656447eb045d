//! Transfer notifications
//!
//! Delivery is fire-and-forget: a failing sink is logged and counted, it never
//! rolls back or blocks the transfer it reports on.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferEventKind {
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub transfer_id: Option<i64>,
    pub user: String,
    /// Human amount, e.g. "0.1"
    pub amount: String,
    pub destination_label: String,
    /// Lock tx hash on success, reason on failure
    pub tx_hash_or_error: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &TransferEvent) -> eyre::Result<()>;
}

/// Fan out to every sink and swallow failures
pub async fn dispatch(sinks: &[Arc<dyn NotificationSink>], event: &TransferEvent) {
    for sink in sinks {
        match sink.deliver(event).await {
            Ok(()) => debug!(sink = sink.name(), kind = ?event.kind, user = %event.user, "Notification delivered"),
            Err(e) => {
                metrics::NOTIFICATION_FAILURES
                    .with_label_values(&[sink.name()])
                    .inc();
                warn!(sink = sink.name(), error = %e, "Notification delivery failed");
            }
        }
    }
}

/// In-process broadcast, e.g. for the API event stream
pub struct ChannelSink {
    sender: broadcast::Sender<TransferEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, event: &TransferEvent) -> eyre::Result<()> {
        // Nobody listening is not a failure
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// POSTs the event as JSON to a webhook URL
pub struct WebhookSink {
    url: String,
    client: Client,
}

impl WebhookSink {
    pub fn new(url: &str) -> eyre::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &TransferEvent) -> eyre::Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(eyre::eyre!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    fn event() -> TransferEvent {
        TransferEvent {
            kind: TransferEventKind::Committed,
            transfer_id: Some(1),
            user: "0xaa".to_string(),
            amount: "0.1".to_string(),
            destination_label: "BSC".to_string(),
            tx_hash_or_error: "0xlock".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_others() {
        let broken = Arc::new(RecordingSink::default());
        broken.set_failing(true);
        let healthy = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![broken.clone(), healthy.clone()];

        dispatch(&sinks, &event()).await;
        assert!(broken.events().is_empty());
        assert_eq!(healthy.events(), vec![event()]);
    }

    #[tokio::test]
    async fn test_channel_sink_broadcasts() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        sink.deliver(&event()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event());
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["kind"], "COMMITTED");
        assert_eq!(json["destinationLabel"], "BSC");
        assert_eq!(json["txHashOrError"], "0xlock");
    }
}
