//! In-process pub/sub hub for real-time run streaming.
//!
//! One broadcast channel per run id. The event bus publishes wire envelopes
//! here; subscribe-with-replay bridges attach a receiver before running their
//! replay query so nothing falls between replay and live delivery.
//!
//! Payloads are `serde_json::Value` envelopes; the hub has no knowledge of
//! event semantics.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Per-run broadcast hub. Thread-safe, cloneable.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl StreamHub {
    /// Create a hub with default capacity (256 buffered envelopes per run).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a hub with the given per-run channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish an envelope for a run. No-op if nobody is subscribed.
    pub async fn publish(&self, run_id: Uuid, value: serde_json::Value) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&run_id) {
            // Ignore send errors (no active receivers)
            let _ = tx.send(value);
        }
    }

    /// Subscribe to a run's channel, creating it on first use.
    pub async fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Drop channels with zero subscribers (housekeeping for finished runs).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Number of live run channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let hub = StreamHub::new();
        let run_id = Uuid::new_v4();
        let mut rx = hub.subscribe(run_id).await;

        let value = serde_json::json!({"type": "token.delta", "payload": {"delta": "hello"}});
        hub.publish(run_id, value.clone()).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received, value);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = StreamHub::new();
        // Should not panic
        hub.publish(Uuid::new_v4(), serde_json::json!({"data": "dropped"}))
            .await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_channels_without_receivers() {
        let hub = StreamHub::new();
        let run_id = Uuid::new_v4();
        let rx = hub.subscribe(run_id).await;

        assert_eq!(hub.channel_count().await, 1);

        drop(rx);
        hub.cleanup().await;

        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_envelope() {
        let hub = StreamHub::new();
        let run_id = Uuid::new_v4();
        let mut rx1 = hub.subscribe(run_id).await;
        let mut rx2 = hub.subscribe(run_id).await;

        let value = serde_json::json!({"type": "run.heartbeat"});
        hub.publish(run_id, value.clone()).await;

        assert_eq!(rx1.recv().await.unwrap(), value);
        assert_eq!(rx2.recv().await.unwrap(), value);
    }
}
