//! Broadcast sinks.
//!
//! [`BroadcastSink`] is the seam to the transport layer. [`BroadcastHub`] is an
//! in-process implementation that fans each payload out to every subscriber of
//! a channel; a WebSocket handler subscribes once per connection and forwards
//! what it receives.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::BroadcastError;

use super::events::RunEvent;

/// Default per-channel buffer of the hub.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Destination for run broadcasts.
#[async_trait]
pub trait BroadcastSink: Send + Sync + 'static {
    /// Deliver `payload` to every subscriber of `channel`.
    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), BroadcastError>;
}

/// Serialize `event` and hand it to `sink`.
pub async fn publish(
    sink: &dyn BroadcastSink,
    channel: &str,
    event: &RunEvent,
) -> Result<(), BroadcastError> {
    let payload = event
        .to_payload()
        .map_err(|source| BroadcastError::Serialization {
            channel: channel.to_string(),
            source,
        })?;
    sink.broadcast(channel, payload).await
}

/// Channel-keyed in-process fan-out.
///
/// Broadcasting to a channel nobody subscribed to is a no-op. Channels whose
/// subscribers have all gone away are pruned on the next broadcast.
#[derive(Debug)]
pub struct BroadcastHub {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<Value>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub whose channels buffer up to `capacity` payloads per
    /// subscriber before slow subscribers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to `channel`, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.read()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, broadcast::Sender<Value>>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, broadcast::Sender<Value>>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BroadcastSink for BroadcastHub {
    async fn broadcast(&self, channel: &str, payload: Value) -> Result<(), BroadcastError> {
        let sent = match self.read().get(channel) {
            Some(tx) => tx.send(payload).is_ok(),
            None => return Ok(()),
        };

        if !sent {
            let mut channels = self.write();
            if channels
                .get(channel)
                .is_some_and(|tx| tx.receiver_count() == 0)
            {
                channels.remove(channel);
                tracing::debug!(channel, "Pruned channel without subscribers");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_fans_out_to_all_subscribers() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe("research");
        let mut b = hub.subscribe("research");
        assert_eq!(hub.subscriber_count("research"), 2);

        hub.broadcast("research", json!({"type": "run_started"}))
            .await
            .expect("broadcast");

        assert_eq!(a.recv().await.expect("recv a")["type"], "run_started");
        assert_eq!(b.recv().await.expect("recv b")["type"], "run_started");
    }

    #[tokio::test]
    async fn test_hub_without_subscribers_is_noop() {
        let hub = BroadcastHub::new();
        hub.broadcast("nobody", json!({"type": "x"}))
            .await
            .expect("broadcast");
        assert_eq!(hub.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_hub_prunes_dead_channels() {
        let hub = BroadcastHub::new();
        let rx = hub.subscribe("research");
        drop(rx);

        hub.broadcast("research", json!({"type": "x"}))
            .await
            .expect("broadcast");
        assert!(hub.read().get("research").is_none());
    }

    #[tokio::test]
    async fn test_publish_serializes_event() {
        let hub = BroadcastHub::new();
        let mut rx = hub.subscribe("research");
        let event = RunEvent::RunCancelled {
            run_id: "r1".to_string(),
        };

        publish(&hub, "research", &event).await.expect("publish");
        let payload = rx.recv().await.expect("recv");
        assert_eq!(payload, json!({"type": "run_cancelled", "run_id": "r1"}));
    }
}
