//! Channel-addressed publish/subscribe for live status fanout
//!
//! Launch progress, eviction notices, and per-session log events are
//! published here and delivered to observers as Server-Sent Events. The bus
//! is publisher-favoring: every subscriber sits behind a [`BoundedQueue`]
//! and any subscriber whose queue rejects a push is dropped on the spot, so
//! a stalled observer can never slow a switch down.

use crate::sync::{BoundedQueue, PushOutcome};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Channel carrying global status, metrics, and launch-progress events.
pub const DEFAULT_CHANNEL: &str = "default";

/// Per-subscriber queue capacity before the subscriber is considered dead.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// One event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic event id, unique per bus
    pub id: u64,
    /// Event-type tag (e.g. "launch_progress", "preempted")
    pub event: String,
    /// JSON payload
    pub data: serde_json::Value,
    /// ISO-8601 publication timestamp
    pub timestamp: String,
}

impl Event {
    /// Render as one SSE frame: `id`/`event` lines plus a `data:` line with
    /// the payload and timestamp, blank-line terminated.
    pub fn to_sse_frame(&self) -> Bytes {
        let body = serde_json::json!({
            "data": self.data,
            "timestamp": self.timestamp,
        });
        Bytes::from(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id, self.event, body
        ))
    }
}

struct Subscriber {
    id: u64,
    queue: Arc<BoundedQueue<Event>>,
}

/// The publish/subscribe bus.
pub struct EventBus {
    channels: DashMap<String, Vec<Subscriber>>,
    next_event_id: AtomicU64,
    next_subscriber_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_event_id: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Publish to every live subscriber of `channel`.
    ///
    /// Subscribers whose queues are full are removed immediately; the
    /// publisher never waits. Returns the number of subscribers reached.
    pub fn publish(&self, channel: &str, event_type: &str, data: serde_json::Value) -> usize {
        let Some(mut subscribers) = self.channels.get_mut(channel) else {
            trace!(channel, event_type, "publish to channel with no subscribers");
            return 0;
        };

        let event = Event {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            event: event_type.to_string(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut delivered = 0;
        subscribers.retain(|sub| match sub.queue.push(event.clone()) {
            PushOutcome::Delivered | PushOutcome::Buffered => {
                delivered += 1;
                true
            }
            PushOutcome::Rejected => {
                debug!(
                    channel,
                    subscriber = sub.id,
                    "dropping subscriber with full queue"
                );
                false
            }
        });

        let emptied = subscribers.is_empty();
        drop(subscribers);
        if emptied {
            self.remove_channel_if_empty(channel);
        }
        delivered
    }

    /// Register a new subscriber on `channel`.
    pub fn subscribe(self: &Arc<Self>, channel: &str) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::new(SUBSCRIBER_QUEUE_CAPACITY));

        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                queue: Arc::clone(&queue),
            });

        debug!(channel, subscriber = id, "subscribed");
        Subscription {
            bus: Arc::clone(self),
            channel: channel.to_string(),
            id,
            queue,
            cancel: CancellationToken::new(),
        }
    }

    /// Number of subscribers currently registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|sub| sub.id != id);
            let emptied = subscribers.is_empty();
            drop(subscribers);
            if emptied {
                self.remove_channel_if_empty(channel);
            }
        }
        debug!(channel, subscriber = id, "unsubscribed");
    }

    // The last unsubscribe deletes the channel entry to bound memory.
    fn remove_channel_if_empty(&self, channel: &str) {
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
    }
}

/// A live subscription: a cancellable pull-based sequence of events.
///
/// Dropping the subscription removes its queue from the channel.
pub struct Subscription {
    bus: Arc<EventBus>,
    channel: String,
    id: u64,
    queue: Arc<BoundedQueue<Event>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next event, or `None` once the subscription is torn down.
    pub async fn next(&self) -> Option<Event> {
        self.queue.take(&self.cancel).await.ok()
    }

    /// Token that tears the subscription's wait loop down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
        self.bus.unsubscribe(&self.channel, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(DEFAULT_CHANNEL);

        let reached = bus.publish(DEFAULT_CHANNEL, "status", json!({"stage": "ready"}));
        assert_eq!(reached, 1);

        let event = sub.next().await.unwrap();
        assert_eq!(event.event, "status");
        assert_eq!(event.data["stage"], "ready");
        assert!(!event.timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = Arc::new(EventBus::new());
        let _default = bus.subscribe(DEFAULT_CHANNEL);
        let session = bus.subscribe("session-42");

        bus.publish("session-42", "log", json!({"line": "hello"}));

        let event = session.next().await.unwrap();
        assert_eq!(event.event, "log");
        // The default channel saw nothing.
        assert_eq!(bus.publish(DEFAULT_CHANNEL, "noop", json!({})), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let bus = Arc::new(EventBus::new());
        let _sub = bus.subscribe(DEFAULT_CHANNEL);

        // Fill the queue past capacity without consuming.
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            assert_eq!(bus.publish(DEFAULT_CHANNEL, "tick", json!({ "i": i })), 1);
        }
        // The overflowing publish drops the subscriber.
        assert_eq!(bus.publish(DEFAULT_CHANNEL, "tick", json!({})), 0);
        assert_eq!(bus.subscriber_count(DEFAULT_CHANNEL), 0);
    }

    #[tokio::test]
    async fn test_drop_removes_channel_entry() {
        let bus = Arc::new(EventBus::new());
        {
            let _sub = bus.subscribe("ephemeral");
            assert_eq!(bus.subscriber_count("ephemeral"), 1);
        }
        assert_eq!(bus.subscriber_count("ephemeral"), 0);
        assert!(!bus.channels.contains_key("ephemeral"));
    }

    #[test]
    fn test_sse_frame_shape() {
        let event = Event {
            id: 7,
            event: "launch_progress".to_string(),
            data: json!({"progress": 0.5}),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let frame = String::from_utf8(event.to_sse_frame().to_vec()).unwrap();
        assert!(frame.starts_with("id: 7\nevent: launch_progress\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"progress\":0.5"));
        assert!(frame.contains("\"timestamp\""));
    }
}
