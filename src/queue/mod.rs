//! In-memory pub/sub message queue
//!
//! Named channels fan out immutable, TTL-bounded messages to durable
//! subscribers with bounded delivery queues. Broadcast never holds the
//! channel table lock while delivering, and never blocks: a full
//! subscriber queue drops the message for that subscriber only.
//!
//! This is the mutex-guarded reference implementation; its tests double
//! as the contract any alternative implementation must satisfy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::config::QueueConfig;
use crate::core::error::{HubError, HubResult};

/// Retained messages per channel; oldest are dropped beyond this
const MAX_RETAINED: usize = 1_000;

/// An immutable queued message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub channel: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub expires_at: DateTime<Utc>,
}

impl Message {
    fn new(channel: &str, message_type: &str, payload: Value, ttl_seconds: i64) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            message_type: message_type.to_string(),
            payload,
            created_at,
            ttl_seconds,
            expires_at: created_at + chrono::Duration::seconds(ttl_seconds),
        }
    }

    /// Whether the message has outlived its TTL
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A durable subscription handed to the caller
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub channel: String,
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Receive the next delivery; `None` once the subscription is
    /// unsubscribed and its queue drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Debug, Clone)]
struct SubscriberHandle {
    id: String,
    sender: mpsc::Sender<Message>,
    active: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct ChannelState {
    messages: VecDeque<Message>,
    subscribers: Vec<SubscriberHandle>,
}

/// Per-channel statistics
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelStats {
    pub message_count: usize,
    pub subscriber_count: usize,
}

/// Queue-wide statistics
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub channels: HashMap<String, ChannelStats>,
    pub total_messages: usize,
    pub total_subscribers: usize,
}

/// Mutex-guarded in-memory message queue
#[derive(Debug)]
pub struct MessageQueue {
    channels: RwLock<HashMap<String, ChannelState>>,
    config: QueueConfig,
}

impl MessageQueue {
    /// Create a queue; call [`MessageQueue::start_cleanup`] on the
    /// owning `Arc` to begin background reaping.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Send a message to a channel. A non-positive TTL takes the
    /// configured default. Returns the stored message.
    pub async fn send(
        &self,
        channel: &str,
        message_type: &str,
        payload: Value,
        ttl_seconds: i64,
    ) -> HubResult<Message> {
        if channel.is_empty() {
            return Err(HubError::validation("channel name must not be empty"));
        }
        let ttl = if ttl_seconds <= 0 {
            self.config.default_ttl_seconds
        } else {
            ttl_seconds
        };
        let message = Message::new(channel, message_type, payload, ttl);

        // Store, then snapshot subscribers so delivery happens outside
        // the table lock.
        let subscribers = {
            let mut channels = self.channels.write().await;
            let state = channels.entry(channel.to_string()).or_default();
            state.messages.push_back(message.clone());
            while state.messages.len() > MAX_RETAINED {
                state.messages.pop_front();
            }
            state.subscribers.clone()
        };

        for subscriber in subscribers {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        channel,
                        subscription = %subscriber.id,
                        "subscriber queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(subscription = %subscriber.id, "subscriber gone");
                }
            }
        }

        Ok(message)
    }

    /// Receive up to `limit` unexpired messages, newest at the tail.
    ///
    /// Blocking mode returns immediately when a message already exists;
    /// otherwise it waits up to `timeout` for one new delivery through an
    /// ephemeral subscription. A timeout yields an empty list, not an
    /// error.
    pub async fn receive(
        &self,
        channel: &str,
        limit: usize,
        blocking: bool,
        timeout: Duration,
    ) -> Vec<Message> {
        let limit = if limit == 0 {
            self.config.default_receive_limit
        } else {
            limit
        };

        let existing = self.unexpired_tail(channel, limit).await;
        if !existing.is_empty() || !blocking {
            return existing;
        }

        let mut subscription = self.subscribe(channel).await;
        let received = tokio::time::timeout(timeout, subscription.recv()).await;
        let _ = self.unsubscribe(&subscription.id).await;

        match received {
            Ok(Some(message)) if !message.is_expired() => vec![message],
            _ => Vec::new(),
        }
    }

    async fn unexpired_tail(&self, channel: &str, limit: usize) -> Vec<Message> {
        let channels = self.channels.read().await;
        let Some(state) = channels.get(channel) else {
            return Vec::new();
        };
        let unexpired: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| !m.is_expired())
            .collect();
        let skip = unexpired.len().saturating_sub(limit);
        unexpired.into_iter().skip(skip).cloned().collect()
    }

    /// Create a durable subscription with a bounded delivery queue
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let handle = SubscriberHandle {
            id: Uuid::new_v4().to_string(),
            sender,
            active: Arc::new(AtomicBool::new(true)),
        };
        let subscription = Subscription {
            id: handle.id.clone(),
            channel: channel.to_string(),
            receiver,
        };

        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_default()
            .subscribers
            .push(handle);
        subscription
    }

    /// Destroy a subscription: no further deliveries occur and its queue
    /// closes once drained.
    pub async fn unsubscribe(&self, subscription_id: &str) -> HubResult<()> {
        let mut channels = self.channels.write().await;
        for state in channels.values_mut() {
            if let Some(pos) = state
                .subscribers
                .iter()
                .position(|s| s.id == subscription_id)
            {
                let handle = state.subscribers.swap_remove(pos);
                handle.active.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }
        Err(HubError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// Remove expired messages and drop channels left empty
    pub async fn reap_expired(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|channel, state| {
            let before = state.messages.len();
            state.messages.retain(|m| !m.is_expired());
            let removed = before - state.messages.len();
            if removed > 0 {
                debug!(%channel, removed, "reaped expired messages");
            }
            !state.messages.is_empty() || !state.subscribers.is_empty()
        });
    }

    /// Spawn the periodic cleanup tick; ends when the queue is dropped
    pub fn start_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(queue) = weak.upgrade() else { return };
                queue.reap_expired().await;
            }
        });
    }

    /// Per-channel and total counters
    pub async fn stats(&self) -> QueueStats {
        let channels = self.channels.read().await;
        let mut stats = QueueStats::default();
        for (name, state) in channels.iter() {
            let unexpired = state.messages.iter().filter(|m| !m.is_expired()).count();
            stats.total_messages += unexpired;
            stats.total_subscribers += state.subscribers.len();
            stats.channels.insert(
                name.clone(),
                ChannelStats {
                    message_count: unexpired,
                    subscriber_count: state.subscribers.len(),
                },
            );
        }
        stats
    }

    /// Subscriber count for one channel
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |state| state.subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> MessageQueue {
        MessageQueue::new(QueueConfig::default())
    }

    #[tokio::test]
    async fn test_send_then_receive_non_blocking() {
        let queue = queue();
        queue
            .send("ws-channel", "ws-message", json!({"test": "data"}), 3_600)
            .await
            .unwrap();

        let messages = queue
            .receive("ws-channel", 10, false, Duration::ZERO)
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel, "ws-channel");
        assert_eq!(messages[0].message_type, "ws-message");
        assert_eq!(messages[0].payload, json!({"test": "data"}));
    }

    #[tokio::test]
    async fn test_blocking_receive_times_out_with_empty_list() {
        let queue = queue();
        let started = std::time::Instant::now();
        let messages = queue
            .receive("empty-channel", 10, true, Duration::from_millis(200))
            .await;
        assert!(messages.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_blocking_receive_wakes_on_new_message() {
        let queue = Arc::new(queue());
        let receiver = queue.clone();
        let task = tokio::spawn(async move {
            receiver
                .receive("late-channel", 10, true, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue
            .send("late-channel", "event", json!({"n": 1}), 60)
            .await
            .unwrap();

        let messages = task.await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, "event");
    }

    #[tokio::test]
    async fn test_ttl_default_and_expiry_invariant() {
        let queue = queue();
        let message = queue
            .send("c", "t", Value::Null, 0)
            .await
            .unwrap();
        assert_eq!(message.ttl_seconds, 3_600);
        assert_eq!(
            message.expires_at,
            message.created_at + chrono::Duration::seconds(3_600)
        );
    }

    #[tokio::test]
    async fn test_expired_messages_never_returned_and_reaped() {
        let queue = queue();
        queue
            .send("c", "old", Value::Null, -1)
            .await
            .unwrap();
        // Force immediate expiry by rewriting the stored message.
        {
            let mut channels = queue.channels.write().await;
            let state = channels.get_mut("c").unwrap();
            state.messages[0].expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        assert!(queue.receive("c", 10, false, Duration::ZERO).await.is_empty());

        queue.reap_expired().await;
        assert!(queue.channels.read().await.get("c").is_none());
    }

    #[tokio::test]
    async fn test_receive_limit_keeps_newest_at_tail() {
        let queue = queue();
        for n in 0..5 {
            queue
                .send("c", "t", json!({"n": n}), 60)
                .await
                .unwrap();
        }

        let messages = queue.receive("c", 3, false, Duration::ZERO).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].payload["n"], 2);
        assert_eq!(messages[2].payload["n"], 4);
    }

    #[tokio::test]
    async fn test_subscription_delivery_and_unsubscribe() {
        let queue = queue();
        let mut subscription = queue.subscribe("c").await;
        assert_eq!(queue.subscriber_count("c").await, 1);

        queue.send("c", "t", json!(1), 60).await.unwrap();
        let delivered = subscription.recv().await.unwrap();
        assert_eq!(delivered.payload, json!(1));

        queue.unsubscribe(&subscription.id).await.unwrap();
        queue.send("c", "t", json!(2), 60).await.unwrap();

        // Queue is closed: no further deliveries.
        assert!(subscription.recv().await.is_none());
        assert_eq!(queue.subscriber_count("c").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let queue = queue();
        let err = queue.unsubscribe("no-such-id").await.unwrap_err();
        assert!(matches!(err, HubError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_leaves_count_unchanged() {
        let queue = queue();
        let _standing = queue.subscribe("c").await;
        let before = queue.subscriber_count("c").await;

        let ephemeral = queue.subscribe("c").await;
        queue.unsubscribe(&ephemeral.id).await.unwrap();

        assert_eq!(queue.subscriber_count("c").await, before);
    }

    #[tokio::test]
    async fn test_full_subscriber_queue_drops_for_that_subscriber_only() {
        let config = QueueConfig {
            subscriber_capacity: 2,
            ..Default::default()
        };
        let queue = MessageQueue::new(config);
        let mut slow = queue.subscribe("c").await;
        let mut fast = queue.subscribe("c").await;

        for n in 0..4 {
            queue.send("c", "t", json!({"n": n}), 60).await.unwrap();
            // Keep the fast subscriber drained.
            assert!(fast.try_recv().is_some());
        }

        // Slow subscriber observed a gap but the channel retains all.
        let mut slow_seen = 0;
        while slow.try_recv().is_some() {
            slow_seen += 1;
        }
        assert_eq!(slow_seen, 2);
        assert_eq!(
            queue.receive("c", 10, false, Duration::ZERO).await.len(),
            4
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = queue();
        queue.send("a", "t", Value::Null, 60).await.unwrap();
        queue.send("a", "t", Value::Null, 60).await.unwrap();
        queue.send("b", "t", Value::Null, 60).await.unwrap();
        let _sub = queue.subscribe("b").await;

        let stats = queue.stats().await;
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.total_subscribers, 1);
        assert_eq!(stats.channels["a"].message_count, 2);
        assert_eq!(stats.channels["b"].subscriber_count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_reaps_in_background() {
        let config = QueueConfig {
            cleanup_interval_ms: 20,
            ..Default::default()
        };
        let queue = Arc::new(MessageQueue::new(config));
        queue.start_cleanup();

        queue.send("c", "t", Value::Null, 60).await.unwrap();
        {
            let mut channels = queue.channels.write().await;
            channels.get_mut("c").unwrap().messages[0].expires_at =
                Utc::now() - chrono::Duration::seconds(1);
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.stats().await.total_messages, 0);
    }
}
