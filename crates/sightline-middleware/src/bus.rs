//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so every
//! subscriber receives every message without any single subscriber blocking
//! the others, and a slow subscriber never stalls a sampling loop.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Detections`] | Every routed obstacle, object and sign |
//! | [`Topic::Performance`] | Latency breaches and resource pressure |
//! | [`Topic::Power`] | Tier changes, power-save toggles, shutdown requests |
//! | [`Topic::SystemAlerts`] | Lifecycle and channel toggles |

use sightline_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Number of buffered events per topic before slow subscribers start
/// lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Detections,
    Performance,
    Power,
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Detections, Topic::Performance, Topic::Power, Topic::SystemAlerts];

    /// The lane a payload belongs on.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::Detection(_) => Topic::Detections,
            EventPayload::LatencyBreach { .. } | EventPayload::ResourcePressure { .. } => Topic::Performance,
            EventPayload::BatteryTierChanged { .. }
            | EventPayload::PowerSaveChanged { .. }
            | EventPayload::ShutdownRequested { .. } => Topic::Power,
            EventPayload::ChannelToggled { .. } => Topic::SystemAlerts,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Shared event bus.  Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    topics: [broadcast::Sender<Event>; 4],
}

impl EventBus {
    /// Create a bus whose topic channels each buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: std::array::from_fn(|_| broadcast::channel(capacity.max(1)).0),
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns the number of subscribers handed the event; `0` when nobody
    /// is listening, which is normal for a headless device.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.topics[topic.index()].send(event).unwrap_or(0)
    }

    /// Publish `event` on the topic its payload belongs to.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topics[topic.index()].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics[topic.index()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Lag is logged and skipped over.  Returns `None` once every sender
    /// has been dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "bus subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
