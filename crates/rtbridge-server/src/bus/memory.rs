//! In-process notification bus.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{NotificationBus, NotificationStream};
use crate::error::{Error, Result};

/// Per-channel backlog before a slow subscriber is disconnected.
const CHANNEL_CAPACITY: usize = 1024;

/// Notification bus shared by bridges running in one process.
///
/// Each channel is a `tokio::sync::broadcast` channel. A subscriber that
/// falls behind is disconnected rather than silently skipping messages, so
/// it resynchronizes like it would after a real connection loss.
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Publish synchronously. Returns the number of subscribers reached.
    pub fn publish_now(&self, channel: &str, payload: &str) -> usize {
        let sender = match self.channels.get(channel) {
            Some(sender) => sender.clone(),
            None => return 0,
        };

        let reached = sender.send(payload.to_string()).unwrap_or(0);
        trace!(channel, reached, "published notification");
        reached
    }

    /// Drop every open subscription, as if all connections were lost.
    pub fn disconnect_all(&self) {
        let count = self.channels.len();
        self.channels.clear();
        debug!(channels = count, "dropped all bus subscriptions");
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.publish_now(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = futures::stream::unfold(Some(receiver), move |state| {
            let channel = channel.clone();
            async move {
                let mut receiver = state?;
                match receiver.recv().await {
                    Ok(payload) => Some((Ok(payload), Some(receiver))),
                    Err(broadcast::error::RecvError::Closed) => None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                        Err(Error::Bus(format!(
                            "subscriber on {} lagged by {} notifications",
                            channel, skipped
                        ))),
                        None,
                    )),
                }
            }
        });

        Ok(stream.boxed())
    }
}
