//! Notification bus abstraction.
//!
//! The bus is a best-effort publish/subscribe-by-name primitive: no backlog,
//! no durability, no ordering across channels. A subscription stream ending
//! (or yielding an error) means the connection was lost and notifications
//! may have been missed; callers re-subscribe and resynchronize.

mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Stream of payloads received on one channel.
pub type NotificationStream = BoxStream<'static, Result<String>>;

/// Best-effort named-channel messaging.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    /// Publish a payload on a channel. Delivered to current subscribers only.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Start listening on a channel.
    async fn subscribe(&self, channel: &str) -> Result<NotificationStream>;
}
