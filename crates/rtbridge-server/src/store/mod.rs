//! Durable store for channel liveness and subscription records.
//!
//! Every mutating operation pairs a write with the control event that
//! announces it, and the pair is applied as one unit: peers never observe
//! the event without the write being visible.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use rtbridge_proto::SubscriptionRecord;
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Result of one heartbeat round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// The channel row did not exist and was created.
    pub inserted: bool,
    /// Channels whose liveness lapsed and were removed.
    pub reaped: Vec<String>,
}

/// Access to the liveness and subscription tables.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Create the tables and indexes if they do not exist.
    async fn ensure_schema(&self) -> Result<()>;

    /// Renew `channel_id` for `ttl`, delete expired channels together with
    /// the records they own, and publish one `ChannelOffline` per deleted
    /// channel.
    async fn heartbeat(&self, channel_id: &str, ttl: Duration) -> Result<HeartbeatOutcome>;

    /// Insert or overwrite a record and publish `SubscriptionUpsert`.
    ///
    /// On conflict only `subscriptions`, `auth_ref` and
    /// `updated_by_channel_id` are overwritten.
    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
        auth_snapshot: Option<&JsonValue>,
    ) -> Result<()>;

    /// Delete a record and publish `SubscriptionDelete` if it existed.
    ///
    /// Returns whether a record was deleted.
    async fn delete_subscription(&self, client_id: &str) -> Result<bool>;

    /// All records owned by channels other than `channel_id`.
    async fn foreign_subscriptions(&self, channel_id: &str) -> Result<Vec<SubscriptionRecord>>;
}
