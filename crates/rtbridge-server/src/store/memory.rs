//! In-process store backed by hash maps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rtbridge_proto::{Channel, ControlEvent, SubscriptionRecord};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{HeartbeatOutcome, SubscriptionStore};
use crate::bus::MemoryBus;
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    channels: HashMap<String, DateTime<Utc>>,
    records: HashMap<String, SubscriptionRecord>,
}

/// Store shared by bridges running in one process.
///
/// Writes and their announcements happen under one lock, so a concurrent
/// reader never sees an announced change that is not yet stored.
pub struct MemoryStore {
    state: Mutex<State>,
    bus: Arc<MemoryBus>,
    control_channel: String,
}

impl MemoryStore {
    /// Create a store announcing changes on `control_channel` of `bus`.
    pub fn new(bus: Arc<MemoryBus>, control_channel: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            bus,
            control_channel: control_channel.into(),
        }
    }

    /// Look up a record.
    pub fn record(&self, client_id: &str) -> Option<SubscriptionRecord> {
        self.state.lock().records.get(client_id).cloned()
    }

    /// All records, in no particular order.
    pub fn records(&self) -> Vec<SubscriptionRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Insert a record without announcing it.
    pub fn insert_record(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .records
            .insert(record.client_id.clone(), record);
    }

    /// All live channel rows.
    pub fn channels(&self) -> Vec<Channel> {
        self.state
            .lock()
            .channels
            .iter()
            .map(|(id, valid_until)| Channel::new(id.clone(), *valid_until))
            .collect()
    }

    /// Move a channel's deadline into the past.
    pub fn expire_channel(&self, channel_id: &str) {
        if let Some(valid_until) = self.state.lock().channels.get_mut(channel_id) {
            *valid_until = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    fn announce(&self, event: &ControlEvent) -> Result<()> {
        let payload = event.encode()?;
        self.bus.publish_now(&self.control_channel, &payload);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, channel_id: &str, ttl: Duration) -> Result<HeartbeatOutcome> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("channel ttl out of range: {}", e)))?;
        let now = Utc::now();

        let mut state = self.state.lock();
        let inserted = state
            .channels
            .insert(channel_id.to_string(), now + ttl)
            .is_none();

        let reaped: Vec<String> = state
            .channels
            .iter()
            .filter(|(id, valid_until)| id.as_str() != channel_id && **valid_until < now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &reaped {
            state.channels.remove(id);
            state.records.retain(|_, record| &record.channel_id != id);
            self.announce(&ControlEvent::channel_offline(id.clone()))?;
            debug!(channel = %id, "reaped expired channel");
        }

        Ok(HeartbeatOutcome { inserted, reaped })
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
        auth_snapshot: Option<&JsonValue>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .records
            .entry(record.client_id.clone())
            .and_modify(|existing| {
                existing.subscriptions = record.subscriptions.clone();
                existing.auth_ref = record.auth_ref.clone();
                existing.updated_by_channel_id = record.updated_by_channel_id.clone();
            })
            .or_insert_with(|| record.clone())
            .clone();

        self.announce(&ControlEvent::upsert(stored, auth_snapshot.cloned()))
    }

    async fn delete_subscription(&self, client_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.records.remove(client_id).is_none() {
            return Ok(false);
        }

        self.announce(&ControlEvent::delete(client_id))?;
        Ok(true)
    }

    async fn foreign_subscriptions(&self, channel_id: &str) -> Result<Vec<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .values()
            .filter(|record| record.channel_id != channel_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rtbridge_proto::CONTROL_CHANNEL;

    use crate::bus::NotificationBus;

    fn store() -> (Arc<MemoryBus>, MemoryStore) {
        let bus = Arc::new(MemoryBus::new());
        let store = MemoryStore::new(bus.clone(), CONTROL_CHANNEL);
        (bus, store)
    }

    #[tokio::test]
    async fn test_upsert_announces_stored_row() {
        let (bus, store) = store();
        let mut events = bus.subscribe(CONTROL_CHANNEL).await.unwrap();

        let record = SubscriptionRecord::new("c1", "a")
            .with_subscriptions(["t1"])
            .with_updated_by("a");
        store.upsert_subscription(&record, None).await.unwrap();

        let payload = events.next().await.unwrap().unwrap();
        assert_eq!(
            ControlEvent::decode(&payload).unwrap(),
            ControlEvent::upsert(record.clone(), None)
        );
        assert_eq!(store.record("c1"), Some(record));
    }

    #[tokio::test]
    async fn test_upsert_conflict_keeps_owner() {
        let (_bus, store) = store();
        let first = SubscriptionRecord::new("c1", "a").with_subscriptions(["t1"]);
        store.upsert_subscription(&first, None).await.unwrap();

        let second = SubscriptionRecord::new("c1", "b")
            .with_subscriptions(["t2"])
            .with_updated_by("b");
        store.upsert_subscription(&second, None).await.unwrap();

        let stored = store.record("c1").unwrap();
        assert_eq!(stored.channel_id, "a");
        assert_eq!(stored.subscription_list(), vec!["t2".to_string()]);
        assert_eq!(stored.updated_by_channel_id, "b");
    }

    #[tokio::test]
    async fn test_delete_only_announces_existing() {
        let (bus, store) = store();
        let mut events = bus.subscribe(CONTROL_CHANNEL).await.unwrap();

        assert!(!store.delete_subscription("missing").await.unwrap());

        store.insert_record(SubscriptionRecord::new("c1", "a"));
        assert!(store.delete_subscription("c1").await.unwrap());

        let payload = events.next().await.unwrap().unwrap();
        assert_eq!(payload, "subscription_delete|c1");
        assert!(store.record("c1").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_reaps_and_cascades() {
        let (bus, store) = store();
        let ttl = Duration::from_secs(40);

        assert!(store.heartbeat("a", ttl).await.unwrap().inserted);
        store.heartbeat("b", ttl).await.unwrap();
        store.insert_record(SubscriptionRecord::new("c1", "a"));
        store.insert_record(SubscriptionRecord::new("c2", "b"));

        let mut events = bus.subscribe(CONTROL_CHANNEL).await.unwrap();
        store.expire_channel("a");

        let outcome = store.heartbeat("b", ttl).await.unwrap();
        assert!(!outcome.inserted);
        assert_eq!(outcome.reaped, vec!["a".to_string()]);
        assert!(store.record("c1").is_none());
        assert!(store.record("c2").is_some());
        assert_eq!(store.channels().len(), 1);

        let payload = events.next().await.unwrap().unwrap();
        assert_eq!(payload, "subscription_channel_offline|a");
    }

    #[tokio::test]
    async fn test_heartbeat_never_reaps_self() {
        let (_bus, store) = store();
        store.heartbeat("a", Duration::from_secs(40)).await.unwrap();
        store.expire_channel("a");

        let outcome = store.heartbeat("a", Duration::from_secs(40)).await.unwrap();
        assert!(outcome.reaped.is_empty());
        assert!(!outcome.inserted);
    }

    #[tokio::test]
    async fn test_foreign_subscriptions() {
        let (_bus, store) = store();
        store.insert_record(SubscriptionRecord::new("c1", "a"));
        store.insert_record(SubscriptionRecord::new("c2", "b"));
        store.insert_record(SubscriptionRecord::new("c3", "b"));

        let mut ids: Vec<String> = store
            .foreign_subscriptions("a")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.client_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c2".to_string(), "c3".to_string()]);
    }
}
