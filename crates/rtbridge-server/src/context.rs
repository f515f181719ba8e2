//! Shared handles injected into every bridge component.

use std::sync::Arc;

use crate::bus::NotificationBus;
use crate::config::BridgeConfig;
use crate::schema::SchemaCache;
use crate::store::SubscriptionStore;

/// Everything a component needs to publish, persist or relay.
///
/// Built once at startup and shared behind an `Arc`; there is no global
/// lookup of the running bridge.
pub struct BridgeContext {
    channel_id: String,
    config: BridgeConfig,
    bus: Arc<dyn NotificationBus>,
    store: Arc<dyn SubscriptionStore>,
    schema: Arc<dyn SchemaCache>,
}

impl BridgeContext {
    /// Create a context for the instance identified by `channel_id`.
    pub fn new(
        channel_id: impl Into<String>,
        config: BridgeConfig,
        bus: Arc<dyn NotificationBus>,
        store: Arc<dyn SubscriptionStore>,
        schema: Arc<dyn SchemaCache>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            config,
            bus,
            store,
            schema,
        }
    }

    /// This instance's channel id.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Notification bus.
    pub fn bus(&self) -> &dyn NotificationBus {
        self.bus.as_ref()
    }

    /// Durable store.
    pub fn store(&self) -> &dyn SubscriptionStore {
        self.store.as_ref()
    }

    /// Schema and settings cache.
    pub fn schema(&self) -> &dyn SchemaCache {
        self.schema.as_ref()
    }
}
