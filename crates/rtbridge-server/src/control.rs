//! Handler for the shared control channel.

use std::sync::Arc;

use async_trait::async_trait;
use rtbridge_proto::ControlEvent;
use tracing::{debug, error, info, trace, warn};

use crate::context::BridgeContext;
use crate::error::{Error, Result};
use crate::listener::NotificationHandler;
use crate::registry::ClientRegistry;
use crate::resync::{apply_remote_record, full_resync};

/// Applies control events from every instance to the local registry.
pub struct ControlHandler {
    context: Arc<BridgeContext>,
    registry: Arc<dyn ClientRegistry>,
}

impl ControlHandler {
    pub fn new(context: Arc<BridgeContext>, registry: Arc<dyn ClientRegistry>) -> Self {
        Self { context, registry }
    }

    /// Apply one decoded event.
    pub async fn apply(&self, event: ControlEvent) -> Result<()> {
        if event.origin_channel() == Some(self.context.channel_id()) {
            trace!(kind = event.kind(), "ignoring own control event");
            return Ok(());
        }

        match event {
            ControlEvent::SubscriptionUpsert {
                record,
                auth_snapshot,
            } => {
                let applied = apply_remote_record(
                    &self.context,
                    self.registry.as_ref(),
                    &record,
                    auth_snapshot.as_ref(),
                )?;
                trace!(client_id = %record.client_id, ?applied, "applied subscription upsert");
            }
            ControlEvent::SubscriptionDelete { client_id } => match self.registry.by_id(&client_id) {
                Some(proxy) if proxy.is_local() => {
                    trace!(client_id = %client_id, "ignoring delete for local client");
                }
                Some(_) => {
                    self.registry.unregister(&client_id);
                    debug!(client_id = %client_id, "remote client went offline");
                }
                None => {}
            },
            ControlEvent::ChannelOffline { channel_id } => {
                if channel_id == self.context.channel_id() {
                    warn!(
                        channel = %channel_id,
                        "this instance was reaped by a peer, local clients are re-announced on the next heartbeat"
                    );
                    return Ok(());
                }

                let mut removed = 0;
                for proxy in self.registry.remote() {
                    if proxy.channel_id() == channel_id {
                        self.registry.unregister(proxy.id());
                        removed += 1;
                    }
                }
                info!(channel = %channel_id, removed, "peer channel went offline");
            }
            ControlEvent::CollectionUpdated => {
                if let Err(e) = self.context.schema().reload_collections().await {
                    warn!(error = %e, "failed to reload collections");
                }
            }
            ControlEvent::SettingsUpdated => {
                if let Err(e) = self.context.schema().reload_settings().await {
                    warn!(error = %e, "failed to reload settings");
                }
            }
        }

        Ok(())
    }

    async fn reload_caches(&self) {
        if let Err(e) = self.context.schema().reload_collections().await {
            warn!(error = %e, "failed to reload collections after reconnect");
        }
        if let Err(e) = self.context.schema().reload_settings().await {
            warn!(error = %e, "failed to reload settings after reconnect");
        }
    }
}

#[async_trait]
impl NotificationHandler for ControlHandler {
    /// Events may have been missed while disconnected, so every
    /// (re)connect resyncs from the store and reloads cached structure.
    async fn on_connect(&self) -> Result<()> {
        full_resync(&self.context, self.registry.as_ref()).await?;
        self.reload_caches().await;
        Ok(())
    }

    async fn handle(&self, payload: &str) -> Result<()> {
        let event = ControlEvent::decode(payload).map_err(Error::from)?;
        if let Err(e) = self.apply(event).await {
            if e.is_fatal() {
                error!(error = %e, "failed to apply control event");
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtbridge_proto::{SubscriptionRecord, CONTROL_CHANNEL};
    use serde_json::json;

    use crate::bus::MemoryBus;
    use crate::client::ChannelClient;
    use crate::config::BridgeConfig;
    use crate::proxy::ClientProxy;
    use crate::registry::ProxyRegistry;
    use crate::schema::{Collection, StaticSchemaCache};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        schema: Arc<StaticSchemaCache>,
        context: Arc<BridgeContext>,
        registry: Arc<ProxyRegistry>,
        handler: ControlHandler,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new(bus.clone(), CONTROL_CHANNEL));
        let schema = Arc::new(
            StaticSchemaCache::new().with_collection(Collection::new("pbc_1", "users", ["email"])),
        );
        let context = Arc::new(BridgeContext::new(
            "a",
            BridgeConfig::default(),
            bus,
            store.clone(),
            schema.clone(),
        ));
        let registry = Arc::new(ProxyRegistry::new());
        let handler = ControlHandler::new(context.clone(), registry.clone());
        Fixture {
            store,
            schema,
            context,
            registry,
            handler,
        }
    }

    fn upsert(client_id: &str, channel: &str, topics: &[&str]) -> String {
        let record = SubscriptionRecord::new(client_id, channel)
            .with_subscriptions(topics.iter().copied())
            .with_updated_by(channel);
        ControlEvent::upsert(record, None).encode().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_and_updates_remote_proxy() {
        let fx = fixture();
        fx.handler.handle(&upsert("c1", "b", &["t1", "t2"])).await.unwrap();

        let proxy = fx.registry.by_id("c1").unwrap();
        assert!(proxy.is_remote());
        assert_eq!(proxy.channel_id(), "b");
        assert!(proxy.is_subscribed("t1") && proxy.is_subscribed("t2"));

        fx.handler.handle(&upsert("c1", "b", &["t3"])).await.unwrap();
        let proxy = fx.registry.by_id("c1").unwrap();
        assert!(proxy.is_subscribed("t3"));
        assert!(!proxy.is_subscribed("t1"));
    }

    #[tokio::test]
    async fn test_upsert_with_snapshot_sets_principal() {
        let fx = fixture();
        let record = SubscriptionRecord::new("c1", "b")
            .with_subscriptions(["t1"])
            .with_auth_ref("users/u1")
            .with_updated_by("b");
        let payload = ControlEvent::upsert(record, Some(json!({"id": "u1", "email": "x@y.z"})))
            .encode()
            .unwrap();

        fx.handler.handle(&payload).await.unwrap();
        let principal = fx.registry.by_id("c1").unwrap().principal().unwrap();
        assert_eq!(principal.id, "u1");
        assert_eq!(principal.collection, "users");
    }

    #[tokio::test]
    async fn test_own_upsert_is_ignored() {
        let fx = fixture();
        let record = SubscriptionRecord::new("c1", "b")
            .with_subscriptions(["t1"])
            .with_updated_by("a");
        let payload = ControlEvent::upsert(record, None).encode().unwrap();

        fx.handler.handle(&payload).await.unwrap();
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_remote_only() {
        let fx = fixture();
        fx.handler.handle(&upsert("c1", "b", &["t1"])).await.unwrap();
        let (client, _rx) = ChannelClient::new("c2", 4);
        fx.registry
            .register(Arc::new(ClientProxy::local(fx.context.clone(), client)));

        fx.handler.handle("subscription_delete|c1").await.unwrap();
        fx.handler.handle("subscription_delete|c2").await.unwrap();
        fx.handler.handle("subscription_delete|unknown").await.unwrap();

        assert!(fx.registry.by_id("c1").is_none());
        assert!(fx.registry.by_id("c2").is_some());
    }

    #[tokio::test]
    async fn test_channel_offline_removes_its_proxies() {
        let fx = fixture();
        fx.handler.handle(&upsert("c1", "b", &["t1"])).await.unwrap();
        fx.handler.handle(&upsert("c2", "b", &["t1"])).await.unwrap();
        fx.handler.handle(&upsert("c3", "c", &["t1"])).await.unwrap();

        fx.handler
            .handle("subscription_channel_offline|b")
            .await
            .unwrap();

        assert_eq!(fx.registry.len(), 1);
        assert!(fx.registry.by_id("c3").is_some());
    }

    #[tokio::test]
    async fn test_own_channel_offline_keeps_local_clients() {
        let fx = fixture();
        let (client, _rx) = ChannelClient::new("c1", 4);
        fx.registry
            .register(Arc::new(ClientProxy::local(fx.context.clone(), client)));

        fx.handler
            .handle("subscription_channel_offline|a")
            .await
            .unwrap();
        assert!(fx.registry.by_id("c1").is_some());
    }

    #[tokio::test]
    async fn test_structural_events_reload_cache() {
        let fx = fixture();
        fx.handler
            .handle("collection_updated|empty-payload")
            .await
            .unwrap();
        fx.handler
            .handle("settings_updated|empty-payload")
            .await
            .unwrap();
        assert_eq!(fx.schema.collection_reloads(), 1);
        assert_eq!(fx.schema.settings_reloads(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_is_fatal() {
        let fx = fixture();
        let err = fx.handler.handle("client_teleported|c1").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_event_is_not_fatal() {
        let fx = fixture();
        let err = fx.handler.handle("subscription_upsert|nope|").await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_resyncs_and_reloads() {
        let fx = fixture();
        fx.store
            .insert_record(SubscriptionRecord::new("c1", "b").with_subscriptions(["t1"]));

        fx.handler.on_connect().await.unwrap();

        assert!(fx.registry.by_id("c1").is_some());
        assert_eq!(fx.schema.collection_reloads(), 1);
        assert_eq!(fx.schema.settings_reloads(), 1);
    }
}
