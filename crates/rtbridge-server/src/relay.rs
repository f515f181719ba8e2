//! Handler for this instance's private relay channel.

use std::sync::Arc;

use async_trait::async_trait;
use rtbridge_proto::RelayMessage;
use tracing::{debug, error, trace};

use crate::context::BridgeContext;
use crate::error::{Error, Result};
use crate::listener::NotificationHandler;
use crate::registry::ClientRegistry;

/// Delivers relayed messages to clients connected here.
pub struct RelayHandler {
    context: Arc<BridgeContext>,
    registry: Arc<dyn ClientRegistry>,
}

impl RelayHandler {
    pub fn new(context: Arc<BridgeContext>, registry: Arc<dyn ClientRegistry>) -> Self {
        Self { context, registry }
    }
}

#[async_trait]
impl NotificationHandler for RelayHandler {
    async fn handle(&self, payload: &str) -> Result<()> {
        let relay = RelayMessage::decode(payload).map_err(Error::from)?;

        let Some(proxy) = self.registry.by_id(&relay.client_id) else {
            debug!(client_id = %relay.client_id, "relay target not found, client may have disconnected");
            return Ok(());
        };

        match proxy.deliver_local(relay.message) {
            Ok(()) => {
                trace!(client_id = %relay.client_id, "delivered relayed message");
                Ok(())
            }
            Err(e @ Error::WrongChannel { .. }) => {
                error!(
                    client_id = %relay.client_id,
                    channel = %self.context.channel_id(),
                    owner = %proxy.channel_id(),
                    "relay delivered to an instance that does not own the client"
                );
                if self.context.config().strict_routing {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtbridge_proto::{Message, SubscriptionRecord, CONTROL_CHANNEL};

    use crate::bus::MemoryBus;
    use crate::client::ChannelClient;
    use crate::config::BridgeConfig;
    use crate::proxy::ClientProxy;
    use crate::registry::ProxyRegistry;
    use crate::schema::StaticSchemaCache;
    use crate::store::MemoryStore;

    fn handler(config: BridgeConfig) -> (Arc<BridgeContext>, Arc<ProxyRegistry>, RelayHandler) {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new(bus.clone(), CONTROL_CHANNEL));
        let context = Arc::new(BridgeContext::new(
            "a",
            config,
            bus,
            store,
            Arc::new(StaticSchemaCache::new()),
        ));
        let registry = Arc::new(ProxyRegistry::new());
        let handler = RelayHandler::new(context.clone(), registry.clone());
        (context, registry, handler)
    }

    #[tokio::test]
    async fn test_delivers_to_local_client() {
        let (context, registry, handler) = handler(BridgeConfig::default());
        let (client, mut rx) = ChannelClient::new("c1", 4);
        registry.register(Arc::new(ClientProxy::local(context, client)));

        handler.handle("c1|posts/1|{\"a\":\"x|y\"}").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::new("posts/1", "{\"a\":\"x|y\"}")
        );
    }

    #[tokio::test]
    async fn test_unknown_client_is_dropped() {
        let (_context, _registry, handler) = handler(BridgeConfig::default());
        assert!(handler.handle("missing|t1|data").await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_relay_is_not_fatal() {
        let (_context, _registry, handler) = handler(BridgeConfig::default());
        let err = handler.handle("no-delimiters").await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_misrouted_relay_dropped_by_default() {
        let (context, registry, handler) = handler(BridgeConfig::default());
        registry.register(Arc::new(ClientProxy::remote(
            context,
            &SubscriptionRecord::new("c1", "b"),
        )));
        assert!(handler.handle("c1|t1|data").await.is_ok());
    }

    #[tokio::test]
    async fn test_misrouted_relay_fatal_when_strict() {
        let (context, registry, handler) = handler(BridgeConfig::new().with_strict_routing());
        registry.register(Arc::new(ClientProxy::remote(
            context,
            &SubscriptionRecord::new("c1", "b"),
        )));
        let err = handler.handle("c1|t1|data").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
