//! Bridge lifecycle and the API used by the local realtime transport.

use std::sync::Arc;

use rtbridge_proto::{ControlEvent, Message};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::NotificationBus;
use crate::client::ChannelClient;
use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::control::ControlHandler;
use crate::error::{Error, Result};
use crate::heartbeat::{generate_channel_id, ChannelHeartbeat};
use crate::listener::{listen, shutdown_channel, ShutdownTrigger};
use crate::proxy::{ClientProxy, LocalClient};
use crate::registry::{ClientRegistry, ProxyRegistry};
use crate::relay::RelayHandler;
use crate::resync::{full_resync, ResyncStats};
use crate::schema::SchemaCache;
use crate::store::SubscriptionStore;

/// One bridge instance.
///
/// Owns the channel identity and the proxy registry. [`start`](Self::start)
/// spawns the heartbeat, the control listener and the relay listener.
pub struct Bridge {
    context: Arc<BridgeContext>,
    registry: Arc<dyn ClientRegistry>,
}

impl Bridge {
    /// Create a bridge with a freshly generated channel id.
    pub fn new(
        config: BridgeConfig,
        bus: Arc<dyn NotificationBus>,
        store: Arc<dyn SubscriptionStore>,
        schema: Arc<dyn SchemaCache>,
    ) -> Result<Self> {
        Self::with_channel_id(generate_channel_id(), config, bus, store, schema)
    }

    /// Create a bridge with a fixed channel id.
    pub fn with_channel_id(
        channel_id: impl Into<String>,
        config: BridgeConfig,
        bus: Arc<dyn NotificationBus>,
        store: Arc<dyn SubscriptionStore>,
        schema: Arc<dyn SchemaCache>,
    ) -> Result<Self> {
        config.validate()?;

        let channel_id = channel_id.into();
        if !rtbridge_proto::is_valid_channel_name(&channel_id) {
            return Err(Error::Config(format!("invalid channel id: {}", channel_id)));
        }
        if channel_id == config.control_channel {
            return Err(Error::Config(
                "channel id collides with the control channel".to_string(),
            ));
        }

        let context = Arc::new(BridgeContext::new(channel_id, config, bus, store, schema));
        Ok(Self {
            context,
            registry: Arc::new(ProxyRegistry::new()),
        })
    }

    /// This instance's channel id.
    pub fn channel_id(&self) -> &str {
        self.context.channel_id()
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    /// Registry of local and remote proxies.
    pub fn registry(&self) -> &Arc<dyn ClientRegistry> {
        &self.registry
    }

    /// Prepare the store and spawn the background loops.
    pub async fn start(&self) -> Result<BridgeHandle> {
        self.context.store().ensure_schema().await?;

        let (trigger, shutdown) = shutdown_channel();
        let mut tasks = JoinSet::new();

        let heartbeat = ChannelHeartbeat::new(self.context.clone(), self.registry.clone());
        let signal = shutdown.clone();
        tasks.spawn(async move { ("heartbeat", heartbeat.run(signal).await) });

        let control = ControlHandler::new(self.context.clone(), self.registry.clone());
        let context = self.context.clone();
        let signal = shutdown.clone();
        tasks.spawn(async move {
            let channel = context.config().control_channel.clone();
            let result = listen(context.bus(), &channel, &control, context.config(), &signal).await;
            ("control listener", result)
        });

        let relay = RelayHandler::new(self.context.clone(), self.registry.clone());
        let context = self.context.clone();
        let signal = shutdown;
        tasks.spawn(async move {
            let channel = context.channel_id().to_string();
            let result = listen(context.bus(), &channel, &relay, context.config(), &signal).await;
            ("relay listener", result)
        });

        info!(channel = %self.channel_id(), "bridge started");
        Ok(BridgeHandle { trigger, tasks })
    }

    /// Register a client connected to this instance.
    ///
    /// Nothing is announced until the client has subscriptions; call
    /// [`subscriptions_changed`](Self::subscriptions_changed) after it
    /// subscribes.
    pub fn register_local(&self, client: Arc<dyn LocalClient>) -> Arc<ClientProxy> {
        let proxy = Arc::new(ClientProxy::local(self.context.clone(), client));
        self.registry.register(proxy.clone());
        proxy
    }

    /// Create and register a channel-backed client with a random id.
    pub fn connect_client(&self) -> (Arc<ChannelClient>, mpsc::Receiver<Message>) {
        let (client, rx) = ChannelClient::generate(self.context.config().client_buffer);
        self.register_local(client.clone());
        (client, rx)
    }

    /// Announce a local client's current topics and principal.
    pub async fn subscriptions_changed(&self, client_id: &str) -> Result<()> {
        let proxy = self.local_proxy(client_id)?;
        proxy.broadcast_changes().await
    }

    /// Remove a local client and announce that it went offline.
    pub async fn disconnect(&self, client_id: &str) -> Result<()> {
        let proxy = self.local_proxy(client_id)?;
        self.registry.unregister(client_id);
        proxy.broadcast_go_offline().await?;
        debug!(client_id, "local client disconnected");
        Ok(())
    }

    /// Send `message` to every client subscribed to `topic`, local or remote.
    ///
    /// Returns the number of clients the message was handed to. A failed
    /// relay to one client is logged and does not stop the fan-out.
    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        let mut sent = 0;
        for proxy in self.registry.all() {
            if !proxy.is_subscribed(topic) {
                continue;
            }
            match proxy.send(message.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(client_id = %proxy.id(), topic, error = %e, "failed to send message"),
            }
        }
        sent
    }

    /// Send `message` to one client. Returns `false` if the client is unknown.
    pub async fn send_to(&self, client_id: &str, message: Message) -> Result<bool> {
        match self.registry.by_id(client_id) {
            Some(proxy) => {
                proxy.send(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tell every instance, this one included, to reload collections.
    pub async fn broadcast_collection_updated(&self) -> Result<()> {
        self.broadcast(ControlEvent::CollectionUpdated).await
    }

    /// Tell every instance, this one included, to reload settings.
    pub async fn broadcast_settings_updated(&self) -> Result<()> {
        self.broadcast(ControlEvent::SettingsUpdated).await
    }

    /// Rebuild remote proxies from the store.
    pub async fn resync(&self) -> Result<ResyncStats> {
        full_resync(&self.context, self.registry.as_ref()).await
    }

    async fn broadcast(&self, event: ControlEvent) -> Result<()> {
        let payload = event.encode()?;
        self.context
            .bus()
            .publish(&self.context.config().control_channel, &payload)
            .await
    }

    fn local_proxy(&self, client_id: &str) -> Result<Arc<ClientProxy>> {
        match self.registry.by_id(client_id) {
            Some(proxy) if proxy.is_local() => Ok(proxy),
            Some(_) => Err(Error::InvalidProxy(format!(
                "client {} is not connected to this instance",
                client_id
            ))),
            None => Err(Error::InvalidProxy(format!("unknown client {}", client_id))),
        }
    }
}

/// Running background loops of a started bridge.
pub struct BridgeHandle {
    trigger: ShutdownTrigger,
    tasks: JoinSet<(&'static str, Result<()>)>,
}

impl BridgeHandle {
    /// Wait until a loop stops on its own.
    ///
    /// Loops only stop early on a fatal error, which is returned. Resolves to
    /// `Ok` once every loop has exited cleanly.
    pub async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(task = name, "bridge task finished"),
                Ok((name, Err(e))) => {
                    error!(task = name, error = %e, "bridge task failed");
                    return Err(e);
                }
                Err(e) => return Err(Error::Task(e.to_string())),
            }
        }
        Ok(())
    }

    /// Signal shutdown and wait for every loop to exit.
    ///
    /// Returns the first error any loop reported.
    pub async fn shutdown(mut self) -> Result<()> {
        self.trigger.trigger();

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(e) => Err(Error::Task(e.to_string())),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        info!("bridge stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
