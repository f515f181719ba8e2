//! Client proxies.
//!
//! A [`ClientProxy`] stands in for one realtime client, wherever it is
//! connected. Local proxies wrap a client attached to this instance and
//! originate subscription changes; remote proxies mirror a record owned by
//! a peer and relay messages to it.
//!
//! Remote proxy lifecycle:
//!
//! ```text
//! absent --(resync | upsert)--> present --(upsert)--> present
//! present --(delete | channel offline | resync omission)--> absent
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rtbridge_proto::{Message, RelayMessage, SubscriptionRecord};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::auth::Principal;
use crate::context::BridgeContext;
use crate::error::{Error, Result};

/// A client connected to this instance, as seen by the local transport.
pub trait LocalClient: Send + Sync {
    /// Client id.
    fn id(&self) -> &str;

    /// Deliver a message. Must not block; drop the message if the client
    /// cannot take it.
    fn send(&self, message: Message);

    /// Current topic set.
    fn subscriptions(&self) -> BTreeSet<String>;

    /// Authenticated principal, if any.
    fn principal(&self) -> Option<Principal>;

    /// Whether the transport has given up on this client.
    fn is_discarded(&self) -> bool {
        false
    }
}

/// Where the proxied client lives.
pub enum ProxyKind {
    /// Connected to this instance.
    Local(Arc<dyn LocalClient>),
    /// Connected to a peer; state is mirrored from its record.
    Remote,
}

struct Mirror {
    record: SubscriptionRecord,
    principal: Option<Principal>,
}

/// Uniform handle to a local or remote client.
pub struct ClientProxy {
    client_id: String,
    kind: ProxyKind,
    context: Arc<BridgeContext>,
    mirror: RwLock<Mirror>,
    /// Serializes store writes for a local client.
    writes: Mutex<()>,
    /// Set once the client went offline for good.
    closed: AtomicBool,
}

impl ClientProxy {
    /// Wrap a client connected to this instance.
    pub fn local(context: Arc<BridgeContext>, client: Arc<dyn LocalClient>) -> Self {
        let client_id = client.id().to_string();
        let record = SubscriptionRecord::new(client_id.clone(), context.channel_id());
        Self {
            client_id,
            kind: ProxyKind::Local(client),
            context,
            mirror: RwLock::new(Mirror {
                record,
                principal: None,
            }),
            writes: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Mirror a client owned by a peer.
    ///
    /// The proxy starts with the record's identity only; apply
    /// [`receive_changes`](Self::receive_changes) to load topics and principal.
    pub fn remote(context: Arc<BridgeContext>, record: &SubscriptionRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            kind: ProxyKind::Remote,
            context,
            mirror: RwLock::new(Mirror {
                record: SubscriptionRecord::new(record.client_id.clone(), record.channel_id.clone()),
                principal: None,
            }),
            writes: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Client id.
    pub fn id(&self) -> &str {
        &self.client_id
    }

    /// Kind of proxy.
    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    /// Whether this proxy wraps a locally connected client.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, ProxyKind::Local(_))
    }

    /// Whether the client is owned by another instance.
    ///
    /// Computed from the mirrored record on every call.
    pub fn is_remote(&self) -> bool {
        self.mirror.read().record.channel_id != self.context.channel_id()
    }

    /// Channel id of the owning instance.
    pub fn channel_id(&self) -> String {
        self.mirror.read().record.channel_id.clone()
    }

    /// Snapshot of the mirrored record.
    pub fn record(&self) -> SubscriptionRecord {
        self.mirror.read().record.clone()
    }

    /// Current topic set.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        match &self.kind {
            ProxyKind::Local(client) => client.subscriptions(),
            ProxyKind::Remote => self.mirror.read().record.subscriptions.clone(),
        }
    }

    /// Whether the client is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        match &self.kind {
            ProxyKind::Local(client) => client.subscriptions().contains(topic),
            ProxyKind::Remote => self.mirror.read().record.is_subscribed(topic),
        }
    }

    /// Authenticated principal, if any.
    pub fn principal(&self) -> Option<Principal> {
        match &self.kind {
            ProxyKind::Local(client) => client.principal(),
            ProxyKind::Remote => self.mirror.read().principal.clone(),
        }
    }

    /// Whether [`broadcast_go_offline`](Self::broadcast_go_offline) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Persist and announce this local client's current subscriptions.
    ///
    /// An empty topic set is announced as the client going offline. Once the
    /// client went offline for good this is a no-op, so a stale handle can
    /// never bring its record back.
    pub async fn broadcast_changes(&self) -> Result<()> {
        let client = self.local_client("broadcast changes")?;
        let _writes = self.writes.lock().await;

        if self.is_closed() {
            debug!(client_id = %self.client_id, "client is offline, skipping broadcast");
            return Ok(());
        }

        let subscriptions = client.subscriptions();
        if subscriptions.is_empty() {
            self.delete_record().await?;
            return Ok(());
        }

        let principal = client.principal();
        let mut record = self.record();
        record.subscriptions = subscriptions;
        record.auth_ref = principal.as_ref().map(Principal::auth_ref).unwrap_or_default();
        record.updated_by_channel_id = self.context.channel_id().to_string();

        let snapshot = principal.as_ref().map(Principal::snapshot);
        self.context
            .store()
            .upsert_subscription(&record, snapshot.as_ref())
            .await?;

        debug!(
            client_id = %self.client_id,
            topics = record.subscriptions.len(),
            authenticated = principal.is_some(),
            "broadcast subscription changes"
        );

        let mut mirror = self.mirror.write();
        mirror.record = record;
        mirror.principal = principal;
        Ok(())
    }

    /// Delete this local client's record and announce it.
    ///
    /// Closes the proxy: later [`broadcast_changes`](Self::broadcast_changes)
    /// calls write nothing. Returns whether a record existed.
    pub async fn broadcast_go_offline(&self) -> Result<bool> {
        self.local_client("broadcast go offline")?;
        let _writes = self.writes.lock().await;

        self.closed.store(true, Ordering::SeqCst);
        self.delete_record().await
    }

    async fn delete_record(&self) -> Result<bool> {
        let deleted = self
            .context
            .store()
            .delete_subscription(&self.client_id)
            .await?;

        debug!(client_id = %self.client_id, deleted, "broadcast client offline");

        let mut mirror = self.mirror.write();
        mirror.record.subscriptions.clear();
        mirror.record.auth_ref.clear();
        Ok(deleted)
    }

    /// Apply a peer's record to this remote proxy.
    ///
    /// Replaces topics and principal; never touches the client or channel
    /// id. A missing snapshot clears the principal. A snapshot that cannot
    /// be resolved is logged and also clears it.
    pub fn receive_changes(
        &self,
        record: &SubscriptionRecord,
        auth_snapshot: Option<&JsonValue>,
    ) -> Result<()> {
        if self.is_local() {
            return Err(Error::InvalidProxy(format!(
                "cannot apply remote changes to local client {}",
                self.client_id
            )));
        }
        if record.client_id != self.client_id {
            return Err(Error::InvalidProxy(format!(
                "record for {} applied to proxy {}",
                record.client_id, self.client_id
            )));
        }

        let principal = match (record.has_auth(), auth_snapshot) {
            (true, Some(snapshot)) => {
                match Principal::from_snapshot(&record.auth_ref, snapshot, self.context.schema()) {
                    Ok(principal) => Some(principal),
                    Err(e) => {
                        warn!(
                            client_id = %self.client_id,
                            auth_ref = %record.auth_ref,
                            error = %e,
                            "failed to resolve auth snapshot"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let mut mirror = self.mirror.write();
        mirror.record.subscriptions = record.subscriptions.clone();
        mirror.record.auth_ref = record.auth_ref.clone();
        mirror.record.updated_by_channel_id = record.updated_by_channel_id.clone();
        mirror.principal = principal;

        trace!(
            client_id = %self.client_id,
            topics = mirror.record.subscriptions.len(),
            "applied remote changes"
        );
        Ok(())
    }

    /// Send a message to the client wherever it is connected.
    ///
    /// Local clients get it directly; remote clients get it through their
    /// owner's private channel. Discarded local clients are skipped.
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.is_remote() {
            return match &self.kind {
                ProxyKind::Local(client) => {
                    if !client.is_discarded() {
                        client.send(message);
                    }
                    Ok(())
                }
                ProxyKind::Remote => {
                    error!(
                        client_id = %self.client_id,
                        channel = %self.context.channel_id(),
                        "attempted to relay a message to own channel"
                    );
                    Err(Error::SelfRelay {
                        client_id: self.client_id.clone(),
                        channel_id: self.context.channel_id().to_string(),
                    })
                }
            };
        }

        let channel = self.channel_id();
        let payload = RelayMessage::new(self.client_id.clone(), message).encode()?;
        self.context.bus().publish(&channel, &payload).await?;

        trace!(client_id = %self.client_id, channel = %channel, "relayed message");
        Ok(())
    }

    /// Hand a relayed message to the wrapped local client.
    ///
    /// Fails with [`Error::WrongChannel`] if this instance does not own the
    /// client; the message is never forwarded again.
    pub fn deliver_local(&self, message: Message) -> Result<()> {
        match &self.kind {
            ProxyKind::Local(client) if !self.is_remote() => {
                if !client.is_discarded() {
                    client.send(message);
                }
                Ok(())
            }
            _ => Err(Error::WrongChannel {
                client_id: self.client_id.clone(),
            }),
        }
    }

    fn local_client(&self, operation: &str) -> Result<&Arc<dyn LocalClient>> {
        match &self.kind {
            ProxyKind::Local(client) => Ok(client),
            ProxyKind::Remote => Err(Error::InvalidProxy(format!(
                "cannot {} for remote client {}",
                operation, self.client_id
            ))),
        }
    }
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mirror = self.mirror.read();
        f.debug_struct("ClientProxy")
            .field("client_id", &self.client_id)
            .field("local", &self.is_local())
            .field("channel_id", &mirror.record.channel_id)
            .field("subscriptions", &mirror.record.subscriptions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use rtbridge_proto::{ControlEvent, CONTROL_CHANNEL};
    use serde_json::json;

    use crate::bus::{MemoryBus, NotificationBus};
    use crate::client::ChannelClient;
    use crate::config::BridgeConfig;
    use crate::schema::{Collection, StaticSchemaCache};
    use crate::store::MemoryStore;

    struct Fixture {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        context: Arc<BridgeContext>,
    }

    fn fixture(channel_id: &str) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::new(bus.clone(), CONTROL_CHANNEL));
        let schema = Arc::new(
            StaticSchemaCache::new()
                .with_collection(Collection::new("pbc_1", "users", ["email"])),
        );
        let context = Arc::new(BridgeContext::new(
            channel_id,
            BridgeConfig::default(),
            bus.clone(),
            store.clone(),
            schema,
        ));
        Fixture {
            bus,
            store,
            context,
        }
    }

    fn remote_record() -> SubscriptionRecord {
        SubscriptionRecord::new("c1", "b")
            .with_subscriptions(["t1", "t2"])
            .with_auth_ref("users/u1")
            .with_updated_by("b")
    }

    #[tokio::test]
    async fn test_broadcast_changes_writes_and_announces() {
        let fx = fixture("a");
        let mut events = fx.bus.subscribe(CONTROL_CHANNEL).await.unwrap();

        let (client, _rx) = ChannelClient::new("c1", 8);
        client.subscribe(["t1", "t2"]);
        client.set_principal(Some(Principal::new("users", "u1").with_field("email", "x@y.z")));
        let proxy = ClientProxy::local(fx.context.clone(), client.clone());

        proxy.broadcast_changes().await.unwrap();

        let stored = fx.store.record("c1").unwrap();
        assert_eq!(stored.channel_id, "a");
        assert_eq!(stored.updated_by_channel_id, "a");
        assert_eq!(stored.auth_ref, "users/u1");
        assert_eq!(stored.subscription_list(), vec!["t1".to_string(), "t2".to_string()]);

        let payload = events.next().await.unwrap().unwrap();
        match ControlEvent::decode(&payload).unwrap() {
            ControlEvent::SubscriptionUpsert {
                record,
                auth_snapshot,
            } => {
                assert_eq!(record, stored);
                assert_eq!(auth_snapshot, Some(json!({"id": "u1", "email": "x@y.z"})));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!proxy.is_remote());
    }

    #[tokio::test]
    async fn test_empty_subscriptions_go_offline() {
        let fx = fixture("a");
        let (client, _rx) = ChannelClient::new("c1", 8);
        client.subscribe(["t1"]);
        let proxy = ClientProxy::local(fx.context.clone(), client.clone());
        proxy.broadcast_changes().await.unwrap();

        let mut events = fx.bus.subscribe(CONTROL_CHANNEL).await.unwrap();
        client.unsubscribe_all();
        proxy.broadcast_changes().await.unwrap();

        assert!(fx.store.record("c1").is_none());
        assert_eq!(events.next().await.unwrap().unwrap(), "subscription_delete|c1");

        // Emptied topics do not close the client; it may subscribe again.
        assert!(!proxy.is_closed());
        client.subscribe(["t2"]);
        proxy.broadcast_changes().await.unwrap();
        assert!(fx.store.record("c1").unwrap().is_subscribed("t2"));
    }

    #[tokio::test]
    async fn test_broadcast_after_go_offline_writes_nothing() {
        let fx = fixture("a");
        let (client, _rx) = ChannelClient::new("c1", 8);
        client.subscribe(["t1"]);
        let proxy = Arc::new(ClientProxy::local(fx.context.clone(), client.clone()));
        proxy.broadcast_changes().await.unwrap();

        let stale = proxy.clone();
        assert!(proxy.broadcast_go_offline().await.unwrap());
        assert!(proxy.is_closed());

        let mut events = fx.bus.subscribe(CONTROL_CHANNEL).await.unwrap();
        stale.broadcast_changes().await.unwrap();
        assert!(fx.store.record("c1").is_none());

        let next = tokio::time::timeout(std::time::Duration::from_millis(50), events.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_remote_proxy_rejects_broadcast() {
        let fx = fixture("a");
        let proxy = ClientProxy::remote(fx.context.clone(), &remote_record());
        assert!(matches!(
            proxy.broadcast_changes().await,
            Err(Error::InvalidProxy(_))
        ));
    }

    #[test]
    fn test_receive_changes_is_idempotent() {
        let fx = fixture("a");
        let record = remote_record();
        let snapshot = json!({"id": "u1", "email": "x@y.z"});

        let once = ClientProxy::remote(fx.context.clone(), &record);
        once.receive_changes(&record, Some(&snapshot)).unwrap();

        let twice = ClientProxy::remote(fx.context.clone(), &record);
        twice.receive_changes(&record, Some(&snapshot)).unwrap();
        twice.receive_changes(&record, Some(&snapshot)).unwrap();

        assert_eq!(once.record(), twice.record());
        assert_eq!(once.principal(), twice.principal());
        assert_eq!(once.record(), record);
        assert_eq!(once.principal().unwrap().id, "u1");
    }

    #[test]
    fn test_receive_changes_keeps_identity() {
        let fx = fixture("a");
        let proxy = ClientProxy::remote(fx.context.clone(), &remote_record());

        let moved = SubscriptionRecord::new("c1", "c").with_subscriptions(["t3"]);
        proxy.receive_changes(&moved, None).unwrap();

        assert_eq!(proxy.channel_id(), "b");
        assert_eq!(proxy.subscriptions().len(), 1);
        assert!(proxy.is_subscribed("t3"));
        assert!(proxy.principal().is_none());

        let other = SubscriptionRecord::new("c2", "b");
        assert!(proxy.receive_changes(&other, None).is_err());
    }

    #[test]
    fn test_receive_changes_without_snapshot_clears_principal() {
        let fx = fixture("a");
        let record = remote_record();
        let proxy = ClientProxy::remote(fx.context.clone(), &record);

        proxy
            .receive_changes(&record, Some(&json!({"email": "x@y.z"})))
            .unwrap();
        assert!(proxy.principal().is_some());

        proxy.receive_changes(&record, None).unwrap();
        assert!(proxy.principal().is_none());
    }

    #[test]
    fn test_local_proxy_rejects_remote_changes() {
        let fx = fixture("a");
        let (client, _rx) = ChannelClient::new("c1", 8);
        let proxy = ClientProxy::local(fx.context.clone(), client);
        assert!(proxy.receive_changes(&remote_record(), None).is_err());
    }

    #[tokio::test]
    async fn test_send_local_delivers_directly() {
        let fx = fixture("a");
        let (client, mut rx) = ChannelClient::new("c1", 8);
        let proxy = ClientProxy::local(fx.context.clone(), client);

        proxy.send(Message::new("t1", "hello")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::new("t1", "hello"));
    }

    #[tokio::test]
    async fn test_send_remote_relays_to_owner() {
        let fx = fixture("a");
        let mut relay = fx.bus.subscribe("b").await.unwrap();
        let proxy = ClientProxy::remote(fx.context.clone(), &remote_record());

        assert!(proxy.is_remote());
        proxy.send(Message::new("t1", "x|y")).await.unwrap();
        assert_eq!(relay.next().await.unwrap().unwrap(), "c1|t1|x|y");
    }

    #[tokio::test]
    async fn test_send_to_own_channel_fails() {
        let fx = fixture("a");
        let record = SubscriptionRecord::new("c1", "a");
        let proxy = ClientProxy::remote(fx.context.clone(), &record);

        let err = proxy.send(Message::new("t1", "")).await.unwrap_err();
        assert!(matches!(err, Error::SelfRelay { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_deliver_local_rejects_remote() {
        let fx = fixture("a");
        let proxy = ClientProxy::remote(fx.context.clone(), &remote_record());
        assert!(matches!(
            proxy.deliver_local(Message::new("t1", "")),
            Err(Error::WrongChannel { .. })
        ));
    }
}
