//! Channel-backed local client.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rtbridge_proto::Message;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::Principal;
use crate::proxy::LocalClient;

/// Length of generated client ids.
pub const CLIENT_ID_LEN: usize = 40;

/// A local client whose outbound messages land in a bounded channel.
///
/// The owning transport drains the receiver and writes to the socket.
/// Sending never waits: when the buffer is full the message is dropped and
/// counted.
pub struct ChannelClient {
    id: String,
    tx: mpsc::Sender<Message>,
    subscriptions: RwLock<BTreeSet<String>>,
    principal: RwLock<Option<Principal>>,
    discarded: AtomicBool,
    dropped: AtomicU64,
}

impl ChannelClient {
    /// Create a client with the given id and outbound buffer.
    pub fn new(id: impl Into<String>, buffer: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let client = Arc::new(Self {
            id: id.into(),
            tx,
            subscriptions: RwLock::new(BTreeSet::new()),
            principal: RwLock::new(None),
            discarded: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        (client, rx)
    }

    /// Create a client with a random id.
    pub fn generate(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        Self::new(generate_client_id(), buffer)
    }

    /// Add topics.
    pub fn subscribe<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions
            .write()
            .extend(topics.into_iter().map(Into::into));
    }

    /// Remove topics.
    pub fn unsubscribe<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subscriptions = self.subscriptions.write();
        for topic in topics {
            subscriptions.remove(topic.as_ref());
        }
    }

    /// Remove every topic.
    pub fn unsubscribe_all(&self) {
        self.subscriptions.write().clear();
    }

    /// Attach or clear the authenticated principal.
    pub fn set_principal(&self, principal: Option<Principal>) {
        *self.principal.write() = principal;
    }

    /// Stop delivering messages to this client.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }

    /// Messages dropped because the buffer was full or closed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LocalClient for ChannelClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, message: Message) {
        if let Err(e) = self.tx.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(client_id = %self.id, error = %e, "dropped message for local client");
        }
    }

    fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.read().clone()
    }

    fn principal(&self) -> Option<Principal> {
        self.principal.read().clone()
    }

    fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::SeqCst)
    }
}

/// Random alphanumeric client id.
pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions() {
        let (client, _rx) = ChannelClient::new("c1", 4);
        client.subscribe(["a", "b", "c"]);
        client.unsubscribe(["b"]);
        assert_eq!(
            client.subscriptions().into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "c".to_string()]
        );

        client.unsubscribe_all();
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_send_never_blocks() {
        let (client, mut rx) = ChannelClient::new("c1", 1);
        client.send(Message::new("t", "1"));
        client.send(Message::new("t", "2"));

        assert_eq!(client.dropped_count(), 1);
        assert_eq!(rx.recv().await.unwrap().data, "1");
    }

    #[test]
    fn test_generated_ids() {
        let (a, _) = ChannelClient::generate(1);
        let (b, _) = ChannelClient::generate(1);
        assert_eq!(a.id().len(), CLIENT_ID_LEN);
        assert_ne!(a.id(), b.id());
        assert!(!a.is_discarded());
        a.discard();
        assert!(a.is_discarded());
    }
}
