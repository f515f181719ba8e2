//! Registry of client proxies known to this instance.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::proxy::ClientProxy;

/// Lookup table shared by the listeners, the heartbeat and the local
/// transport.
pub trait ClientRegistry: Send + Sync {
    /// Register a proxy, replacing any proxy with the same id.
    fn register(&self, proxy: Arc<ClientProxy>);

    /// Remove a proxy. Returns the removed proxy, if any.
    fn unregister(&self, client_id: &str) -> Option<Arc<ClientProxy>>;

    /// Look up a proxy by client id.
    fn by_id(&self, client_id: &str) -> Option<Arc<ClientProxy>>;

    /// Snapshot of every registered proxy.
    fn all(&self) -> Vec<Arc<ClientProxy>>;

    /// Snapshot of proxies for clients owned by other instances.
    fn remote(&self) -> Vec<Arc<ClientProxy>> {
        self.all()
            .into_iter()
            .filter(|proxy| proxy.is_remote())
            .collect()
    }

    /// Snapshot of proxies wrapping clients connected here.
    fn local(&self) -> Vec<Arc<ClientProxy>> {
        self.all()
            .into_iter()
            .filter(|proxy| proxy.is_local())
            .collect()
    }

    /// Number of registered proxies.
    fn len(&self) -> usize {
        self.all().len()
    }

    /// Whether no proxy is registered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concurrent in-memory registry.
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: DashMap<String, Arc<ClientProxy>>,
}

impl ProxyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            proxies: DashMap::new(),
        }
    }
}

impl ClientRegistry for ProxyRegistry {
    fn register(&self, proxy: Arc<ClientProxy>) {
        let client_id = proxy.id().to_string();
        let remote = proxy.is_remote();
        if self.proxies.insert(client_id.clone(), proxy).is_some() {
            debug!(client_id = %client_id, remote, "replaced client proxy");
        } else {
            debug!(client_id = %client_id, remote, "registered client proxy");
        }
    }

    fn unregister(&self, client_id: &str) -> Option<Arc<ClientProxy>> {
        let removed = self.proxies.remove(client_id).map(|(_, proxy)| proxy);
        if removed.is_some() {
            debug!(client_id, "unregistered client proxy");
        }
        removed
    }

    fn by_id(&self, client_id: &str) -> Option<Arc<ClientProxy>> {
        self.proxies.get(client_id).map(|entry| entry.value().clone())
    }

    fn all(&self) -> Vec<Arc<ClientProxy>> {
        self.proxies
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.proxies.len()
    }
}
