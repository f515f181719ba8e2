//! Schema and settings cache collaborator.
//!
//! The bridge does not own collection definitions or settings. It only asks
//! the host's cache to reload when a peer announces a change, and looks up
//! auth collections to rebuild principals received from peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::Result;

/// Collection definition as far as the bridge cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Collection id.
    pub id: String,
    /// Collection name, as used in `auth_ref`.
    pub name: String,
    /// Field names a principal of this collection carries.
    pub fields: Vec<String>,
}

impl Collection {
    /// Create a collection definition.
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Host-side cache of collections and settings.
#[async_trait]
pub trait SchemaCache: Send + Sync {
    /// Reload collection definitions from storage.
    async fn reload_collections(&self) -> Result<()>;

    /// Reload settings from storage.
    async fn reload_settings(&self) -> Result<()>;

    /// Look up a cached collection by name or id.
    fn find_collection(&self, name_or_id: &str) -> Option<Collection>;
}

/// Fixed in-memory schema cache.
///
/// Reloads are counted and logged but change nothing; collections are
/// registered up front. Used by the standalone node and by tests.
pub struct StaticSchemaCache {
    collections: RwLock<HashMap<String, Collection>>,
    collection_reloads: AtomicU64,
    settings_reloads: AtomicU64,
}

impl StaticSchemaCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            collection_reloads: AtomicU64::new(0),
            settings_reloads: AtomicU64::new(0),
        }
    }

    /// Register a collection.
    pub fn with_collection(self, collection: Collection) -> Self {
        self.insert(collection);
        self
    }

    /// Register or replace a collection.
    pub fn insert(&self, collection: Collection) {
        self.collections
            .write()
            .insert(collection.name.clone(), collection);
    }

    /// Number of collection reloads requested so far.
    pub fn collection_reloads(&self) -> u64 {
        self.collection_reloads.load(Ordering::SeqCst)
    }

    /// Number of settings reloads requested so far.
    pub fn settings_reloads(&self) -> u64 {
        self.settings_reloads.load(Ordering::SeqCst)
    }
}

impl Default for StaticSchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaCache for StaticSchemaCache {
    async fn reload_collections(&self) -> Result<()> {
        let count = self.collection_reloads.fetch_add(1, Ordering::SeqCst) + 1;
        info!(count, "collections reload requested");
        Ok(())
    }

    async fn reload_settings(&self) -> Result<()> {
        let count = self.settings_reloads.fetch_add(1, Ordering::SeqCst) + 1;
        info!(count, "settings reload requested");
        Ok(())
    }

    fn find_collection(&self, name_or_id: &str) -> Option<Collection> {
        let collections = self.collections.read();
        collections.get(name_or_id).cloned().or_else(|| {
            collections
                .values()
                .find(|collection| collection.id == name_or_id)
                .cloned()
        })
    }
}
