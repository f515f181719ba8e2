//! Authenticated principals attached to realtime clients.

use rtbridge_proto::record::{auth_ref, AUTH_REF_SEPARATOR};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::schema::SchemaCache;

/// The authenticated identity behind a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// Auth collection name.
    pub collection: String,
    /// Record id within the collection.
    pub id: String,
    /// Record fields.
    pub data: Map<String, JsonValue>,
}

impl Principal {
    /// Create a principal.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            data: Map::new(),
        }
    }

    /// Set a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// `collection/id` reference stored in subscription records.
    pub fn auth_ref(&self) -> String {
        auth_ref(&self.collection, &self.id)
    }

    /// JSON object sent to peers alongside the subscription record.
    pub fn snapshot(&self) -> JsonValue {
        let mut data = self.data.clone();
        data.insert("id".to_string(), JsonValue::String(self.id.clone()));
        JsonValue::Object(data)
    }

    /// Rebuild a principal from a peer's snapshot.
    ///
    /// The collection named in `auth_ref` must be known to `schema`; only
    /// the fields it defines are kept, and fields missing from the snapshot
    /// are set to null.
    pub fn from_snapshot(
        auth_ref: &str,
        snapshot: &JsonValue,
        schema: &dyn SchemaCache,
    ) -> Result<Self> {
        let (collection_name, id) = auth_ref
            .split_once(AUTH_REF_SEPARATOR)
            .filter(|(collection, id)| !collection.is_empty() && !id.is_empty())
            .ok_or_else(|| Error::Schema(format!("invalid auth ref: {:?}", auth_ref)))?;

        let collection = schema
            .find_collection(collection_name)
            .ok_or_else(|| Error::Schema(format!("unknown collection: {}", collection_name)))?;

        let fields = snapshot
            .as_object()
            .ok_or_else(|| Error::Schema("auth snapshot is not an object".to_string()))?;

        let data = collection
            .fields
            .iter()
            .filter(|field| field.as_str() != "id")
            .map(|field| {
                let value = fields.get(field).cloned().unwrap_or(JsonValue::Null);
                (field.clone(), value)
            })
            .collect();

        Ok(Self {
            collection: collection.name,
            id: id.to_string(),
            data,
        })
    }
}
