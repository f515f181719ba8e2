//! Durable record types shared by every instance.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the collection and the record id in an `auth_ref`.
pub const AUTH_REF_SEPARATOR: char = '/';

/// One realtime client's subscriptions, as persisted in the side-table.
///
/// There is exactly one record per `client_id`. The record is owned by the
/// instance named in `channel_id`; `updated_by_channel_id` names the
/// instance that last wrote it and is used to suppress echoes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Client identifier, unique across the cluster.
    pub client_id: String,
    /// Channel id of the instance the client is connected to.
    pub channel_id: String,
    /// Subscribed topics.
    #[serde(default)]
    pub subscriptions: BTreeSet<String>,
    /// `collection/id` of the authenticated principal, or empty.
    #[serde(default)]
    pub auth_ref: String,
    /// Channel id of the last writer.
    #[serde(default)]
    pub updated_by_channel_id: String,
}

impl SubscriptionRecord {
    /// Create an empty record for a client owned by `channel_id`.
    pub fn new(client_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            channel_id: channel_id.into(),
            subscriptions: BTreeSet::new(),
            auth_ref: String::new(),
            updated_by_channel_id: String::new(),
        }
    }

    /// Set the subscribed topics.
    pub fn with_subscriptions<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the principal reference.
    pub fn with_auth_ref(mut self, auth_ref: impl Into<String>) -> Self {
        self.auth_ref = auth_ref.into();
        self
    }

    /// Set the last writer.
    pub fn with_updated_by(mut self, channel_id: impl Into<String>) -> Self {
        self.updated_by_channel_id = channel_id.into();
        self
    }

    /// Check whether this client is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    /// Check whether the record carries an authenticated principal.
    pub fn has_auth(&self) -> bool {
        !self.auth_ref.is_empty()
    }

    /// Split `auth_ref` into `(collection, record_id)`.
    pub fn auth_ref_parts(&self) -> Option<(&str, &str)> {
        let (collection, id) = self.auth_ref.split_once(AUTH_REF_SEPARATOR)?;
        if collection.is_empty() || id.is_empty() {
            return None;
        }
        Some((collection, id))
    }

    /// Subscriptions as a list, in the order stored in the database.
    pub fn subscription_list(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }
}

/// Build an `auth_ref` from its parts.
pub fn auth_ref(collection: &str, record_id: &str) -> String {
    format!("{}{}{}", collection, AUTH_REF_SEPARATOR, record_id)
}

/// Liveness row advertised by one running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id.
    pub id: String,
    /// Deadline after which peers may reap the channel.
    pub valid_until: DateTime<Utc>,
}

impl Channel {
    /// Create a channel row.
    pub fn new(id: impl Into<String>, valid_until: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            valid_until,
        }
    }

    /// Check whether the liveness deadline has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}
