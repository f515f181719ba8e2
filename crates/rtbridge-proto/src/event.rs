//! Broadcast control events.
//!
//! Every instance listens on [`CONTROL_CHANNEL`](crate::CONTROL_CHANNEL) and
//! receives every event, including its own. Payloads have the form
//! `type|field1|field2...`.

use serde_json::Value as JsonValue;

use crate::record::SubscriptionRecord;
use crate::{Error, DELIMITER, EMPTY_PAYLOAD};

const SUBSCRIPTION_UPSERT: &str = "subscription_upsert";
const SUBSCRIPTION_DELETE: &str = "subscription_delete";
const CHANNEL_OFFLINE: &str = "subscription_channel_offline";
const COLLECTION_UPDATED: &str = "collection_updated";
const SETTINGS_UPDATED: &str = "settings_updated";

/// Lifecycle and structural events shared by all instances.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A client's subscription record was created or changed.
    SubscriptionUpsert {
        record: SubscriptionRecord,
        /// Principal data captured by the writer, if the client is authenticated.
        auth_snapshot: Option<JsonValue>,
    },
    /// A client went offline or cleared its subscriptions.
    SubscriptionDelete { client_id: String },
    /// An instance was reaped; all of its clients are gone.
    ChannelOffline { channel_id: String },
    /// Collection definitions changed somewhere in the cluster.
    CollectionUpdated,
    /// Settings changed somewhere in the cluster.
    SettingsUpdated,
}

impl ControlEvent {
    /// Build an upsert event.
    pub fn upsert(record: SubscriptionRecord, auth_snapshot: Option<JsonValue>) -> Self {
        ControlEvent::SubscriptionUpsert {
            record,
            auth_snapshot,
        }
    }

    /// Build a delete event.
    pub fn delete(client_id: impl Into<String>) -> Self {
        ControlEvent::SubscriptionDelete {
            client_id: client_id.into(),
        }
    }

    /// Build a channel-offline event.
    pub fn channel_offline(channel_id: impl Into<String>) -> Self {
        ControlEvent::ChannelOffline {
            channel_id: channel_id.into(),
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::SubscriptionUpsert { .. } => SUBSCRIPTION_UPSERT,
            ControlEvent::SubscriptionDelete { .. } => SUBSCRIPTION_DELETE,
            ControlEvent::ChannelOffline { .. } => CHANNEL_OFFLINE,
            ControlEvent::CollectionUpdated => COLLECTION_UPDATED,
            ControlEvent::SettingsUpdated => SETTINGS_UPDATED,
        }
    }

    /// Channel id of the instance that wrote the event, when the event carries one.
    pub fn origin_channel(&self) -> Option<&str> {
        match self {
            ControlEvent::SubscriptionUpsert { record, .. } => {
                Some(record.updated_by_channel_id.as_str())
            }
            _ => None,
        }
    }

    /// Encode the event to its wire payload.
    pub fn encode(&self) -> Result<String, Error> {
        let body = match self {
            ControlEvent::SubscriptionUpsert {
                record,
                auth_snapshot,
            } => {
                let record_json = escape_delimiter(&serde_json::to_string(record)?);
                let auth_json = match auth_snapshot {
                    Some(value) => serde_json::to_string(value)?,
                    None => String::new(),
                };
                format!("{}{}{}", record_json, DELIMITER, auth_json)
            }
            ControlEvent::SubscriptionDelete { client_id } => {
                require_plain("client_id", client_id)?;
                client_id.clone()
            }
            ControlEvent::ChannelOffline { channel_id } => {
                require_plain("channel_id", channel_id)?;
                channel_id.clone()
            }
            ControlEvent::CollectionUpdated | ControlEvent::SettingsUpdated => {
                EMPTY_PAYLOAD.to_string()
            }
        };

        Ok(format!("{}{}{}", self.kind(), DELIMITER, body))
    }

    /// Decode a wire payload.
    ///
    /// Returns [`Error::UnknownEventType`] for a well-formed payload whose
    /// type this build does not know, and [`Error::Malformed`] for anything
    /// else that cannot be read.
    pub fn decode(payload: &str) -> Result<Self, Error> {
        let (kind, body) = payload
            .split_once(DELIMITER)
            .ok_or_else(|| Error::Malformed(format!("missing event type: {}", payload)))?;

        match kind {
            SUBSCRIPTION_UPSERT => {
                let (record_json, auth_json) = body.split_once(DELIMITER).ok_or_else(|| {
                    Error::Malformed(format!("upsert needs 2 fields: {}", body))
                })?;

                let record: SubscriptionRecord = serde_json::from_str(record_json)
                    .map_err(|e| Error::Malformed(format!("subscription record: {}", e)))?;

                let auth_snapshot = if auth_json.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::from_str(auth_json)
                            .map_err(|e| Error::Malformed(format!("auth snapshot: {}", e)))?,
                    )
                };

                Ok(ControlEvent::SubscriptionUpsert {
                    record,
                    auth_snapshot,
                })
            }
            SUBSCRIPTION_DELETE => Ok(ControlEvent::SubscriptionDelete {
                client_id: non_empty("client_id", body)?,
            }),
            CHANNEL_OFFLINE => Ok(ControlEvent::ChannelOffline {
                channel_id: non_empty("channel_id", body)?,
            }),
            COLLECTION_UPDATED => Ok(ControlEvent::CollectionUpdated),
            SETTINGS_UPDATED => Ok(ControlEvent::SettingsUpdated),
            other => Err(Error::UnknownEventType(other.to_string())),
        }
    }
}

/// Escape the delimiter inside serialized JSON.
///
/// The delimiter can only occur inside JSON strings, where `\u007c` decodes
/// to the same character.
fn escape_delimiter(json: &str) -> String {
    json.replace(DELIMITER, "\\u007c")
}

fn require_plain(field: &str, value: &str) -> Result<(), Error> {
    if value.contains(DELIMITER) {
        return Err(Error::Malformed(format!(
            "{} must not contain '{}': {}",
            field, DELIMITER, value
        )));
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> Result<String, Error> {
    if value.is_empty() || value.contains(DELIMITER) {
        return Err(Error::Malformed(format!("invalid {}: {:?}", field, value)));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> SubscriptionRecord {
        SubscriptionRecord::new("c1", "c_host_a")
            .with_subscriptions(["posts", "users/1"])
            .with_auth_ref("users/u1")
            .with_updated_by("c_host_a")
    }

    #[test]
    fn test_upsert_wire_shape() {
        let event = ControlEvent::upsert(record(), None);
        let payload = event.encode().unwrap();

        assert!(payload.starts_with("subscription_upsert|{"));
        assert!(payload.ends_with('|'));
        assert_eq!(ControlEvent::decode(&payload).unwrap(), event);
    }

    #[test]
    fn test_upsert_with_snapshot() {
        let snapshot = json!({"id": "u1", "email": "a|b@example.com"});
        let event = ControlEvent::upsert(record(), Some(snapshot.clone()));
        let payload = event.encode().unwrap();

        match ControlEvent::decode(&payload).unwrap() {
            ControlEvent::SubscriptionUpsert { auth_snapshot, .. } => {
                assert_eq!(auth_snapshot, Some(snapshot));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_upsert_topic_with_delimiter() {
        let record = SubscriptionRecord::new("c1", "a").with_subscriptions(["a|b"]);
        let event = ControlEvent::upsert(record, None);
        let payload = event.encode().unwrap();

        // type, record, snapshot
        assert_eq!(payload.matches(DELIMITER).count(), 2);
        assert_eq!(ControlEvent::decode(&payload).unwrap(), event);
    }

    #[test]
    fn test_simple_events() {
        assert_eq!(
            ControlEvent::delete("c1").encode().unwrap(),
            "subscription_delete|c1"
        );
        assert_eq!(
            ControlEvent::channel_offline("c_host_b").encode().unwrap(),
            "subscription_channel_offline|c_host_b"
        );
        assert_eq!(
            ControlEvent::CollectionUpdated.encode().unwrap(),
            "collection_updated|empty-payload"
        );
        assert_eq!(
            ControlEvent::decode("settings_updated|empty-payload").unwrap(),
            ControlEvent::SettingsUpdated
        );
        assert_eq!(
            ControlEvent::decode("subscription_channel_offline|c_host_b").unwrap(),
            ControlEvent::channel_offline("c_host_b")
        );
    }

    #[test]
    fn test_origin_channel() {
        let event = ControlEvent::upsert(record(), None);
        assert_eq!(event.origin_channel(), Some("c_host_a"));
        assert_eq!(ControlEvent::delete("c1").origin_channel(), None);
    }

    #[test]
    fn test_unknown_type() {
        let err = ControlEvent::decode("client_teleported|c1").unwrap_err();
        assert!(matches!(err, Error::UnknownEventType(kind) if kind == "client_teleported"));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            ControlEvent::decode("subscription_delete"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            ControlEvent::decode("subscription_upsert|{}"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            ControlEvent::decode("subscription_upsert|not json|"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            ControlEvent::decode("subscription_delete|"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            ControlEvent::delete("a|b").encode(),
            Err(Error::Malformed(_))
        ));
    }
}
