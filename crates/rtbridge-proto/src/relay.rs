//! Point-to-point relay messages.
//!
//! A relay message carries one realtime message to one client connected to
//! another instance. It is published on the owning instance's private
//! channel as `client_id|name|data`; `data` is the final field and may
//! contain the delimiter.

use crate::{Error, DELIMITER};

/// A realtime message as delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Event name, e.g. the topic it was published on.
    pub name: String,
    /// Message body.
    pub data: String,
}

impl Message {
    /// Create a message.
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A message addressed to a client on another instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Target client.
    pub client_id: String,
    /// Message to deliver.
    pub message: Message,
}

impl RelayMessage {
    /// Create a relay message.
    pub fn new(client_id: impl Into<String>, message: Message) -> Self {
        Self {
            client_id: client_id.into(),
            message,
        }
    }

    /// Encode to `client_id|name|data`.
    pub fn encode(&self) -> Result<String, Error> {
        for (field, value) in [("client_id", &self.client_id), ("name", &self.message.name)] {
            if value.contains(DELIMITER) {
                return Err(Error::Malformed(format!(
                    "relay {} must not contain '{}': {}",
                    field, DELIMITER, value
                )));
            }
        }

        Ok(format!(
            "{}{}{}{}{}",
            self.client_id, DELIMITER, self.message.name, DELIMITER, self.message.data
        ))
    }

    /// Decode a relay payload.
    pub fn decode(payload: &str) -> Result<Self, Error> {
        let mut parts = payload.splitn(3, DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(client_id), Some(name), Some(data)) if !client_id.is_empty() => {
                Ok(Self::new(client_id, Message::new(name, data)))
            }
            _ => Err(Error::Malformed(format!(
                "relay payload needs 3 fields: {}",
                payload
            ))),
        }
    }
}
