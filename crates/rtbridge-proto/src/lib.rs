//! rtbridge protocol types and payload codecs.
//!
//! Instances of the bridge talk to each other over a text-only notification
//! bus. This crate defines everything that crosses that bus and everything
//! persisted in the durable side-table:
//!
//! - [`record`] - Subscription records and channel liveness rows
//! - [`event`] - Broadcast control events (`type|field|...`)
//! - [`relay`] - Point-to-point relay messages (`client|name|data`)
//! - [`channel`] - Channel naming rules
//! - [`error`] - Protocol error types
//!
//! # Payload format
//!
//! All payloads are pipe-delimited text. Only the final field of a payload
//! may contain the delimiter; nested JSON that is not in the final position
//! has its pipes escaped as `\u007c`, which every JSON decoder reads back
//! unchanged.

pub mod channel;
pub mod error;
pub mod event;
pub mod record;
pub mod relay;

pub use channel::{is_valid_channel_name, normalize_channel_name, CONTROL_CHANNEL, MAX_CHANNEL_NAME_LEN};
pub use error::Error;
pub use event::ControlEvent;
pub use record::{Channel, SubscriptionRecord};
pub use relay::{Message, RelayMessage};

/// Field delimiter shared by every payload on the bus.
pub const DELIMITER: char = '|';

/// Filler used for events that carry no data.
pub const EMPTY_PAYLOAD: &str = "empty-payload";
