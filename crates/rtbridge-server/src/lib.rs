//! rtbridge server library.
//!
//! Lets several realtime server instances behind a load balancer act as one.
//! Each instance keeps a registry of client proxies: local proxies for
//! clients connected to it and remote proxies mirroring clients connected
//! to peers. Subscription changes are written to a shared store and
//! broadcast on a control channel; messages for remote clients are relayed
//! over the owning instance's private channel.
//!
//! Three loops run per instance, see [`Bridge::start`]:
//! - the channel heartbeat, which also reaps dead peers
//! - the control listener, which applies peer changes and resyncs on reconnect
//! - the relay listener, which delivers messages to local clients

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod listener;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod resync;
pub mod schema;
pub mod store;

pub use auth::Principal;
pub use bridge::{Bridge, BridgeHandle};
pub use bus::{MemoryBus, NotificationBus};
pub use client::ChannelClient;
pub use config::{Args, BridgeConfig};
pub use context::BridgeContext;
pub use error::{Error, Result};
pub use proxy::{ClientProxy, LocalClient};
pub use registry::{ClientRegistry, ProxyRegistry};
pub use schema::{Collection, SchemaCache, StaticSchemaCache};
pub use store::{MemoryStore, SubscriptionStore};
