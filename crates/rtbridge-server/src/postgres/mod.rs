//! Postgres backend.
//!
//! `LISTEN`/`NOTIFY` is the bus, two side tables are the store. Store writes
//! call `pg_notify` inside the same transaction, so the announcement is only
//! delivered if the write commits.

mod bus;
mod store;

pub use bus::PgBus;
pub use store::PgStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};

/// Channel liveness table.
pub const CHANNELS_TABLE: &str = "_realtime_channels";

/// Subscription record table.
pub const CLIENTS_TABLE: &str = "_realtime_clients";

/// Largest payload `pg_notify` accepts, in bytes.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Open a connection pool for `config.database_url`.
pub async fn connect(config: &BridgeConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| Error::Config("database url is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "connected to postgres");
    Ok(pool)
}

/// Bus and store sharing one pool.
pub fn backend(pool: PgPool, config: &BridgeConfig) -> (PgBus, PgStore) {
    (
        PgBus::new(pool.clone()),
        PgStore::new(pool, config.control_channel.clone()),
    )
}
