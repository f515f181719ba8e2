use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use rtbridge_proto::{ControlEvent, SubscriptionRecord};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use super::MAX_NOTIFY_PAYLOAD;
use crate::error::Result;
use crate::store::{HeartbeatOutcome, SubscriptionStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _realtime_channels (
    channel_id  TEXT PRIMARY KEY NOT NULL,
    valid_until TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS _realtime_clients (
    client_id             TEXT PRIMARY KEY NOT NULL,
    channel_id            TEXT NOT NULL,
    subscriptions         TEXT[] NOT NULL DEFAULT '{}',
    auth_ref              TEXT NOT NULL DEFAULT '',
    updated_by_channel_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS _realtime_clients_channel_id_idx
    ON _realtime_clients (channel_id);
"#;

const RENEW_CHANNEL: &str = r#"
INSERT INTO _realtime_channels (channel_id, valid_until)
VALUES ($1, now() + make_interval(secs => $2))
ON CONFLICT (channel_id) DO UPDATE SET valid_until = EXCLUDED.valid_until
RETURNING (xmax = 0) AS inserted
"#;

const REAP_CHANNELS: &str = r#"
WITH reaped AS (
    DELETE FROM _realtime_channels
    WHERE valid_until < now() AND channel_id <> $1
    RETURNING channel_id
), purged AS (
    DELETE FROM _realtime_clients
    WHERE channel_id IN (SELECT channel_id FROM reaped)
)
SELECT channel_id FROM reaped
"#;

const UPSERT_CLIENT: &str = r#"
INSERT INTO _realtime_clients (client_id, channel_id, subscriptions, auth_ref, updated_by_channel_id)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (client_id) DO UPDATE SET
    subscriptions = EXCLUDED.subscriptions,
    auth_ref = EXCLUDED.auth_ref,
    updated_by_channel_id = EXCLUDED.updated_by_channel_id
RETURNING client_id, channel_id, subscriptions, auth_ref, updated_by_channel_id
"#;

const DELETE_CLIENT: &str = "DELETE FROM _realtime_clients WHERE client_id = $1";

const FOREIGN_CLIENTS: &str = r#"
SELECT client_id, channel_id, subscriptions, auth_ref, updated_by_channel_id
FROM _realtime_clients
WHERE channel_id <> $1
"#;

/// Side-table store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    control_channel: String,
}

impl PgStore {
    pub fn new(pool: PgPool, control_channel: impl Into<String>) -> Self {
        Self {
            pool,
            control_channel: control_channel.into(),
        }
    }

    async fn notify(&self, tx: &mut Transaction<'_, Postgres>, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.control_channel)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("realtime tables ready");
        Ok(())
    }

    async fn heartbeat(&self, channel_id: &str, ttl: Duration) -> Result<HeartbeatOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted: bool = sqlx::query_scalar(RENEW_CHANNEL)
            .bind(channel_id)
            .bind(ttl.as_secs_f64())
            .fetch_one(&mut *tx)
            .await?;

        let reaped: Vec<String> = sqlx::query_scalar(REAP_CHANNELS)
            .bind(channel_id)
            .fetch_all(&mut *tx)
            .await?;

        for id in &reaped {
            let payload = ControlEvent::channel_offline(id.clone()).encode()?;
            self.notify(&mut tx, &payload).await?;
        }

        tx.commit().await?;
        Ok(HeartbeatOutcome { inserted, reaped })
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
        auth_snapshot: Option<&JsonValue>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(UPSERT_CLIENT)
            .bind(&record.client_id)
            .bind(&record.channel_id)
            .bind(record.subscription_list())
            .bind(&record.auth_ref)
            .bind(&record.updated_by_channel_id)
            .fetch_one(&mut *tx)
            .await?;
        let stored = record_from_row(&row)?;

        let payload = upsert_payload(&stored, auth_snapshot)?;
        self.notify(&mut tx, &payload).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_subscription(&self, client_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(DELETE_CLIENT)
            .bind(client_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if deleted {
            let payload = ControlEvent::delete(client_id).encode()?;
            self.notify(&mut tx, &payload).await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn foreign_subscriptions(&self, channel_id: &str) -> Result<Vec<SubscriptionRecord>> {
        let rows = sqlx::query(FOREIGN_CLIENTS)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<SubscriptionRecord> {
    let subscriptions: Vec<String> = row.try_get("subscriptions")?;
    Ok(SubscriptionRecord {
        client_id: row.try_get("client_id")?,
        channel_id: row.try_get("channel_id")?,
        subscriptions: subscriptions.into_iter().collect::<BTreeSet<_>>(),
        auth_ref: row.try_get("auth_ref")?,
        updated_by_channel_id: row.try_get("updated_by_channel_id")?,
    })
}

/// Encode an upsert event that fits in one notification.
///
/// An oversized snapshot is left out; peers then see the client as
/// unauthenticated until the next upsert that fits.
fn upsert_payload(record: &SubscriptionRecord, auth_snapshot: Option<&JsonValue>) -> Result<String> {
    let payload = ControlEvent::upsert(record.clone(), auth_snapshot.cloned()).encode()?;
    if payload.len() <= MAX_NOTIFY_PAYLOAD || auth_snapshot.is_none() {
        return Ok(payload);
    }

    warn!(
        client_id = %record.client_id,
        size = payload.len(),
        "auth snapshot too large for notification, sending without it"
    );
    Ok(ControlEvent::upsert(record.clone(), None).encode()?)
}
