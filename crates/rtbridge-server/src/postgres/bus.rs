use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::debug;

use crate::bus::{NotificationBus, NotificationStream};
use crate::error::{Error, Result};

/// `LISTEN`/`NOTIFY` bus.
///
/// Each subscription holds its own connection taken from the pool's
/// settings. When that connection drops the stream yields an error and
/// ends, instead of silently reconnecting.
#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationBus for PgBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(bus_error)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(bus_error)?;
        listener.listen(channel).await.map_err(bus_error)?;
        debug!(channel, "postgres listener connected");

        let channel = channel.to_string();
        let stream = futures::stream::unfold(Some(listener), move |state| {
            let channel = channel.clone();
            async move {
                let mut listener = state?;
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        Some((Ok(notification.payload().to_string()), Some(listener)))
                    }
                    Ok(None) => Some((
                        Err(Error::Bus(format!("connection for {} was lost", channel))),
                        None,
                    )),
                    Err(e) => Some((Err(bus_error(e)), None)),
                }
            }
        });

        Ok(stream.boxed())
    }
}

fn bus_error(err: sqlx::Error) -> Error {
    Error::Bus(err.to_string())
}
