//! Reconnecting listen loop and the shared shutdown signal.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::NotificationBus;
use crate::config::BridgeConfig;
use crate::error::Result;

/// Sending half of the shutdown signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Ask every loop holding a [`Shutdown`] to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half of the shutdown signal, cloned into every loop.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested or the trigger is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `delay`. Returns `true` if shutdown interrupted the sleep.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Create a linked trigger and signal.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Consumer of one bus channel.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Called after every successful (re)subscription, before any payload
    /// from the new connection is handled.
    async fn on_connect(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one payload.
    async fn handle(&self, payload: &str) -> Result<()>;
}

/// Listen on `channel` until shutdown.
///
/// Connection failures are retried after the configured delay, forever.
/// Handler errors are logged and the payload dropped, except fatal errors,
/// which end the loop and are returned. A clean shutdown returns `Ok`.
pub async fn listen<H>(
    bus: &dyn NotificationBus,
    channel: &str,
    handler: &H,
    config: &BridgeConfig,
    shutdown: &Shutdown,
) -> Result<()>
where
    H: NotificationHandler + ?Sized,
{
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => break,
            subscribed = bus.subscribe(channel) => subscribed,
        };

        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                warn!(channel, error = %e, "failed to subscribe, retrying");
                if shutdown.sleep(config.retry_delay).await {
                    break;
                }
                continue;
            }
        };

        info!(channel, "listening");

        if let Err(e) = handler.on_connect().await {
            if e.is_fatal() {
                error!(channel, error = %e, "fatal error while connecting listener");
                return Err(e);
            }
            warn!(channel, error = %e, "listener connect hook failed, reconnecting");
            if shutdown.sleep(config.retry_delay).await {
                break;
            }
            continue;
        }

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(channel, "stopping listener");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(payload)) => {
                    if config.log_payloads {
                        debug!(channel, payload = %payload, "notification received");
                    }
                    if let Err(e) = handler.handle(&payload).await {
                        if e.is_fatal() {
                            error!(channel, error = %e, "fatal protocol violation");
                            return Err(e);
                        }
                        warn!(channel, error = %e, "dropped notification");
                    }
                }
                Some(Err(e)) => {
                    warn!(channel, error = %e, "listener connection lost");
                    break;
                }
                None => {
                    warn!(channel, "listener stream closed");
                    break;
                }
            }
        }

        if shutdown.sleep(config.retry_delay).await {
            break;
        }
    }

    info!(channel, "stopping listener");
    Ok(())
}
