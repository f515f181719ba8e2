//! Channel liveness: identity, heartbeat and reaping of dead peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rtbridge_proto::{normalize_channel_name, MAX_CHANNEL_NAME_LEN};
use tracing::{debug, info, warn};

use crate::context::BridgeContext;
use crate::error::Result;
use crate::listener::Shutdown;
use crate::registry::ClientRegistry;
use crate::store::HeartbeatOutcome;

const CHANNEL_PREFIX: &str = "c_";
const CHANNEL_SUFFIX_LEN: usize = 5;

/// Generate a fresh channel id of the form `c_<host>_<suffix>`.
///
/// The host part is normalized and shortened so the suffix always survives
/// the length limit.
pub fn generate_channel_id() -> String {
    channel_id_for_host(&hostname())
}

fn channel_id_for_host(host: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(CHANNEL_SUFFIX_LEN)
        .collect();

    let budget = MAX_CHANNEL_NAME_LEN - CHANNEL_PREFIX.len() - CHANNEL_SUFFIX_LEN - 1;
    let host: String = normalize_channel_name(host).chars().take(budget).collect();

    normalize_channel_name(&format!("{}{}_{}", CHANNEL_PREFIX, host, suffix))
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => "localhost".to_string(),
    }
}

/// Keeps this instance's channel row alive and reaps expired peers.
pub struct ChannelHeartbeat {
    context: Arc<BridgeContext>,
    registry: Arc<dyn ClientRegistry>,
    joined: AtomicBool,
}

impl ChannelHeartbeat {
    pub fn new(context: Arc<BridgeContext>, registry: Arc<dyn ClientRegistry>) -> Self {
        Self {
            context,
            registry,
            joined: AtomicBool::new(false),
        }
    }

    /// Run one heartbeat.
    ///
    /// If the channel row had to be recreated after the first beat, a peer
    /// reaped this instance and deleted its records, so every local client
    /// is announced again.
    pub async fn beat(&self) -> Result<HeartbeatOutcome> {
        let channel_id = self.context.channel_id();
        let outcome = self
            .context
            .store()
            .heartbeat(channel_id, self.context.config().channel_ttl)
            .await?;

        for reaped in &outcome.reaped {
            info!(channel = %reaped, "reaped expired peer channel");
        }

        let rejoined = outcome.inserted && self.joined.swap(true, Ordering::SeqCst);
        if rejoined {
            warn!(channel = %channel_id, "channel was reaped by a peer, re-announcing local clients");
            self.reannounce().await;
        } else {
            debug!(channel = %channel_id, inserted = outcome.inserted, "heartbeat");
        }

        Ok(outcome)
    }

    /// Heartbeat until shutdown.
    ///
    /// Failed beats are retried after the configured retry delay.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        info!(channel = %self.context.channel_id(), "starting heartbeat");

        loop {
            let delay = match self.beat().await {
                Ok(_) => self.next_delay(),
                Err(e) => {
                    warn!(error = %e, "heartbeat failed, retrying");
                    self.context.config().retry_delay
                }
            };

            if shutdown.sleep(delay).await {
                break;
            }
        }

        info!(channel = %self.context.channel_id(), "stopping heartbeat");
        Ok(())
    }

    /// Interval minus a random jitter, so peers started together drift apart.
    pub fn next_delay(&self) -> Duration {
        let config = self.context.config();
        let max_jitter = u64::try_from(config.heartbeat_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        config
            .heartbeat_interval
            .saturating_sub(Duration::from_millis(jitter))
    }

    async fn reannounce(&self) {
        for proxy in self.registry.local() {
            // Clients that disconnected since the snapshot stay gone.
            let registered = self
                .registry
                .by_id(proxy.id())
                .is_some_and(|current| Arc::ptr_eq(&current, &proxy));
            if !registered || proxy.is_closed() {
                debug!(client_id = %proxy.id(), "client left during re-announce, skipping");
                continue;
            }
            if let Err(e) = proxy.broadcast_changes().await {
                warn!(client_id = %proxy.id(), error = %e, "failed to re-announce client");
            }
        }
    }
}
