//! Rebuilding the remote proxy set from the durable store.

use std::collections::HashSet;
use std::sync::Arc;

use rtbridge_proto::SubscriptionRecord;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::context::BridgeContext;
use crate::error::Result;
use crate::proxy::ClientProxy;
use crate::registry::ClientRegistry;

/// Outcome of applying one peer record to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new remote proxy was registered.
    Created,
    /// An existing remote proxy was updated in place.
    Updated,
    /// The client moved to another instance; its proxy was replaced.
    Replaced,
    /// The client is connected here; the record was ignored.
    SkippedLocal,
}

/// Counts from one full resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncStats {
    pub created: usize,
    pub updated: usize,
    pub pruned: usize,
}

/// Apply a peer-owned record: create, update or replace its remote proxy.
///
/// Records owned by this instance and records for clients connected here
/// are ignored.
pub fn apply_remote_record(
    context: &Arc<BridgeContext>,
    registry: &dyn ClientRegistry,
    record: &SubscriptionRecord,
    auth_snapshot: Option<&JsonValue>,
) -> Result<Applied> {
    if record.channel_id == context.channel_id() {
        debug!(client_id = %record.client_id, "ignoring record owned by this instance");
        return Ok(Applied::SkippedLocal);
    }

    let existing = registry.by_id(&record.client_id);
    match existing {
        Some(proxy) if proxy.is_local() => {
            debug!(client_id = %record.client_id, "ignoring record for local client");
            Ok(Applied::SkippedLocal)
        }
        Some(proxy) if proxy.channel_id() == record.channel_id => {
            proxy.receive_changes(record, auth_snapshot)?;
            Ok(Applied::Updated)
        }
        existing => {
            let proxy = Arc::new(ClientProxy::remote(context.clone(), record));
            proxy.receive_changes(record, auth_snapshot)?;
            registry.register(proxy);
            if existing.is_some() {
                debug!(
                    client_id = %record.client_id,
                    channel = %record.channel_id,
                    "client moved to another instance"
                );
                Ok(Applied::Replaced)
            } else {
                Ok(Applied::Created)
            }
        }
    }
}

/// Make the remote proxies match every record owned by other instances.
///
/// Creates proxies for unknown clients, refreshes known ones and removes
/// remote proxies whose record no longer exists. Local proxies are never
/// touched. Snapshots are not stored, so resynced principals are cleared
/// until the next upsert for that client.
pub async fn full_resync(
    context: &Arc<BridgeContext>,
    registry: &dyn ClientRegistry,
) -> Result<ResyncStats> {
    let mut stale: HashSet<String> = registry
        .remote()
        .into_iter()
        .map(|proxy| proxy.id().to_string())
        .collect();

    let records = context
        .store()
        .foreign_subscriptions(context.channel_id())
        .await?;

    let mut stats = ResyncStats::default();
    for record in &records {
        stale.remove(&record.client_id);
        match apply_remote_record(context, registry, record, None)? {
            Applied::Created | Applied::Replaced => stats.created += 1,
            Applied::Updated => stats.updated += 1,
            Applied::SkippedLocal => {}
        }
    }

    for client_id in stale {
        let still_remote = registry
            .by_id(&client_id)
            .map(|proxy| !proxy.is_local())
            .unwrap_or(false);
        if still_remote && registry.unregister(&client_id).is_some() {
            stats.pruned += 1;
        }
    }

    info!(
        channel = %context.channel_id(),
        records = records.len(),
        created = stats.created,
        updated = stats.updated,
        pruned = stats.pruned,
        "resynced remote subscriptions"
    );

    Ok(stats)
}
