//! Remote blacklist synchronisation.
//!
//! On its cadence the syncer fetches the full remote reputation list,
//! diffs it against the persisted blacklist and applies the delta to the
//! record store and the firewall: removed addresses lose their rule,
//! appended addresses gain one when their confidence clears the block
//! threshold. A failed sync defers the next attempt by a fixed back-off
//! instead of the normal cadence.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use crate::abuseipdb::{AbuseIpdbClient, RemoteBlacklist};
use crate::config::Config;
use crate::firewall::reconciler::Reconciler;
use crate::scoring;
use crate::store::{self, BlacklistEntry, DataSet, DataStore, SyncMarker};
use hostblock_shared::errors::HostblockResult;

/// Seconds until the next attempt after a failed sync.
pub const FAILURE_BACKOFF_SECS: u64 = 300;

pub struct BlacklistSyncer {
    backoff_until: u64,
}

impl BlacklistSyncer {
    pub fn new() -> Self {
        BlacklistSyncer { backoff_until: 0 }
    }

    /// The syncer runs iff an interval is configured, the interval has
    /// elapsed and no failure back-off is pending.
    pub fn due(&self, config: &Config, data: &DataSet, now: u64) -> bool {
        config.abuseipdb_blacklist_interval > 0
            && now >= self.backoff_until
            && now.saturating_sub(data.sync.last_sync) >= config.abuseipdb_blacklist_interval
    }

    /// Run one sync when due; arms the back-off on failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn tick(
        &mut self,
        config: &Config,
        client: &AbuseIpdbClient,
        data: &mut DataSet,
        store: &DataStore,
        reconciler: &Reconciler,
        now: u64,
    ) {
        if !self.due(config, data, now) {
            return;
        }
        if let Err(e) = self.sync(config, client, data, store, reconciler, now).await {
            error!("blacklist sync failed: {e}, next attempt in {FAILURE_BACKOFF_SECS} seconds");
            self.backoff_until = now + FAILURE_BACKOFF_SECS;
        }
    }

    /// Fetch and apply unconditionally (also used by the one-shot CLI sync).
    pub async fn sync(
        &mut self,
        config: &Config,
        client: &AbuseIpdbClient,
        data: &mut DataSet,
        store: &DataStore,
        reconciler: &Reconciler,
        now: u64,
    ) -> HostblockResult<()> {
        info!("synchronising remote blacklist");
        let remote = client.fetch_blacklist(config.abuseipdb_block_score).await?;
        self.apply_remote(config, remote, data, store, reconciler, now)
            .await
    }

    /// Diff a fetched list against the persisted one and apply it.
    pub async fn apply_remote(
        &mut self,
        config: &Config,
        remote: RemoteBlacklist,
        data: &mut DataSet,
        store: &DataStore,
        reconciler: &Reconciler,
        now: u64,
    ) -> HostblockResult<()> {
        if remote.generated_at <= data.sync.last_generated {
            warn!(
                "remote blacklist generation {} is not newer than the stored {}, applying anyway",
                remote.generated_at, data.sync.last_generated
            );
        }
        let params = config.scoring_params();

        let mut remote_map: BTreeMap<String, BlacklistEntry> = BTreeMap::new();
        for record in remote.records {
            if record.ip_address.len() > store::MAX_ADDRESS_LEN || !record.ip_address.is_ascii() {
                warn!(
                    "remote blacklist address does not fit the data file field, skipped: {}",
                    record.ip_address
                );
                continue;
            }
            remote_map.insert(
                record.ip_address,
                BlacklistEntry {
                    total_reports: record.total_reports,
                    confidence_score: record.abuse_confidence_score.min(100),
                    has_rule: false,
                },
            );
        }

        let mut added = 0usize;
        let mut updated = 0usize;
        let mut removed = 0usize;

        // Addresses gone from the remote list: drop the record and the rule,
        // unless the address earned a rule of its own.
        let stale: Vec<String> = data
            .blacklist
            .keys()
            .filter(|address| !remote_map.contains_key(*address))
            .cloned()
            .collect();
        for address in stale {
            let entry = data.blacklist.remove(&address).expect("key from same map");
            if let Err(e) = store.remove_blacklist(&address) {
                error!("failed to remove blacklist record {address}: {e}");
            }
            if entry.has_rule {
                let ip_desired = data
                    .ips
                    .get(&address)
                    .is_some_and(|state| scoring::requires_rule(state, &params, now));
                let has_rule = reconciler.apply(&address, ip_desired, true).await;
                if let Some(state) = data.ips.get_mut(&address) {
                    state.has_rule = has_rule;
                }
            }
            removed += 1;
        }

        // Addresses present in both: refresh the persisted fields when they
        // changed; the transient rule flag is untouched.
        for (address, remote_entry) in &remote_map {
            let Some(local) = data.blacklist.get_mut(address) else {
                continue;
            };
            if local.total_reports != remote_entry.total_reports
                || local.confidence_score != remote_entry.confidence_score
            {
                local.total_reports = remote_entry.total_reports;
                local.confidence_score = remote_entry.confidence_score;
                let entry = *local;
                match store.update_blacklist(address, &entry) {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Err(e) = store.append_blacklist(address, &entry) {
                            error!("failed to persist blacklist record {address}: {e}");
                        }
                    }
                    Err(e) => error!("failed to update blacklist record {address}: {e}"),
                }
                updated += 1;
            }
            // The confidence may have crossed the block threshold either way.
            reconciler.reconcile_address(address, data, &params, now).await;
        }

        // New addresses: persist, then let the reconciler decide on a rule
        // from the confidence score.
        for (address, remote_entry) in &remote_map {
            if data.blacklist.contains_key(address) {
                continue;
            }
            data.blacklist.insert(address.clone(), *remote_entry);
            if let Err(e) = store.append_blacklist(address, remote_entry) {
                error!("failed to append blacklist record {address}: {e}");
            }
            reconciler.reconcile_address(address, data, &params, now).await;
            added += 1;
        }

        data.sync = SyncMarker {
            last_sync: now,
            last_generated: remote.generated_at,
        };
        store.update_sync_marker(&data.sync)?;

        info!("blacklist synchronised: {added} added, {updated} updated, {removed} removed");
        Ok(())
    }
}

impl Default for BlacklistSyncer {
    fn default() -> Self {
        Self::new()
    }
}
