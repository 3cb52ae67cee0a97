use std::sync::Arc;

use anyhow::bail;
use hostblock::abuseipdb::AbuseIpdbClient;
use hostblock::firewall::driver::{FirewallDriver, IptablesDriver};
use hostblock::firewall::reconciler::Reconciler;
use hostblock::store::DataStore;
use hostblock::syncer::BlacklistSyncer;
use hostblock::{Config, util};

use super::{notify_daemon, runtime};

/// One-shot remote blacklist sync, ignoring the configured cadence.
pub fn execute(config: &Config) -> anyhow::Result<()> {
    if config.abuseipdb_key.is_empty() {
        bail!("abuseipdb.api.key is not configured");
    }

    let store = DataStore::new(&config.data_file_path);
    let mut data = store.load()?;

    let driver: Arc<dyn FirewallDriver> = Arc::new(IptablesDriver::new()?);
    let reconciler = Reconciler::new(driver, &config.iptables_rule, config.iptables_insert)?;
    let client = AbuseIpdbClient::new(config)?;

    runtime()?.block_on(async {
        let now = util::now();
        // Mark which records already own rules so the diff below only
        // touches what actually changed.
        reconciler
            .full_sync(&mut data, &config.scoring_params(), now)
            .await?;
        let mut syncer = BlacklistSyncer::new();
        syncer
            .sync(config, &client, &mut data, &store, &reconciler, now)
            .await?;
        Ok::<(), anyhow::Error>(())
    })?;

    println!(
        "Blacklist synchronised, {} entr{} on file",
        data.blacklist.len(),
        if data.blacklist.len() == 1 { "y" } else { "ies" }
    );

    notify_daemon(config);
    Ok(())
}
