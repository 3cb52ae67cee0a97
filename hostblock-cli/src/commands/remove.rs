use std::sync::Arc;

use anyhow::bail;
use hostblock::firewall::driver::{FirewallDriver, IpFamily, IptablesDriver};
use hostblock::firewall::reconciler::{MANAGED_CHAIN, Reconciler};
use hostblock::store::DataStore;
use hostblock::Config;

use super::{notify_daemon, runtime};

/// Remove an address record and any firewall rule it owns. Rule removal
/// needs root; without it the record is still removed and the rule is
/// left for the operator.
pub fn execute(config: &Config, address: &str) -> anyhow::Result<()> {
    let store = DataStore::new(&config.data_file_path);
    let data = store.load()?;
    if !data.ips.contains_key(address) {
        bail!("no record for address {address}");
    }

    match IptablesDriver::new() {
        Ok(driver) => {
            let driver: Arc<dyn FirewallDriver> = Arc::new(driver);
            let reconciler =
                Reconciler::new(driver.clone(), &config.iptables_rule, config.iptables_insert)?;
            runtime()?.block_on(async {
                let family = IpFamily::of(address);
                match driver.list_rules(MANAGED_CHAIN, family).await {
                    Ok(rules) => {
                        let owns_rule = rules
                            .iter()
                            .any(|rule| reconciler.template().extract(rule).as_deref() == Some(address));
                        if owns_rule {
                            reconciler.apply(address, false, true).await;
                        }
                    }
                    Err(e) => tracing::error!("failed to list firewall rules: {e}"),
                }
            });
        }
        Err(e) => {
            tracing::warn!(
                "cannot remove the firewall rule ({e}); remove it manually if one exists"
            );
        }
    }

    if !store.remove_ip(address)? {
        bail!("record for {address} disappeared from the data file");
    }
    println!("Address {address} removed");

    notify_daemon(config);
    Ok(())
}
