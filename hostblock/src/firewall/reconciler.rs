//! Firewall reconciliation.
//!
//! Brings the managed chain into agreement with the block predicate,
//! tolerating drift: manually added rules for unknown addresses are left
//! alone, duplicates are reported but not removed, and driver failures
//! leave the desired state in place so the next tick retries.

use std::sync::Arc;

use hostblock_shared::errors::{HostblockError, HostblockResult};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::firewall::driver::{FirewallDriver, IpFamily};
use crate::pattern::IP_TOKEN;
use crate::scoring::{self, ScoringParams};
use crate::store::DataSet;

/// Chain the daemon manages.
pub const MANAGED_CHAIN: &str = "INPUT";

/// Rule template split around its `%i` placeholder.
///
/// A listed rule matches the template iff it contains both halves with an
/// address-shaped token between them.
#[derive(Debug, Clone)]
pub struct RuleTemplate {
    prefix: String,
    suffix: String,
    ip_search: Regex,
}

impl RuleTemplate {
    pub fn parse(template: &str) -> HostblockResult<Self> {
        if template.matches("%i").count() != 1 {
            return Err(HostblockError::Config(format!(
                "firewall rule template must contain exactly one %i: {template}"
            )));
        }
        let (prefix, suffix) = template.split_once("%i").expect("checked above");
        let ip_search =
            Regex::new(IP_TOKEN).map_err(|e| HostblockError::Regex(e.to_string()))?;
        Ok(RuleTemplate {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            ip_search,
        })
    }

    /// Rule specification for one address.
    pub fn render(&self, address: &str) -> String {
        format!("{}{}{}", self.prefix, address, self.suffix)
    }

    /// Extract the address from a listed rule matching this template.
    pub fn extract(&self, rule: &str) -> Option<String> {
        let start = rule.find(&self.prefix)? + self.prefix.len();
        let rest = &rule[start..];
        let end = rest.find(&self.suffix)?;
        self.ip_search
            .find(&rest[..end])
            .map(|m| m.as_str().to_string())
    }
}

/// The convergence loop between scoring decisions and the installed chain.
pub struct Reconciler {
    driver: Arc<dyn FirewallDriver>,
    template: RuleTemplate,
    chain: String,
    insert_first: bool,
}

impl Reconciler {
    pub fn new(
        driver: Arc<dyn FirewallDriver>,
        template: &str,
        insert_first: bool,
    ) -> HostblockResult<Self> {
        Ok(Reconciler {
            driver,
            template: RuleTemplate::parse(template)?,
            chain: MANAGED_CHAIN.to_string(),
            insert_first,
        })
    }

    pub fn template(&self) -> &RuleTemplate {
        &self.template
    }

    async fn install(&self, address: &str) -> HostblockResult<()> {
        let rule = self.template.render(address);
        let family = IpFamily::of(address);
        if self.insert_first {
            self.driver.insert(&self.chain, 1, &rule, family).await
        } else {
            self.driver.append(&self.chain, &rule, family).await
        }
    }

    async fn withdraw(&self, address: &str) -> HostblockResult<()> {
        let rule = self.template.render(address);
        self.driver
            .remove(&self.chain, &rule, IpFamily::of(address))
            .await
    }

    /// Issue at most one driver call to move an address towards its
    /// desired state. Returns the new `has_rule` value; failures are
    /// logged and leave the old value so the next tick retries.
    pub async fn apply(&self, address: &str, desired: bool, has_rule: bool) -> bool {
        if desired && !has_rule {
            match self.install(address).await {
                Ok(()) => {
                    debug!("rule for {address} added to chain {}", self.chain);
                    true
                }
                Err(e) => {
                    error!("failed to add rule for {address}: {e}");
                    false
                }
            }
        } else if !desired && has_rule {
            match self.withdraw(address).await {
                Ok(()) => {
                    debug!("rule for {address} removed from chain {}", self.chain);
                    false
                }
                Err(e) => {
                    error!("failed to remove rule for {address}: {e}");
                    true
                }
            }
        } else {
            has_rule
        }
    }

    /// Full reconciliation: walk the chain, mark which records own rules,
    /// then converge every record whose desired state disagrees.
    pub async fn full_sync(
        &self,
        data: &mut DataSet,
        params: &ScoringParams,
        now: u64,
    ) -> HostblockResult<()> {
        info!("checking firewall rules against data");

        for state in data.ips.values_mut() {
            state.has_rule = false;
        }
        for entry in data.blacklist.values_mut() {
            entry.has_rule = false;
        }

        for family in [IpFamily::V4, IpFamily::V6] {
            let rules = match self.driver.list_rules(&self.chain, family).await {
                Ok(rules) => rules,
                Err(e) => {
                    error!("failed to list {} rules: {e}", family.tool());
                    continue;
                }
            };
            for rule in &rules {
                let Some(address) = self.template.extract(rule) else {
                    continue;
                };
                if let Some(state) = data.ips.get_mut(&address) {
                    if state.has_rule {
                        warn!("found duplicate rule for {address}, consider:");
                        warn!("$ {} --list-rules {} | grep {address}", family.tool(), self.chain);
                        warn!(
                            "$ {} -D {} {}",
                            family.tool(),
                            self.chain,
                            self.template.render(&address)
                        );
                    } else {
                        state.has_rule = true;
                    }
                } else if let Some(entry) = data.blacklist.get_mut(&address) {
                    if entry.has_rule {
                        warn!("found duplicate rule for blacklisted {address}");
                    } else {
                        entry.has_rule = true;
                    }
                } else {
                    warn!(
                        "found rule for {address} but no record owns it, \
                         leaving the rule alone (review manually)"
                    );
                }
            }
        }

        let addresses: Vec<String> = data.ips.keys().cloned().collect();
        for address in addresses {
            let state = data.ips[&address];
            let desired = scoring::requires_rule(&state, params, now)
                || data
                    .blacklist
                    .get(&address)
                    .is_some_and(|e| scoring::blacklist_requires_rule(e, params));
            if desired != state.has_rule {
                if desired {
                    warn!("address {address} is missing its firewall rule, adding");
                } else {
                    warn!("address {address} no longer needs its firewall rule, removing");
                }
                let has_rule = self.apply(&address, desired, state.has_rule).await;
                if let Some(state) = data.ips.get_mut(&address) {
                    state.has_rule = has_rule;
                }
                if let Some(entry) = data.blacklist.get_mut(&address) {
                    entry.has_rule = has_rule;
                }
            }
        }

        let blacklist_only: Vec<String> = data
            .blacklist
            .keys()
            .filter(|address| !data.ips.contains_key(*address))
            .cloned()
            .collect();
        for address in blacklist_only {
            let entry = data.blacklist[&address];
            let desired = scoring::blacklist_requires_rule(&entry, params);
            if desired != entry.has_rule {
                let has_rule = self.apply(&address, desired, entry.has_rule).await;
                if let Some(entry) = data.blacklist.get_mut(&address) {
                    entry.has_rule = has_rule;
                }
            }
        }

        Ok(())
    }

    /// Incremental reconciliation of one address after a state mutation.
    pub async fn reconcile_address(
        &self,
        address: &str,
        data: &mut DataSet,
        params: &ScoringParams,
        now: u64,
    ) {
        let ip_state = data.ips.get(address).copied();
        let bl_entry = data.blacklist.get(address).copied();
        let (has_rule, known) = match (&ip_state, &bl_entry) {
            (Some(state), _) => (state.has_rule, true),
            (None, Some(entry)) => (entry.has_rule, true),
            (None, None) => (false, false),
        };
        if !known {
            return;
        }
        let desired = ip_state
            .map(|state| scoring::requires_rule(&state, params, now))
            .unwrap_or(false)
            || bl_entry
                .map(|entry| scoring::blacklist_requires_rule(&entry, params))
                .unwrap_or(false);
        let has_rule = self.apply(address, desired, has_rule).await;
        if let Some(state) = data.ips.get_mut(address) {
            state.has_rule = has_rule;
        }
        if let Some(entry) = data.blacklist.get_mut(address) {
            entry.has_rule = has_rule;
        }
    }

    /// Template migration: re-add every rule matching the old template
    /// under the current one.
    pub async fn migrate_template(&self, old: &RuleTemplate) {
        warn!("firewall rule template changed in configuration, updating chain");
        for family in [IpFamily::V4, IpFamily::V6] {
            let rules = match self.driver.list_rules(&self.chain, family).await {
                Ok(rules) => rules,
                Err(e) => {
                    error!("failed to list {} rules: {e}", family.tool());
                    continue;
                }
            };
            for rule in &rules {
                let Some(address) = old.extract(rule) else {
                    continue;
                };
                if let Err(e) = self
                    .driver
                    .remove(&self.chain, &old.render(&address), family)
                    .await
                {
                    error!("failed to remove old-template rule for {address}: {e}");
                    continue;
                }
                let result = if self.insert_first {
                    self.driver
                        .insert(&self.chain, 1, &self.template.render(&address), family)
                        .await
                } else {
                    self.driver
                        .append(&self.chain, &self.template.render(&address), family)
                        .await
                };
                if let Err(e) = result {
                    error!("failed to re-add rule for {address} under new template: {e}");
                }
            }
        }
    }
}
