use anyhow::bail;
use hostblock::store::{DataStore, IpState, MAX_ADDRESS_LEN};
use hostblock::{Config, util};

use super::notify_daemon;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualList {
    Whitelist,
    Blacklist,
}

impl ManualList {
    fn name(&self) -> &'static str {
        match self {
            ManualList::Whitelist => "whitelist",
            ManualList::Blacklist => "blacklist",
        }
    }
}

/// Toggle the manual whitelist/blacklist flag of an address, creating the
/// record on first use. A running daemon is signalled to reload.
pub fn execute(config: &Config, address: &str, list: ManualList) -> anyhow::Result<()> {
    if address.len() > MAX_ADDRESS_LEN || !address.is_ascii() || address.is_empty() {
        bail!("not a usable IP address: {address}");
    }

    let store = DataStore::new(&config.data_file_path);
    let mut data = store.load()?;

    match data.ips.get_mut(address) {
        Some(state) => {
            let enabled = match list {
                ManualList::Whitelist => {
                    state.whitelisted = !state.whitelisted;
                    if state.whitelisted && state.blacklisted {
                        tracing::warn!("{address} was blacklisted, clearing the blacklist flag");
                        state.blacklisted = false;
                    }
                    state.whitelisted
                }
                ManualList::Blacklist => {
                    state.blacklisted = !state.blacklisted;
                    if state.blacklisted && state.whitelisted {
                        tracing::warn!("{address} was whitelisted, clearing the whitelist flag");
                        state.whitelisted = false;
                    }
                    state.blacklisted
                }
            };
            let state = *state;
            if !store.update_ip(address, &state)? {
                store.append_ip(address, &state)?;
            }
            println!(
                "Address {address} {} the {}",
                if enabled { "added to" } else { "removed from" },
                list.name()
            );
        }
        None => {
            let state = IpState {
                last_activity: util::now(),
                whitelisted: list == ManualList::Whitelist,
                blacklisted: list == ManualList::Blacklist,
                ..Default::default()
            };
            data.ips.insert(address.to_string(), state);
            store.append_ip(address, &state)?;
            println!("Address {address} added to the {}", list.name());
        }
    }

    notify_daemon(config);
    Ok(())
}
