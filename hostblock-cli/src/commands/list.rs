use hostblock::store::DataStore;
use hostblock::{Config, scoring, util};

use crate::cli::Cli;

pub fn execute(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let store = DataStore::new(&config.data_file_path);
    let data = store.load()?;
    let params = config.scoring_params();
    let now = util::now();

    for (address, state) in &data.ips {
        let blocked = scoring::requires_rule(state, &params, now)
            || data
                .blacklist
                .get(address)
                .is_some_and(|entry| scoring::blacklist_requires_rule(entry, &params));
        if !blocked && !cli.all {
            continue;
        }

        let mut line = format!("{address:<39}");
        if cli.all {
            let status = if state.whitelisted {
                "whitelisted"
            } else if state.blacklisted {
                "blacklisted"
            } else if blocked {
                "blocked"
            } else {
                "-"
            };
            line.push_str(&format!(" {status:<11}"));
        }
        if cli.count {
            line.push_str(&format!(" {:>10}", state.activity_count));
        }
        if cli.time {
            line.push_str(&format!(
                " {}",
                util::format_datetime(state.last_activity, &config.datetime_format)
            ));
        }
        println!("{}", line.trim_end());
    }
    Ok(())
}
