mod cli;
mod commands;

use std::process;

use clap::Parser;
use cli::Cli;
use hostblock::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();

    let config_path = Config::path_from_env();
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {e}", config_path.display());
            process::exit(1);
        }
    };

    // RUST_LOG wins over the configured log.level.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.filter_directive()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = if cli.print_config {
        commands::print_config::execute(&config)
    } else if cli.statistics {
        commands::statistics::execute(&config)
    } else if cli.list {
        commands::list::execute(&cli, &config)
    } else if let Some(address) = &cli.blacklist {
        commands::toggle::execute(&config, address, commands::toggle::ManualList::Blacklist)
    } else if let Some(address) = &cli.whitelist {
        commands::toggle::execute(&config, address, commands::toggle::ManualList::Whitelist)
    } else if let Some(address) = &cli.remove {
        commands::remove::execute(&config, address)
    } else if cli.sync_blacklist {
        commands::sync_blacklist::execute(&config)
    } else if cli.daemon {
        commands::daemon::execute(&config_path, config)
    } else {
        cli::print_usage()
    };

    if let Err(error) = result {
        eprintln!("Error: {error}");
        process::exit(1);
    }
}
