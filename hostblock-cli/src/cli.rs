//! CLI definition and argument parsing for the hostblock binary.
//!
//! One binary with mutually exclusive primary actions; the list action
//! takes extra column flags.

use clap::{ArgGroup, CommandFactory, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "hostblock",
    version,
    about = "Automatic blocking of suspicious remote hosts",
    group = ArgGroup::new("action").args([
        "print_config",
        "statistics",
        "list",
        "blacklist",
        "whitelist",
        "remove",
        "daemon",
        "sync_blacklist",
    ])
)]
pub struct Cli {
    /// Print the effective configuration
    #[arg(short = 'p', long = "print-config")]
    pub print_config: bool,

    /// Print summary statistics about collected data
    #[arg(short = 's', long = "statistics")]
    pub statistics: bool,

    /// List blocked addresses
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// With --list, include addresses without an active rule
    #[arg(short = 'a', long = "all", requires = "list")]
    pub all: bool,

    /// With --list, show suspicious activity counts
    #[arg(short = 'c', long = "count", requires = "list")]
    pub count: bool,

    /// With --list, show the last activity time
    #[arg(short = 't', long = "time", requires = "list")]
    pub time: bool,

    /// Toggle the blacklist flag for an address
    #[arg(short = 'b', long = "blacklist", value_name = "IP")]
    pub blacklist: Option<String>,

    /// Toggle the whitelist flag for an address
    #[arg(short = 'w', long = "whitelist", value_name = "IP")]
    pub whitelist: Option<String>,

    /// Remove an address record together with its firewall rule
    #[arg(short = 'r', long = "remove", value_name = "IP")]
    pub remove: Option<String>,

    /// Fork and run as a daemon
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// One-shot synchronisation of the remote blacklist
    #[arg(long = "sync-blacklist")]
    pub sync_blacklist: bool,
}

/// Print the generated usage text; invoked when no action is given.
pub fn print_usage() -> anyhow::Result<()> {
    Cli::command().print_help()?;
    println!();
    Ok(())
}
