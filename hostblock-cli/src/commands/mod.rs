//! Command implementations, one module per primary action.

pub mod daemon;
pub mod list;
pub mod print_config;
pub mod remove;
pub mod statistics;
pub mod sync_blacklist;
pub mod toggle;

use hostblock::Config;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Tell a running daemon (if any) to reload configuration and data after
/// a mutating command.
pub(crate) fn notify_daemon(config: &Config) {
    let Ok(contents) = std::fs::read_to_string(&config.pid_file_path) else {
        return;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        tracing::warn!(
            "PID file {} does not contain a PID",
            config.pid_file_path.display()
        );
        return;
    };
    match kill(Pid::from_raw(pid), Signal::SIGUSR1) {
        Ok(()) => tracing::info!("asked the running daemon (pid {pid}) to reload"),
        Err(e) => tracing::debug!("no running daemon to notify: {e}"),
    }
}

/// Runtime for the commands that need async (firewall and network calls).
pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
