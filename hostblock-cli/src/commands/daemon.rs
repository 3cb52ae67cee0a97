use std::path::Path;

use anyhow::{Context, bail};
use hostblock::firewall::driver::IptablesDriver;
use hostblock::{Config, RunFlags, util};

/// Fork into the background and run the daemon main loop.
///
/// A live PID in the PID file aborts startup; a stale one is cleaned up.
/// The parent writes the child PID and exits, the child detaches from the
/// terminal and runs the supervisor loop until SIGTERM.
pub fn execute(config_path: &Path, config: Config) -> anyhow::Result<()> {
    // Fail on missing privileges before forking, while stderr is still
    // attached to the caller's terminal.
    drop(IptablesDriver::new()?);

    if config.pid_file_path.exists() {
        let contents = std::fs::read_to_string(&config.pid_file_path)
            .with_context(|| format!("cannot read {}", config.pid_file_path.display()))?;
        match contents.trim().parse::<i32>() {
            Ok(pid) if util::is_process_alive(pid) => {
                bail!("another hostblock instance is already running (pid {pid})");
            }
            Ok(pid) => {
                tracing::warn!("removing stale PID file for dead process {pid}");
                std::fs::remove_file(&config.pid_file_path)?;
            }
            Err(_) => {
                bail!(
                    "PID file {} exists but does not contain a PID; remove it manually",
                    config.pid_file_path.display()
                );
            }
        }
    }

    tracing::info!("starting daemon process");

    #[cfg(unix)]
    {
        daemonize::Daemonize::new()
            .pid_file(&config.pid_file_path)
            .start()
            .map_err(|e| anyhow::anyhow!("failed to daemonize: {e}"))?;
    }

    // Child process from here on.
    let flags = RunFlags::new();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(hostblock::daemon::run(
        config_path.to_path_buf(),
        config,
        flags,
    ))?;
    Ok(())
}
