//! Daemon supervisor.
//!
//! Owns the shared run flags and the coarse control loop: reload
//! configuration and data on demand, drive the tailer on its interval,
//! withdraw expired rules and run the blacklist syncer. Signals arrive
//! through atomic flags posted by watcher tasks; every suspension point
//! in the loop and its callees re-reads them, so shutdown is cooperative.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use crate::abuseipdb::AbuseIpdbClient;
use crate::config::Config;
use crate::firewall::driver::{FirewallDriver, IptablesDriver};
use crate::firewall::reconciler::Reconciler;
use crate::report::{self, ReportQueue, Reporter};
use crate::scoring;
use crate::store::{DataSet, DataStore, FileBookmark};
use crate::syncer::BlacklistSyncer;
use crate::tailer;
use crate::util;
use hostblock_shared::errors::HostblockResult;

/// Pause between control loop iterations.
const TICK: Duration = Duration::from_millis(200);

/// Flags shared between the control loop, the signal watchers and the
/// report worker.
pub struct RunFlags {
    running: AtomicBool,
    reload_config: AtomicBool,
    reload_data: AtomicBool,
}

impl RunFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(RunFlags {
            running: AtomicBool::new(true),
            reload_config: AtomicBool::new(false),
            reload_data: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_config.store(true, Ordering::Relaxed);
        self.reload_data.store(true, Ordering::Relaxed);
    }

    fn take_reload_config(&self) -> bool {
        self.reload_config.swap(false, Ordering::Relaxed)
    }

    fn take_reload_data(&self) -> bool {
        self.reload_data.swap(false, Ordering::Relaxed)
    }
}

/// Run the daemon with the real iptables driver. Requires root.
pub async fn run(config_path: PathBuf, config: Config, flags: Arc<RunFlags>) -> HostblockResult<()> {
    let driver: Arc<dyn FirewallDriver> = Arc::new(IptablesDriver::new()?);
    run_with_driver(config_path, config, flags, driver).await
}

/// Run the daemon against an injected firewall driver.
pub async fn run_with_driver(
    config_path: PathBuf,
    mut config: Config,
    flags: Arc<RunFlags>,
    driver: Arc<dyn FirewallDriver>,
) -> HostblockResult<()> {
    info!("starting daemon");
    let mut reconciler = Reconciler::new(driver.clone(), &config.iptables_rule, config.iptables_insert)?;
    let store = DataStore::new(&config.data_file_path);
    let mut data = store.load()?;
    sync_bookmarks(&config, &mut data, &store);

    let now = util::now();
    reconciler
        .full_sync(&mut data, &config.scoring_params(), now)
        .await?;

    install_signal_handlers(flags.clone())?;

    let queue = ReportQueue::default();
    let mut reporter = Reporter::new(&config, queue.clone());
    let gate = Arc::new(AtomicU64::new(0));
    let worker = if config.abuseipdb_key.is_empty() {
        None
    } else {
        let client = AbuseIpdbClient::new(&config)?;
        Some(tokio::spawn(report::run_report_worker(
            queue.clone(),
            client,
            flags.clone(),
            gate.clone(),
        )))
    };
    let mut sync_client = if config.abuseipdb_key.is_empty() {
        None
    } else {
        Some(AbuseIpdbClient::new(&config)?)
    };
    let mut syncer = BlacklistSyncer::new();

    let mut last_log_check = now.saturating_sub(config.log_check_interval);
    while flags.is_running() {
        tokio::time::sleep(TICK).await;
        let now = util::now();

        if flags.take_reload_config() {
            info!("reloading configuration");
            match Config::load(&config_path) {
                Ok(new_config) => {
                    match Reconciler::new(
                        driver.clone(),
                        &new_config.iptables_rule,
                        new_config.iptables_insert,
                    ) {
                        Ok(new_reconciler) => {
                            if new_config.iptables_rule != config.iptables_rule {
                                new_reconciler.migrate_template(reconciler.template()).await;
                            }
                            reconciler = new_reconciler;
                            reporter = Reporter::new(&new_config, queue.clone());
                            sync_client = if new_config.abuseipdb_key.is_empty() {
                                None
                            } else {
                                AbuseIpdbClient::new(&new_config).ok()
                            };
                            config = new_config;
                            sync_bookmarks(&config, &mut data, &store);
                        }
                        Err(e) => error!("reloaded configuration rejected: {e}"),
                    }
                }
                Err(e) => error!("failed to reload configuration: {e}"),
            }
        }

        if flags.take_reload_data() {
            info!("reloading data file");
            match store.load() {
                Ok(loaded) => {
                    data = loaded;
                    sync_bookmarks(&config, &mut data, &store);
                    if let Err(e) = reconciler
                        .full_sync(&mut data, &config.scoring_params(), now)
                        .await
                    {
                        error!("failed to reconcile after data reload: {e}");
                    }
                }
                Err(e) => error!("failed to reload data: {e}"),
            }
        }

        if now.saturating_sub(last_log_check) >= config.log_check_interval {
            tailer::check_log_files(&config, &mut data, &store, &reconciler, &reporter, &flags)
                .await;
            expire_rules(&config, &mut data, &reconciler, util::now()).await;
            last_log_check = now;
        }

        if let Some(client) = &sync_client {
            syncer
                .tick(&config, client, &mut data, &store, &reconciler, now)
                .await;
        }
    }

    if let Some(worker) = worker {
        // The worker watches the same flags and exits on its own.
        let _ = worker.await;
    }
    info!("daemon stopped");
    Ok(())
}

/// Withdraw rules whose block predicate no longer holds.
async fn expire_rules(config: &Config, data: &mut DataSet, reconciler: &Reconciler, now: u64) {
    let params = config.scoring_params();
    let ruled: Vec<String> = data
        .ips
        .iter()
        .filter(|(_, state)| state.has_rule)
        .map(|(address, _)| address.clone())
        .collect();
    for address in ruled {
        let state = data.ips[&address];
        if state.blacklisted {
            continue;
        }
        // An address can keep its rule through the remote blacklist even
        // after its own score expires.
        if data
            .blacklist
            .get(&address)
            .is_some_and(|entry| scoring::blacklist_requires_rule(entry, &params))
        {
            continue;
        }
        if scoring::rule_expired(&state, &params, now) {
            info!("rule for {address} expired, removing");
            let has_rule = reconciler.apply(&address, false, true).await;
            if let Some(state) = data.ips.get_mut(&address) {
                state.has_rule = has_rule;
            }
            if let Some(entry) = data.blacklist.get_mut(&address) {
                entry.has_rule = has_rule;
            }
        }
    }
}

/// Align persisted bookmarks with the configured file set: drop records
/// for files no longer configured, create records for new ones.
fn sync_bookmarks(config: &Config, data: &mut DataSet, store: &DataStore) {
    let configured: std::collections::BTreeSet<&str> = config
        .groups
        .iter()
        .flat_map(|group| group.files.iter())
        .map(String::as_str)
        .collect();

    let stale: Vec<String> = data
        .bookmarks
        .keys()
        .filter(|path| !configured.contains(path.as_str()))
        .cloned()
        .collect();
    for path in stale {
        info!("bookmark for {path} no longer matches any configured log file, removing");
        data.bookmarks.remove(&path);
        if let Err(e) = store.remove_file(&path) {
            error!("failed to remove bookmark for {path}: {e}");
        }
    }

    for path in configured {
        if !data.bookmarks.contains_key(path) {
            let bookmark = FileBookmark::default();
            data.bookmarks.insert(path.to_string(), bookmark);
            if let Err(e) = store.append_file(path, &bookmark) {
                error!("failed to create bookmark for {path}: {e}");
            }
        }
    }
}

fn install_signal_handlers(flags: Arc<RunFlags>) -> HostblockResult<()> {
    let mut term = signal(SignalKind::terminate())?;
    let term_flags = flags.clone();
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            info!("SIGTERM received, shutting down");
            term_flags.stop();
        }
    });

    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("SIGUSR1 received, scheduling configuration and data reload");
            flags.request_reload();
        }
    });
    Ok(())
}
