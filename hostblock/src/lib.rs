//! Hostblock core library.
//!
//! This crate provides the building blocks of the Hostblock daemon: the
//! configuration loader, the pattern set, the append-and-patch record store,
//! the scoring engine, the firewall driver and reconciler, the log tailer,
//! the abuse report queue and the remote blacklist syncer.

pub mod abuseipdb;
pub mod config;
pub mod daemon;
pub mod firewall;
pub mod pattern;
pub mod report;
pub mod scoring;
pub mod store;
pub mod syncer;
pub mod tailer;
pub mod util;

pub use config::{Config, LogGroup, LogLevel};
pub use daemon::RunFlags;
pub use firewall::driver::{FirewallDriver, IpFamily, IptablesDriver};
pub use firewall::reconciler::{Reconciler, RuleTemplate};
pub use pattern::{Pattern, ReportPolicy};
pub use scoring::ScoringParams;
pub use store::{BlacklistEntry, DataSet, DataStore, FileBookmark, IpState, SyncMarker};

pub use hostblock_shared::errors::{HostblockError, HostblockResult};
