//! Configuration loading.
//!
//! The configuration file is INI-style with a `[Global]` section and one
//! `[Log.<name>]` section per log group. The loader scans line by line
//! because key order matters inside a group: `log.score` and the
//! per-pattern reporting keys always bind to the most recent
//! `log.pattern` (and the `log.refused.*` set to the most recent
//! `log.refused.pattern`).

use std::fmt;
use std::path::{Path, PathBuf};

use hostblock_shared::errors::{HostblockError, HostblockResult};
use tracing::{debug, warn};

use crate::pattern::{Pattern, ReportPolicy};
use crate::scoring::ScoringParams;
use crate::util;

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "HOSTBLOCK_CONFIG";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostblock.conf";

/// Remote confidence threshold bounds; values outside are clamped.
const MIN_BLOCK_SCORE: u8 = 25;
const MAX_BLOCK_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    /// Directive handed to the tracing `EnvFilter` when `RUST_LOG` is unset.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One `[Log.<name>]` section: files to follow and the patterns applied to
/// their lines, plus group-level reporting overrides.
#[derive(Debug, Clone, Default)]
pub struct LogGroup {
    pub name: String,
    /// Log file paths. Bookmarks for them live in the data set, keyed by path.
    pub files: Vec<String>,
    /// Suspicious-activity patterns.
    pub patterns: Vec<Pattern>,
    /// Refused-connection patterns; these never create a first record.
    pub refused_patterns: Vec<Pattern>,
    /// Group-level reporting override; `None` inherits the global default.
    pub report_all: Option<bool>,
    pub report_categories: Option<Vec<u32>>,
    pub report_comment: Option<String>,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    /// Seconds between log file checks.
    pub log_check_interval: u64,
    /// Score needed before an address is blocked.
    pub activity_score_to_block: u32,
    /// Multiplier turning score into seconds of remaining block time;
    /// 0 keeps rules until the score is manually reduced.
    pub keep_blocked_score_multiplier: u32,
    /// Firewall rule template, contains exactly one `%i`.
    pub iptables_rule: String,
    /// Insert rules at position 1 instead of appending.
    pub iptables_insert: bool,
    pub datetime_format: String,
    pub data_file_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub abuseipdb_url: String,
    pub abuseipdb_key: String,
    /// Format of the remote generation timestamp.
    pub abuseipdb_datetime_format: String,
    /// Seconds between blacklist syncs; 0 disables the syncer.
    pub abuseipdb_blacklist_interval: u64,
    /// Confidence threshold for blocking remote blacklist entries,
    /// clamped to 25..=100.
    pub abuseipdb_block_score: u8,
    /// Global reporting default.
    pub report_all: bool,
    /// Mask the hostname and local addresses out of reported lines.
    pub report_mask: bool,
    pub report_categories: Vec<u32>,
    pub report_comment: Option<String>,
    pub groups: Vec<LogGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::Info,
            log_check_interval: 30,
            activity_score_to_block: 10,
            keep_blocked_score_multiplier: 3600,
            iptables_rule: "-s %i -j DROP".to_string(),
            iptables_insert: false,
            datetime_format: "%Y-%m-%d %H:%M:%S".to_string(),
            data_file_path: PathBuf::from("/usr/share/hostblock/hostblock.data"),
            pid_file_path: PathBuf::from("/var/run/hostblock.pid"),
            abuseipdb_url: "https://api.abuseipdb.com/api/v2".to_string(),
            abuseipdb_key: String::new(),
            abuseipdb_datetime_format: "%Y-%m-%dT%H:%M:%S%:z".to_string(),
            abuseipdb_blacklist_interval: 0,
            abuseipdb_block_score: 90,
            report_all: false,
            report_mask: false,
            report_categories: vec![18, 22],
            report_comment: None,
            groups: Vec::new(),
        }
    }
}

/// Section the parser is currently inside.
#[derive(Clone, Copy)]
enum Section {
    Global,
    Group(usize),
}

impl Config {
    /// Configuration file path: `$HOSTBLOCK_CONFIG` if set, the system
    /// default otherwise.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate the configuration file. Malformed integers,
    /// uncompilable patterns and a block-rule template without `%i` are
    /// fatal.
    pub fn load(path: &Path) -> HostblockResult<Config> {
        debug!("loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HostblockError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Parse configuration text. Split out of [`Config::load`] so tests can
    /// feed literal strings.
    pub fn parse(raw: &str) -> HostblockResult<Config> {
        let mut config = Config::default();
        let mut section = Section::Global;

        for (lineno, raw_line) in raw.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let header = &line[1..line.len() - 1];
                if header == "Global" {
                    section = Section::Global;
                } else if let Some(name) = header.strip_prefix("Log.") {
                    config.groups.push(LogGroup {
                        name: name.to_string(),
                        ..Default::default()
                    });
                    section = Section::Group(config.groups.len() - 1);
                    debug!("log file group: {name}");
                } else {
                    warn!("line {}: unknown section [{header}], ignored", lineno + 1);
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("line {}: not a key=value pair, ignored: {line}", lineno + 1);
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match section {
                Section::Global => config.apply_global(key, value)?,
                Section::Group(idx) => apply_group(&mut config.groups[idx], key, value)?,
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_global(&mut self, key: &str, value: &str) -> HostblockResult<()> {
        match key {
            "log.level" => {
                self.log_level = value.parse().map_err(|_| {
                    HostblockError::Config(format!("unknown log.level: {value}"))
                })?;
            }
            "log.check.interval" => self.log_check_interval = parse_u64(key, value)?,
            "address.block.score" => self.activity_score_to_block = parse_u32(key, value)?,
            "address.block.multiplier" => {
                self.keep_blocked_score_multiplier = parse_u32(key, value)?;
            }
            "iptables.rules.block" => {
                if !value.contains("%i") {
                    return Err(HostblockError::Config(format!(
                        "iptables.rules.block is missing the %i address placeholder: {value}"
                    )));
                }
                self.iptables_rule = value.to_string();
            }
            "iptables.rules.insert" => self.iptables_insert = parse_bool(key, value)?,
            "datetime.format" => self.datetime_format = value.to_string(),
            "datafile.path" => self.data_file_path = PathBuf::from(value),
            "pidfile.path" => self.pid_file_path = PathBuf::from(value),
            "abuseipdb.api.url" => self.abuseipdb_url = value.trim_end_matches('/').to_string(),
            "abuseipdb.api.key" => self.abuseipdb_key = value.to_string(),
            "abuseipdb.datetime.format" => self.abuseipdb_datetime_format = value.to_string(),
            "abuseipdb.blacklist.interval" => {
                self.abuseipdb_blacklist_interval = parse_u64(key, value)?;
            }
            "abuseipdb.block.score" => {
                let score = parse_u32(key, value)?;
                let clamped = score.clamp(MIN_BLOCK_SCORE as u32, MAX_BLOCK_SCORE as u32) as u8;
                if score != clamped as u32 {
                    warn!(
                        "abuseipdb.block.score {score} outside {MIN_BLOCK_SCORE}..{MAX_BLOCK_SCORE}, clamped to {clamped}"
                    );
                }
                self.abuseipdb_block_score = clamped;
            }
            "abuseipdb.report.all" => self.report_all = parse_bool(key, value)?,
            "abuseipdb.report.mask" => self.report_mask = parse_bool(key, value)?,
            "abuseipdb.report.categories" => {
                self.report_categories = parse_categories(key, value)?;
            }
            "abuseipdb.report.comment" => self.report_comment = Some(value.to_string()),
            _ => debug!("unknown global key ignored: {key}"),
        }
        Ok(())
    }

    fn validate(&self) -> HostblockResult<()> {
        if !util::is_valid_datetime_format(&self.datetime_format) {
            return Err(HostblockError::Config(format!(
                "invalid datetime.format: {}",
                self.datetime_format
            )));
        }
        if !util::is_valid_datetime_format(&self.abuseipdb_datetime_format) {
            return Err(HostblockError::Config(format!(
                "invalid abuseipdb.datetime.format: {}",
                self.abuseipdb_datetime_format
            )));
        }
        Ok(())
    }

    pub fn scoring_params(&self) -> ScoringParams {
        ScoringParams {
            score_to_block: self.activity_score_to_block,
            multiplier: self.keep_blocked_score_multiplier,
            reputation_block_score: self.abuseipdb_block_score,
        }
    }

    /// Render the effective configuration as annotated INI text.
    pub fn print(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "## Hostblock configuration, generated automatically");
        let _ = writeln!(out, "## Timestamp: {}\n", util::now());
        let _ = writeln!(out, "[Global]\n");
        let _ = writeln!(out, "## Log level (ERROR|WARNING|INFO|DEBUG)");
        let _ = writeln!(out, "log.level = {}\n", self.log_level);
        let _ = writeln!(out, "## Interval for log file check (seconds)");
        let _ = writeln!(out, "log.check.interval = {}\n", self.log_check_interval);
        let _ = writeln!(out, "## Needed score to block an address");
        let _ = writeln!(out, "address.block.score = {}\n", self.activity_score_to_block);
        let _ = writeln!(
            out,
            "## Score multiplier, seconds of block time per score point (0 keeps rules)"
        );
        let _ = writeln!(
            out,
            "address.block.multiplier = {}\n",
            self.keep_blocked_score_multiplier
        );
        let _ = writeln!(out, "## Firewall rule template, %i is the address");
        let _ = writeln!(out, "iptables.rules.block = {}", self.iptables_rule);
        let _ = writeln!(out, "iptables.rules.insert = {}\n", self.iptables_insert);
        let _ = writeln!(out, "## Datetime format for console output");
        let _ = writeln!(out, "datetime.format = {}\n", self.datetime_format);
        let _ = writeln!(out, "## Full path to the data file");
        let _ = writeln!(out, "datafile.path = {}\n", self.data_file_path.display());
        let _ = writeln!(out, "## Full path to the PID file");
        let _ = writeln!(out, "pidfile.path = {}\n", self.pid_file_path.display());
        let _ = writeln!(out, "## AbuseIPDB integration");
        let _ = writeln!(out, "abuseipdb.api.url = {}", self.abuseipdb_url);
        let _ = writeln!(out, "abuseipdb.api.key = {}", self.abuseipdb_key);
        let _ = writeln!(
            out,
            "abuseipdb.datetime.format = {}",
            self.abuseipdb_datetime_format
        );
        let _ = writeln!(
            out,
            "abuseipdb.blacklist.interval = {}",
            self.abuseipdb_blacklist_interval
        );
        let _ = writeln!(out, "abuseipdb.block.score = {}", self.abuseipdb_block_score);
        let _ = writeln!(out, "abuseipdb.report.all = {}", self.report_all);
        let _ = writeln!(out, "abuseipdb.report.mask = {}", self.report_mask);
        let _ = writeln!(
            out,
            "abuseipdb.report.categories = {}",
            join_categories(&self.report_categories)
        );
        if let Some(comment) = &self.report_comment {
            let _ = writeln!(out, "abuseipdb.report.comment = {comment}");
        }

        for group in &self.groups {
            let _ = writeln!(out, "\n## Pattern and log file configuration for {}", group.name);
            let _ = writeln!(out, "[Log.{}]\n", group.name);
            for path in &group.files {
                let _ = writeln!(out, "log.path = {path}");
            }
            if let Some(report_all) = group.report_all {
                let _ = writeln!(out, "abuseipdb.report.all = {report_all}");
            }
            if let Some(categories) = &group.report_categories {
                let _ = writeln!(
                    out,
                    "abuseipdb.report.categories = {}",
                    join_categories(categories)
                );
            }
            if let Some(comment) = &group.report_comment {
                let _ = writeln!(out, "abuseipdb.report.comment = {comment}");
            }
            let _ = writeln!(out, "\n## Patterns to match suspicious activity, %i is the address");
            for pattern in &group.patterns {
                let _ = writeln!(out, "log.pattern = {}", pattern.raw);
                let _ = writeln!(out, "log.score = {}", pattern.score);
            }
            let _ = writeln!(out, "\n## Patterns to count refused connections");
            for pattern in &group.refused_patterns {
                let _ = writeln!(out, "log.refused.pattern = {}", pattern.raw);
                let _ = writeln!(out, "log.refused.score = {}", pattern.score);
            }
        }
        out
    }
}

fn apply_group(group: &mut LogGroup, key: &str, value: &str) -> HostblockResult<()> {
    match key {
        "log.path" => {
            group.files.push(value.to_string());
            debug!("log file path: {value}");
        }
        "log.pattern" => {
            group.patterns.push(Pattern::compile(value)?);
            debug!("pattern to match: {value}");
        }
        "log.score" => bind_last(&mut group.patterns, key, |p| {
            p.score = parse_u32(key, value)?;
            Ok(())
        })?,
        "log.abuseipdb.report" => bind_last(&mut group.patterns, key, |p| {
            p.report = ReportPolicy::from_bool(parse_bool(key, value)?);
            Ok(())
        })?,
        "log.abuseipdb.categories" => bind_last(&mut group.patterns, key, |p| {
            p.categories = Some(parse_categories(key, value)?);
            Ok(())
        })?,
        "log.abuseipdb.comment" => bind_last(&mut group.patterns, key, |p| {
            p.comment = Some(value.to_string());
            Ok(())
        })?,
        "log.refused.pattern" => {
            group.refused_patterns.push(Pattern::compile(value)?);
            debug!("pattern to match refused connections: {value}");
        }
        "log.refused.score" => bind_last(&mut group.refused_patterns, key, |p| {
            p.score = parse_u32(key, value)?;
            Ok(())
        })?,
        "log.refused.abuseipdb.report" => bind_last(&mut group.refused_patterns, key, |p| {
            p.report = ReportPolicy::from_bool(parse_bool(key, value)?);
            Ok(())
        })?,
        "log.refused.abuseipdb.categories" => bind_last(&mut group.refused_patterns, key, |p| {
            p.categories = Some(parse_categories(key, value)?);
            Ok(())
        })?,
        "log.refused.abuseipdb.comment" => bind_last(&mut group.refused_patterns, key, |p| {
            p.comment = Some(value.to_string());
            Ok(())
        })?,
        "abuseipdb.report.all" => group.report_all = Some(parse_bool(key, value)?),
        "abuseipdb.report.categories" => {
            group.report_categories = Some(parse_categories(key, value)?);
        }
        "abuseipdb.report.comment" => group.report_comment = Some(value.to_string()),
        _ => debug!("unknown group key ignored: {key}"),
    }
    Ok(())
}

/// Apply a follow-up key to the most recently declared pattern.
fn bind_last<F>(patterns: &mut [Pattern], key: &str, apply: F) -> HostblockResult<()>
where
    F: FnOnce(&mut Pattern) -> HostblockResult<()>,
{
    match patterns.last_mut() {
        Some(pattern) => apply(pattern),
        None => {
            warn!("{key} appears before any pattern in its group, ignored");
            Ok(())
        }
    }
}

/// Strip a trailing comment. Whole-line comments start with `#`; inline
/// comments need a space before the `#` so patterns may contain the
/// character.
fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return "";
    }
    match line.find(" #") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_u64(key: &str, value: &str) -> HostblockResult<u64> {
    value
        .parse()
        .map_err(|_| HostblockError::Config(format!("invalid integer for {key}: {value}")))
}

fn parse_u32(key: &str, value: &str) -> HostblockResult<u32> {
    value
        .parse()
        .map_err(|_| HostblockError::Config(format!("invalid integer for {key}: {value}")))
}

fn parse_bool(key: &str, value: &str) -> HostblockResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(HostblockError::Config(format!(
            "invalid boolean for {key}: {value}"
        ))),
    }
}

fn parse_categories(key: &str, value: &str) -> HostblockResult<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| {
                HostblockError::Config(format!("invalid category list for {key}: {value}"))
            })
        })
        .collect()
}

fn join_categories(categories: &[u32]) -> String {
    categories
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
