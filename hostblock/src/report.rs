//! Abuse report queue and worker.
//!
//! The tailer is the producer: a match whose layered reporting policy
//! resolves to "report" is turned into a queue item, at most once per
//! address per 15 minutes. A single worker drains the queue and talks to
//! the remote service, honouring its back-off hints through a shared
//! gate. Items that hit the gate are dropped, not re-queued; the inbound
//! per-address throttle already bounds the pressure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::abuseipdb::AbuseIpdbClient;
use crate::config::{Config, LogGroup};
use crate::daemon::RunFlags;
use crate::pattern::Pattern;
use crate::store::IpState;
use crate::util;
use hostblock_shared::errors::HostblockError;

/// Per-address floor between report enqueues.
pub const REPORT_INTERVAL_SECS: u64 = 15 * 60;

/// Reported comments are truncated to this many bytes.
pub const COMMENT_MAX_BYTES: usize = 1500;

/// Worker pause between iterations.
const WORKER_SLEEP: Duration = Duration::from_millis(2);

/// Gate applied when a rate-limit response carries no retry hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportItem {
    pub address: String,
    pub categories: Vec<u32>,
    pub comment: String,
}

/// Mutex-guarded FIFO between the control thread and the worker.
#[derive(Clone, Default)]
pub struct ReportQueue {
    inner: Arc<Mutex<VecDeque<ReportItem>>>,
}

impl ReportQueue {
    pub fn push(&self, item: ReportItem) {
        self.inner.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<ReportItem> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Producer side: policy resolution, throttling, comment rendering.
pub struct Reporter {
    queue: ReportQueue,
    mask_tokens: Vec<String>,
    datetime_format: String,
}

impl Reporter {
    pub fn new(config: &Config, queue: ReportQueue) -> Self {
        let mask_tokens = if config.report_mask {
            util::host_identity_tokens()
        } else {
            Vec::new()
        };
        Self::with_mask_tokens(queue, mask_tokens, config.datetime_format.clone())
    }

    /// Construct with explicit mask tokens instead of probing the host.
    pub fn with_mask_tokens(
        queue: ReportQueue,
        mask_tokens: Vec<String>,
        datetime_format: String,
    ) -> Self {
        Reporter {
            queue,
            mask_tokens,
            datetime_format,
        }
    }

    /// Enqueue a report for a match when policy allows it. Stamps
    /// `last_reported` on success; the caller persists the record.
    #[allow(clippy::too_many_arguments)]
    pub fn maybe_enqueue(
        &self,
        config: &Config,
        group: &LogGroup,
        pattern: &Pattern,
        address: &str,
        port: Option<&str>,
        line: &str,
        state: &mut IpState,
        now: u64,
    ) -> bool {
        let enabled = pattern
            .report
            .resolve(group.report_all.unwrap_or(config.report_all));
        if !enabled {
            return false;
        }
        if state.whitelisted {
            return false;
        }
        if now < state.last_reported.saturating_add(REPORT_INTERVAL_SECS) {
            debug!("report for {address} suppressed by the 15 minute throttle");
            return false;
        }

        let categories = pattern
            .categories
            .clone()
            .or_else(|| group.report_categories.clone())
            .unwrap_or_else(|| config.report_categories.clone());
        let comment = match effective_comment(config, group, pattern) {
            Some(template) => self.render_comment(template, address, port, line, now),
            None => String::new(),
        };

        state.last_reported = now;
        self.queue.push(ReportItem {
            address: address.to_string(),
            categories,
            comment,
        });
        debug!("report for {address} enqueued");
        true
    }

    fn render_comment(
        &self,
        template: &str,
        address: &str,
        port: Option<&str>,
        line: &str,
        now: u64,
    ) -> String {
        let masked_line = mask(line, &self.mask_tokens);
        let mut comment = template
            .replace("%i", address)
            .replace("%p", port.unwrap_or(""))
            .replace("%m", &masked_line)
            .replace("%d", &util::format_datetime(now, &self.datetime_format));
        truncate_bytes(&mut comment, COMMENT_MAX_BYTES);
        comment
    }
}

/// Layered comment template: pattern over group over global; an empty
/// template at the winning level disables the comment outright.
fn effective_comment<'a>(
    config: &'a Config,
    group: &'a LogGroup,
    pattern: &'a Pattern,
) -> Option<&'a str> {
    let resolved = pattern
        .comment
        .as_deref()
        .or(group.report_comment.as_deref())
        .or(config.report_comment.as_deref());
    match resolved {
        None | Some("") => None,
        Some(template) => Some(template),
    }
}

/// Replace every occurrence of the given tokens with asterisks of the
/// same length.
fn mask(line: &str, tokens: &[String]) -> String {
    let mut masked = line.to_string();
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        masked = masked.replace(token.as_str(), &"*".repeat(token.len()));
    }
    masked
}

fn truncate_bytes(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Consumer loop. Exits when the running flag clears; anything still
/// queued at that point is discarded.
pub async fn run_report_worker(
    queue: ReportQueue,
    client: AbuseIpdbClient,
    flags: Arc<RunFlags>,
    gate: Arc<AtomicU64>,
) {
    debug!("report worker started");
    while flags.is_running() {
        tokio::time::sleep(WORKER_SLEEP).await;
        let Some(item) = queue.pop() else {
            continue;
        };
        let now = util::now();
        let gated_until = gate.load(Ordering::Relaxed);
        if now < gated_until {
            debug!(
                "report for {} dropped, remote back-off active for {} more second(s)",
                item.address,
                gated_until - now
            );
            continue;
        }
        match client
            .report(&item.address, &item.categories, &item.comment)
            .await
        {
            Ok(()) => debug!("reported {}", item.address),
            Err(HostblockError::RateLimited { retry_after }) => {
                let until = now + retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                gate.store(until, Ordering::Relaxed);
                warn!("remote rate limit hit, holding reports until {until}");
            }
            Err(e) => error!("failed to report {}: {e}", item.address),
        }
    }
    let dropped = queue.len();
    if dropped > 0 {
        debug!("report worker exiting, discarding {dropped} queued item(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ReportPolicy;

    fn reporter(queue: ReportQueue) -> Reporter {
        Reporter::with_mask_tokens(queue, Vec::new(), "%Y-%m-%d %H:%M:%S".to_string())
    }

    fn pattern(report: ReportPolicy) -> Pattern {
        let mut pattern = Pattern::compile(r".*fail from %i").unwrap();
        pattern.report = report;
        pattern
    }

    fn group() -> LogGroup {
        LogGroup {
            name: "test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_throttle_allows_one_report_per_window() {
        // Four matches inside fifteen minutes produce a single report.
        let queue = ReportQueue::default();
        let reporter = reporter(queue.clone());
        let config = Config::default();
        let group = group();
        let pattern = pattern(ReportPolicy::On);
        let mut state = IpState::default();

        let mut enqueued = 0;
        for offset in [0u64, 60, 300, 800] {
            if reporter.maybe_enqueue(
                &config,
                &group,
                &pattern,
                "203.0.113.7",
                None,
                "fail from 203.0.113.7",
                &mut state,
                10_000 + offset,
            ) {
                enqueued += 1;
            }
        }
        assert_eq!(enqueued, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(state.last_reported, 10_000);

        // A match after the window produces the next report.
        assert!(reporter.maybe_enqueue(
            &config,
            &group,
            &pattern,
            "203.0.113.7",
            None,
            "fail from 203.0.113.7",
            &mut state,
            10_000 + REPORT_INTERVAL_SECS,
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_whitelisted_addresses_are_never_reported() {
        let queue = ReportQueue::default();
        let reporter = reporter(queue.clone());
        let config = Config {
            report_all: true,
            ..Default::default()
        };
        let mut state = IpState {
            whitelisted: true,
            ..Default::default()
        };
        assert!(!reporter.maybe_enqueue(
            &config,
            &group(),
            &pattern(ReportPolicy::On),
            "203.0.113.7",
            None,
            "fail from 203.0.113.7",
            &mut state,
            10_000,
        ));
        assert!(queue.is_empty());
        assert_eq!(state.last_reported, 0);
    }

    #[test]
    fn test_policy_layering() {
        let queue = ReportQueue::default();
        let reporter = reporter(queue.clone());
        let mut state = IpState::default();

        // Global off, group on, pattern inherits: reported.
        let config = Config::default();
        let group = LogGroup {
            report_all: Some(true),
            ..group()
        };
        assert!(reporter.maybe_enqueue(
            &config,
            &group,
            &pattern(ReportPolicy::Inherit),
            "10.0.0.1",
            None,
            "fail from 10.0.0.1",
            &mut state,
            10_000,
        ));

        // Pattern force-off wins over the group.
        let mut state = IpState::default();
        assert!(!reporter.maybe_enqueue(
            &config,
            &group,
            &pattern(ReportPolicy::Off),
            "10.0.0.2",
            None,
            "fail from 10.0.0.2",
            &mut state,
            10_000,
        ));
    }

    #[test]
    fn test_comment_placeholders_and_masking() {
        let queue = ReportQueue::default();
        let reporter = Reporter::with_mask_tokens(
            queue.clone(),
            vec!["myhost".to_string()],
            "%Y".to_string(),
        );
        let config = Config {
            report_all: true,
            report_comment: Some("attack on %i port %p: %m".to_string()),
            ..Default::default()
        };
        let mut state = IpState::default();
        reporter.maybe_enqueue(
            &config,
            &group(),
            &pattern(ReportPolicy::Inherit),
            "203.0.113.7",
            Some("22"),
            "myhost sshd: fail from 203.0.113.7",
            &mut state,
            10_000,
        );
        let item = queue.pop().unwrap();
        assert_eq!(
            item.comment,
            "attack on 203.0.113.7 port 22: ****** sshd: fail from 203.0.113.7"
        );
    }

    #[test]
    fn test_empty_comment_template_disables_comment() {
        let config = Config {
            report_comment: Some("global comment".to_string()),
            ..Default::default()
        };
        let group = LogGroup {
            report_comment: Some(String::new()),
            ..group()
        };
        let pattern = pattern(ReportPolicy::On);
        assert_eq!(effective_comment(&config, &group, &pattern), None);

        // Without the group override the global template applies.
        assert_eq!(
            effective_comment(&config, &self::group(), &pattern),
            Some("global comment")
        );
    }

    #[test]
    fn test_comment_truncation_is_char_safe() {
        let mut text = format!("{}é", "a".repeat(COMMENT_MAX_BYTES - 1));
        truncate_bytes(&mut text, COMMENT_MAX_BYTES);
        assert_eq!(text.len(), COMMENT_MAX_BYTES - 1);

        let mut long = "x".repeat(COMMENT_MAX_BYTES * 2);
        truncate_bytes(&mut long, COMMENT_MAX_BYTES);
        assert_eq!(long.len(), COMMENT_MAX_BYTES);
    }

    #[test]
    fn test_default_categories_inherit_from_global() {
        let queue = ReportQueue::default();
        let reporter = reporter(queue.clone());
        let config = Config {
            report_all: true,
            report_categories: vec![18, 22],
            ..Default::default()
        };
        let mut state = IpState::default();
        reporter.maybe_enqueue(
            &config,
            &group(),
            &pattern(ReportPolicy::Inherit),
            "10.0.0.3",
            None,
            "fail from 10.0.0.3",
            &mut state,
            10_000,
        );
        assert_eq!(queue.pop().unwrap().categories, vec![18, 22]);
    }
}
