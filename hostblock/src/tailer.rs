//! Log tailer.
//!
//! Each tick walks every configured log file, reads the lines appended
//! since the persisted bookmark and feeds them through the pattern set
//! into the scoring engine. Rotation is detected by file shrinkage; a
//! shrunk file is rescanned from the start. The tailer is cooperative:
//! it yields briefly between lines and checks the shared running flag so
//! shutdown never waits for a large backlog.

use std::io::SeekFrom;

use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::daemon::RunFlags;
use crate::firewall::reconciler::Reconciler;
use crate::report::Reporter;
use crate::scoring::{self, MatchKind, ScoringParams};
use crate::store::{self, DataSet, DataStore, FileBookmark};
use crate::util;
use hostblock_shared::errors::HostblockResult;

/// Pause between lines so the daemon stays responsive.
const LINE_YIELD: std::time::Duration = std::time::Duration::from_micros(500);

/// Seconds between progress log lines while working through one file.
const PROGRESS_INTERVAL_SECS: u64 = 60;

/// Check every configured log file for new lines. Per-file errors are
/// logged and the walk continues; one unreadable file must not stall the
/// others.
pub async fn check_log_files(
    config: &Config,
    data: &mut DataSet,
    store: &DataStore,
    reconciler: &Reconciler,
    reporter: &Reporter,
    flags: &RunFlags,
) {
    debug!("checking log files for suspicious activity");
    let params = config.scoring_params();
    for group_idx in 0..config.groups.len() {
        debug!("checking log group {}", config.groups[group_idx].name);
        let paths = config.groups[group_idx].files.clone();
        for path in paths {
            if !flags.is_running() {
                return;
            }
            if let Err(e) = check_one_file(
                config, group_idx, &path, data, store, reconciler, reporter, flags, &params,
            )
            .await
            {
                error!("failed to check {path}: {e}");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn check_one_file(
    config: &Config,
    group_idx: usize,
    path: &str,
    data: &mut DataSet,
    store: &DataStore,
    reconciler: &Reconciler,
    reporter: &Reporter,
    flags: &RunFlags,
    params: &ScoringParams,
) -> HostblockResult<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            error!("unable to stat {path}: {e}");
            return Ok(());
        }
    };
    let current_size = metadata.len();
    let (mut position, last_size) = data
        .bookmarks
        .get(path)
        .map(|b| (b.bookmark, b.size))
        .unwrap_or((0, 0));
    debug!("{path}: current size {current_size}, last known size {last_size}");

    if current_size < last_size {
        warn!("{path} shrank from {last_size} to {current_size} bytes, rescanning from the start");
        position = 0;
        let bookmark = FileBookmark {
            bookmark: 0,
            size: current_size,
        };
        data.bookmarks.insert(path.to_string(), bookmark);
        persist_bookmark(store, path, &bookmark);
    }

    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(position)).await?;

    let initial = position;
    let job_total = current_size.saturating_sub(initial);
    let mut last_progress = util::now();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        if !flags.is_running() {
            debug!("stop requested, leaving {path} at offset {position}");
            break;
        }
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            // A line still being written; pick it up next tick.
            break;
        }
        position += n as u64;
        let line = String::from_utf8_lossy(&buf[..n - 1]);
        process_line(
            config, group_idx, &line, data, store, reconciler, reporter, params,
        )
        .await;

        tokio::time::sleep(LINE_YIELD).await;

        let now = util::now();
        if now.saturating_sub(last_progress) >= PROGRESS_INTERVAL_SECS {
            let done = position.saturating_sub(initial);
            let percentage = if job_total > 0 {
                done as f64 * 100.0 / job_total as f64
            } else {
                100.0
            };
            info!("processing {path}, progress: {percentage:.1}%");
            last_progress = now;
        }
    }
    debug!("finished reading {path} at offset {position}");

    let bookmark = FileBookmark {
        bookmark: position,
        size: current_size,
    };
    if data.bookmarks.get(path) != Some(&bookmark) {
        data.bookmarks.insert(path.to_string(), bookmark);
        persist_bookmark(store, path, &bookmark);
    }
    Ok(())
}

fn persist_bookmark(store: &DataStore, path: &str, bookmark: &FileBookmark) {
    let result = match store.update_file(path, bookmark) {
        Ok(true) => Ok(()),
        Ok(false) => store.append_file(path, bookmark),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("failed to persist bookmark for {path}: {e}");
    }
}

/// Match one line against the group's pattern set and apply the result.
/// Within each pattern class the first matching pattern wins, so a line
/// counts at most once as suspicious and at most once as refused.
#[allow(clippy::too_many_arguments)]
async fn process_line(
    config: &Config,
    group_idx: usize,
    line: &str,
    data: &mut DataSet,
    store: &DataStore,
    reconciler: &Reconciler,
    reporter: &Reporter,
    params: &ScoringParams,
) {
    let group = &config.groups[group_idx];
    let mut events: Vec<(MatchKind, usize, String, Option<String>)> = Vec::new();

    for (idx, pattern) in group.patterns.iter().enumerate() {
        if let Some(m) = pattern.matches(line) {
            events.push((
                MatchKind::Suspicious,
                idx,
                m.ip.to_string(),
                m.port.map(str::to_string),
            ));
            break;
        }
    }
    for (idx, pattern) in group.refused_patterns.iter().enumerate() {
        if let Some(m) = pattern.matches(line) {
            events.push((
                MatchKind::Refused,
                idx,
                m.ip.to_string(),
                m.port.map(str::to_string),
            ));
            break;
        }
    }

    for (kind, pattern_idx, address, port) in events {
        if address.len() > store::MAX_ADDRESS_LEN {
            warn!("captured address exceeds the data file field, skipped: {address}");
            continue;
        }
        let pattern = match kind {
            MatchKind::Suspicious => &group.patterns[pattern_idx],
            MatchKind::Refused => &group.refused_patterns[pattern_idx],
        };
        let now = util::now();
        debug!(
            "pattern match in {}: address {address}, score {}",
            group.name, pattern.score
        );

        let Some(outcome) =
            scoring::apply_match(&mut data.ips, &data.blacklist, params, &address, kind, pattern.score, now)
        else {
            continue;
        };

        if let Some(state) = data.ips.get_mut(&address) {
            reporter.maybe_enqueue(config, group, pattern, &address, port.as_deref(), line, state, now);
        }

        if let Some(state) = data.ips.get(&address) {
            let persisted = if outcome.created {
                store.append_ip(&address, state)
            } else {
                match store.update_ip(&address, state) {
                    Ok(true) => Ok(()),
                    Ok(false) => store.append_ip(&address, state),
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = persisted {
                error!("failed to persist activity for {address}: {e}");
            }
        }

        reconciler.reconcile_address(&address, data, params, now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogGroup;
    use crate::firewall::driver::testing::MockDriver;
    use crate::pattern::Pattern;
    use crate::report::ReportQueue;
    use std::io::Write;
    use tempfile::TempDir;

    struct TestContext {
        config: Config,
        data: DataSet,
        store: DataStore,
        reconciler: Reconciler,
        reporter: Reporter,
        flags: std::sync::Arc<RunFlags>,
        log_path: std::path::PathBuf,
        _temp_dir: TempDir,
    }

    fn context(multiplier: u32) -> TestContext {
        let temp_dir = TempDir::new().expect("create temp dir");
        let log_path = temp_dir.path().join("auth.log");
        std::fs::write(&log_path, b"").unwrap();

        let mut config = Config {
            keep_blocked_score_multiplier: multiplier,
            data_file_path: temp_dir.path().join("hostblock.data"),
            ..Default::default()
        };
        config.groups.push(LogGroup {
            name: "ssh".to_string(),
            files: vec![log_path.to_string_lossy().into_owned()],
            patterns: vec![{
                let mut p = Pattern::compile(r".*fail from %i").unwrap();
                p.score = 5;
                p
            }],
            refused_patterns: vec![Pattern::compile(r".*refused connect from %i").unwrap()],
            ..Default::default()
        });

        let store = DataStore::new(&config.data_file_path);
        let data = store.load().unwrap();
        let driver = MockDriver::new(&[]);
        let reconciler = Reconciler::new(driver, "-s %i -j DROP", false).unwrap();
        let reporter = Reporter::with_mask_tokens(
            ReportQueue::default(),
            Vec::new(),
            config.datetime_format.clone(),
        );
        TestContext {
            config,
            data,
            store,
            reconciler,
            reporter,
            flags: RunFlags::new(),
            log_path,
            _temp_dir: temp_dir,
        }
    }

    async fn tick(ctx: &mut TestContext) {
        check_log_files(
            &ctx.config,
            &mut ctx.data,
            &ctx.store,
            &ctx.reconciler,
            &ctx.reporter,
            &ctx.flags,
        )
        .await;
    }

    fn append(path: &std::path::Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_new_lines_feed_scoring_and_advance_bookmark() {
        let mut ctx = context(0);
        append(&ctx.log_path, "fail from 203.0.113.7\nnothing here\n");

        tick(&mut ctx).await;

        assert_eq!(ctx.data.ips["203.0.113.7"].activity_score, 5);
        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 1);
        let key = ctx.log_path.to_string_lossy().into_owned();
        let size = std::fs::metadata(&ctx.log_path).unwrap().len();
        assert_eq!(ctx.data.bookmarks[&key].bookmark, size);

        // Second tick with no new data changes nothing.
        tick(&mut ctx).await;
        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 1);
    }

    #[tokio::test]
    async fn test_only_new_lines_are_read() {
        let mut ctx = context(0);
        append(&ctx.log_path, "fail from 203.0.113.7\n");
        tick(&mut ctx).await;
        append(&ctx.log_path, "fail from 203.0.113.7\n");
        tick(&mut ctx).await;

        // Two matches, not three: the first line was not re-read.
        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 2);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_next_tick() {
        let mut ctx = context(0);
        append(&ctx.log_path, "fail from 203.0.113.7");
        tick(&mut ctx).await;
        assert!(ctx.data.ips.is_empty());

        append(&ctx.log_path, "\n");
        tick(&mut ctx).await;
        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 1);
    }

    #[tokio::test]
    async fn test_rotation_resets_bookmark_and_rescans() {
        // Grow, rotate, shrink; the shrunk content is re-fed.
        let mut ctx = context(0);
        append(&ctx.log_path, "fail from 203.0.113.7\nfail from 203.0.113.7\n");
        tick(&mut ctx).await;
        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 2);

        // Rotation: the file is replaced by a shorter one.
        std::fs::write(&ctx.log_path, "fail from 203.0.113.7\n").unwrap();
        tick(&mut ctx).await;

        assert_eq!(ctx.data.ips["203.0.113.7"].activity_count, 3);
        let key = ctx.log_path.to_string_lossy().into_owned();
        let size = std::fs::metadata(&ctx.log_path).unwrap().len();
        assert_eq!(ctx.data.bookmarks[&key].size, size);
        assert_eq!(ctx.data.bookmarks[&key].bookmark, size);
    }

    #[tokio::test]
    async fn test_refused_match_counts_once_per_class() {
        let mut ctx = context(0);
        // The line matches both classes; the refused side finds an
        // existing record because the suspicious match created it first.
        ctx.config.groups[0].patterns[0] = {
            let mut p = Pattern::compile(r".*fail from %i.*").unwrap();
            p.score = 5;
            p
        };
        append(
            &ctx.log_path,
            "fail from 10.0.0.1 refused connect from 10.0.0.1\n",
        );
        tick(&mut ctx).await;

        let state = &ctx.data.ips["10.0.0.1"];
        assert_eq!(state.activity_count, 1);
        assert_eq!(state.refused_count, 1);
        // Suspicious score 5 plus refused score 1.
        assert_eq!(state.activity_score, 6);
    }

    #[tokio::test]
    async fn test_bookmark_survives_reload() {
        let mut ctx = context(0);
        append(&ctx.log_path, "fail from 203.0.113.7\n");
        tick(&mut ctx).await;

        let reloaded = ctx.store.load().unwrap();
        let key = ctx.log_path.to_string_lossy().into_owned();
        assert_eq!(reloaded.bookmarks[&key], ctx.data.bookmarks[&key]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_lines() {
        let mut ctx = context(0);
        ctx.flags.stop();
        append(&ctx.log_path, "fail from 203.0.113.7\n");
        tick(&mut ctx).await;
        assert!(ctx.data.ips.is_empty());
    }
}
