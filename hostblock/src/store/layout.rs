//! On-disk record layout.
//!
//! All integer fields are fixed-width, right-justified, space-padded
//! decimal; addresses are fixed-width and right-justified. The only
//! variable-width suffix is the log file path of a bookmark record.
//! Every width below derives from this table:
//!
//! | tag | record          | layout after tag                                            |
//! |-----|-----------------|-------------------------------------------------------------|
//! | `d` | address state   | addr(39) last_act(20) score(10) count(10) refused(10) wl(1) bl(1) last_rep(20) |
//! | `b` | file bookmark   | bookmark(20) size(20) path(var)                             |
//! | `a` | blacklist entry | addr(39) total_reports(10) confidence(3)                    |
//! | `s` | sync marker     | sync_time(20) generated_time(20)                            |
//! | `r` | tombstone       | spaces, preserving the replaced record's length             |

use hostblock_shared::errors::{HostblockError, HostblockResult};

use super::{BlacklistEntry, FileBookmark, IpState, SyncMarker};

pub const TAG_IP: u8 = b'd';
pub const TAG_BOOKMARK: u8 = b'b';
pub const TAG_BLACKLIST: u8 = b'a';
pub const TAG_SYNC: u8 = b's';
pub const TAG_TOMBSTONE: u8 = b'r';

pub const ADDR_WIDTH: usize = 39;
pub const TIMESTAMP_WIDTH: usize = 20;
pub const SCORE_WIDTH: usize = 10;
pub const COUNT_WIDTH: usize = 10;
pub const FLAG_WIDTH: usize = 1;
pub const CONFIDENCE_WIDTH: usize = 3;

/// Mutable region of a `d` record: everything after the address.
pub const IP_MUTABLE_WIDTH: usize = TIMESTAMP_WIDTH
    + SCORE_WIDTH
    + COUNT_WIDTH
    + COUNT_WIDTH
    + FLAG_WIDTH
    + FLAG_WIDTH
    + TIMESTAMP_WIDTH;

/// Full `d` record including the tag byte (112).
pub const IP_RECORD_LEN: usize = 1 + ADDR_WIDTH + IP_MUTABLE_WIDTH;

/// `d` records written before the reporting timestamp existed (92).
pub const LEGACY_IP_RECORD_LEN: usize = IP_RECORD_LEN - TIMESTAMP_WIDTH;

/// Mutable region of an `a` record.
pub const BLACKLIST_MUTABLE_WIDTH: usize = COUNT_WIDTH + CONFIDENCE_WIDTH;

/// Full `a` record including the tag byte (53).
pub const BLACKLIST_RECORD_LEN: usize = 1 + ADDR_WIDTH + BLACKLIST_MUTABLE_WIDTH;

/// Numeric header of a `b` record (bookmark + size) and the whole body of
/// an `s` record.
pub const NUMERIC_HEADER_WIDTH: usize = TIMESTAMP_WIDTH + TIMESTAMP_WIDTH;

/// Full `s` record including the tag byte.
pub const SYNC_RECORD_LEN: usize = 1 + NUMERIC_HEADER_WIDTH;

/// Tombstones trigger a compacting rewrite past this count.
pub const TOMBSTONE_COMPACT_THRESHOLD: usize = 100;

fn flag(value: bool) -> char {
    if value { 'y' } else { 'n' }
}

fn parse_flag(byte: u8) -> bool {
    byte == b'y'
}

fn parse_num<T: std::str::FromStr>(field: &str, what: &str) -> HostblockResult<T> {
    field.trim().parse().map_err(|_| {
        HostblockError::DataCorruption(format!("unparseable {what} field: {field:?}"))
    })
}

pub fn render_ip_mutable(state: &IpState) -> String {
    format!(
        "{:>tw$}{:>sw$}{:>cw$}{:>cw$}{}{}{:>tw$}",
        state.last_activity,
        state.activity_score,
        state.activity_count,
        state.refused_count,
        flag(state.whitelisted),
        flag(state.blacklisted),
        state.last_reported,
        tw = TIMESTAMP_WIDTH,
        sw = SCORE_WIDTH,
        cw = COUNT_WIDTH,
    )
}

pub fn render_ip_record(address: &str, state: &IpState) -> String {
    format!("d{:>aw$}{}", address, render_ip_mutable(state), aw = ADDR_WIDTH)
}

/// Parse a `d` line. Returns the address, the state and whether the line
/// used the legacy short layout.
pub fn parse_ip_record(line: &str) -> HostblockResult<(String, IpState, bool)> {
    if !line.is_ascii() {
        return Err(HostblockError::DataCorruption(
            "non-ASCII bytes in d record".to_string(),
        ));
    }
    let legacy = match line.len() {
        IP_RECORD_LEN => false,
        LEGACY_IP_RECORD_LEN => true,
        n => {
            return Err(HostblockError::DataCorruption(format!(
                "d record length {n}, expected {IP_RECORD_LEN} or {LEGACY_IP_RECORD_LEN}"
            )));
        }
    };

    let address = line[1..1 + ADDR_WIDTH].trim_start().to_string();
    let mut offset = 1 + ADDR_WIDTH;
    let last_activity = parse_num(&line[offset..offset + TIMESTAMP_WIDTH], "last activity")?;
    offset += TIMESTAMP_WIDTH;
    let activity_score = parse_num(&line[offset..offset + SCORE_WIDTH], "activity score")?;
    offset += SCORE_WIDTH;
    let activity_count = parse_num(&line[offset..offset + COUNT_WIDTH], "activity count")?;
    offset += COUNT_WIDTH;
    let refused_count = parse_num(&line[offset..offset + COUNT_WIDTH], "refused count")?;
    offset += COUNT_WIDTH;
    let whitelisted = parse_flag(line.as_bytes()[offset]);
    offset += FLAG_WIDTH;
    let blacklisted = parse_flag(line.as_bytes()[offset]);
    offset += FLAG_WIDTH;
    let last_reported = if legacy {
        0
    } else {
        parse_num(&line[offset..offset + TIMESTAMP_WIDTH], "last reported")?
    };

    Ok((
        address,
        IpState {
            last_activity,
            activity_score,
            activity_count,
            refused_count,
            whitelisted,
            blacklisted,
            last_reported,
            has_rule: false,
        },
        legacy,
    ))
}

pub fn render_bookmark_header(bookmark: &FileBookmark) -> String {
    format!(
        "{:>tw$}{:>tw$}",
        bookmark.bookmark,
        bookmark.size,
        tw = TIMESTAMP_WIDTH
    )
}

pub fn render_bookmark_record(path: &str, bookmark: &FileBookmark) -> String {
    format!("b{}{}", render_bookmark_header(bookmark), path)
}

pub fn parse_bookmark_record(line: &str) -> HostblockResult<(String, FileBookmark)> {
    if !line.is_ascii() || line.len() < SYNC_RECORD_LEN {
        return Err(HostblockError::DataCorruption(format!(
            "malformed b record: {line:?}"
        )));
    }
    let bookmark = parse_num(&line[1..1 + TIMESTAMP_WIDTH], "bookmark")?;
    let size = parse_num(
        &line[1 + TIMESTAMP_WIDTH..1 + NUMERIC_HEADER_WIDTH],
        "file size",
    )?;
    let path = line[1 + NUMERIC_HEADER_WIDTH..].trim().to_string();
    if path.is_empty() {
        return Err(HostblockError::DataCorruption(
            "b record without a path".to_string(),
        ));
    }
    Ok((path, FileBookmark { bookmark, size }))
}

pub fn render_blacklist_mutable(entry: &BlacklistEntry) -> String {
    format!(
        "{:>cw$}{:>fw$}",
        entry.total_reports,
        entry.confidence_score,
        cw = COUNT_WIDTH,
        fw = CONFIDENCE_WIDTH
    )
}

pub fn render_blacklist_record(address: &str, entry: &BlacklistEntry) -> String {
    format!(
        "a{:>aw$}{}",
        address,
        render_blacklist_mutable(entry),
        aw = ADDR_WIDTH
    )
}

pub fn parse_blacklist_record(line: &str) -> HostblockResult<(String, BlacklistEntry)> {
    if !line.is_ascii() || line.len() != BLACKLIST_RECORD_LEN {
        return Err(HostblockError::DataCorruption(format!(
            "a record length {}, expected {BLACKLIST_RECORD_LEN}",
            line.len()
        )));
    }
    let address = line[1..1 + ADDR_WIDTH].trim_start().to_string();
    let total_reports = parse_num(
        &line[1 + ADDR_WIDTH..1 + ADDR_WIDTH + COUNT_WIDTH],
        "total reports",
    )?;
    let confidence_score = parse_num(&line[1 + ADDR_WIDTH + COUNT_WIDTH..], "confidence")?;
    Ok((
        address,
        BlacklistEntry {
            total_reports,
            confidence_score,
            has_rule: false,
        },
    ))
}

pub fn render_sync_record(marker: &SyncMarker) -> String {
    format!(
        "s{:>tw$}{:>tw$}",
        marker.last_sync,
        marker.last_generated,
        tw = TIMESTAMP_WIDTH
    )
}

pub fn parse_sync_record(line: &str) -> HostblockResult<SyncMarker> {
    if !line.is_ascii() || line.len() != SYNC_RECORD_LEN {
        return Err(HostblockError::DataCorruption(format!(
            "s record length {}, expected {SYNC_RECORD_LEN}",
            line.len()
        )));
    }
    Ok(SyncMarker {
        last_sync: parse_num(&line[1..1 + TIMESTAMP_WIDTH], "sync time")?,
        last_generated: parse_num(&line[1 + TIMESTAMP_WIDTH..], "generation time")?,
    })
}

/// A tombstone line replacing a record of `record_len` bytes.
pub fn render_tombstone(record_len: usize) -> String {
    let mut line = String::with_capacity(record_len);
    line.push('r');
    for _ in 1..record_len {
        line.push(' ');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> IpState {
        IpState {
            last_activity: 1_714_012_345,
            activity_score: 43_200,
            activity_count: 17,
            refused_count: 3,
            whitelisted: false,
            blacklisted: true,
            last_reported: 1_714_000_000,
            has_rule: true,
        }
    }

    #[test]
    fn test_ip_record_width() {
        let line = render_ip_record("203.0.113.7", &sample_state());
        assert_eq!(line.len(), IP_RECORD_LEN);
        assert_eq!(IP_RECORD_LEN, 112);
        assert_eq!(BLACKLIST_RECORD_LEN, 53);
    }

    #[test]
    fn test_ip_record_round_trip() {
        let state = sample_state();
        let line = render_ip_record("203.0.113.7", &state);
        let (address, parsed, legacy) = parse_ip_record(&line).unwrap();
        assert_eq!(address, "203.0.113.7");
        assert!(!legacy);
        // has_rule is transient and never persisted.
        assert!(!parsed.has_rule);
        assert_eq!(parsed.last_activity, state.last_activity);
        assert_eq!(parsed.activity_score, state.activity_score);
        assert_eq!(parsed.activity_count, state.activity_count);
        assert_eq!(parsed.refused_count, state.refused_count);
        assert_eq!(parsed.blacklisted, state.blacklisted);
        assert_eq!(parsed.last_reported, state.last_reported);
    }

    #[test]
    fn test_legacy_ip_record_parses_without_report_timestamp() {
        let full = render_ip_record("198.51.100.1", &sample_state());
        let legacy_line = &full[..LEGACY_IP_RECORD_LEN];
        let (address, parsed, legacy) = parse_ip_record(legacy_line).unwrap();
        assert_eq!(address, "198.51.100.1");
        assert!(legacy);
        assert_eq!(parsed.last_reported, 0);
    }

    #[test]
    fn test_ip_record_bad_length_is_corruption() {
        assert!(matches!(
            parse_ip_record("d   1.2.3.4"),
            Err(HostblockError::DataCorruption(_))
        ));
    }

    #[test]
    fn test_bookmark_record_round_trip() {
        let bookmark = FileBookmark {
            bookmark: 4096,
            size: 8192,
        };
        let line = render_bookmark_record("/var/log/auth.log", &bookmark);
        let (path, parsed) = parse_bookmark_record(&line).unwrap();
        assert_eq!(path, "/var/log/auth.log");
        assert_eq!(parsed, bookmark);
    }

    #[test]
    fn test_blacklist_record_round_trip() {
        let entry = BlacklistEntry {
            total_reports: 120,
            confidence_score: 96,
            has_rule: false,
        };
        let line = render_blacklist_record("2001:db8::7", &entry);
        assert_eq!(line.len(), BLACKLIST_RECORD_LEN);
        let (address, parsed) = parse_blacklist_record(&line).unwrap();
        assert_eq!(address, "2001:db8::7");
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_sync_record_round_trip() {
        let marker = SyncMarker {
            last_sync: 1_714_012_345,
            last_generated: 1_714_012_000,
        };
        let line = render_sync_record(&marker);
        assert_eq!(line.len(), SYNC_RECORD_LEN);
        assert_eq!(parse_sync_record(&line).unwrap(), marker);
    }

    #[test]
    fn test_tombstone_preserves_length() {
        let line = render_tombstone(IP_RECORD_LEN);
        assert_eq!(line.len(), IP_RECORD_LEN);
        assert!(line.starts_with('r'));
        assert!(line[1..].bytes().all(|b| b == b' '));
    }
}
