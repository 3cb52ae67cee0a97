//! Append-and-patch record store.
//!
//! All daemon state lives in a single line-oriented ASCII file: address
//! records, log file bookmarks, the remote blacklist and the sync marker
//! (see [`layout`] for the exact widths). Single-record changes are
//! patched in place: every mutable region has a constant length, so a
//! write either lands completely or leaves a parseable stale record, and
//! byte offsets of the following records never move. Removal overwrites
//! a record with a length-preserving tombstone; the file is compacted on
//! load once enough tombstones pile up.

pub mod layout;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hostblock_shared::errors::{HostblockError, HostblockResult};
use tracing::{debug, info, warn};

/// Longest address the fixed-width layout can hold.
pub const MAX_ADDRESS_LEN: usize = layout::ADDR_WIDTH;

const LOCK_TRIES: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Per-address record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpState {
    /// Unix seconds of the most recent match.
    pub last_activity: u64,
    /// Decaying activity score; seconds of remaining block budget when a
    /// multiplier is configured.
    pub activity_score: u32,
    /// Matches against suspicious-activity patterns.
    pub activity_count: u32,
    /// Matches against refused-connection patterns.
    pub refused_count: u32,
    pub whitelisted: bool,
    pub blacklisted: bool,
    /// Unix seconds of the most recent report enqueue.
    pub last_reported: u64,
    /// Transient: a matching firewall rule was observed in the last
    /// reconciliation. Never persisted.
    pub has_rule: bool,
}

/// Read position for one followed log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileBookmark {
    /// Byte offset of the first unread byte.
    pub bookmark: u64,
    /// File size observed at the last read; shrinkage means rotation.
    pub size: u64,
}

/// One address from the remote reputation blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlacklistEntry {
    pub total_reports: u32,
    /// 0..=100.
    pub confidence_score: u8,
    /// Transient, like [`IpState::has_rule`].
    pub has_rule: bool,
}

/// Local and remote timestamps of the last blacklist sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncMarker {
    pub last_sync: u64,
    pub last_generated: u64,
}

/// Everything the store persists, as in-memory maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSet {
    pub ips: BTreeMap<String, IpState>,
    /// Keyed by log file path.
    pub bookmarks: BTreeMap<String, FileBookmark>,
    pub blacklist: BTreeMap<String, BlacklistEntry>,
    pub sync: SyncMarker,
}

#[derive(Default)]
struct LoadStats {
    duplicates: bool,
    malformed: bool,
    legacy: bool,
    tombstones: usize,
}

/// Handle on the data file.
#[derive(Debug, Clone)]
pub struct DataStore {
    path: PathBuf,
}

impl DataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the whole data file into memory.
    ///
    /// A missing file is created empty. Duplicate or malformed records
    /// rename the current file to a timestamped `.bck` backup and rewrite
    /// a compacted copy; legacy short records and an excess of tombstones
    /// trigger a plain rewrite.
    pub fn load(&self) -> HostblockResult<DataSet> {
        info!("loading data from {}", self.path.display());
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("data file missing, creating an empty one");
                let data = DataSet::default();
                self.save_all(&data)?;
                return Ok(data);
            }
            Err(e) => return Err(e.into()),
        };
        lock(&file, libc::LOCK_SH, &self.path)?;
        let parsed = read_records(&file);
        unlock(&file);
        let (data, stats) = parsed?;

        if stats.duplicates || stats.malformed {
            self.backup_and_rewrite(&data)?;
        } else if stats.legacy {
            info!("legacy address records detected, rewriting data file");
            self.save_all(&data)?;
        } else if stats.tombstones > layout::TOMBSTONE_COMPACT_THRESHOLD {
            info!(
                "{} removed records in data file, compacting",
                stats.tombstones
            );
            self.save_all(&data)?;
        }

        info!("loaded {} address record(s)", data.ips.len());
        Ok(data)
    }

    /// Rewrite the whole file from the in-memory maps.
    pub fn save_all(&self, data: &DataSet) -> HostblockResult<()> {
        debug!("rewriting data in {}", self.path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        lock(&file, libc::LOCK_EX, &self.path)?;
        let result = write_all_records(&file, data);
        unlock(&file);
        result
    }

    pub fn append_ip(&self, address: &str, state: &IpState) -> HostblockResult<()> {
        debug!("appending address {address} to data file");
        check_address(address)?;
        self.append_line(&layout::render_ip_record(address, state))
    }

    /// Patch the mutable region of an address record in place.
    /// Returns false when no live record carries the address.
    pub fn update_ip(&self, address: &str, state: &IpState) -> HostblockResult<bool> {
        debug!("updating address {address} in data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            if tag == layout::TAG_IP {
                let found = read_fixed(&mut file, layout::ADDR_WIDTH)?;
                if found.trim_start() == address {
                    file.write_all(layout::render_ip_mutable(state).as_bytes())?;
                    return Ok(true);
                }
                skip(&mut file, layout::IP_MUTABLE_WIDTH + 1)?;
            } else {
                skip_other_record(&mut file)?;
            }
        }
        warn!("cannot update {address}, record not found in data file");
        Ok(false)
    }

    /// Tombstone an address record. Returns false when it is not present.
    pub fn remove_ip(&self, address: &str) -> HostblockResult<bool> {
        debug!("removing address {address} from data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            if tag == layout::TAG_IP {
                let found = read_fixed(&mut file, layout::ADDR_WIDTH)?;
                if found.trim_start() == address {
                    file.seek(SeekFrom::Current(-((1 + layout::ADDR_WIDTH) as i64)))?;
                    file.write_all(layout::render_tombstone(layout::IP_RECORD_LEN).as_bytes())?;
                    return Ok(true);
                }
                skip(&mut file, layout::IP_MUTABLE_WIDTH + 1)?;
            } else {
                skip_other_record(&mut file)?;
            }
        }
        warn!("cannot remove {address}, record not found in data file");
        Ok(false)
    }

    pub fn append_file(&self, path: &str, bookmark: &FileBookmark) -> HostblockResult<()> {
        debug!("appending bookmark for {path} to data file");
        self.append_line(&layout::render_bookmark_record(path, bookmark))
    }

    /// Patch a bookmark record's numeric header in place.
    pub fn update_file(&self, path: &str, bookmark: &FileBookmark) -> HostblockResult<bool> {
        debug!("updating bookmark for {path} in data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            match tag {
                layout::TAG_IP => skip(&mut file, layout::IP_RECORD_LEN)?,
                layout::TAG_BOOKMARK => {
                    let header_pos = file.stream_position()?;
                    skip(&mut file, layout::NUMERIC_HEADER_WIDTH)?;
                    let found = read_to_lf(&mut file)?;
                    if found.trim() == path {
                        file.seek(SeekFrom::Start(header_pos))?;
                        file.write_all(layout::render_bookmark_header(bookmark).as_bytes())?;
                        return Ok(true);
                    }
                }
                _ => skip_other_record(&mut file)?,
            }
        }
        warn!("cannot update bookmark for {path}, record not found in data file");
        Ok(false)
    }

    /// Tombstone a bookmark record.
    pub fn remove_file(&self, path: &str) -> HostblockResult<bool> {
        debug!("removing bookmark for {path} from data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            match tag {
                layout::TAG_IP => skip(&mut file, layout::IP_RECORD_LEN)?,
                layout::TAG_BOOKMARK => {
                    let header_pos = file.stream_position()?;
                    skip(&mut file, layout::NUMERIC_HEADER_WIDTH)?;
                    let found = read_to_lf(&mut file)?;
                    if found.trim() == path {
                        let record_len = 1 + layout::NUMERIC_HEADER_WIDTH + found.len();
                        file.seek(SeekFrom::Start(header_pos - 1))?;
                        file.write_all(layout::render_tombstone(record_len).as_bytes())?;
                        return Ok(true);
                    }
                }
                _ => skip_other_record(&mut file)?,
            }
        }
        warn!("cannot remove bookmark for {path}, record not found in data file");
        Ok(false)
    }

    pub fn append_blacklist(&self, address: &str, entry: &BlacklistEntry) -> HostblockResult<()> {
        debug!("appending blacklist entry {address} to data file");
        check_address(address)?;
        self.append_line(&layout::render_blacklist_record(address, entry))
    }

    /// Patch a blacklist record's mutable region in place.
    pub fn update_blacklist(&self, address: &str, entry: &BlacklistEntry) -> HostblockResult<bool> {
        debug!("updating blacklist entry {address} in data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            match tag {
                layout::TAG_IP => skip(&mut file, layout::IP_RECORD_LEN)?,
                layout::TAG_BLACKLIST => {
                    let found = read_fixed(&mut file, layout::ADDR_WIDTH)?;
                    if found.trim_start() == address {
                        file.write_all(layout::render_blacklist_mutable(entry).as_bytes())?;
                        return Ok(true);
                    }
                    skip(&mut file, layout::BLACKLIST_MUTABLE_WIDTH + 1)?;
                }
                _ => skip_other_record(&mut file)?,
            }
        }
        warn!("cannot update blacklist entry {address}, record not found in data file");
        Ok(false)
    }

    /// Tombstone a blacklist record.
    pub fn remove_blacklist(&self, address: &str) -> HostblockResult<bool> {
        debug!("removing blacklist entry {address} from data file");
        let Some(mut file) = self.open_rw()? else {
            return Ok(false);
        };
        loop {
            let Some(tag) = read_tag(&mut file)? else {
                break;
            };
            match tag {
                layout::TAG_IP => skip(&mut file, layout::IP_RECORD_LEN)?,
                layout::TAG_BLACKLIST => {
                    let found = read_fixed(&mut file, layout::ADDR_WIDTH)?;
                    if found.trim_start() == address {
                        file.seek(SeekFrom::Current(-((1 + layout::ADDR_WIDTH) as i64)))?;
                        file.write_all(
                            layout::render_tombstone(layout::BLACKLIST_RECORD_LEN).as_bytes(),
                        )?;
                        return Ok(true);
                    }
                    skip(&mut file, layout::BLACKLIST_MUTABLE_WIDTH + 1)?;
                }
                _ => skip_other_record(&mut file)?,
            }
        }
        warn!("cannot remove blacklist entry {address}, record not found in data file");
        Ok(false)
    }

    /// Patch the sync marker, appending one when the file has none yet.
    pub fn update_sync_marker(&self, marker: &SyncMarker) -> HostblockResult<()> {
        debug!("updating sync marker in data file");
        if let Some(mut file) = self.open_rw()? {
            loop {
                let Some(tag) = read_tag(&mut file)? else {
                    break;
                };
                match tag {
                    layout::TAG_IP => skip(&mut file, layout::IP_RECORD_LEN)?,
                    layout::TAG_SYNC => {
                        let record = layout::render_sync_record(marker);
                        file.write_all(record[1..].as_bytes())?;
                        return Ok(());
                    }
                    _ => skip_other_record(&mut file)?,
                }
            }
        }
        self.append_line(&layout::render_sync_record(marker))
    }

    fn open_rw(&self) -> HostblockResult<Option<File>> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("data file {} does not exist", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn append_line(&self, record: &str) -> HostblockResult<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        lock(&file, libc::LOCK_EX, &self.path)?;
        let result = file
            .write_all(record.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(HostblockError::from);
        unlock(&file);
        result
    }

    fn backup_and_rewrite(&self, data: &DataSet) -> HostblockResult<()> {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let backup = PathBuf::from(format!("{}_{timestamp}.bck", self.path.display()));
        if backup.exists() {
            return Err(HostblockError::DataCorruption(format!(
                "cannot back up data file, {} already exists",
                backup.display()
            )));
        }
        std::fs::rename(&self.path, &backup)?;
        self.save_all(data)?;
        warn!(
            "data file contained duplicate or malformed records; original kept as {}, \
             compacted file written (merge manually if needed)",
            backup.display()
        );
        Ok(())
    }
}

fn check_address(address: &str) -> HostblockResult<()> {
    if address.len() > MAX_ADDRESS_LEN || !address.is_ascii() {
        return Err(HostblockError::DataCorruption(format!(
            "address does not fit the {MAX_ADDRESS_LEN}-byte field: {address}"
        )));
    }
    Ok(())
}

fn lock(file: &File, operation: i32, path: &Path) -> HostblockResult<()> {
    for attempt in 1..=LOCK_TRIES {
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(());
        }
        if attempt < LOCK_TRIES {
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }
    Err(HostblockError::Lock(format!(
        "{} still locked after {LOCK_TRIES} attempts",
        path.display()
    )))
}

fn unlock(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

fn read_records(file: &File) -> HostblockResult<(DataSet, LoadStats)> {
    let mut data = DataSet::default();
    let mut stats = LoadStats::default();
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match line.as_bytes()[0] {
            layout::TAG_IP => match layout::parse_ip_record(&line) {
                Ok((address, mut state, legacy)) => {
                    if legacy {
                        stats.legacy = true;
                    }
                    if state.whitelisted && state.blacklisted {
                        warn!(
                            "address {address} is both whitelisted and blacklisted, \
                             removing it from the blacklist"
                        );
                        state.blacklisted = false;
                    }
                    if data.ips.insert(address.clone(), state).is_some() {
                        warn!("address {address} is duplicated in the data file");
                        stats.duplicates = true;
                    }
                }
                Err(e) => {
                    warn!("skipping malformed address record: {e}");
                    stats.malformed = true;
                }
            },
            layout::TAG_BOOKMARK => match layout::parse_bookmark_record(&line) {
                Ok((path, bookmark)) => {
                    if data.bookmarks.insert(path.clone(), bookmark).is_some() {
                        warn!("bookmark for {path} is duplicated in the data file");
                        stats.duplicates = true;
                    }
                }
                Err(e) => {
                    warn!("skipping malformed bookmark record: {e}");
                    stats.malformed = true;
                }
            },
            layout::TAG_BLACKLIST => match layout::parse_blacklist_record(&line) {
                Ok((address, entry)) => {
                    if data.blacklist.insert(address.clone(), entry).is_some() {
                        warn!("blacklist entry {address} is duplicated in the data file");
                        stats.duplicates = true;
                    }
                }
                Err(e) => {
                    warn!("skipping malformed blacklist record: {e}");
                    stats.malformed = true;
                }
            },
            layout::TAG_SYNC => match layout::parse_sync_record(&line) {
                Ok(marker) => data.sync = marker,
                Err(e) => {
                    warn!("skipping malformed sync record: {e}");
                    stats.malformed = true;
                }
            },
            layout::TAG_TOMBSTONE => stats.tombstones += 1,
            other => {
                warn!("skipping record with unknown tag {:?}", other as char);
                stats.malformed = true;
            }
        }
    }

    Ok((data, stats))
}

fn write_all_records(file: &File, data: &DataSet) -> HostblockResult<()> {
    file.set_len(0)?;
    let mut writer = BufWriter::new(file);
    for (address, state) in &data.ips {
        if check_address(address).is_err() {
            warn!("skipping over-long address on save: {address}");
            continue;
        }
        writer.write_all(layout::render_ip_record(address, state).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    for (path, bookmark) in &data.bookmarks {
        writer.write_all(layout::render_bookmark_record(path, bookmark).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    for (address, entry) in &data.blacklist {
        if check_address(address).is_err() {
            warn!("skipping over-long blacklist address on save: {address}");
            continue;
        }
        writer.write_all(layout::render_blacklist_record(address, entry).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    if data.sync != SyncMarker::default() {
        writer.write_all(layout::render_sync_record(&data.sync).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn read_tag(file: &mut File) -> HostblockResult<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte)? {
            0 => return Ok(None),
            // Tolerate stray newlines between records.
            _ if byte[0] == b'\n' => continue,
            _ => return Ok(Some(byte[0])),
        }
    }
}

fn read_fixed(file: &mut File, len: usize) -> HostblockResult<String> {
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| HostblockError::DataCorruption("non-ASCII bytes in record".to_string()))
}

fn skip(file: &mut File, bytes: usize) -> HostblockResult<()> {
    file.seek(SeekFrom::Current(bytes as i64))?;
    Ok(())
}

/// Skip a record of unknown type: the tag has been consumed, so step over
/// the shortest possible body (the 40-byte numeric header every non-`d`
/// record at least carries) and read the remainder up to the line feed.
fn skip_other_record(file: &mut File) -> HostblockResult<()> {
    skip(file, layout::NUMERIC_HEADER_WIDTH)?;
    read_to_lf(file)?;
    Ok(())
}

/// Read up to (and including) the next LF, returning the bytes before it.
fn read_to_lf(file: &mut File) -> HostblockResult<String> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte)? {
            0 => break,
            _ if byte[0] == b'\n' => break,
            _ => out.push(byte[0]),
        }
    }
    String::from_utf8(out)
        .map_err(|_| HostblockError::DataCorruption("non-ASCII bytes in record".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (DataStore, TempDir) {
        let dir = TempDir::new().expect("create temp dir");
        let store = DataStore::new(dir.path().join("hostblock.data"));
        (store, dir)
    }

    fn state(score: u32) -> IpState {
        IpState {
            last_activity: 1_700_000_000,
            activity_score: score,
            activity_count: 2,
            refused_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_is_created_empty() {
        let (store, _dir) = store();
        let data = store.load().unwrap();
        assert!(data.ips.is_empty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_all_load_round_trip() {
        let (store, _dir) = store();
        let mut data = DataSet::default();
        data.ips.insert("203.0.113.7".to_string(), state(100));
        data.ips.insert(
            "2001:db8::42".to_string(),
            IpState {
                whitelisted: true,
                ..state(7)
            },
        );
        data.bookmarks.insert(
            "/var/log/auth.log".to_string(),
            FileBookmark {
                bookmark: 512,
                size: 1024,
            },
        );
        data.blacklist.insert(
            "198.51.100.9".to_string(),
            BlacklistEntry {
                total_reports: 44,
                confidence_score: 97,
                has_rule: false,
            },
        );
        data.sync = SyncMarker {
            last_sync: 1_700_000_100,
            last_generated: 1_700_000_050,
        };

        store.save_all(&data).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_append_update_remove_sequence() {
        // Append, update, remove; a reload ends without the address.
        let (store, _dir) = store();
        store.load().unwrap();
        store.append_ip("10.0.0.1", &state(5)).unwrap();
        let mut updated = state(5);
        updated.activity_score = 50;
        updated.refused_count = 9;
        assert!(store.update_ip("10.0.0.1", &updated).unwrap());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ips["10.0.0.1"].activity_score, 50);
        assert_eq!(loaded.ips["10.0.0.1"].refused_count, 9);

        assert!(store.remove_ip("10.0.0.1").unwrap());
        let loaded = store.load().unwrap();
        assert!(!loaded.ips.contains_key("10.0.0.1"));
    }

    #[test]
    fn test_remove_twice_reports_failure_without_corruption() {
        // The second removal fails but the file stays structurally intact.
        let (store, _dir) = store();
        store.load().unwrap();
        store.append_ip("10.0.0.1", &state(5)).unwrap();
        store.append_ip("10.0.0.2", &state(6)).unwrap();

        assert!(store.remove_ip("10.0.0.1").unwrap());
        assert!(!store.remove_ip("10.0.0.1").unwrap());

        let loaded = store.load().unwrap();
        assert!(!loaded.ips.contains_key("10.0.0.1"));
        assert_eq!(loaded.ips["10.0.0.2"].activity_score, 6);
    }

    #[test]
    fn test_tombstones_and_sync_marker_load_to_empty_map() {
        let (store, _dir) = store();
        let content = format!(
            "{}\n{}\n{}\n",
            layout::render_tombstone(layout::IP_RECORD_LEN),
            layout::render_tombstone(layout::IP_RECORD_LEN),
            layout::render_sync_record(&SyncMarker {
                last_sync: 11,
                last_generated: 7,
            })
        );
        std::fs::write(store.path(), content).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.ips.is_empty());
        assert_eq!(loaded.sync.last_sync, 11);
    }

    #[test]
    fn test_duplicates_trigger_backup_and_compaction() {
        let (store, dir) = store();
        let line = layout::render_ip_record("192.0.2.4", &state(9));
        std::fs::write(store.path(), format!("{line}\n{line}\n")).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ips.len(), 1);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bck"))
            .collect();
        assert_eq!(backups.len(), 1);

        // The rewritten file holds exactly one record for the address.
        let rewritten = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(rewritten.matches("192.0.2.4").count(), 1);
    }

    #[test]
    fn test_whitelist_wins_over_blacklist_on_load() {
        let (store, _dir) = store();
        let mut conflicted = state(9);
        conflicted.whitelisted = true;
        conflicted.blacklisted = true;
        let line = layout::render_ip_record("198.51.100.1", &conflicted);
        std::fs::write(store.path(), format!("{line}\n")).unwrap();

        let loaded = store.load().unwrap();
        let st = &loaded.ips["198.51.100.1"];
        assert!(st.whitelisted);
        assert!(!st.blacklisted);
    }

    #[test]
    fn test_legacy_records_are_rewritten_full_width() {
        let (store, _dir) = store();
        let full = layout::render_ip_record("10.1.2.3", &state(4));
        let legacy = &full[..layout::LEGACY_IP_RECORD_LEN];
        std::fs::write(store.path(), format!("{legacy}\n")).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ips["10.1.2.3"].last_reported, 0);

        let rewritten = std::fs::read_to_string(store.path()).unwrap();
        let line = rewritten.lines().next().unwrap();
        assert_eq!(line.len(), layout::IP_RECORD_LEN);
    }

    #[test]
    fn test_update_preserves_following_records() {
        let (store, _dir) = store();
        store.load().unwrap();
        store.append_ip("10.0.0.1", &state(1)).unwrap();
        store
            .append_file(
                "/var/log/auth.log",
                &FileBookmark {
                    bookmark: 10,
                    size: 20,
                },
            )
            .unwrap();
        store.append_ip("10.0.0.2", &state(2)).unwrap();
        store
            .append_blacklist(
                "10.0.0.3",
                &BlacklistEntry {
                    total_reports: 1,
                    confidence_score: 91,
                    has_rule: false,
                },
            )
            .unwrap();

        let mut updated = state(1);
        updated.activity_score = 777;
        assert!(store.update_ip("10.0.0.1", &updated).unwrap());
        assert!(
            store
                .update_file(
                    "/var/log/auth.log",
                    &FileBookmark {
                        bookmark: 99,
                        size: 200,
                    },
                )
                .unwrap()
        );
        assert!(
            store
                .update_blacklist(
                    "10.0.0.3",
                    &BlacklistEntry {
                        total_reports: 2,
                        confidence_score: 95,
                        has_rule: true,
                    },
                )
                .unwrap()
        );

        let loaded = store.load().unwrap();
        assert_eq!(loaded.ips["10.0.0.1"].activity_score, 777);
        assert_eq!(loaded.ips["10.0.0.2"].activity_score, 2);
        assert_eq!(loaded.bookmarks["/var/log/auth.log"].bookmark, 99);
        assert_eq!(loaded.blacklist["10.0.0.3"].confidence_score, 95);
        // has_rule is transient.
        assert!(!loaded.blacklist["10.0.0.3"].has_rule);
    }

    #[test]
    fn test_remove_file_tombstones_whole_line() {
        let (store, _dir) = store();
        store.load().unwrap();
        store
            .append_file(
                "/var/log/auth.log",
                &FileBookmark {
                    bookmark: 10,
                    size: 20,
                },
            )
            .unwrap();
        store.append_ip("10.0.0.2", &state(2)).unwrap();

        assert!(store.remove_file("/var/log/auth.log").unwrap());
        assert!(!store.remove_file("/var/log/auth.log").unwrap());

        let loaded = store.load().unwrap();
        assert!(loaded.bookmarks.is_empty());
        assert_eq!(loaded.ips["10.0.0.2"].activity_score, 2);
    }

    #[test]
    fn test_sync_marker_is_appended_then_patched() {
        let (store, _dir) = store();
        store.load().unwrap();
        store.append_ip("10.0.0.1", &state(1)).unwrap();

        store
            .update_sync_marker(&SyncMarker {
                last_sync: 100,
                last_generated: 90,
            })
            .unwrap();
        store
            .update_sync_marker(&SyncMarker {
                last_sync: 200,
                last_generated: 190,
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(
            loaded.sync,
            SyncMarker {
                last_sync: 200,
                last_generated: 190,
            }
        );
        // Patched in place, not appended twice.
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.matches("\ns").count() + content.matches("^s").count(), 1);
    }

    #[test]
    fn test_over_long_address_is_rejected() {
        let (store, _dir) = store();
        store.load().unwrap();
        let long = "1".repeat(MAX_ADDRESS_LEN + 1);
        assert!(store.append_ip(&long, &state(1)).is_err());
    }
}
