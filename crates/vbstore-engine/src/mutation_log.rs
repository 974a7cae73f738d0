//! Append-only log of key to row id associations.
//!
//! The log lets warmup rebuild the key map without scanning the underlying
//! store. Layout:
//!
//! ```text
//! header block: | magic 4B | version 4B | block size 4B | crc32c 4B | padding |
//! data block:   | crc32c 4B | record count 2B | records ... | zero padding |
//! record:       | type 1B | vbucket 2B | row id 8B | key len 2B | key |
//! ```
//!
//! Every block is exactly `block_size` bytes. The block CRC covers everything
//! after the CRC field. Records between a `Commit1` and the following
//! `Commit2` belong to one flusher transaction; replay only trusts records
//! followed by a `Commit2`.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use vbstore_common::config::{LogSyncMode, MutationLogConfig};
use vbstore_common::{Error, Result, VBucketId};

/// Log header magic number
const LOG_MAGIC: u32 = 0x4D4C_4F47; // "MLOG"

const LOG_VERSION: u32 = 1;

/// Bytes of the header block that carry data
const HEADER_LEN: usize = 16;

/// CRC plus record count
const BLOCK_HEADER_SIZE: usize = 6;

/// Type, vbucket, row id and key length
const RECORD_HEADER_SIZE: usize = 13;

/// Kind of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogRecordType {
    New = 0,
    Del = 1,
    DelAll = 2,
    Commit1 = 3,
    Commit2 = 4,
}

impl LogRecordType {
    pub const ALL: [Self; 5] = [
        Self::New,
        Self::Del,
        Self::DelAll,
        Self::Commit1,
        Self::Commit2,
    ];

    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            1 => Some(Self::Del),
            2 => Some(Self::DelAll),
            3 => Some(Self::Commit1),
            4 => Some(Self::Commit2),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Del => "del",
            Self::DelAll => "delall",
            Self::Commit1 => "commit1",
            Self::Commit2 => "commit2",
        }
    }
}

/// One decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: LogRecordType,
    pub vbucket: VBucketId,
    pub row_id: i64,
    pub key: String,
}

impl LogRecord {
    fn new(kind: LogRecordType, vbucket: VBucketId, key: &str, row_id: i64) -> Self {
        Self {
            kind,
            vbucket,
            row_id,
            key: key.to_string(),
        }
    }

    fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.vbucket.to_le_bytes());
        buf.extend_from_slice(&self.row_id.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
    }

    /// Decode one record, returning it and its encoded length
    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(Error::corruption("log record header truncated"));
        }
        let kind = LogRecordType::from_u8(data[0])
            .ok_or_else(|| Error::corruption(format!("unknown log record type {}", data[0])))?;
        let vbucket = u16::from_le_bytes([data[1], data[2]]);
        let mut row = [0u8; 8];
        row.copy_from_slice(&data[3..11]);
        let row_id = i64::from_le_bytes(row);
        let key_len = usize::from(u16::from_le_bytes([data[11], data[12]]));
        let end = RECORD_HEADER_SIZE + key_len;
        if data.len() < end {
            return Err(Error::corruption("log record key truncated"));
        }
        let key = std::str::from_utf8(&data[RECORD_HEADER_SIZE..end])
            .map_err(|e| Error::corruption(format!("log record key is not utf-8: {e}")))?
            .to_string();
        Ok((
            Self {
                kind,
                vbucket,
                row_id,
                key,
            },
            end,
        ))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_header(block_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block_size);
    buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
    buf.extend_from_slice(&LOG_VERSION.to_le_bytes());
    buf.extend_from_slice(&(block_size as u32).to_le_bytes());
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.resize(block_size, 0);
    buf
}

/// Read and validate the header, returning the block size
fn read_header(file: &mut File) -> Result<usize> {
    let mut buf = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::InvalidLogHeader("file too small".into())
        } else {
            Error::Io(e)
        }
    })?;
    let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    if word(0) != LOG_MAGIC {
        return Err(Error::InvalidLogHeader(format!("bad magic {:#010x}", word(0))));
    }
    if word(4) != LOG_VERSION {
        return Err(Error::InvalidLogHeader(format!("unsupported version {}", word(4))));
    }
    if crc32c::crc32c(&buf[..12]) != word(12) {
        return Err(Error::InvalidLogHeader("header checksum mismatch".into()));
    }
    let block_size = word(8) as usize;
    if block_size < 512 || !block_size.is_power_of_two() {
        return Err(Error::InvalidLogHeader(format!("bad block size {block_size}")));
    }
    Ok(block_size)
}

struct LogInner {
    path: Option<PathBuf>,
    /// `None` while the log is disabled
    file: Option<File>,
    block_size: usize,
    /// Encoded records of the block being filled
    block: Vec<u8>,
    count: u16,
    /// Bytes on disk
    size: u64,
}

impl LogInner {
    /// Stop logging and empty the file on disk
    ///
    /// Records stop reaching the file from here on, so its contents no
    /// longer cover every persisted key. An empty log sends the next warmup
    /// to a full scan.
    fn disable(&mut self, reason: &Error) {
        if let Some(file) = self.file.take() {
            warn!("Disabling mutation log: {}", reason);
            self.invalidate(&file);
        }
        self.block.clear();
        self.count = 0;
        self.size = 0;
    }

    fn invalidate(&self, file: &File) {
        let truncated = file.set_len(0).and_then(|()| file.sync_all());
        let Err(e) = truncated else {
            return;
        };
        let Some(path) = self.path.as_ref() else {
            return;
        };
        warn!(path = %path.display(), "Could not truncate mutation log, removing it: {}", e);
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != ErrorKind::NotFound
        {
            error!(path = %path.display(), "Stale mutation log left on disk: {}", e);
        }
    }

    fn append(&mut self, record: &LogRecord) {
        if self.file.is_none() {
            return;
        }
        if BLOCK_HEADER_SIZE + record.encoded_len() > self.block_size {
            warn!(key = %record.key, "Key too long for a mutation log block");
            return;
        }
        if BLOCK_HEADER_SIZE + self.block.len() + record.encoded_len() > self.block_size
            || self.count == u16::MAX
        {
            self.flush();
        }
        record.encode_into(&mut self.block);
        self.count += 1;
    }

    fn flush(&mut self) {
        if self.count == 0 {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut buf = Vec::with_capacity(self.block_size);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.block);
        buf.resize(self.block_size, 0);
        let crc = crc32c::crc32c(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_le_bytes());

        match file.write_all(&buf) {
            Ok(()) => {
                self.size += buf.len() as u64;
                self.block.clear();
                self.count = 0;
            }
            Err(e) => self.disable(&Error::Io(e)),
        }
    }

    fn sync(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.sync_data() {
            self.disable(&Error::Io(e));
        }
    }
}

/// The mutation log
pub struct MutationLog {
    path: Option<PathBuf>,
    sync_mode: LogSyncMode,
    inner: Mutex<LogInner>,
    logged: [AtomicU64; 5],
}

impl MutationLog {
    /// Create a log handle; nothing is opened until [`MutationLog::open`]
    pub fn new(config: &MutationLogConfig) -> Self {
        Self::at(config.path.clone(), config.block_size, config.sync)
    }

    fn at(path: Option<PathBuf>, block_size: usize, sync_mode: LogSyncMode) -> Self {
        Self {
            path: path.clone(),
            sync_mode,
            inner: Mutex::new(LogInner {
                path,
                file: None,
                block_size,
                block: Vec::new(),
                count: 0,
                size: 0,
            }),
            logged: Default::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Path of the temporary file compaction writes
    pub fn compact_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|p| {
            let mut name = p.as_os_str().to_owned();
            name.push(".compact");
            PathBuf::from(name)
        })
    }

    /// Open or create the log file
    ///
    /// Without a configured path the log stays disabled. A torn partial
    /// block at the tail is cut off.
    pub fn open(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            info!("No mutation log path configured, mutation log disabled");
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut inner = self.inner.lock();
        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&encode_header(inner.block_size))?;
            file.sync_all()?;
        } else {
            let block_size = read_header(&mut file)?;
            if block_size != inner.block_size {
                info!(
                    file = block_size,
                    configured = inner.block_size,
                    "Using block size of existing mutation log"
                );
                inner.block_size = block_size;
            }
        }
        let block_size = inner.block_size as u64;
        let len = file.metadata()?.len();
        let size = len - len % block_size;
        if size != len {
            warn!(path = %path.display(), "Truncating torn mutation log tail");
            file.set_len(size)?;
        }
        file.seek(SeekFrom::Start(size))?;
        inner.size = size;
        inner.block.clear();
        inner.count = 0;
        inner.file = Some(file);
        debug!(path = %path.display(), size, "mutation log opened");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    /// Stop logging; buffered records are dropped and the file is emptied
    pub fn disable(&self) {
        self.inner
            .lock()
            .disable(&Error::internal("disabled on request"));
    }

    fn write(&self, record: &LogRecord) {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return;
        }
        inner.append(record);
        self.logged[record.kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_item(&self, vbucket: VBucketId, key: &str, row_id: i64) {
        self.write(&LogRecord::new(LogRecordType::New, vbucket, key, row_id));
    }

    pub fn del_item(&self, vbucket: VBucketId, key: &str) {
        self.write(&LogRecord::new(LogRecordType::Del, vbucket, key, 0));
    }

    pub fn delete_all(&self, vbucket: VBucketId) {
        self.write(&LogRecord::new(LogRecordType::DelAll, vbucket, "", 0));
    }

    /// Mark the start of a transaction commit
    pub fn commit1(&self) {
        self.write(&LogRecord::new(LogRecordType::Commit1, 0, "", 0));
        let mut inner = self.inner.lock();
        inner.flush();
        if self.sync_mode.sync_on_commit1() {
            inner.sync();
        }
    }

    /// Mark a transaction as fully committed
    pub fn commit2(&self) {
        self.write(&LogRecord::new(LogRecordType::Commit2, 0, "", 0));
        let mut inner = self.inner.lock();
        inner.flush();
        if self.sync_mode.sync_on_commit2() {
            inner.sync();
        }
    }

    /// Write out the partially filled block
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    pub fn sync(&self) {
        self.inner.lock().sync();
    }

    /// Records of `kind` written since open (or since the last reset)
    pub fn items_logged(&self, kind: LogRecordType) -> u64 {
        self.logged[kind as usize].load(Ordering::Relaxed)
    }

    /// Seed the counters with what replay found in the existing file
    pub fn reset_counts(&self, seen: &HashMap<LogRecordType, u64>) {
        for kind in LogRecordType::ALL {
            self.logged[kind as usize].store(
                seen.get(&kind).copied().unwrap_or(0),
                Ordering::Relaxed,
            );
        }
    }

    /// Bytes on disk
    pub fn log_size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Whether the log has grown enough, relative to the live keys, to be
    /// worth compacting
    pub fn should_compact(&self, config: &MutationLogConfig, queue_size: usize) -> bool {
        let new = self.items_logged(LogRecordType::New);
        let del = self.items_logged(LogRecordType::Del);
        let logged = new + del;
        let unique = new.saturating_sub(del);
        self.is_enabled()
            && self.log_size() > config.max_log_size
            && logged > config.max_entry_ratio.saturating_mul(unique)
            && queue_size < config.queue_cap
    }

    /// Create an empty log next to this one for compaction
    pub fn create_compacted(&self) -> Result<Self> {
        let path = self
            .compact_path()
            .ok_or_else(|| Error::configuration("mutation log has no path"))?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let block_size = self.inner.lock().block_size;
        let log = Self::at(Some(path), block_size, self.sync_mode);
        log.open()?;
        Ok(log)
    }

    /// Atomically swap in a compacted log
    pub fn replace_with(&self, compacted: Self) -> Result<()> {
        let (Some(from), Some(to)) = (compacted.path.clone(), self.path.clone()) else {
            return Err(Error::configuration("mutation log has no path"));
        };
        compacted.flush();
        compacted.sync();
        if !compacted.is_enabled() {
            return Err(Error::internal("compacted log failed while writing"));
        }
        std::fs::rename(&from, &to)?;
        let new_inner = compacted.inner.into_inner();
        let mut inner = self.inner.lock();
        *inner = new_inner;
        inner.path = Some(to.clone());
        for (mine, theirs) in self.logged.iter().zip(compacted.logged.iter()) {
            mine.store(theirs.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        info!(path = %to.display(), size = inner.size, "mutation log compacted");
        Ok(())
    }

    /// Iterate the records on disk
    pub fn iter(&self) -> Result<MutationLogIterator> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::configuration("mutation log has no path"))?;
        let mut file = File::open(path)?;
        let block_size = read_header(&mut file)?;
        file.seek(SeekFrom::Start(block_size as u64))?;
        Ok(MutationLogIterator {
            file,
            block_size,
            block_no: 1,
            pending: VecDeque::new(),
            done: false,
        })
    }
}

/// Iterator over the records of a log file
///
/// Stops at the first short block; yields an error and stops at the first
/// corrupt one.
pub struct MutationLogIterator {
    file: File,
    block_size: usize,
    block_no: u64,
    pending: VecDeque<LogRecord>,
    done: bool,
}

impl MutationLogIterator {
    fn read_block(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; self.block_size];
        if let Err(e) = self.file.read_exact(&mut buf) {
            return if e.kind() == ErrorKind::UnexpectedEof {
                Ok(false)
            } else {
                Err(Error::Io(e))
            };
        }
        let block = self.block_no;
        self.block_no += 1;

        let expected = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let actual = crc32c::crc32c(&buf[4..]);
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                block,
                expected,
                actual,
            });
        }
        let count = u16::from_le_bytes([buf[4], buf[5]]);
        let mut offset = BLOCK_HEADER_SIZE;
        for _ in 0..count {
            let (record, len) = LogRecord::decode(&buf[offset..])?;
            offset += len;
            self.pending.push_back(record);
        }
        Ok(true)
    }
}

impl Iterator for MutationLogIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            match self.read_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Rebuilds the committed key to row id map from a log
pub struct MutationLogHarvester<'a> {
    log: &'a MutationLog,
    vbuckets: Option<HashSet<VBucketId>>,
    committed: HashMap<VBucketId, HashMap<String, i64>>,
    /// Records seen since the last `Commit2`
    loading: Vec<LogRecord>,
    seen: HashMap<LogRecordType, u64>,
}

impl<'a> MutationLogHarvester<'a> {
    pub fn new(log: &'a MutationLog) -> Self {
        Self {
            log,
            vbuckets: None,
            committed: HashMap::new(),
            loading: Vec::new(),
            seen: HashMap::new(),
        }
    }

    /// Only harvest records of these vbuckets
    pub fn set_vbuckets(&mut self, vbuckets: impl IntoIterator<Item = VBucketId>) {
        self.vbuckets = Some(vbuckets.into_iter().collect());
    }

    fn wanted(&self, vb: VBucketId) -> bool {
        self.vbuckets.as_ref().is_none_or(|set| set.contains(&vb))
    }

    /// Replay the log
    ///
    /// A corrupt block ends replay; everything committed before it is kept.
    pub fn load(&mut self) -> Result<()> {
        self.committed.clear();
        self.loading.clear();
        self.seen.clear();
        for record in self.log.iter()? {
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_corruption() => {
                    warn!("Mutation log replay stopped early: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            };
            *self.seen.entry(record.kind).or_default() += 1;
            match record.kind {
                LogRecordType::New | LogRecordType::Del | LogRecordType::DelAll => {
                    if self.wanted(record.vbucket) {
                        self.loading.push(record);
                    }
                }
                LogRecordType::Commit1 => {}
                LogRecordType::Commit2 => self.apply_loading(),
            }
        }
        debug!(
            committed = self.total(),
            uncommitted = self.loading.len(),
            "mutation log harvested"
        );
        Ok(())
    }

    fn apply_loading(&mut self) {
        for record in self.loading.drain(..) {
            let keys = self.committed.entry(record.vbucket).or_default();
            match record.kind {
                LogRecordType::New => {
                    keys.insert(record.key, record.row_id);
                }
                LogRecordType::Del => {
                    keys.remove(&record.key);
                }
                LogRecordType::DelAll => keys.clear(),
                LogRecordType::Commit1 | LogRecordType::Commit2 => {}
            }
        }
    }

    /// Visit every committed association
    pub fn apply(&self, mut f: impl FnMut(VBucketId, &str, i64)) {
        for (vb, keys) in &self.committed {
            for (key, row_id) in keys {
                f(*vb, key, *row_id);
            }
        }
    }

    /// Committed associations
    pub fn total(&self) -> usize {
        self.committed.values().map(HashMap::len).sum()
    }

    /// Records of a transaction that never reached `Commit2`
    pub fn uncommitted(&self) -> &[LogRecord] {
        &self.loading
    }

    /// Records seen per type, for seeding the log's counters
    pub const fn items_seen(&self) -> &HashMap<LogRecordType, u64> {
        &self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(dir: &Path) -> MutationLogConfig {
        MutationLogConfig {
            path: Some(dir.join("mutation.log")),
            block_size: 512,
            sync: LogSyncMode::Off,
            ..Default::default()
        }
    }

    fn harvest(log: &MutationLog) -> (BTreeMap<(VBucketId, String), i64>, Vec<LogRecord>) {
        let mut harvester = MutationLogHarvester::new(log);
        harvester.load().unwrap();
        let mut map = BTreeMap::new();
        harvester.apply(|vb, key, row| {
            map.insert((vb, key.to_string()), row);
        });
        (map, harvester.uncommitted().to_vec())
    }

    #[test]
    fn test_committed_records_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = MutationLog::new(&config(dir.path()));
        log.open().unwrap();
        assert!(log.is_enabled());

        log.new_item(0, "a", 1);
        log.new_item(1, "b", 2);
        log.commit1();
        log.commit2();
        log.del_item(0, "a");
        log.new_item(0, "c", 3);
        log.commit1();
        log.commit2();
        // Never committed.
        log.new_item(0, "d", 4);
        log.commit1();

        let (map, uncommitted) = harvest(&log);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&(1, "b".to_string())], 2);
        assert_eq!(map[&(0, "c".to_string())], 3);
        assert_eq!(uncommitted.len(), 1);
        assert_eq!(uncommitted[0].key, "d");
        assert_eq!(log.items_logged(LogRecordType::New), 4);

        // Replay is idempotent.
        assert_eq!(harvest(&log).0, map);
    }

    #[test]
    fn test_delete_all_and_vbucket_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = MutationLog::new(&config(dir.path()));
        log.open().unwrap();
        log.new_item(0, "a", 1);
        log.new_item(1, "b", 2);
        log.commit1();
        log.commit2();
        log.delete_all(0);
        log.commit1();
        log.commit2();

        let mut harvester = MutationLogHarvester::new(&log);
        harvester.set_vbuckets([0, 1]);
        harvester.load().unwrap();
        assert_eq!(harvester.total(), 1);

        let mut harvester = MutationLogHarvester::new(&log);
        harvester.set_vbuckets([0]);
        harvester.load().unwrap();
        assert_eq!(harvester.total(), 0);
    }

    #[test]
    fn test_records_span_blocks_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        {
            let log = MutationLog::new(&cfg);
            log.open().unwrap();
            for i in 0..200 {
                log.new_item(3, &format!("key-{i:04}"), i + 1);
            }
            log.commit1();
            log.commit2();
            assert!(log.log_size() > 512 * 4);
        }
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        log.new_item(3, "late", 999);
        log.commit1();
        log.commit2();
        let (map, uncommitted) = harvest(&log);
        assert_eq!(map.len(), 201);
        assert!(uncommitted.is_empty());
    }

    #[test]
    fn test_corrupt_block_ends_replay() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        log.new_item(0, "a", 1);
        log.commit1();
        log.commit2();
        log.new_item(0, "b", 2);
        log.commit1();
        log.commit2();
        let size = log.log_size();
        drop(log);

        // Flip a byte in the last block.
        let path = cfg.path.clone().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let idx = usize::try_from(size).unwrap() - 100;
        bytes[idx] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        let (map, uncommitted) = harvest(&log);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&(0, "a".to_string())));
        // "b" was read but its Commit2 block is the corrupt one.
        assert_eq!(uncommitted.len(), 1);
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::write(cfg.path.as_ref().unwrap(), b"not a mutation log at all").unwrap();
        let log = MutationLog::new(&cfg);
        assert!(log.open().unwrap_err().is_corruption());
        assert!(!log.is_enabled());
        // Writes are no-ops on a disabled log.
        log.new_item(0, "a", 1);
        assert_eq!(log.items_logged(LogRecordType::New), 0);
    }

    #[test]
    fn test_no_path_disables() {
        let log = MutationLog::new(&MutationLogConfig::default());
        log.open().unwrap();
        assert!(!log.is_enabled());
        assert!(log.iter().is_err());
    }

    #[test]
    fn test_disable_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        log.new_item(0, "a", 1);
        log.commit1();
        log.commit2();
        log.disable();
        assert!(!log.is_enabled());
        assert_eq!(log.log_size(), 0);
        assert_eq!(std::fs::metadata(cfg.path.as_ref().unwrap()).unwrap().len(), 0);

        // Reopening starts a fresh log with nothing to replay.
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        assert!(log.is_enabled());
        let (map, uncommitted) = harvest(&log);
        assert!(map.is_empty());
        assert!(uncommitted.is_empty());
    }

    #[test]
    fn test_compaction_swaps_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        for round in 0..20 {
            log.new_item(0, "hot", round + 1);
            log.commit1();
            log.commit2();
        }
        let before = log.log_size();

        let compacted = log.create_compacted().unwrap();
        compacted.new_item(0, "hot", 20);
        compacted.commit1();
        compacted.commit2();
        log.replace_with(compacted).unwrap();

        assert!(log.log_size() < before);
        assert!(!log.compact_path().unwrap().exists());
        let (map, _) = harvest(&log);
        assert_eq!(map[&(0, "hot".to_string())], 20);

        // The swapped-in file keeps taking writes.
        log.new_item(0, "cold", 21);
        log.commit1();
        log.commit2();
        assert_eq!(harvest(&log).0.len(), 2);
    }

    #[test]
    fn test_should_compact_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_log_size = 0;
        cfg.max_entry_ratio = 2;
        cfg.queue_cap = 10;
        let log = MutationLog::new(&cfg);
        log.open().unwrap();
        log.new_item(0, "a", 1);
        log.commit1();
        log.commit2();
        assert!(!log.should_compact(&cfg, 0));
        for _ in 0..3 {
            log.del_item(0, "a");
            log.new_item(0, "a", 1);
        }
        log.commit1();
        log.commit2();
        // 4 new + 3 del = 7 logged, 1 unique.
        assert!(log.should_compact(&cfg, 0));
        assert!(!log.should_compact(&cfg, 10));
    }
}
