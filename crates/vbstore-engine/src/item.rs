//! Items, item metadata and the per-store CAS counter.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use vbstore_common::{Status, VBucketId};

/// Row id of an entry that has never been persisted
pub const NO_ROW_ID: i64 = -1;

/// Seconds since the UNIX epoch
#[must_use]
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

/// A key with its value and metadata, as passed in and out of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub vbucket: VBucketId,
    pub flags: u32,
    /// Absolute expiry in seconds since the epoch, 0 for never
    pub exptime: u32,
    pub value: Option<Bytes>,
    pub cas: u64,
    pub row_id: i64,
    pub seqno: u64,
}

impl Item {
    pub fn new(key: impl Into<String>, vbucket: VBucketId, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            vbucket,
            flags: 0,
            exptime: 0,
            value: Some(value.into()),
            cas: 0,
            row_id: NO_ROW_ID,
            seqno: 0,
        }
    }

    /// An item carrying only a key (no value), used for deletions and metadata
    pub fn key_only(key: impl Into<String>, vbucket: VBucketId) -> Self {
        Self {
            value: None,
            ..Self::new(key, vbucket, Bytes::new())
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }

    #[must_use]
    pub const fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[must_use]
    pub const fn with_seqno(mut self, seqno: u64) -> Self {
        self.seqno = seqno;
        self
    }

    /// Length of the value in bytes
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }

    #[must_use]
    pub const fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    #[must_use]
    pub const fn metadata(&self) -> ItemMetaData {
        ItemMetaData {
            cas: self.cas,
            seqno: self.seqno,
            flags: self.flags,
            exptime: self.exptime,
        }
    }
}

/// Metadata that travels with replicated and meta-preserving mutations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemMetaData {
    pub cas: u64,
    pub seqno: u64,
    pub flags: u32,
    pub exptime: u32,
}

/// Monotonic CAS source owned by one store instance
#[derive(Debug)]
pub struct CasCounter(AtomicU64);

impl CasCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Hand out the next CAS value
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future values are larger than `seen` (after warmup)
    pub fn observe(&self, seen: u64) {
        self.0.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for CasCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a read, from memory or from the underlying store
#[derive(Debug, Clone)]
pub struct GetValue {
    pub status: Status,
    pub item: Option<Item>,
    pub row_id: i64,
    /// Only metadata was requested or returned
    pub partial: bool,
}

impl GetValue {
    #[must_use]
    pub const fn new(status: Status) -> Self {
        Self {
            status,
            item: None,
            row_id: NO_ROW_ID,
            partial: false,
        }
    }

    #[must_use]
    pub fn found(item: Item) -> Self {
        let row_id = item.row_id;
        Self {
            status: Status::Success,
            item: Some(item),
            row_id,
            partial: false,
        }
    }

    #[must_use]
    pub const fn not_found() -> Self {
        Self::new(Status::KeyNotFound)
    }

    #[must_use]
    pub const fn would_block(row_id: i64) -> Self {
        Self {
            status: Status::WouldBlock,
            item: None,
            row_id,
            partial: false,
        }
    }

    /// Value bytes of a successful read
    #[must_use]
    pub fn value(&self) -> Option<&Bytes> {
        self.item.as_ref().and_then(|i| i.value.as_ref())
    }
}
