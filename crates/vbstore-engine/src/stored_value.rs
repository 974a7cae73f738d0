//! In-memory state of a single key.

use crate::item::{Item, ItemMetaData, NO_ROW_ID};
use bytes::Bytes;
use vbstore_common::{Status, VBucketId};

/// Fixed per-entry bookkeeping charged against the memory quota
pub const STORED_VALUE_OVERHEAD: usize = 64;

/// Placeholder states of an entry created by a metadata fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempState {
    /// Fetch scheduled, nothing known yet
    Initial,
    /// The underlying store has no such key
    NonExistent,
    /// The underlying store returned tombstone metadata
    Deleted,
}

/// One key's current in-memory value and metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    key: String,
    value: Option<Bytes>,
    flags: u32,
    exptime: u32,
    cas: u64,
    seqno: u64,
    row_id: i64,
    dirty: bool,
    pending_id: bool,
    deleted: bool,
    temp: Option<TempState>,
    locked_until: u32,
    referenced: bool,
}

impl StoredValue {
    /// A fresh, dirty entry for a client mutation
    pub(crate) fn new(item: &Item, cas: u64, seqno: u64) -> Self {
        Self {
            key: item.key.clone(),
            value: item.value.clone(),
            flags: item.flags,
            exptime: item.exptime,
            cas,
            seqno,
            row_id: NO_ROW_ID,
            dirty: true,
            pending_id: false,
            deleted: false,
            temp: None,
            locked_until: 0,
            referenced: true,
        }
    }

    /// A clean entry loaded from disk; `partial` entries carry no value
    pub(crate) fn from_disk(item: &Item, partial: bool) -> Self {
        Self {
            key: item.key.clone(),
            value: if partial { None } else { item.value.clone() },
            flags: item.flags,
            exptime: item.exptime,
            cas: item.cas,
            seqno: item.seqno,
            row_id: item.row_id,
            dirty: false,
            pending_id: false,
            deleted: false,
            temp: None,
            locked_until: 0,
            referenced: false,
        }
    }

    /// A deleted placeholder awaiting a metadata fetch
    pub(crate) fn temp_deleted(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            flags: 0,
            exptime: 0,
            cas: 0,
            seqno: 0,
            row_id: NO_ROW_ID,
            dirty: false,
            pending_id: false,
            deleted: true,
            temp: Some(TempState::Initial),
            locked_until: 0,
            referenced: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub const fn flags(&self) -> u32 {
        self.flags
    }

    pub const fn exptime(&self) -> u32 {
        self.exptime
    }

    pub const fn cas(&self) -> u64 {
        self.cas
    }

    pub const fn seqno(&self) -> u64 {
        self.seqno
    }

    pub const fn row_id(&self) -> i64 {
        self.row_id
    }

    pub const fn has_row_id(&self) -> bool {
        self.row_id > 0
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn is_clean(&self) -> bool {
        !self.dirty
    }

    pub const fn is_pending_id(&self) -> bool {
        self.pending_id
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub const fn temp_state(&self) -> Option<TempState> {
        self.temp
    }

    pub const fn is_temp(&self) -> bool {
        self.temp.is_some()
    }

    pub const fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Value is in memory (deleted entries have nothing to fetch)
    pub const fn is_resident(&self) -> bool {
        self.deleted || self.value.is_some()
    }

    pub const fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    pub const fn is_locked(&self, now: u32) -> bool {
        self.locked_until > now
    }

    /// Bytes charged against the memory quota
    pub fn size(&self) -> usize {
        STORED_VALUE_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }

    pub const fn metadata(&self) -> ItemMetaData {
        ItemMetaData {
            cas: self.cas,
            seqno: self.seqno,
            flags: self.flags,
            exptime: self.exptime,
        }
    }

    pub(crate) const fn lock(&mut self, until: u32) {
        self.locked_until = until;
    }

    pub(crate) const fn unlock(&mut self) {
        self.locked_until = 0;
    }

    pub(crate) const fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) const fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Put an entry back on the dirty path after a failed persist
    pub(crate) const fn re_dirty(&mut self) {
        self.dirty = true;
        self.pending_id = false;
    }

    pub(crate) const fn set_referenced(&mut self, referenced: bool) {
        self.referenced = referenced;
    }

    pub(crate) const fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub(crate) const fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    /// Mark that a row id is being assigned by an in-flight write
    pub(crate) const fn set_pending_id(&mut self) {
        self.pending_id = true;
    }

    pub(crate) const fn set_row_id(&mut self, row_id: i64) {
        self.row_id = row_id;
        self.pending_id = false;
    }

    pub(crate) const fn clear_row_id(&mut self) {
        self.row_id = NO_ROW_ID;
        self.pending_id = false;
    }

    /// Replace value and metadata with those of a client mutation
    pub(crate) fn set_value(&mut self, item: &Item, cas: u64, seqno: u64) {
        self.value = item.value.clone();
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.cas = cas;
        self.seqno = seqno;
        self.deleted = false;
        self.temp = None;
        self.referenced = true;
        self.dirty = true;
    }

    /// Turn the entry into a dirty tombstone
    pub(crate) fn delete(&mut self, meta: &ItemMetaData) {
        self.value = None;
        self.flags = meta.flags;
        self.exptime = meta.exptime;
        self.cas = meta.cas;
        self.seqno = meta.seqno;
        self.deleted = true;
        self.temp = None;
        self.locked_until = 0;
        self.dirty = true;
    }

    /// Drop the value from memory; only clean persisted entries qualify
    pub(crate) fn eject_value(&mut self) -> bool {
        if self.is_ejectable() {
            self.value = None;
            true
        } else {
            false
        }
    }

    pub fn is_ejectable(&self) -> bool {
        !self.dirty
            && !self.deleted
            && self.has_row_id()
            && self.value.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Repopulate the value after a background fetch
    pub(crate) fn restore_value(&mut self, item: &Item) -> bool {
        if self.is_resident() {
            return false;
        }
        self.value = item.value.clone();
        true
    }

    /// Fill a temp entry with the outcome of a metadata fetch
    pub(crate) fn restore_meta(&mut self, fetched: Option<&Item>, status: Status) -> bool {
        if self.temp != Some(TempState::Initial) {
            return false;
        }
        match (status, fetched) {
            (Status::Success, Some(item)) => {
                self.flags = item.flags;
                self.exptime = item.exptime;
                self.cas = item.cas;
                self.seqno = item.seqno;
                self.row_id = item.row_id;
                self.temp = Some(TempState::Deleted);
                true
            }
            (Status::KeyNotFound, _) => {
                self.temp = Some(TempState::NonExistent);
                true
            }
            _ => false,
        }
    }

    /// Build an item snapshot of this entry
    pub fn to_item(&self, vbucket: VBucketId, hide_locked_cas: bool, now: u32) -> Item {
        Item {
            key: self.key.clone(),
            vbucket,
            flags: self.flags,
            exptime: self.exptime,
            value: self.value.clone(),
            cas: if hide_locked_cas && self.is_locked(now) {
                u64::MAX
            } else {
                self.cas
            },
            row_id: self.row_id,
            seqno: self.seqno,
        }
    }
}
