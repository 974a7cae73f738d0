//! Per-vbucket key map protected by lock stripes.
//!
//! A key hashes (xxh64) to one of a fixed number of stripes; each stripe is a
//! `parking_lot::Mutex` over a `HashMap`. Operations on different stripes
//! never contend and operations on one key are fully serialized. Every change
//! made through a [`LockedBucket`] is charged to the engine's memory counter.

use crate::item::{CasCounter, Item, ItemMetaData, now_secs};
use crate::stats::EpStats;
use crate::stored_value::StoredValue;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use xxhash_rust::xxh64::xxh64;

/// Outcome of applying a mutation to the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    /// A CAS operation named a key that does not exist
    NotFound,
    /// A new entry was created
    Inserted,
    InvalidCas,
    WasClean,
    WasDirty,
    IsLocked,
    NoMem,
}

/// Outcome of an add
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddType {
    Success,
    NoMem,
    Exists,
    /// A deleted or expired entry was revived
    Undel,
}

type Stripe = HashMap<String, StoredValue>;

/// Striped hash table of stored entries
pub struct HashTable {
    stripes: Box<[Mutex<Stripe>]>,
    num_items: AtomicUsize,
    num_non_resident: AtomicUsize,
    mem_size: AtomicUsize,
    stats: Arc<EpStats>,
}

impl HashTable {
    pub fn new(num_locks: usize, stats: Arc<EpStats>) -> Self {
        let stripes = (0..num_locks.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            num_items: AtomicUsize::new(0),
            num_non_resident: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            stats,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn stripe_index(&self, key: &str) -> usize {
        (xxh64(key.as_bytes(), 0) % self.stripes.len() as u64) as usize
    }

    /// Lock the stripe holding `key`
    pub fn lock(&self, key: &str) -> LockedBucket<'_> {
        LockedBucket {
            table: self,
            map: self.stripes[self.stripe_index(key)].lock(),
        }
    }

    /// Visit every entry, one stripe at a time
    pub fn visit(&self, mut f: impl FnMut(&StoredValue)) {
        for stripe in &*self.stripes {
            let map = stripe.lock();
            map.values().for_each(&mut f);
        }
    }

    /// Visit every entry mutably, one stripe at a time
    pub fn visit_mut(&self, mut f: impl FnMut(&mut ValueMut<'_>)) {
        for stripe in &*self.stripes {
            let mut map = stripe.lock();
            for value in map.values_mut() {
                let mut guard = ValueMut::new(self, value);
                f(&mut guard);
            }
        }
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for stripe in &*self.stripes {
            let mut map = stripe.lock();
            for (_, v) in map.drain() {
                self.account_remove(&v);
                removed += 1;
            }
        }
        removed
    }

    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn num_non_resident(&self) -> usize {
        self.num_non_resident.load(Ordering::Relaxed)
    }

    /// Bytes charged by this table
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    fn account_insert(&self, v: &StoredValue) {
        self.num_items.fetch_add(1, Ordering::Relaxed);
        if !v.is_resident() {
            self.num_non_resident.fetch_add(1, Ordering::Relaxed);
        }
        self.mem_size.fetch_add(v.size(), Ordering::Relaxed);
        self.stats.mem_add(v.size());
    }

    fn account_remove(&self, v: &StoredValue) {
        self.num_items.fetch_sub(1, Ordering::Relaxed);
        if !v.is_resident() {
            self.num_non_resident.fetch_sub(1, Ordering::Relaxed);
        }
        self.mem_size.fetch_sub(v.size(), Ordering::Relaxed);
        self.stats.mem_sub(v.size());
    }

    fn account_change(&self, old_size: usize, old_resident: bool, v: &StoredValue) {
        let new_size = v.size();
        if new_size > old_size {
            self.mem_size.fetch_add(new_size - old_size, Ordering::Relaxed);
            self.stats.mem_add(new_size - old_size);
        } else if old_size > new_size {
            self.mem_size.fetch_sub(old_size - new_size, Ordering::Relaxed);
            self.stats.mem_sub(old_size - new_size);
        }
        match (old_resident, v.is_resident()) {
            (true, false) => {
                self.num_non_resident.fetch_add(1, Ordering::Relaxed);
            }
            (false, true) => {
                self.num_non_resident.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.stats.mem_sub(self.mem_size());
    }
}

/// Mutable access to one entry; memory accounting is settled on drop
pub struct ValueMut<'a> {
    value: &'a mut StoredValue,
    table: &'a HashTable,
    size: usize,
    resident: bool,
}

impl<'a> ValueMut<'a> {
    fn new(table: &'a HashTable, value: &'a mut StoredValue) -> Self {
        let size = value.size();
        let resident = value.is_resident();
        Self {
            value,
            table,
            size,
            resident,
        }
    }
}

impl Deref for ValueMut<'_> {
    type Target = StoredValue;

    fn deref(&self) -> &StoredValue {
        self.value
    }
}

impl DerefMut for ValueMut<'_> {
    fn deref_mut(&mut self) -> &mut StoredValue {
        self.value
    }
}

impl Drop for ValueMut<'_> {
    fn drop(&mut self) {
        self.table
            .account_change(self.size, self.resident, self.value);
    }
}

/// A locked stripe; all per-key operations go through this guard
pub struct LockedBucket<'a> {
    table: &'a HashTable,
    map: MutexGuard<'a, Stripe>,
}

impl LockedBucket<'_> {
    /// Find a live entry, or any entry including deleted and temp ones
    pub fn find(&self, key: &str, wants_deleted: bool) -> Option<&StoredValue> {
        self.map
            .get(key)
            .filter(|v| wants_deleted || !v.is_deleted())
    }

    pub fn find_mut(&mut self, key: &str, wants_deleted: bool) -> Option<ValueMut<'_>> {
        let table = self.table;
        self.map
            .get_mut(key)
            .filter(|v| wants_deleted || !v.is_deleted())
            .map(|v| ValueMut::new(table, v))
    }

    /// Apply a set
    ///
    /// `cas` of 0 means unconditional. With `has_meta` the item's own CAS
    /// and seqno are kept; otherwise a fresh CAS is drawn from `counter`.
    /// Without `allow_existing` a live entry makes the set fail.
    pub fn set(
        &mut self,
        item: &Item,
        cas: u64,
        allow_existing: bool,
        has_meta: bool,
        counter: &CasCounter,
    ) -> MutationType {
        if !self.table.stats.has_space_for(item.nbytes() + item.key.len()) {
            return MutationType::NoMem;
        }
        let now = now_secs();

        if let Some(mut v) = self.find_mut(&item.key, true) {
            if !allow_existing && !v.is_deleted() {
                return MutationType::InvalidCas;
            }
            if v.is_locked(now) {
                if cas != v.cas() {
                    return MutationType::IsLocked;
                }
                v.unlock();
            }
            if cas != 0 && cas != v.cas() {
                return if v.is_deleted() {
                    MutationType::NotFound
                } else {
                    MutationType::InvalidCas
                };
            }
            if cas != 0 && v.is_deleted() {
                return MutationType::NotFound;
            }
            let was_dirty = v.is_dirty();
            let (new_cas, seqno) = if has_meta {
                (item.cas, item.seqno)
            } else {
                (counter.next(), v.seqno() + 1)
            };
            v.set_value(item, new_cas, seqno);
            return if was_dirty {
                MutationType::WasDirty
            } else {
                MutationType::WasClean
            };
        }

        if cas != 0 {
            return MutationType::NotFound;
        }
        let (new_cas, seqno) = if has_meta {
            (item.cas, item.seqno.max(1))
        } else {
            (counter.next(), 1)
        };
        self.insert(StoredValue::new(item, new_cas, seqno));
        MutationType::Inserted
    }

    /// Apply an add: fails if a live, unexpired entry exists
    pub fn add(&mut self, item: &Item, counter: &CasCounter) -> AddType {
        if !self.table.stats.has_space_for(item.nbytes() + item.key.len()) {
            return AddType::NoMem;
        }
        let now = now_secs();
        if let Some(mut v) = self.find_mut(&item.key, true) {
            if !v.is_deleted() && !v.is_expired(now) {
                return AddType::Exists;
            }
            let seqno = v.seqno() + 1;
            v.unlock();
            v.set_value(item, counter.next(), seqno);
            return AddType::Undel;
        }
        self.insert(StoredValue::new(item, counter.next(), 1));
        AddType::Success
    }

    /// Turn a live entry (or, with `meta`, a temp entry) into a tombstone
    pub fn soft_delete(
        &mut self,
        key: &str,
        cas: u64,
        meta: Option<&ItemMetaData>,
        counter: &CasCounter,
    ) -> MutationType {
        let now = now_secs();
        let Some(mut v) = self.find_mut(key, meta.is_some()) else {
            return MutationType::NotFound;
        };
        if v.is_deleted() && !v.is_temp() {
            return MutationType::NotFound;
        }
        if v.is_locked(now) && cas != v.cas() {
            return MutationType::IsLocked;
        }
        if cas != 0 && cas != v.cas() {
            return MutationType::InvalidCas;
        }
        let was_dirty = v.is_dirty();
        let meta = match meta {
            Some(meta) => *meta,
            None => ItemMetaData {
                cas: counter.next(),
                seqno: v.seqno() + 1,
                flags: v.flags(),
                exptime: 0,
            },
        };
        v.delete(&meta);
        if was_dirty {
            MutationType::WasDirty
        } else {
            MutationType::WasClean
        }
    }

    /// Insert a deleted placeholder for a pending metadata fetch
    pub fn add_temp_deleted_item(&mut self, key: &str) -> AddType {
        if !self.table.stats.has_space_for(key.len()) {
            return AddType::NoMem;
        }
        if self.map.contains_key(key) {
            return AddType::Exists;
        }
        self.insert(StoredValue::temp_deleted(key));
        AddType::Success
    }

    /// Insert a clean entry loaded from disk unless the key is already known
    pub fn insert_from_disk(&mut self, item: &Item, partial: bool) -> bool {
        if self.map.contains_key(&item.key) {
            return false;
        }
        self.insert(StoredValue::from_disk(item, partial));
        true
    }

    /// Hard-remove an entry
    pub fn remove(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(v) => {
                self.table.account_remove(&v);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, v: StoredValue) {
        self.table.account_insert(&v);
        if let Some(old) = self.map.insert(v.key().to_string(), v) {
            self.table.account_remove(&old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stored_value::TempState;

    fn table() -> HashTable {
        HashTable::new(7, Arc::new(EpStats::new(1 << 20, 1 << 19, 1 << 19, 1 << 20)))
    }

    #[test]
    fn test_set_insert_then_update() {
        let ht = table();
        let cas = CasCounter::new();
        let item = Item::new("a", 0, "one");
        assert_eq!(ht.lock("a").set(&item, 0, true, false, &cas), MutationType::Inserted);
        assert_eq!(
            ht.lock("a").set(&item, 0, true, false, &cas),
            MutationType::WasDirty
        );
        ht.lock("a").find_mut("a", false).unwrap().mark_clean();
        assert_eq!(
            ht.lock("a").set(&item, 0, true, false, &cas),
            MutationType::WasClean
        );
        assert_eq!(ht.num_items(), 1);
        assert_eq!(ht.lock("a").find("a", false).unwrap().seqno(), 3);
    }

    #[test]
    fn test_cas_conflicts() {
        let ht = table();
        let cas = CasCounter::new();
        let item = Item::new("a", 0, "one");
        assert_eq!(
            ht.lock("a").set(&item, 99, true, false, &cas),
            MutationType::NotFound
        );
        ht.lock("a").set(&item, 0, true, false, &cas);
        let current = ht.lock("a").find("a", false).unwrap().cas();
        assert_eq!(
            ht.lock("a").set(&item, current + 100, true, false, &cas),
            MutationType::InvalidCas
        );
        assert_eq!(
            ht.lock("a").set(&item, current, true, false, &cas),
            MutationType::WasDirty
        );
    }

    #[test]
    fn test_locked_entry() {
        let ht = table();
        let cas = CasCounter::new();
        let item = Item::new("a", 0, "one");
        ht.lock("a").set(&item, 0, true, false, &cas);
        let current = {
            let mut bucket = ht.lock("a");
            let mut v = bucket.find_mut("a", false).unwrap();
            v.lock(u32::MAX);
            v.cas()
        };
        assert_eq!(
            ht.lock("a").set(&item, 0, true, false, &cas),
            MutationType::IsLocked
        );
        assert_eq!(
            ht.lock("a").soft_delete("a", 0, None, &cas),
            MutationType::IsLocked
        );
        assert_eq!(
            ht.lock("a").set(&item, current, true, false, &cas),
            MutationType::WasDirty
        );
    }

    #[test]
    fn test_add_and_undelete() {
        let ht = table();
        let cas = CasCounter::new();
        let item = Item::new("a", 0, "one");
        assert_eq!(ht.lock("a").add(&item, &cas), AddType::Success);
        assert_eq!(ht.lock("a").add(&item, &cas), AddType::Exists);
        assert_eq!(
            ht.lock("a").soft_delete("a", 0, None, &cas),
            MutationType::WasDirty
        );
        assert!(ht.lock("a").find("a", false).is_none());
        assert!(ht.lock("a").find("a", true).unwrap().is_deleted());
        assert_eq!(ht.lock("a").add(&item, &cas), AddType::Undel);
        assert!(ht.lock("a").find("a", false).is_some());
    }

    #[test]
    fn test_delete_missing_and_deleted() {
        let ht = table();
        let cas = CasCounter::new();
        assert_eq!(
            ht.lock("nope").soft_delete("nope", 0, None, &cas),
            MutationType::NotFound
        );
        ht.lock("a").set(&Item::new("a", 0, "x"), 0, true, false, &cas);
        ht.lock("a").soft_delete("a", 0, None, &cas);
        assert_eq!(
            ht.lock("a").soft_delete("a", 0, None, &cas),
            MutationType::NotFound
        );
    }

    #[test]
    fn test_no_memory() {
        let stats = Arc::new(EpStats::new(100, 50, 60, 100));
        let ht = HashTable::new(3, stats);
        let cas = CasCounter::new();
        let big = Item::new("a", 0, vec![0u8; 200]);
        assert_eq!(ht.lock("a").set(&big, 0, true, false, &cas), MutationType::NoMem);
        assert_eq!(ht.lock("a").add(&big, &cas), AddType::NoMem);
        assert_eq!(ht.num_items(), 0);
    }

    #[test]
    fn test_memory_accounting_follows_ejection() {
        let stats = Arc::new(EpStats::new(1 << 20, 1 << 19, 1 << 19, 1 << 20));
        let ht = HashTable::new(3, Arc::clone(&stats));
        let mut item = Item::new("a", 0, vec![1u8; 100]);
        item.row_id = 5;
        assert!(ht.lock("a").insert_from_disk(&item, false));
        let before = stats.mem_used();
        assert_eq!(before, ht.mem_size());
        assert!(ht.lock("a").find_mut("a", false).unwrap().eject_value());
        assert_eq!(stats.mem_used(), before - 100);
        assert_eq!(ht.num_non_resident(), 1);
        assert_eq!(ht.clear(), 1);
        assert_eq!(stats.mem_used(), 0);
        assert_eq!(ht.num_non_resident(), 0);
    }

    #[test]
    fn test_temp_item_hidden_from_plain_find() {
        let ht = table();
        let cas = CasCounter::new();
        assert_eq!(ht.lock("t").add_temp_deleted_item("t"), AddType::Success);
        assert_eq!(ht.lock("t").add_temp_deleted_item("t"), AddType::Exists);
        assert!(ht.lock("t").find("t", false).is_none());
        assert_eq!(
            ht.lock("t").find("t", true).unwrap().temp_state(),
            Some(TempState::Initial)
        );
        let meta = ItemMetaData {
            cas: 500,
            seqno: 4,
            flags: 0,
            exptime: 0,
        };
        assert_eq!(
            ht.lock("t").soft_delete("t", 0, Some(&meta), &cas),
            MutationType::WasClean
        );
        let bucket = ht.lock("t");
        let v = bucket.find("t", true).unwrap();
        assert!(!v.is_temp());
        assert_eq!(v.cas(), 500);
    }

    #[test]
    fn test_visit_counts_all_stripes() {
        let ht = table();
        let cas = CasCounter::new();
        for i in 0..50 {
            let key = format!("key-{i}");
            ht.lock(&key).set(&Item::new(key.clone(), 0, "v"), 0, true, false, &cas);
        }
        let mut seen = 0;
        ht.visit(|_| seen += 1);
        assert_eq!(seen, 50);
        assert!(ht.lock("key-7").remove("key-7"));
        assert_eq!(ht.num_items(), 49);
    }
}
