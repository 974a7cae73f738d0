//! In-memory underlying store with fault injection.

use super::{
    KvStore, PendingWrite, StorageProperties, TxnBuffer, VBucketStateMap, WriteResult,
};
use crate::item::{GetValue, Item};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use vbstore_common::{Result, Status, VBucketId};

#[derive(Default)]
struct Data {
    rows: BTreeMap<(VBucketId, i64), Item>,
    keys: HashMap<(VBucketId, String), i64>,
    states: VBucketStateMap,
    next_row_id: i64,
}

impl Data {
    fn apply(&mut self, write: &PendingWrite, failing: &HashSet<String>) -> WriteResult {
        match write {
            PendingWrite::Set { item, .. } if failing.contains(&item.key) => WriteResult::failed(),
            PendingWrite::Set { item, .. } if item.row_id > 0 => {
                match self.rows.get_mut(&(item.vbucket, item.row_id)) {
                    Some(row) => {
                        *row = item.clone();
                        WriteResult::new(1, item.row_id)
                    }
                    None => WriteResult::new(0, item.row_id),
                }
            }
            PendingWrite::Set { item, .. } => {
                self.next_row_id += 1;
                let row_id = self.next_row_id;
                let mut stored = item.clone();
                stored.row_id = row_id;
                if let Some(old) = self
                    .keys
                    .insert((item.vbucket, item.key.clone()), row_id)
                {
                    self.rows.remove(&(item.vbucket, old));
                }
                self.rows.insert((item.vbucket, row_id), stored);
                WriteResult::new(1, row_id)
            }
            PendingWrite::Del { item, row_id, .. } => {
                if self.rows.remove(&(item.vbucket, *row_id)).is_none() {
                    return WriteResult::new(0, *row_id);
                }
                let index = (item.vbucket, item.key.clone());
                if self.keys.get(&index) == Some(row_id) {
                    self.keys.remove(&index);
                }
                WriteResult::new(1, *row_id)
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    data: Mutex<Data>,
    failing_sets: Mutex<HashSet<String>>,
    fail_begins: AtomicUsize,
    fail_commits: AtomicUsize,
    fail_snapshots: AtomicUsize,
    fail_gets: AtomicUsize,
    get_calls: AtomicUsize,
    commits: AtomicUsize,
}

/// Consume one injected failure from `counter`
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Underlying store kept entirely in memory
///
/// Handles created with [`KvStore::read_only`] share the data. Tests use the
/// `fail_*` switches to exercise the engine's retry paths.
pub struct MemoryKvStore {
    shared: Arc<Shared>,
    txn: TxnBuffer,
    efficient_get_multi: bool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            txn: TxnBuffer::default(),
            efficient_get_multi: true,
        }
    }

    /// Report whether batched reads should be used
    #[must_use]
    pub const fn with_multi_get(mut self, enabled: bool) -> Self {
        self.efficient_get_multi = enabled;
        self
    }

    pub fn fail_next_begins(&self, n: usize) {
        self.shared.fail_begins.store(n, Ordering::Release);
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.shared.fail_commits.store(n, Ordering::Release);
    }

    pub fn fail_next_snapshots(&self, n: usize) {
        self.shared.fail_snapshots.store(n, Ordering::Release);
    }

    /// Fail the next `n` reads with a temporary failure
    pub fn fail_next_gets(&self, n: usize) {
        self.shared.fail_gets.store(n, Ordering::Release);
    }

    /// Make every set of `key` report a failed row until cleared
    pub fn fail_sets_of(&self, key: &str) {
        self.shared.failing_sets.lock().insert(key.to_string());
    }

    pub fn clear_set_failures(&self) {
        self.shared.failing_sets.lock().clear();
    }

    /// Reads served so far
    pub fn get_calls(&self) -> usize {
        self.shared.get_calls.load(Ordering::Acquire)
    }

    /// Transactions committed so far
    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::Acquire)
    }

    pub fn num_rows(&self) -> usize {
        self.shared.data.lock().rows.len()
    }

    /// Stored record of a key
    pub fn stored(&self, vb: VBucketId, key: &str) -> Option<Item> {
        let data = self.shared.data.lock();
        let row_id = data.keys.get(&(vb, key.to_string()))?;
        data.rows.get(&(vb, *row_id)).cloned()
    }

    /// Write a record directly, outside any transaction
    pub fn insert_row(&self, item: &Item) -> i64 {
        let mut data = self.shared.data.lock();
        let write = PendingWrite::Set {
            item: item.clone(),
            cb: Box::new(|_| {}),
        };
        data.apply(&write, &HashSet::new()).row_id
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self) -> bool {
        if take_failure(&self.shared.fail_begins) {
            return false;
        }
        self.txn.begin();
        true
    }

    fn commit(&self) -> bool {
        let Some(writes) = self.txn.take() else {
            return true;
        };
        if take_failure(&self.shared.fail_commits) {
            self.txn.restore(writes);
            return false;
        }
        let results: Vec<_> = {
            let failing = self.shared.failing_sets.lock().clone();
            let mut data = self.shared.data.lock();
            writes.iter().map(|w| data.apply(w, &failing)).collect()
        };
        self.shared.commits.fetch_add(1, Ordering::AcqRel);
        debug!(writes = writes.len(), "memory store committed");
        TxnBuffer::complete(writes, results);
        true
    }

    fn rollback(&self) {
        self.txn.take();
    }

    fn set(&self, item: &Item, cb: super::SetCallback) {
        self.txn.push(PendingWrite::Set {
            item: item.clone(),
            cb,
        });
    }

    fn del(&self, item: &Item, row_id: i64, cb: super::DelCallback) {
        self.txn.push(PendingWrite::Del {
            item: item.clone(),
            row_id,
            cb,
        });
    }

    fn get(&self, key: &str, row_id: i64, vb: VBucketId) -> GetValue {
        self.shared.get_calls.fetch_add(1, Ordering::AcqRel);
        if take_failure(&self.shared.fail_gets) {
            return GetValue::new(Status::TempFail);
        }
        let data = self.shared.data.lock();
        let row_id = if row_id > 0 {
            Some(row_id)
        } else {
            data.keys.get(&(vb, key.to_string())).copied()
        };
        row_id
            .and_then(|id| data.rows.get(&(vb, id)))
            .filter(|item| item.key == key)
            .map_or_else(GetValue::not_found, |item| GetValue::found(item.clone()))
    }

    fn snapshot_vbuckets(&self, states: &VBucketStateMap) -> bool {
        if take_failure(&self.shared.fail_snapshots) {
            return false;
        }
        let mut data = self.shared.data.lock();
        for (vb, state) in states {
            data.states.insert(*vb, *state);
        }
        true
    }

    fn list_persisted_vbuckets(&self) -> VBucketStateMap {
        self.shared.data.lock().states.clone()
    }

    fn del_vbucket(&self, vb: VBucketId, recreate: bool) -> bool {
        let mut data = self.shared.data.lock();
        data.rows.retain(|(row_vb, _), _| *row_vb != vb);
        data.keys.retain(|(key_vb, _), _| *key_vb != vb);
        if !recreate {
            data.states.remove(&vb);
        }
        true
    }

    fn reset(&self) -> bool {
        let mut data = self.shared.data.lock();
        data.rows.clear();
        data.keys.clear();
        true
    }

    fn dump(&self, visitor: &mut dyn FnMut(Item)) -> Result<()> {
        let rows: Vec<Item> = self.shared.data.lock().rows.values().cloned().collect();
        rows.into_iter().for_each(visitor);
        Ok(())
    }

    fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            efficient_get_multi: self.efficient_get_multi,
            max_readers: 1,
        }
    }

    fn read_only(&self) -> Arc<dyn KvStore> {
        Arc::new(Self {
            shared: Arc::clone(&self.shared),
            txn: TxnBuffer::default(),
            efficient_get_multi: self.efficient_get_multi,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbucket::{BgFetchItem, BgFetchQueue};
    use vbstore_common::{PersistedVBucketState, VBucketState};

    fn set_and_commit(store: &MemoryKvStore, item: &Item) -> WriteResult {
        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(store.begin());
        store.set(item, Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().is_err());
        assert!(store.commit());
        rx.try_recv().unwrap()
    }

    #[test]
    fn test_insert_update_delete() {
        let store = MemoryKvStore::new();
        let result = set_and_commit(&store, &Item::new("a", 1, "one"));
        assert_eq!(result, WriteResult::new(1, 1));

        let mut update = Item::new("a", 1, "two");
        update.row_id = 1;
        assert_eq!(set_and_commit(&store, &update), WriteResult::new(1, 1));
        assert_eq!(store.stored(1, "a").unwrap().value.unwrap().as_ref(), b"two");

        update.row_id = 77;
        assert_eq!(set_and_commit(&store, &update).rows_affected, 0);

        let (tx, rx) = crossbeam_channel::unbounded();
        store.begin();
        let tx2 = tx.clone();
        store.del(&Item::key_only("a", 1), 1, Box::new(move |n| tx.send(n).unwrap()));
        store.del(&Item::key_only("a", 1), 1, Box::new(move |n| tx2.send(n).unwrap()));
        store.commit();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(store.num_rows(), 0);
    }

    #[test]
    fn test_failed_commit_keeps_writes() {
        let store = MemoryKvStore::new();
        store.fail_next_commits(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        store.begin();
        store.set(&Item::new("k", 0, "v"), Box::new(move |r| tx.send(r).unwrap()));
        assert!(!store.commit());
        assert!(rx.try_recv().is_err());
        assert!(store.commit());
        assert_eq!(rx.try_recv().unwrap().rows_affected, 1);
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn test_injected_set_failure() {
        let store = MemoryKvStore::new();
        store.fail_sets_of("bad");
        assert_eq!(set_and_commit(&store, &Item::new("bad", 0, "v")).rows_affected, -1);
        store.clear_set_failures();
        assert_eq!(set_and_commit(&store, &Item::new("bad", 0, "v")).rows_affected, 1);
    }

    #[test]
    fn test_write_outside_transaction_fails() {
        let store = MemoryKvStore::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        store.set(&Item::new("k", 0, "v"), Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), WriteResult::failed());
    }

    #[test]
    fn test_get_and_get_multi() {
        let store = MemoryKvStore::new();
        let row = store.insert_row(&Item::new("a", 2, "x"));
        let reader = store.read_only();
        assert_eq!(reader.get("a", row, 2).value().unwrap().as_ref(), b"x");
        assert_eq!(reader.get("a", -1, 2).row_id, row);
        assert_eq!(reader.get("a", row, 3).status, Status::KeyNotFound);

        store.fail_next_gets(1);
        let mut queue = BgFetchQueue::new();
        queue.insert(row, vec![BgFetchItem::new("a", None, true)]);
        reader.get_multi(2, &mut queue);
        assert_eq!(queue[&row][0].value.as_ref().unwrap().status, Status::TempFail);
        reader.get_multi(2, &mut queue);
        let gv = queue[&row][0].value.as_ref().unwrap();
        assert!(gv.status.is_success());
        assert!(gv.partial);
        assert_eq!(store.get_calls(), 5);
    }

    #[test]
    fn test_vbucket_states_and_deletion() {
        let store = MemoryKvStore::new();
        store.insert_row(&Item::new("a", 1, "x"));
        store.insert_row(&Item::new("b", 2, "y"));
        let mut states = VBucketStateMap::new();
        states.insert(1, PersistedVBucketState::new(VBucketState::Active, 3));
        states.insert(2, PersistedVBucketState::new(VBucketState::Replica, 1));
        store.fail_next_snapshots(1);
        assert!(!store.snapshot_vbuckets(&states));
        assert!(store.snapshot_vbuckets(&states));

        assert!(store.del_vbucket(1, false));
        assert_eq!(store.num_rows(), 1);
        assert!(store.stored(2, "b").is_some());
        let persisted = store.list_persisted_vbuckets();
        assert!(!persisted.contains_key(&1));
        assert_eq!(persisted[&2].state, VBucketState::Replica);

        let mut seen = Vec::new();
        store.dump(&mut |item| seen.push(item.key)).unwrap();
        assert_eq!(seen, vec!["b".to_string()]);
    }
}
