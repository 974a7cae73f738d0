//! Underlying store backed by redb.
//!
//! Records live in `items`, keyed by `(vbucket, row id)`. A `keys` index maps
//! `(vbucket, key)` to the row id so reads with an unknown row id still work.
//! Writes issued between `begin` and `commit` are applied in one redb write
//! transaction.

use super::{
    KvStore, PendingWrite, StorageProperties, TxnBuffer, VBucketStateMap, WriteResult,
};
use crate::item::{GetValue, Item};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};
use vbstore_common::{PersistedVBucketState, Status, VBucketId};

const ITEMS: TableDefinition<(u16, u64), &[u8]> = TableDefinition::new("items");
const KEYS: TableDefinition<(u16, &str), u64> = TableDefinition::new("keys");
const VBUCKET_STATES: TableDefinition<u16, &[u8]> = TableDefinition::new("vbucket_states");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ROW_ID: &str = "next_row_id";

/// Error type for redb store operations
#[derive(Debug, thiserror::Error)]
pub enum RedbStoreError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for RedbStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<RedbStoreError> for vbstore_common::Error {
    fn from(e: RedbStoreError) -> Self {
        match e {
            RedbStoreError::Io(io) => Self::Io(io),
            RedbStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::underlying(other.to_string()),
        }
    }
}

type StoreResult<T> = Result<T, RedbStoreError>;

/// On-disk form of a record
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    key: String,
    flags: u32,
    exptime: u32,
    cas: u64,
    seqno: u64,
    value: Vec<u8>,
}

impl DiskRecord {
    fn from_item(item: &Item) -> Self {
        Self {
            key: item.key.clone(),
            flags: item.flags,
            exptime: item.exptime,
            cas: item.cas,
            seqno: item.seqno,
            value: item.value.as_ref().map(|v| v.to_vec()).unwrap_or_default(),
        }
    }

    fn into_item(self, vbucket: VBucketId, row_id: u64) -> Item {
        Item {
            key: self.key,
            vbucket,
            flags: self.flags,
            exptime: self.exptime,
            value: Some(Bytes::from(self.value)),
            cas: self.cas,
            row_id: i64::try_from(row_id).unwrap_or(i64::MAX),
            seqno: self.seqno,
        }
    }
}

/// Row id as a table key; only positive ids name a row
fn row_key(row_id: i64) -> Option<u64> {
    u64::try_from(row_id).ok().filter(|r| *r > 0)
}

/// Persistent underlying store backed by redb
pub struct RedbKvStore {
    db: Arc<Database>,
    txn: TxnBuffer,
    read_only: bool,
}

impl RedbKvStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(ITEMS)?;
            let _t = write_txn.open_table(KEYS)?;
            let _t = write_txn.open_table(VBUCKET_STATES)?;
            let _t = write_txn.open_table(META)?;
        }
        write_txn.commit()?;
        debug!(path = %path.display(), "opened redb store");

        Ok(Self {
            db: Arc::new(db),
            txn: TxnBuffer::default(),
            read_only: false,
        })
    }

    fn apply(&self, writes: &[PendingWrite]) -> StoreResult<Vec<WriteResult>> {
        let write_txn = self.db.begin_write()?;
        let mut results = Vec::with_capacity(writes.len());
        {
            let mut items = write_txn.open_table(ITEMS)?;
            let mut keys = write_txn.open_table(KEYS)?;
            let mut meta = write_txn.open_table(META)?;
            let mut next_row = meta.get(NEXT_ROW_ID)?.map_or(1, |g| g.value());

            for write in writes {
                let result = match write {
                    PendingWrite::Set { item, .. } => {
                        let record = bincode::serialize(&DiskRecord::from_item(item))?;
                        if let Some(row) = row_key(item.row_id) {
                            if items.get((item.vbucket, row))?.is_some() {
                                items.insert((item.vbucket, row), record.as_slice())?;
                                WriteResult::new(1, item.row_id)
                            } else {
                                WriteResult::new(0, item.row_id)
                            }
                        } else {
                            let row = next_row;
                            next_row += 1;
                            let old = keys
                                .insert((item.vbucket, item.key.as_str()), row)?
                                .map(|g| g.value());
                            if let Some(old) = old {
                                items.remove((item.vbucket, old))?;
                            }
                            items.insert((item.vbucket, row), record.as_slice())?;
                            WriteResult::new(1, i64::try_from(row).unwrap_or(i64::MAX))
                        }
                    }
                    PendingWrite::Del { item, row_id, .. } => {
                        let removed = match row_key(*row_id) {
                            Some(row) => items.remove((item.vbucket, row))?.is_some(),
                            None => false,
                        };
                        if removed {
                            let index = (item.vbucket, item.key.as_str());
                            let indexed = keys.get(index)?.map(|g| g.value());
                            if indexed == row_key(*row_id) {
                                keys.remove(index)?;
                            }
                        }
                        WriteResult::new(i32::from(removed), *row_id)
                    }
                };
                results.push(result);
            }
            meta.insert(NEXT_ROW_ID, next_row)?;
        }
        write_txn.commit()?;
        Ok(results)
    }

    fn read(&self, key: &str, row_id: i64, vb: VBucketId) -> StoreResult<Option<Item>> {
        let read_txn = self.db.begin_read()?;
        let row = match row_key(row_id) {
            Some(row) => Some(row),
            None => {
                let keys = read_txn.open_table(KEYS)?;
                keys.get((vb, key))?.map(|g| g.value())
            }
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let items = read_txn.open_table(ITEMS)?;
        let Some(bytes) = items.get((vb, row))? else {
            return Ok(None);
        };
        let record: DiskRecord = bincode::deserialize(bytes.value())?;
        if record.key != key {
            return Ok(None);
        }
        Ok(Some(record.into_item(vb, row)))
    }

    fn write_states(&self, states: &VBucketStateMap) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(VBUCKET_STATES)?;
            for (vb, state) in states {
                let bytes = bincode::serialize(state)?;
                table.insert(*vb, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_states(&self) -> StoreResult<VBucketStateMap> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VBUCKET_STATES)?;
        let mut result = VBucketStateMap::new();
        for entry in table.iter()? {
            let entry = entry?;
            let vb = entry.0.value();
            match bincode::deserialize::<PersistedVBucketState>(entry.1.value()) {
                Ok(state) => {
                    result.insert(vb, state);
                }
                Err(e) => error!("Failed to decode state of vbucket {}: {}", vb, e),
            }
        }
        Ok(result)
    }

    fn remove_vbucket(&self, vb: VBucketId, recreate: bool) -> StoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed;
        {
            let mut items = write_txn.open_table(ITEMS)?;
            let rows = items
                .range((vb, 0u64)..=(vb, u64::MAX))?
                .map(|entry| entry.map(|(k, _)| k.value()))
                .collect::<Result<Vec<_>, _>>()?;
            for row in &rows {
                items.remove(*row)?;
            }
            removed = rows.len();

            let mut keys = write_txn.open_table(KEYS)?;
            let names = keys
                .iter()?
                .filter_map(|entry| match entry {
                    Ok((k, _)) => {
                        let (key_vb, name) = k.value();
                        (key_vb == vb).then(|| Ok(name.to_string()))
                    }
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for name in &names {
                keys.remove((vb, name.as_str()))?;
            }

            if !recreate {
                let mut states = write_txn.open_table(VBUCKET_STATES)?;
                states.remove(vb)?;
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }

    fn clear_items(&self) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(ITEMS)?;
        write_txn.delete_table(KEYS)?;
        {
            let _t = write_txn.open_table(ITEMS)?;
            let _t = write_txn.open_table(KEYS)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(Item)) -> StoreResult<()> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ITEMS)?;
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (vb, row) = k.value();
            let record: DiskRecord = bincode::deserialize(v.value())?;
            visitor(record.into_item(vb, row));
        }
        Ok(())
    }
}

impl KvStore for RedbKvStore {
    fn begin(&self) -> bool {
        if self.read_only {
            warn!("begin on a read-only redb handle");
            return false;
        }
        self.txn.begin();
        true
    }

    fn commit(&self) -> bool {
        let Some(writes) = self.txn.take() else {
            return true;
        };
        match self.apply(&writes) {
            Ok(results) => {
                TxnBuffer::complete(writes, results);
                true
            }
            Err(e) => {
                error!("Failed to commit {} writes: {}", writes.len(), e);
                self.txn.restore(writes);
                false
            }
        }
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
        match self.read(key, row_id, vb) {
            Ok(Some(item)) => GetValue::found(item),
            Ok(None) => GetValue::not_found(),
            Err(e) => {
                warn!(vbucket = vb, key = %key, "Failed to read record: {}", e);
                GetValue::new(Status::TempFail)
            }
        }
    }

    fn snapshot_vbuckets(&self, states: &VBucketStateMap) -> bool {
        if let Err(e) = self.write_states(states) {
            error!("Failed to persist vbucket states: {}", e);
            return false;
        }
        true
    }

    fn list_persisted_vbuckets(&self) -> VBucketStateMap {
        self.load_states().unwrap_or_else(|e| {
            error!("Failed to load vbucket states: {}", e);
            VBucketStateMap::new()
        })
    }

    fn del_vbucket(&self, vb: VBucketId, recreate: bool) -> bool {
        match self.remove_vbucket(vb, recreate) {
            Ok(rows) => {
                debug!(vbucket = vb, rows, "deleted vbucket data");
                true
            }
            Err(e) => {
                error!("Failed to delete vbucket {}: {}", vb, e);
                false
            }
        }
    }

    fn reset(&self) -> bool {
        if let Err(e) = self.clear_items() {
            error!("Failed to reset store: {}", e);
            return false;
        }
        true
    }

    fn dump(&self, visitor: &mut dyn FnMut(Item)) -> vbstore_common::Result<()> {
        Ok(self.visit(visitor)?)
    }

    fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            efficient_get_multi: true,
            max_readers: 1,
        }
    }

    fn read_only(&self) -> Arc<dyn KvStore> {
        Arc::new(Self {
            db: Arc::clone(&self.db),
            txn: TxnBuffer::default(),
            read_only: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbstore_common::VBucketState;

    fn commit_sets(store: &RedbKvStore, items: &[Item]) -> Vec<WriteResult> {
        let (tx, rx) = crossbeam_channel::unbounded();
        assert!(store.begin());
        for item in items {
            let tx = tx.clone();
            store.set(item, Box::new(move |r| tx.send(r).unwrap()));
        }
        assert!(store.commit());
        rx.try_iter().collect()
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = RedbKvStore::open(&path).unwrap();
            let results = commit_sets(
                &store,
                &[
                    Item::new("a", 0, "alpha").with_flags(3),
                    Item::new("b", 1, "beta"),
                ],
            );
            assert_eq!(results, vec![WriteResult::new(1, 1), WriteResult::new(1, 2)]);
        }
        let store = RedbKvStore::open(&path).unwrap();
        let gv = store.get("a", 1, 0);
        assert_eq!(gv.value().unwrap().as_ref(), b"alpha");
        assert_eq!(gv.item.unwrap().flags, 3);
        assert_eq!(store.get("b", -1, 1).row_id, 2);
        assert_eq!(store.get("b", 2, 0).status, Status::KeyNotFound);

        // Row ids keep increasing after reopen.
        let results = commit_sets(&store, &[Item::new("c", 0, "gamma")]);
        assert_eq!(results[0].row_id, 3);
    }

    #[test]
    fn test_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbKvStore::open(dir.path().join("store.redb")).unwrap();
        commit_sets(&store, &[Item::new("a", 0, "v1")]);

        let mut update = Item::new("a", 0, "v2");
        update.row_id = 1;
        assert_eq!(commit_sets(&store, &[update.clone()])[0], WriteResult::new(1, 1));
        update.row_id = 40;
        assert_eq!(commit_sets(&store, &[update])[0].rows_affected, 0);

        let (tx, rx) = crossbeam_channel::unbounded();
        store.begin();
        let tx2 = tx.clone();
        store.del(&Item::key_only("a", 0), 1, Box::new(move |n| tx.send(n).unwrap()));
        store.del(&Item::key_only("a", 0), -1, Box::new(move |n| tx2.send(n).unwrap()));
        assert!(store.commit());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 0]);
        assert_eq!(store.get("a", -1, 0).status, Status::KeyNotFound);
    }

    #[test]
    fn test_vbucket_states_and_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbKvStore::open(dir.path().join("store.redb")).unwrap();
        commit_sets(
            &store,
            &[Item::new("a", 1, "x"), Item::new("b", 1, "y"), Item::new("c", 2, "z")],
        );
        let mut states = VBucketStateMap::new();
        states.insert(1, PersistedVBucketState::new(VBucketState::Active, 4));
        states.insert(2, PersistedVBucketState::new(VBucketState::Replica, 2));
        assert!(store.snapshot_vbuckets(&states));
        assert_eq!(store.list_persisted_vbuckets(), states);

        assert!(store.del_vbucket(1, true));
        assert!(store.list_persisted_vbuckets().contains_key(&1));
        assert!(store.del_vbucket(2, false));
        assert!(!store.list_persisted_vbuckets().contains_key(&2));

        let mut keys = Vec::new();
        store.dump(&mut |item| keys.push(item.key)).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_reset_and_read_only_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbKvStore::open(dir.path().join("store.redb")).unwrap();
        commit_sets(&store, &[Item::new("a", 0, "x")]);
        let reader = store.read_only();
        assert!(!reader.begin());
        assert!(reader.get("a", 1, 0).status.is_success());

        assert!(store.reset());
        assert_eq!(reader.get("a", 1, 0).status, Status::KeyNotFound);
    }
}
