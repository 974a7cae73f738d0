//! Contract with the underlying disk store.
//!
//! The engine only talks to persistence through [`KvStore`]. Writes are
//! issued inside a transaction (`begin` .. `commit`) and report their outcome
//! through a completion callback that fires once the transaction commits.
//! Reads are synchronous and are only ever issued from background tasks.

mod memory;
mod redb_store;

pub use memory::MemoryKvStore;
pub use redb_store::{RedbKvStore, RedbStoreError};

use crate::item::{GetValue, Item};
use crate::queued_item::{QueuedItemRef, sort_for_write};
use crate::vbucket::BgFetchQueue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use vbstore_common::{PersistedVBucketState, Result, VBucketId};

/// Outcome of one persisted set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// 1 when a row was written, 0 when an update found no row, -1 on failure
    pub rows_affected: i32,
    /// Row id of the written row (newly assigned for inserts)
    pub row_id: i64,
}

impl WriteResult {
    #[must_use]
    pub const fn new(rows_affected: i32, row_id: i64) -> Self {
        Self {
            rows_affected,
            row_id,
        }
    }

    #[must_use]
    pub const fn failed() -> Self {
        Self::new(-1, -1)
    }
}

/// Completion of a set
pub type SetCallback = Box<dyn FnOnce(WriteResult) + Send>;

/// Completion of a delete: rows deleted (0 or 1), or -1 on failure
pub type DelCallback = Box<dyn FnOnce(i32) + Send>;

/// Capabilities the engine adapts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageProperties {
    /// Batched reads are cheaper than single reads
    pub efficient_get_multi: bool,
    /// Read handles that may be used concurrently
    pub max_readers: usize,
}

/// Persisted vbucket states keyed by id
pub type VBucketStateMap = BTreeMap<VBucketId, PersistedVBucketState>;

/// A write issued inside a transaction and applied at commit
pub(crate) enum PendingWrite {
    Set {
        item: Item,
        cb: SetCallback,
    },
    Del {
        item: Item,
        row_id: i64,
        cb: DelCallback,
    },
}

impl PendingWrite {
    fn complete(self, result: WriteResult) {
        match self {
            Self::Set { cb, .. } => cb(result),
            Self::Del { cb, .. } => cb(result.rows_affected),
        }
    }
}

/// Writes buffered between `begin` and `commit`
#[derive(Default)]
pub(crate) struct TxnBuffer {
    writes: Mutex<Option<Vec<PendingWrite>>>,
}

impl TxnBuffer {
    fn begin(&self) {
        self.writes.lock().get_or_insert_with(Vec::new);
    }

    /// Buffer a write; outside a transaction it fails immediately
    fn push(&self, write: PendingWrite) {
        let rejected = match self.writes.lock().as_mut() {
            Some(buffer) => {
                buffer.push(write);
                None
            }
            None => Some(write),
        };
        if let Some(write) = rejected {
            warn!("write issued outside a transaction");
            write.complete(WriteResult::failed());
        }
    }

    /// Take the open transaction's writes, if a transaction is open
    fn take(&self) -> Option<Vec<PendingWrite>> {
        self.writes.lock().take()
    }

    /// Put writes back after a failed commit
    fn restore(&self, writes: Vec<PendingWrite>) {
        *self.writes.lock() = Some(writes);
    }

    /// Fire callbacks of a committed transaction
    fn complete(writes: Vec<PendingWrite>, results: Vec<WriteResult>) {
        for (write, result) in writes.into_iter().zip(results) {
            write.complete(result);
        }
    }
}

/// Underlying disk store
pub trait KvStore: Send + Sync {
    /// Start a transaction; `false` means try again later
    fn begin(&self) -> bool;

    /// Apply every write issued since `begin`, then fire their callbacks
    ///
    /// On `false` the writes stay pending and `commit` may be retried.
    fn commit(&self) -> bool;

    /// Drop the writes issued since `begin` without firing callbacks
    fn rollback(&self);

    /// Insert (row id <= 0) or update a record
    fn set(&self, item: &Item, cb: SetCallback);

    /// Delete the row of a record
    fn del(&self, item: &Item, row_id: i64, cb: DelCallback);

    /// Read one record by row id, or by key when the row id is unknown
    fn get(&self, key: &str, row_id: i64, vb: VBucketId) -> GetValue;

    /// Fill in `value` of every queued fetch of one vbucket
    fn get_multi(&self, vb: VBucketId, queue: &mut BgFetchQueue) {
        for (row_id, items) in queue.iter_mut() {
            for item in items {
                let mut gv = self.get(&item.key, *row_id, vb);
                gv.partial = item.meta_only;
                item.value = Some(gv);
            }
        }
    }

    /// Persist the state records of all vbuckets
    fn snapshot_vbuckets(&self, states: &VBucketStateMap) -> bool;

    fn list_persisted_vbuckets(&self) -> VBucketStateMap;

    /// Remove all data of a vbucket, keeping its state record if `recreate`
    fn del_vbucket(&self, vb: VBucketId, recreate: bool) -> bool;

    /// Remove all data of every vbucket
    fn reset(&self) -> bool;

    /// Visit every stored record
    fn dump(&self, visitor: &mut dyn FnMut(Item)) -> Result<()>;

    /// Reorder a flush batch for efficient application
    fn optimize_writes(&self, items: &mut [QueuedItemRef]) {
        sort_for_write(items);
    }

    fn storage_properties(&self) -> StorageProperties;

    /// Another handle on the same data, used only for reads
    fn read_only(&self) -> Arc<dyn KvStore>;
}
