//! One keyspace partition: its map, dirty queue, and waiters.

use crate::checkpoint::CheckpointManager;
use crate::hashtable::HashTable;
use crate::item::GetValue;
use crate::notify::Requester;
use crate::stats::EpStats;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;
use vbstore_common::{Status, VBucketId, VBucketState};

/// Checkpoint id a freshly created active vbucket starts from
pub const INITIAL_ACTIVE_CHECKPOINT_ID: u64 = 2;

/// A pending background fetch
#[derive(Clone)]
pub struct BgFetchItem {
    pub key: String,
    pub requester: Option<Requester>,
    /// Only metadata is wanted (tombstone resurrection)
    pub meta_only: bool,
    /// Underlying-store attempts made so far
    pub attempts: u8,
    pub init_time: Instant,
    /// Filled in by the underlying store
    pub value: Option<GetValue>,
}

impl BgFetchItem {
    pub fn new(key: impl Into<String>, requester: Option<Requester>, meta_only: bool) -> Self {
        Self {
            key: key.into(),
            requester,
            meta_only,
            attempts: 0,
            init_time: Instant::now(),
            value: None,
        }
    }
}

impl std::fmt::Debug for BgFetchItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgFetchItem")
            .field("key", &self.key)
            .field("meta_only", &self.meta_only)
            .field("attempts", &self.attempts)
            .field("has_requester", &self.requester.is_some())
            .finish_non_exhaustive()
    }
}

/// Pending fetches of one vbucket keyed by disk row id
pub type BgFetchQueue = HashMap<i64, Vec<BgFetchItem>>;

/// A vbucket
pub struct VBucket {
    id: VBucketId,
    state: RwLock<VBucketState>,
    /// Incarnation of this vbucket id; queued items from older ones are stale
    version: u64,
    pub ht: HashTable,
    pub checkpoints: CheckpointManager,
    pending_ops: Mutex<Vec<Requester>>,
    pending_bg_fetches: Mutex<BgFetchQueue>,
    pub ops_create: AtomicU64,
    pub ops_update: AtomicU64,
    pub ops_delete: AtomicU64,
    pub ops_reject: AtomicU64,
    /// Highest seqno of a delete known to be persisted
    max_deleted_seqno: AtomicU64,
    stats: Arc<EpStats>,
}

impl VBucket {
    pub fn new(
        id: VBucketId,
        state: VBucketState,
        version: u64,
        checkpoint_id: u64,
        ht_locks: usize,
        chk_max_items: usize,
        stats: Arc<EpStats>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            version,
            ht: HashTable::new(ht_locks, Arc::clone(&stats)),
            checkpoints: CheckpointManager::new(checkpoint_id.max(1), chk_max_items),
            pending_ops: Mutex::new(Vec::new()),
            pending_bg_fetches: Mutex::new(HashMap::new()),
            ops_create: AtomicU64::new(0),
            ops_update: AtomicU64::new(0),
            ops_delete: AtomicU64::new(0),
            ops_reject: AtomicU64::new(0),
            max_deleted_seqno: AtomicU64::new(0),
            stats,
        }
    }

    pub const fn id(&self) -> VBucketId {
        self.id
    }

    pub const fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    /// Change state, returning the previous one
    pub fn set_state(&self, to: VBucketState) -> VBucketState {
        let mut state = self.state.write();
        let old = *state;
        if to == VBucketState::Active
            && self.checkpoints.open_checkpoint_id() < INITIAL_ACTIVE_CHECKPOINT_ID
        {
            self.checkpoints
                .set_open_checkpoint_id(INITIAL_ACTIVE_CHECKPOINT_ID);
        }
        *state = to;
        debug!(vbucket = self.id, from = %old, to = %to, "vbucket state changed");
        old
    }

    /// Park a requester until the vbucket leaves `pending`
    ///
    /// Returns false if the vbucket is no longer pending; the caller should
    /// retry the operation instead of waiting.
    pub fn add_pending_op(&self, requester: Requester) -> bool {
        let state = self.state.read();
        if *state != VBucketState::Pending {
            return false;
        }
        self.pending_ops.lock().push(requester);
        true
    }

    pub fn num_pending_ops(&self) -> usize {
        self.pending_ops.lock().len()
    }

    /// Release parked requesters according to the current state
    pub fn fire_all_ops(&self) {
        let status = match self.state() {
            VBucketState::Pending => return,
            VBucketState::Active => Status::Success,
            VBucketState::Replica | VBucketState::Dead => Status::NotMyVBucket,
        };
        self.fire_all_ops_with(status);
    }

    /// Release parked requesters with an explicit status
    pub fn fire_all_ops_with(&self, status: Status) {
        let ops = std::mem::take(&mut *self.pending_ops.lock());
        if !ops.is_empty() {
            debug!(vbucket = self.id, count = ops.len(), %status, "firing pending ops");
        }
        for op in ops {
            op.notify_io_complete(status);
        }
    }

    /// Queue a background fetch; returns the number of distinct rows pending
    pub fn queue_bg_fetch_item(&self, row_id: i64, item: BgFetchItem) -> usize {
        let mut queue = self.pending_bg_fetches.lock();
        queue.entry(row_id).or_default().push(item);
        queue.len()
    }

    pub fn has_pending_bg_fetches(&self) -> bool {
        !self.pending_bg_fetches.lock().is_empty()
    }

    pub fn take_bg_fetch_items(&self) -> BgFetchQueue {
        std::mem::take(&mut *self.pending_bg_fetches.lock())
    }

    /// Drop all pending fetches, returning their requesters
    pub fn drain_bg_fetch_requesters(&self) -> Vec<Requester> {
        self.take_bg_fetch_items()
            .into_values()
            .flatten()
            .filter_map(|item| item.requester)
            .collect()
    }

    pub fn num_items(&self) -> usize {
        self.ht.num_items()
    }

    pub fn num_non_resident(&self) -> usize {
        self.ht.num_non_resident()
    }

    pub fn max_deleted_seqno(&self) -> u64 {
        self.max_deleted_seqno.load(Ordering::Relaxed)
    }

    pub fn note_deleted_seqno(&self, seqno: u64) {
        self.max_deleted_seqno.fetch_max(seqno, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &EpStats {
        &self.stats
    }

    /// Created, updated, deleted and rejected op counts
    pub fn op_counts(&self) -> [u64; 4] {
        [
            self.ops_create.load(Ordering::Relaxed),
            self.ops_update.load(Ordering::Relaxed),
            self.ops_delete.load(Ordering::Relaxed),
            self.ops_reject.load(Ordering::Relaxed),
        ]
    }
}

impl Drop for VBucket {
    fn drop(&mut self) {
        let ops = std::mem::take(self.pending_ops.get_mut());
        for op in ops {
            op.notify_io_complete(Status::NotMyVBucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;

    fn vbucket(state: VBucketState) -> VBucket {
        VBucket::new(0, state, 1, 1, 5, 100, Arc::new(EpStats::default()))
    }

    #[test]
    fn test_activation_bumps_checkpoint() {
        let vb = vbucket(VBucketState::Dead);
        assert_eq!(vb.checkpoints.open_checkpoint_id(), 1);
        assert_eq!(vb.set_state(VBucketState::Active), VBucketState::Dead);
        assert_eq!(vb.checkpoints.open_checkpoint_id(), 2);
    }

    #[test]
    fn test_pending_ops_fire_on_activation() {
        let vb = vbucket(VBucketState::Pending);
        let (notifier, rx) = ChannelNotifier::new();
        assert!(vb.add_pending_op(notifier.clone()));
        vb.fire_all_ops();
        assert!(rx.try_recv().is_err());

        vb.set_state(VBucketState::Active);
        vb.fire_all_ops();
        assert_eq!(rx.try_recv().unwrap(), Status::Success);
        assert_eq!(vb.num_pending_ops(), 0);
        assert!(!vb.add_pending_op(notifier));
    }

    #[test]
    fn test_pending_ops_rejected_when_dead() {
        let vb = vbucket(VBucketState::Pending);
        let (notifier, rx) = ChannelNotifier::new();
        vb.add_pending_op(notifier);
        vb.set_state(VBucketState::Dead);
        vb.fire_all_ops();
        assert_eq!(rx.try_recv().unwrap(), Status::NotMyVBucket);
    }

    #[test]
    fn test_drop_notifies_waiters() {
        let vb = vbucket(VBucketState::Pending);
        let (notifier, rx) = ChannelNotifier::new();
        vb.add_pending_op(notifier);
        drop(vb);
        assert_eq!(rx.try_recv().unwrap(), Status::NotMyVBucket);
    }

    #[test]
    fn test_bg_fetch_queue_groups_by_row() {
        let vb = vbucket(VBucketState::Active);
        assert_eq!(vb.queue_bg_fetch_item(7, BgFetchItem::new("a", None, false)), 1);
        assert_eq!(vb.queue_bg_fetch_item(7, BgFetchItem::new("a", None, false)), 1);
        assert_eq!(vb.queue_bg_fetch_item(9, BgFetchItem::new("b", None, false)), 2);
        let queue = vb.take_bg_fetch_items();
        assert_eq!(queue[&7].len(), 2);
        assert!(!vb.has_pending_bg_fetches());
    }
}
