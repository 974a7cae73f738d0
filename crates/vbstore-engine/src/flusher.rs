//! Persistence of queued mutations.
//!
//! The flusher task runs on the `rw` dispatcher. Each run drains every
//! vbucket: previously rejected mutations first, then the checkpoint queue.
//! Surviving mutations are written in transactions of `max_txn_size`; the
//! mutation log brackets every commit with `Commit1`/`Commit2` so replay can
//! tell a finished transaction from a torn one.

use crate::dispatcher::{Dispatcher, Next, TaskId, priority};
use crate::item::{Item, now_secs};
use crate::kvstore::WriteResult;
use crate::mutation_log::MutationLog;
use crate::queued_item::{QueuedItemRef, dedup_keep_last};
use crate::stats::EpStats;
use crate::store::{EpStore, micros};
use crate::vbucket::VBucket;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use vbstore_common::{QueueOp, VBucketId};
use vbstore_common::config::FlusherConfig;

/// Flusher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlusherState {
    /// Waiting for warmup to finish
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl FlusherState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Mutations bounced by a flush, retried first on the next one
#[derive(Default)]
pub(crate) struct RejectQueue {
    queues: Mutex<HashMap<VBucketId, VecDeque<QueuedItemRef>>>,
}

impl RejectQueue {
    pub(crate) fn push(&self, item: QueuedItemRef) {
        self.queues
            .lock()
            .entry(item.vbucket())
            .or_default()
            .push_back(item);
    }

    pub(crate) fn take(&self, vb: VBucketId) -> VecDeque<QueuedItemRef> {
        self.queues.lock().remove(&vb).unwrap_or_default()
    }

    pub(crate) fn len(&self, vb: VBucketId) -> usize {
        self.queues.lock().get(&vb).map_or(0, VecDeque::len)
    }

    pub(crate) fn total(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    pub(crate) fn vbuckets(&self) -> Vec<VBucketId> {
        self.queues.lock().keys().copied().collect()
    }
}

/// Drives persistence on the `rw` dispatcher
pub struct Flusher {
    state: Mutex<FlusherState>,
    state_changed: Condvar,
    force_stop: AtomicBool,
    task: Mutex<Option<TaskId>>,
    dispatcher: Arc<Dispatcher>,
    config: FlusherConfig,
    /// Serializes transactions against the read-write store
    pub(crate) txn_lock: Mutex<()>,
    pub(crate) rejects: Arc<RejectQueue>,
}

impl Flusher {
    pub fn new(dispatcher: Arc<Dispatcher>, config: FlusherConfig) -> Self {
        Self {
            state: Mutex::new(FlusherState::Initializing),
            state_changed: Condvar::new(),
            force_stop: AtomicBool::new(false),
            task: Mutex::new(None),
            dispatcher,
            config,
            txn_lock: Mutex::new(()),
            rejects: Arc::new(RejectQueue::default()),
        }
    }

    pub fn state(&self) -> FlusherState {
        *self.state.lock()
    }

    /// Schedule the flusher task
    pub(crate) fn start(&self, store: &Arc<EpStore>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(store);
        let id = self
            .dispatcher
            .schedule("flusher", priority::FLUSHER, Duration::ZERO, move || {
                weak.upgrade()
                    .map_or(Next::Done, |store| store.flusher().step(&store))
            });
        *task = Some(id);
    }

    /// Run the flusher now instead of at the end of its sleep
    pub fn wake(&self) {
        if let Some(id) = *self.task.lock() {
            self.dispatcher.wake(id);
        }
    }

    pub fn pause(&self) -> bool {
        self.transition(FlusherState::Running, FlusherState::Paused)
    }

    pub fn resume(&self) -> bool {
        let resumed = self.transition(FlusherState::Paused, FlusherState::Running);
        if resumed {
            self.wake();
        }
        resumed
    }

    fn transition(&self, from: FlusherState, to: FlusherState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        self.state_changed.notify_all();
        info!("Flusher {} -> {}", from.as_str(), to.as_str());
        true
    }

    /// Stop the flusher and wait for it
    ///
    /// Without `force` every queued mutation is persisted first.
    pub fn stop(&self, force: bool) {
        let task = *self.task.lock();
        {
            let mut state = self.state.lock();
            if *state == FlusherState::Stopped {
                return;
            }
            if task.is_none() {
                *state = FlusherState::Stopped;
                self.state_changed.notify_all();
                return;
            }
            self.force_stop.store(force, Ordering::Release);
            *state = FlusherState::Stopping;
        }
        self.wake();
        let mut state = self.state.lock();
        while *state != FlusherState::Stopped {
            self.state_changed.wait(&mut state);
        }
    }

    fn step(&self, store: &EpStore) -> Next {
        let state = self.state();
        match state {
            FlusherState::Initializing => {
                if store.stats().warmup_complete.load(Ordering::Acquire) {
                    self.transition(FlusherState::Initializing, FlusherState::Running);
                    Next::Snooze(Duration::ZERO)
                } else {
                    Next::Snooze(Duration::from_millis(100))
                }
            }
            FlusherState::Running => {
                let flushed = store.flush_all_vbuckets();
                if flushed > 0 {
                    Next::Snooze(Duration::ZERO)
                } else if store.stats().disk_queue_size() > 0 {
                    Next::Snooze(self.config.commit_retry_backoff())
                } else {
                    Next::Snooze(self.config.idle_sleep())
                }
            }
            FlusherState::Paused => Next::Snooze(self.config.idle_sleep()),
            FlusherState::Stopping => {
                if !self.force_stop.load(Ordering::Acquire) {
                    self.drain(store);
                }
                let mut state = self.state.lock();
                *state = FlusherState::Stopped;
                self.state_changed.notify_all();
                info!("Flusher stopped");
                Next::Done
            }
            FlusherState::Stopped => Next::Done,
        }
    }

    fn drain(&self, store: &EpStore) {
        loop {
            let flushed = store.flush_all_vbuckets();
            let remaining = store.stats().disk_queue_size();
            if remaining == 0 {
                return;
            }
            if flushed == 0 {
                warn!(
                    remaining,
                    rejected = self.rejects.total(),
                    "Flusher stopping with unpersisted mutations"
                );
                return;
            }
        }
    }
}

/// Completion of one persisted mutation
struct PersistenceCallback {
    item: QueuedItemRef,
    vb: Arc<VBucket>,
    /// CAS of the entry when the write was issued
    cas: u64,
    stats: Arc<EpStats>,
    log: Arc<MutationLog>,
    rejects: Arc<RejectQueue>,
}

impl PersistenceCallback {
    fn set_done(self, result: WriteResult) {
        let key = self.item.key();
        match result.rows_affected {
            1 => {
                {
                    let mut bucket = self.vb.ht.lock(key);
                    if let Some(mut v) = bucket.find_mut(key, true) {
                        if result.row_id > 0 {
                            if v.is_pending_id() {
                                self.log.new_item(self.vb.id(), key, result.row_id);
                                self.stats.new_items_logged.fetch_add(1, Ordering::Relaxed);
                            }
                            v.set_row_id(result.row_id);
                        }
                        if v.cas() == self.cas {
                            v.mark_clean();
                        }
                    }
                }
                self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_decr(1);
            }
            0 => {
                // The row we updated is gone; write it as a new row next time.
                warn!(
                    vbucket = self.vb.id(),
                    key = %key,
                    row_id = result.row_id,
                    "Update of a persisted item affected no rows"
                );
                {
                    let mut bucket = self.vb.ht.lock(key);
                    if let Some(mut v) = bucket.find_mut(key, true) {
                        v.clear_row_id();
                    }
                }
                self.reject();
            }
            _ => {
                warn!(vbucket = self.vb.id(), key = %key, "Failed to persist item, requeueing");
                self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
                self.reject();
            }
        }
    }

    fn del_done(self, rows: i32) {
        let key = self.item.key();
        if rows < 0 {
            warn!(vbucket = self.vb.id(), key = %key, "Failed to persist delete, requeueing");
            self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
            self.reject();
            return;
        }
        self.log.del_item(self.vb.id(), key);
        self.stats.del_items_logged.fetch_add(1, Ordering::Relaxed);
        {
            let mut bucket = self.vb.ht.lock(key);
            let still_deleted = match bucket.find_mut(key, true) {
                Some(mut v) if !v.is_deleted() => {
                    v.clear_row_id();
                    false
                }
                Some(_) => true,
                None => false,
            };
            if still_deleted {
                bucket.remove(key);
            }
        }
        if rows > 0 {
            self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
            self.vb.ops_delete.fetch_add(1, Ordering::Relaxed);
            self.vb.note_deleted_seqno(self.item.seqno());
        }
        self.stats.queue_decr(1);
    }

    /// Put the entry back on the dirty path and retry on the next flush
    fn reject(self) {
        {
            let key = self.item.key();
            let mut bucket = self.vb.ht.lock(key);
            if let Some(mut v) = bucket.find_mut(key, true) {
                v.re_dirty();
            }
        }
        self.vb.ops_reject.fetch_add(1, Ordering::Relaxed);
        self.rejects.push(self.item);
    }
}

impl EpStore {
    /// Persist everything queued, returning the mutations resolved
    pub(crate) fn flush_all_vbuckets(&self) -> usize {
        let mut flushed = 0;
        if self.disk_flush_all.swap(false, Ordering::AcqRel) {
            flushed += self.flush_one_delete_all();
        }
        for vb in self.vbuckets.bucket_ids() {
            flushed += self.flush_vbucket(vb);
        }
        // Rejects of vbuckets that no longer exist can never be written.
        for vb in self.flusher.rejects.vbuckets() {
            if self.vbuckets.get_bucket(vb).is_none() {
                let dropped = self.flusher.rejects.take(vb).len();
                self.stats.queue_decr(dropped);
                flushed += dropped;
            }
        }
        flushed
    }

    fn flush_one_delete_all(&self) -> usize {
        let _txn = self.flusher.txn_lock.lock();
        if !self.rw_store.reset() {
            warn!("Failed to reset the underlying store, will retry");
            self.disk_flush_all.store(true, Ordering::Release);
            return 0;
        }
        for vb in self.vbuckets.bucket_ids() {
            self.mutation_log.delete_all(vb);
        }
        self.mutation_log.commit1();
        self.mutation_log.commit2();
        self.stats.queue_decr(1);
        info!("Flushed all items from the underlying store");
        1
    }

    /// Persist the queued mutations of one vbucket
    ///
    /// Returns how many mutations were resolved; rejected mutations stay
    /// queued for the next flush.
    pub fn flush_vbucket(&self, vbid: VBucketId) -> usize {
        let _txn = self.flusher.txn_lock.lock();
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            let dropped = self.flusher.rejects.take(vbid).len();
            self.stats.queue_decr(dropped);
            return 0;
        };

        let mut items: Vec<QueuedItemRef> = self.flusher.rejects.take(vbid).into();
        let (queued, checkpoint_id) = vb.checkpoints.items_for_persistence();
        items.extend(queued);
        if items.is_empty() {
            return 0;
        }
        let total = items.len();
        let mut items = dedup_keep_last(items);
        let duplicates = total - items.len();
        let deletes = items.iter().filter(|qi| qi.op() == QueueOp::Del).count();
        self.stats.queue_decr(duplicates);
        self.rw_store.optimize_writes(&mut items);

        let mut written = 0;
        let txn_size = self.config.flusher.max_txn_size;
        let mut chunks = items.chunks(txn_size);
        while let Some(chunk) = chunks.next() {
            if !self.begin_txn() {
                chunk
                    .iter()
                    .chain(chunks.by_ref().flatten())
                    .for_each(|qi| self.flusher.rejects.push(Arc::clone(qi)));
                break;
            }
            for qi in chunk {
                self.flush_one(&vb, qi);
            }
            self.mutation_log.commit1();
            if !self.commit_txn() {
                break;
            }
            self.mutation_log.commit2();
            self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
            written += chunk.len();
        }

        if checkpoint_id > self.vbuckets.persistence_checkpoint_id(vbid) {
            self.vbuckets
                .set_persistence_checkpoint_id(vbid, checkpoint_id);
            self.schedule_vb_snapshot(true);
        }

        let rejected = self.flusher.rejects.len(vbid);
        debug!(
            vbucket = vbid,
            written,
            deletes,
            rejected,
            duplicates,
            "flushed vbucket"
        );
        (written + duplicates).saturating_sub(rejected)
    }

    /// Open a transaction, retrying until it succeeds or shutdown is forced
    fn begin_txn(&self) -> bool {
        while !self.rw_store.begin() {
            self.stats.begin_failed.fetch_add(1, Ordering::Relaxed);
            if self.stats.force_shutdown.load(Ordering::Acquire) {
                return false;
            }
            warn!(
                "Failed to start a transaction, retrying in {:?}",
                self.config.flusher.commit_retry_backoff()
            );
            std::thread::sleep(self.config.flusher.commit_retry_backoff());
        }
        true
    }

    fn commit_txn(&self) -> bool {
        while !self.rw_store.commit() {
            self.stats.commit_failed.fetch_add(1, Ordering::Relaxed);
            if self.stats.force_shutdown.load(Ordering::Acquire) {
                warn!("Abandoning an uncommitted transaction on forced shutdown");
                self.rw_store.rollback();
                return false;
            }
            warn!(
                "Failed to commit, retrying in {:?}",
                self.config.flusher.commit_retry_backoff()
            );
            std::thread::sleep(self.config.flusher.commit_retry_backoff());
        }
        true
    }

    fn callback(&self, vb: &Arc<VBucket>, qi: &QueuedItemRef, cas: u64) -> PersistenceCallback {
        PersistenceCallback {
            item: Arc::clone(qi),
            vb: Arc::clone(vb),
            cas,
            stats: Arc::clone(&self.stats),
            log: Arc::clone(&self.mutation_log),
            rejects: Arc::clone(&self.flusher.rejects),
        }
    }

    /// Issue the write for one queued mutation
    fn flush_one(&self, vb: &Arc<VBucket>, qi: &QueuedItemRef) {
        let vbid = vb.id();
        if qi.vbucket_version() != vb.version() {
            // Queued against an earlier incarnation of this vbucket.
            self.stats.queue_decr(1);
            return;
        }
        let key = qi.key();
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        let Some(mut v) = bucket.find_mut(key, true) else {
            self.stats.queue_decr(1);
            return;
        };
        if v.is_temp() || !v.is_dirty() {
            // Already persisted by a later copy of this mutation.
            self.stats.queue_decr(1);
            return;
        }

        // The vbucket's disk shard is being created or purged.
        let shard_busy =
            self.vbuckets.is_bucket_creation(vbid) || self.vbuckets.is_bucket_deletion(vbid);
        if shard_busy || (!v.is_deleted() && v.is_pending_id()) {
            v.re_dirty();
            drop(v);
            drop(bucket);
            vb.ops_reject.fetch_add(1, Ordering::Relaxed);
            self.flusher.rejects.push(Arc::clone(qi));
            return;
        }

        self.stats.record_dirty_age(micros(qi.dirtied().elapsed()));
        let mut deleted = v.is_deleted();
        let row_id = v.row_id();
        if !deleted && v.is_expired(now.saturating_add(self.config.expiry_window)) {
            self.stats.flush_expired.fetch_add(1, Ordering::Relaxed);
            v.mark_clean();
            v.clear_row_id();
            deleted = true;
        }

        if deleted {
            drop(v);
            drop(bucket);
            let item = Item {
                row_id,
                ..Item::key_only(key, vbid)
            };
            let cb = self.callback(vb, qi, 0);
            self.rw_store
                .del(&item, row_id, Box::new(move |rows| cb.del_done(rows)));
        } else {
            if row_id > 0 {
                vb.ops_update.fetch_add(1, Ordering::Relaxed);
            } else {
                v.set_pending_id();
                vb.ops_create.fetch_add(1, Ordering::Relaxed);
            }
            let item = v.to_item(vbid, false, now);
            let cas = v.cas();
            drop(v);
            drop(bucket);
            let cb = self.callback(vb, qi, cas);
            self.rw_store
                .set(&item, Box::new(move |result| cb.set_done(result)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::mutation_log::MutationLogHarvester;
    use crate::queued_item::QueuedItem;
    use crate::testing::{active_store, get_value, test_config};
    use vbstore_common::{Status, VBucketState};

    #[test]
    fn test_set_is_persisted_and_logged() {
        let (store, disk, _dir) = active_store(&[0]);
        assert!(store.set(&Item::new("k", 0, "v"), None).is_success());
        assert_eq!(store.stats().disk_queue_size(), 1);

        assert_eq!(store.flush_vbucket(0), 1);
        assert_eq!(store.stats().disk_queue_size(), 0);
        let stored = disk.stored(0, "k").unwrap();
        assert_eq!(stored.value.as_deref(), Some(&b"v"[..]));

        let stats = store.get_key_stats("k", 0).unwrap();
        assert!(!stats.dirty);
        assert_eq!(stats.row_id, stored.row_id);

        let mut harvester = MutationLogHarvester::new(store.mutation_log());
        harvester.load().unwrap();
        assert_eq!(harvester.total(), 1);
        assert_eq!(store.vbucket(0).unwrap().op_counts()[0], 1);
    }

    #[test]
    fn test_duplicates_collapse_to_last_value() {
        let (store, disk, _dir) = active_store(&[0]);
        store.set(&Item::new("k", 0, "one"), None);
        store.flush_vbucket(0);
        store.set(&Item::new("k", 0, "two"), None);
        store.set(&Item::new("k", 0, "three"), None);
        store.flush_vbucket(0);
        assert_eq!(disk.num_rows(), 1);
        assert_eq!(
            disk.stored(0, "k").unwrap().value.as_deref(),
            Some(&b"three"[..])
        );
        assert_eq!(store.vbucket(0).unwrap().op_counts()[1], 1);
    }

    #[test]
    fn test_dirty_age_counts_from_first_mutation() {
        let (store, _disk, _dir) = active_store(&[0]);
        store.set(&Item::new("k", 0, "one"), None);
        std::thread::sleep(Duration::from_millis(5));
        store.set(&Item::new("k", 0, "two"), None);
        assert_eq!(store.flush_vbucket(0), 1);

        let stats = store.stats().snapshot();
        assert!(stats.dirty_age_us >= 5_000);
        assert!(stats.dirty_age_high_wat_us >= stats.dirty_age_us);
    }

    #[test]
    fn test_duplicates_across_checkpoints_keep_last() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(MemoryKvStore::new());
        let mut config = test_config(dir.path());
        config.chk_max_items = 1;
        let store = EpStore::new(config, disk.clone()).unwrap();
        store.mutation_log().open().unwrap();
        store.stats().warmup_complete.store(true, Ordering::Release);
        store.set_vbucket_state(0, VBucketState::Active);
        assert!(store.snapshot_vbuckets());

        // Every mutation lands in its own checkpoint.
        store.set(&Item::new("k", 0, "one"), None);
        store.set(&Item::new("d", 0, "v"), None);
        store.set(&Item::new("k", 0, "two"), None);
        store.delete_item("d", 0, 0, None, false, None);
        assert_eq!(store.vbucket(0).unwrap().checkpoints.num_items(), 4);

        assert_eq!(store.flush_vbucket(0), 4);
        assert_eq!(store.stats().disk_queue_size(), 0);
        assert_eq!(disk.num_rows(), 1);
        assert_eq!(disk.stored(0, "k").unwrap().value.as_deref(), Some(&b"two"[..]));
        assert!(disk.stored(0, "d").is_none());

        let mut harvester = MutationLogHarvester::new(store.mutation_log());
        harvester.load().unwrap();
        assert_eq!(harvester.total(), 1);
    }

    #[test]
    fn test_commit_failures_are_retried() {
        let (store, disk, _dir) = active_store(&[0]);
        store.set(&Item::new("k", 0, "v"), None);
        disk.fail_next_begins(1);
        disk.fail_next_commits(2);
        assert_eq!(store.flush_vbucket(0), 1);
        assert!(disk.stored(0, "k").is_some());
        let stats = store.stats().snapshot();
        assert_eq!(stats.begin_failed, 1);
        assert_eq!(stats.commit_failed, 2);
        assert_eq!(stats.disk_queue_size, 0);
    }

    #[test]
    fn test_failed_set_is_rejected_then_retried() {
        let (store, disk, _dir) = active_store(&[0]);
        disk.fail_sets_of("bad");
        store.set(&Item::new("bad", 0, "v"), None);
        store.set(&Item::new("good", 0, "v"), None);

        assert_eq!(store.flush_vbucket(0), 1);
        assert!(disk.stored(0, "good").is_some());
        assert!(disk.stored(0, "bad").is_none());
        assert_eq!(store.stats().disk_queue_size(), 1);
        assert!(store.get_key_stats("bad", 0).unwrap().dirty);
        assert_eq!(store.vbucket(0).unwrap().op_counts()[3], 1);

        disk.clear_set_failures();
        assert_eq!(store.flush_vbucket(0), 1);
        assert!(disk.stored(0, "bad").is_some());
        assert_eq!(store.stats().disk_queue_size(), 0);
    }

    #[test]
    fn test_vbucket_in_creation_rejects_until_created() {
        let (store, disk, _dir) = active_store(&[]);
        disk.fail_next_snapshots(usize::MAX);
        assert_eq!(store.set_vbucket_state(3, VBucketState::Active), Status::Success);
        assert!(store.vbuckets().is_bucket_creation(3));
        store.set(&Item::new("foo", 3, "bar"), None);

        assert_eq!(store.flush_vbucket(3), 0);
        assert!(disk.stored(3, "foo").is_none());
        assert_eq!(store.stats().disk_queue_size(), 1);

        disk.fail_next_snapshots(0);
        assert!(store.snapshot_vbuckets());
        assert!(!store.vbuckets().is_bucket_creation(3));
        assert_eq!(store.flush_vbucket(3), 1);
        assert!(disk.stored(3, "foo").is_some());
    }

    #[test]
    fn test_delete_removes_row_and_entry() {
        let (store, disk, _dir) = active_store(&[0]);
        store.set(&Item::new("k", 0, "v"), None);
        store.flush_vbucket(0);
        assert_eq!(
            store.delete_item("k", 0, 0, None, false, None).status,
            Status::Success
        );
        store.flush_vbucket(0);
        assert!(disk.stored(0, "k").is_none());
        assert!(store.get_key_stats("k", 0).is_err());
        assert_eq!(store.vbucket(0).unwrap().op_counts()[2], 1);
        assert_eq!(store.stats().snapshot().del_items_logged, 1);
    }

    #[test]
    fn test_expiring_item_is_not_persisted() {
        let (store, disk, _dir) = active_store(&[0]);
        let soon = now_secs() + 1;
        store.set(&Item::new("k", 0, "v").with_exptime(soon), None);
        store.flush_vbucket(0);
        assert!(disk.stored(0, "k").is_none());
        assert_eq!(store.stats().snapshot().flush_expired, 1);
        assert_eq!(store.stats().disk_queue_size(), 0);
    }

    #[test]
    fn test_flush_all_wipes_disk() {
        let (store, disk, _dir) = active_store(&[0]);
        store.set(&Item::new("k", 0, "v"), None);
        store.flush_vbucket(0);
        store.reset();
        assert_eq!(store.stats().disk_queue_size(), 1);
        store.flush_all_vbuckets();
        assert_eq!(disk.num_rows(), 0);
        assert_eq!(store.stats().disk_queue_size(), 0);
        assert_eq!(get_value(&store, "k", 0).status, Status::KeyNotFound);
    }

    #[test]
    fn test_stop_drains_queue() {
        let (store, disk, _dir) = active_store(&[0]);
        store.flusher().start(&store);
        for i in 0..10 {
            store.set(&Item::new(format!("k{i}"), 0, "v"), None);
        }
        store.flusher().stop(false);
        assert_eq!(store.flusher().state(), FlusherState::Stopped);
        assert_eq!(disk.num_rows(), 10);
        assert_eq!(store.stats().disk_queue_size(), 0);
    }

    #[test]
    fn test_reject_queue_fifo() {
        let rejects = RejectQueue::default();
        let item = |k: &str| Arc::new(QueuedItem::new(k, 1, QueueOp::Set, 1, -1, 1));
        rejects.push(item("a"));
        rejects.push(item("b"));
        assert_eq!(rejects.len(1), 2);
        let keys: Vec<_> = rejects
            .take(1)
            .iter()
            .map(|q| q.key().to_string())
            .collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(rejects.total(), 0);
    }
}
