//! The vbucket store.
//!
//! [`EpStore`] owns the vbucket map, the underlying disk store and the four
//! dispatchers background work runs on:
//!
//! - `rw`: the flusher
//! - `ro`: background fetches and warmup
//! - `auxio`: vbucket snapshots, vbucket deletions and log compaction
//! - `nonio`: the item and expiry pagers
//!
//! Client operations never touch disk. A read of an ejected value returns
//! `WouldBlock` and the requester is notified once the fetch completes.

use crate::bgfetcher::{BgFetcher, MAX_BG_FETCH_ATTEMPTS};
use crate::dispatcher::{Dispatcher, Next, Priority, TaskId, priority};
use crate::flusher::Flusher;
use crate::hashtable::{AddType, LockedBucket, MutationType};
use crate::item::{CasCounter, GetValue, Item, ItemMetaData, NO_ROW_ID, now_secs};
use crate::item_pager::{ExpiredItemPager, ItemPager};
use crate::kvstore::{KvStore, RedbKvStore, VBucketStateMap};
use crate::mutation_log::{LogRecord, LogRecordType, MutationLog, MutationLogHarvester};
use crate::notify::{Requester, Waiter};
use crate::queued_item::QueuedItem;
use crate::stats::EpStats;
use crate::stored_value::TempState;
use crate::vbucket::{BgFetchItem, BgFetchQueue, INITIAL_ACTIVE_CHECKPOINT_ID, VBucket};
use crate::vbucket_map::VBucketMap;
use crate::warmup::Warmup;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vbstore_common::{
    EngineConfig, PersistedVBucketState, QueueOp, Result, Status, VBucketId, VBucketState,
};

/// File name of the redb database under the data directory
pub const DB_FILE: &str = "vbstore.redb";

/// Outcome of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub status: Status,
    /// CAS of the stored entry on success
    pub cas: u64,
}

impl MutationResult {
    const fn failed(status: Status) -> Self {
        Self { status, cas: 0 }
    }

    const fn stored(cas: u64) -> Self {
        Self {
            status: Status::Success,
            cas,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outcome of a metadata read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetMetaResult {
    pub status: Status,
    pub meta: Option<ItemMetaData>,
    /// The key exists only as a tombstone
    pub deleted: bool,
}

impl GetMetaResult {
    const fn status(status: Status) -> Self {
        Self {
            status,
            meta: None,
            deleted: false,
        }
    }
}

/// Diagnostic view of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub logically_deleted: bool,
    pub dirty: bool,
    pub exptime: u32,
    pub flags: u32,
    pub cas: u64,
    pub row_id: i64,
    pub resident: bool,
    pub vb_state: VBucketState,
}

/// Per-vbucket counters
#[derive(Debug, Clone, Serialize)]
pub struct VBucketStats {
    pub id: VBucketId,
    pub state: VBucketState,
    pub num_items: usize,
    pub num_non_resident: usize,
    pub queue_size: usize,
    pub pending_ops: usize,
    pub ops_create: u64,
    pub ops_update: u64,
    pub ops_delete: u64,
    pub ops_reject: u64,
}

/// The vbucket store
pub struct EpStore {
    pub(crate) config: EngineConfig,
    pub(crate) stats: Arc<EpStats>,
    pub(crate) vbuckets: VBucketMap,
    /// Serializes vbucket creation, state changes and removal
    vbset_mutex: Mutex<()>,
    pub(crate) rw_store: Arc<dyn KvStore>,
    pub(crate) ro_store: Arc<dyn KvStore>,
    pub(crate) mutation_log: Arc<MutationLog>,
    pub(crate) cas: CasCounter,
    rw_dispatcher: Arc<Dispatcher>,
    ro_dispatcher: Arc<Dispatcher>,
    auxio_dispatcher: Arc<Dispatcher>,
    nonio_dispatcher: Arc<Dispatcher>,
    pub(crate) flusher: Flusher,
    pub(crate) bg_fetcher: BgFetcher,
    warmup: Warmup,
    /// A wipe of the whole disk store is queued
    pub(crate) disk_flush_all: AtomicBool,
    maintenance_tasks: Mutex<Vec<(Arc<Dispatcher>, TaskId)>>,
    shut_down: AtomicBool,
    weak_self: Weak<Self>,
}

impl EpStore {
    /// Create a store over `rw_store`
    ///
    /// Nothing runs until [`EpStore::initialize`].
    pub fn new(config: EngineConfig, rw_store: Arc<dyn KvStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let stats = Arc::new(EpStats::new(
            config.max_size,
            config.low_watermark(),
            config.high_watermark(),
            config.mutation_memory_limit(),
        ));
        let ro_store = rw_store.read_only();
        let rw_dispatcher = Arc::new(Dispatcher::new("rw")?);
        let ro_dispatcher = Arc::new(Dispatcher::new("ro")?);
        let auxio_dispatcher = Arc::new(Dispatcher::new("auxio")?);
        let nonio_dispatcher = Arc::new(Dispatcher::new("nonio")?);
        let flusher = Flusher::new(Arc::clone(&rw_dispatcher), config.flusher.clone());
        let bg_fetcher = BgFetcher::new(Arc::clone(&ro_dispatcher), &config.bg_fetch);
        let warmup = Warmup::new(Arc::clone(&ro_dispatcher));
        let mutation_log = Arc::new(MutationLog::new(&config.klog));
        let vbuckets = VBucketMap::new(config.max_vbuckets);

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            stats,
            vbuckets,
            vbset_mutex: Mutex::new(()),
            rw_store,
            ro_store,
            mutation_log,
            cas: CasCounter::new(),
            rw_dispatcher,
            ro_dispatcher,
            auxio_dispatcher,
            nonio_dispatcher,
            flusher,
            bg_fetcher,
            warmup,
            disk_flush_all: AtomicBool::new(false),
            maintenance_tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    /// Create a store persisting to a redb database under `config.data_dir`
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let disk = RedbKvStore::open(config.data_dir.join(DB_FILE))?;
        Self::new(config, Arc::new(disk))
    }

    /// Open the mutation log, warm up and start background work
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.mutation_log.open() {
            warn!("Mutation log unusable, continuing without it: {}", e);
            self.mutation_log.disable();
        }

        if self.config.warmup.enabled {
            self.warmup.start(self);
        } else {
            self.reset();
            self.stats.warmup_complete.store(true, Ordering::Release);
        }

        self.flusher.start(self);
        self.bg_fetcher.start(self);

        if self.config.warmup.enabled && self.config.warmup.wait_for_warmup {
            self.warmup.wait();
        }
        self.schedule_maintenance();
        info!(
            data_dir = %self.config.data_dir.display(),
            max_vbuckets = self.config.max_vbuckets,
            "Store initialized"
        );
        Ok(())
    }

    /// Stop background work, persisting the queue unless `force`
    pub fn shutdown(&self, force: bool) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(force, queued = self.stats.disk_queue_size(), "Shutting down store");
        self.stats.force_shutdown.store(force, Ordering::Release);
        self.warmup.stop();
        for (dispatcher, id) in self.maintenance_tasks.lock().drain(..) {
            dispatcher.cancel(id);
        }
        self.bg_fetcher.stop();
        if !force {
            // Vbuckets still being created would bounce the final flush.
            self.snapshot_vbuckets();
        }
        self.flusher.stop(force);
        if !force {
            self.snapshot_vbuckets();
        }
        self.mutation_log.flush();
        self.mutation_log.sync();
        for dispatcher in [
            &self.nonio_dispatcher,
            &self.auxio_dispatcher,
            &self.ro_dispatcher,
            &self.rw_dispatcher,
        ] {
            dispatcher.stop(force);
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<EpStats> {
        &self.stats
    }

    pub const fn vbuckets(&self) -> &VBucketMap {
        &self.vbuckets
    }

    pub fn vbucket(&self, vbid: VBucketId) -> Option<Arc<VBucket>> {
        self.vbuckets.get_bucket(vbid)
    }

    pub const fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    pub const fn bg_fetcher(&self) -> &BgFetcher {
        &self.bg_fetcher
    }

    pub const fn warmup(&self) -> &Warmup {
        &self.warmup
    }

    pub fn mutation_log(&self) -> &MutationLog {
        &self.mutation_log
    }

    pub fn pause_flusher(&self) -> bool {
        self.flusher.pause()
    }

    pub fn resume_flusher(&self) -> bool {
        self.flusher.resume()
    }

    /// Run the flusher now if anything is queued
    pub fn wake_up_flusher(&self) -> bool {
        if self.stats.disk_queue_size() == 0 {
            return false;
        }
        self.flusher.wake();
        true
    }

    /// Counters of every vbucket, in id order
    pub fn vbucket_stats(&self) -> Vec<VBucketStats> {
        self.vbuckets
            .bucket_ids()
            .into_iter()
            .filter_map(|id| self.vbuckets.get_bucket(id))
            .map(|vb| {
                let [ops_create, ops_update, ops_delete, ops_reject] = vb.op_counts();
                VBucketStats {
                    id: vb.id(),
                    state: vb.state(),
                    num_items: vb.num_items(),
                    num_non_resident: vb.num_non_resident(),
                    queue_size: vb.checkpoints.num_items(),
                    pending_ops: vb.num_pending_ops(),
                    ops_create,
                    ops_update,
                    ops_delete,
                    ops_reject,
                }
            })
            .collect()
    }

    // ---- client operations ----

    /// Store an item, honoring `item.cas` when non-zero
    pub fn set(&self, item: &Item, requester: Option<Requester>) -> MutationResult {
        self.store_item(item, item.cas, requester.as_ref(), false, false)
    }

    /// Store an item carrying its own metadata, guarded by `cas`
    pub fn set_with_meta(
        &self,
        item: &Item,
        cas: u64,
        requester: Option<Requester>,
        force: bool,
    ) -> MutationResult {
        self.cas.observe(item.cas);
        self.store_item(item, cas, requester.as_ref(), force, true)
    }

    fn store_item(
        &self,
        item: &Item,
        cas: u64,
        requester: Option<&Requester>,
        force: bool,
        has_meta: bool,
    ) -> MutationResult {
        let vb = match self.route(item.vbucket, requester, VBucketState::Active, force) {
            Ok(vb) => vb,
            Err(status) => return MutationResult::failed(status),
        };
        let mut bucket = vb.ht.lock(&item.key);
        match bucket.set(item, cas, true, has_meta, &self.cas) {
            MutationType::NoMem => MutationResult::failed(Status::NoMemory),
            MutationType::InvalidCas | MutationType::IsLocked => {
                MutationResult::failed(Status::KeyExists)
            }
            MutationType::NotFound => MutationResult::failed(Status::KeyNotFound),
            MutationType::Inserted | MutationType::WasClean | MutationType::WasDirty => {
                self.queue_stored(&vb, &bucket, &item.key, QueueOp::Set)
            }
        }
    }

    /// Store an item only if the key is absent or deleted
    pub fn add(&self, item: &Item, requester: Option<Requester>) -> MutationResult {
        let vb = match self.route(item.vbucket, requester.as_ref(), VBucketState::Active, false) {
            Ok(vb) => vb,
            Err(status) => return MutationResult::failed(status),
        };
        if item.cas != 0 {
            return MutationResult::failed(Status::NotStored);
        }
        let mut bucket = vb.ht.lock(&item.key);
        match bucket.add(item, &self.cas) {
            AddType::NoMem => MutationResult::failed(Status::NoMemory),
            AddType::Exists => MutationResult::failed(Status::NotStored),
            AddType::Success | AddType::Undel => {
                self.queue_stored(&vb, &bucket, &item.key, QueueOp::Set)
            }
        }
    }

    /// Delete a key, leaving a tombstone until the delete is persisted
    pub fn delete_item(
        &self,
        key: &str,
        cas: u64,
        vbid: VBucketId,
        requester: Option<Requester>,
        force: bool,
        meta: Option<&ItemMetaData>,
    ) -> MutationResult {
        let vb = match self.route(vbid, requester.as_ref(), VBucketState::Active, force) {
            Ok(vb) => vb,
            Err(status) => return MutationResult::failed(status),
        };
        let mut bucket = vb.ht.lock(key);
        if bucket.find(key, meta.is_some()).is_none() {
            if force && vb.state() != VBucketState::Active {
                // A replicated delete of a key this copy never saw.
                self.queue_dirty(&vb, key, QueueOp::Del, NO_ROW_ID, 0);
            }
            return MutationResult::failed(Status::KeyNotFound);
        }
        if let Some(meta) = meta {
            self.cas.observe(meta.cas);
        }
        match bucket.soft_delete(key, cas, meta, &self.cas) {
            MutationType::NotFound => MutationResult::failed(Status::KeyNotFound),
            MutationType::InvalidCas => MutationResult::failed(Status::KeyExists),
            MutationType::IsLocked => MutationResult::failed(Status::TempFail),
            MutationType::NoMem => MutationResult::failed(Status::NoMemory),
            MutationType::Inserted | MutationType::WasClean | MutationType::WasDirty => {
                self.queue_stored(&vb, &bucket, key, QueueOp::Del)
            }
        }
    }

    /// Read a key from an active vbucket
    ///
    /// An ejected value yields `WouldBlock`; with `queue_bg_fetch` a fetch is
    /// scheduled and `requester` hears the outcome.
    pub fn get(
        &self,
        key: &str,
        vbid: VBucketId,
        requester: Option<Requester>,
        queue_bg_fetch: bool,
    ) -> GetValue {
        self.get_internal(key, vbid, requester, queue_bg_fetch, VBucketState::Active)
    }

    /// Read a key from a replica vbucket
    pub fn get_replica(&self, key: &str, vbid: VBucketId, requester: Option<Requester>) -> GetValue {
        self.get_internal(key, vbid, requester, true, VBucketState::Replica)
    }

    fn get_internal(
        &self,
        key: &str,
        vbid: VBucketId,
        requester: Option<Requester>,
        queue_bg_fetch: bool,
        serves: VBucketState,
    ) -> GetValue {
        let vb = match self.route(vbid, requester.as_ref(), serves, false) {
            Ok(vb) => vb,
            Err(status) => return GetValue::new(status),
        };
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        self.expire_on_access(&vb, &mut bucket, key, now);
        let Some(mut v) = bucket.find_mut(key, false) else {
            return GetValue::not_found();
        };
        v.set_referenced(true);
        if v.is_resident() {
            return GetValue::found(v.to_item(vbid, true, now));
        }
        let row_id = v.row_id();
        drop(v);
        drop(bucket);
        if queue_bg_fetch {
            self.bg_fetch(&vb, key, row_id, requester, false);
        }
        GetValue::would_block(row_id)
    }

    /// Read a key, waiting for a background fetch or a pending vbucket
    pub async fn get_or_wait(&self, key: &str, vbid: VBucketId) -> GetValue {
        loop {
            let (waiter, rx) = Waiter::new();
            let requester: Requester = waiter;
            let gv = self.get(key, vbid, Some(requester), true);
            if gv.status != Status::WouldBlock {
                return gv;
            }
            match rx.await {
                Ok(Status::Success) => {}
                Ok(status) => return GetValue::new(status),
                Err(_) => return GetValue::new(Status::TempFail),
            }
        }
    }

    /// Read a key and replace its expiry time
    pub fn get_and_update_ttl(
        &self,
        key: &str,
        vbid: VBucketId,
        requester: Option<Requester>,
        exptime: u32,
    ) -> GetValue {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => return GetValue::new(status),
        };
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        self.expire_on_access(&vb, &mut bucket, key, now);
        let Some(mut v) = bucket.find_mut(key, false) else {
            return GetValue::not_found();
        };
        if v.is_locked(now) {
            return GetValue::new(Status::KeyExists);
        }
        if !v.is_resident() {
            let row_id = v.row_id();
            drop(v);
            drop(bucket);
            self.bg_fetch(&vb, key, row_id, requester, false);
            return GetValue::would_block(row_id);
        }
        if v.exptime() == exptime {
            return GetValue::found(v.to_item(vbid, false, now));
        }
        v.set_exptime(exptime);
        v.mark_dirty();
        let item = v.to_item(vbid, false, now);
        let (row_id, seqno) = (v.row_id(), v.seqno());
        drop(v);
        self.queue_dirty(&vb, key, QueueOp::Set, row_id, seqno);
        GetValue::found(item)
    }

    /// Read a key and lock it for `lock_timeout` seconds
    pub fn get_locked(
        &self,
        key: &str,
        vbid: VBucketId,
        requester: Option<Requester>,
        lock_timeout: u32,
    ) -> GetValue {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => return GetValue::new(status),
        };
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        self.expire_on_access(&vb, &mut bucket, key, now);
        let Some(mut v) = bucket.find_mut(key, false) else {
            return GetValue::not_found();
        };
        if v.is_locked(now) {
            return GetValue::new(Status::TempFail);
        }
        if !v.is_resident() {
            let row_id = v.row_id();
            drop(v);
            drop(bucket);
            self.bg_fetch(&vb, key, row_id, requester, false);
            return GetValue::would_block(row_id);
        }
        v.lock(now.saturating_add(lock_timeout));
        v.set_cas(self.cas.next());
        GetValue::found(v.to_item(vbid, false, now))
    }

    /// Release a lock taken by [`EpStore::get_locked`]
    pub fn unlock_key(&self, key: &str, vbid: VBucketId, cas: u64) -> Status {
        let vb = match self.active_vbucket(vbid) {
            Ok(vb) => vb,
            Err(status) => return status,
        };
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        let Some(mut v) = bucket.find_mut(key, false) else {
            return Status::KeyNotFound;
        };
        if v.is_locked(now) && v.cas() == cas {
            v.unlock();
            Status::Success
        } else {
            Status::TempFail
        }
    }

    /// Read the metadata of a key, tombstones included
    pub fn get_meta_data(
        &self,
        key: &str,
        vbid: VBucketId,
        requester: Option<Requester>,
    ) -> GetMetaResult {
        let vb = match self.route(vbid, requester.as_ref(), VBucketState::Active, false) {
            Ok(vb) => vb,
            Err(status) => return GetMetaResult::status(status),
        };
        self.stats.num_ops_get_meta.fetch_add(1, Ordering::Relaxed);
        let now = now_secs();
        let mut bucket = vb.ht.lock(key);
        if let Some(v) = bucket.find(key, true) {
            return match v.temp_state() {
                Some(TempState::Initial) => {
                    drop(bucket);
                    self.bg_fetch(&vb, key, NO_ROW_ID, requester, true);
                    GetMetaResult::status(Status::WouldBlock)
                }
                Some(TempState::NonExistent) => GetMetaResult::status(Status::KeyNotFound),
                _ => GetMetaResult {
                    status: Status::Success,
                    meta: Some(v.metadata()),
                    deleted: v.is_deleted() || v.is_expired(now),
                },
            };
        }
        match bucket.add_temp_deleted_item(key) {
            AddType::NoMem => GetMetaResult::status(Status::NoMemory),
            AddType::Exists => GetMetaResult::status(Status::KeyExists),
            AddType::Success | AddType::Undel => {
                drop(bucket);
                self.bg_fetch(&vb, key, NO_ROW_ID, requester, true);
                GetMetaResult::status(Status::WouldBlock)
            }
        }
    }

    /// Diagnostic view of one key, tombstones included
    pub fn get_key_stats(
        &self,
        key: &str,
        vbid: VBucketId,
    ) -> std::result::Result<KeyStats, Status> {
        let vb = self.vbuckets.get_bucket(vbid).ok_or(Status::NotMyVBucket)?;
        let bucket = vb.ht.lock(key);
        let v = bucket
            .find(key, true)
            .filter(|v| !v.is_temp())
            .ok_or(Status::KeyNotFound)?;
        Ok(KeyStats {
            logically_deleted: v.is_deleted(),
            dirty: v.is_dirty(),
            exptime: v.exptime(),
            flags: v.flags(),
            cas: v.cas(),
            row_id: v.row_id(),
            resident: v.is_resident(),
            vb_state: vb.state(),
        })
    }

    /// Drop the value of a clean key from memory
    pub fn evict_key(&self, key: &str, vbid: VBucketId, force: bool) -> (Status, &'static str) {
        let vb = match self.vbuckets.get_bucket(vbid) {
            Some(vb) if force || vb.state() == VBucketState::Active => vb,
            _ => return (self.not_my_vbucket(), "Not my vbucket."),
        };
        let mut bucket = vb.ht.lock(key);
        let Some(mut v) = bucket.find_mut(key, force) else {
            return (Status::KeyNotFound, "Not found.");
        };
        if force {
            v.mark_clean();
        }
        if !v.is_resident() {
            return (Status::Success, "Already ejected.");
        }
        if v.eject_value() {
            self.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
            (Status::Success, "Ejected.")
        } else {
            (Status::KeyExists, "Can't eject: Dirty or a small object.")
        }
    }

    /// Remove the given keys if they expired, and finished temp entries
    pub fn delete_expired_items(&self, keys: &[(VBucketId, String)]) -> usize {
        let now = now_secs();
        let mut expired = 0;
        for (vbid, key) in keys {
            let Some(vb) = self.vbuckets.get_bucket(*vbid) else {
                continue;
            };
            let mut bucket = vb.ht.lock(key);
            let Some(v) = bucket.find(key, true) else {
                continue;
            };
            if v.is_temp() {
                if v.temp_state() != Some(TempState::Initial) {
                    bucket.remove(key);
                }
                continue;
            }
            if v.is_deleted() || !v.is_expired(now) || vb.state() != VBucketState::Active {
                continue;
            }
            if matches!(
                bucket.soft_delete(key, 0, None, &self.cas),
                MutationType::WasClean | MutationType::WasDirty
            ) {
                self.queue_stored(&vb, &bucket, key, QueueOp::Del);
                expired += 1;
            }
        }
        self.stats
            .expired_pager
            .fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    // ---- vbucket lifecycle ----

    /// Create a vbucket or change its state
    pub fn set_vbucket_state(&self, vbid: VBucketId, to: VBucketState) -> Status {
        let guard = self.vbset_mutex.lock();
        if let Some(vb) = self.vbuckets.get_bucket(vbid) {
            let from = vb.state();
            if from == to {
                return Status::Success;
            }
            if !from.can_transition_to(to) {
                warn!(vbucket = vbid, %from, %to, "Rejected vbucket state change");
                return Status::Invalid;
            }
            vb.set_state(to);
            drop(guard);
            if from == VBucketState::Pending {
                vb.fire_all_ops();
            }
            info!(vbucket = vbid, %from, %to, "Changed vbucket state");
            self.schedule_vb_snapshot(false);
            return Status::Success;
        }

        if usize::from(vbid) >= self.vbuckets.size() {
            return Status::OutOfRange;
        }
        let open_id = if to == VBucketState::Active {
            INITIAL_ACTIVE_CHECKPOINT_ID
        } else {
            1
        };
        let vb = self.new_vbucket(vbid, to, open_id);
        self.vbuckets.set_bucket_creation(vbid, true);
        let status = self.vbuckets.add_bucket(Arc::new(vb));
        drop(guard);
        info!(vbucket = vbid, state = %to, "Created vbucket");
        self.schedule_vb_snapshot(true);
        status
    }

    fn new_vbucket(&self, vbid: VBucketId, state: VBucketState, open_id: u64) -> VBucket {
        VBucket::new(
            vbid,
            state,
            self.vbuckets.next_version(vbid),
            open_id,
            self.config.ht_locks,
            self.config.chk_max_items,
            Arc::clone(&self.stats),
        )
    }

    /// Remove a dead vbucket and, in the background, its data on disk
    ///
    /// With a requester the call returns `WouldBlock` and the requester hears
    /// the outcome of the disk deletion.
    pub fn delete_vbucket(&self, vbid: VBucketId, requester: Option<Requester>) -> Status {
        let vb = {
            let _guard = self.vbset_mutex.lock();
            match self.vbuckets.get_bucket(vbid) {
                Some(vb) if vb.state() == VBucketState::Dead => {
                    self.vbuckets.remove_bucket(vbid);
                    self.vbuckets.set_bucket_deletion(vbid, true);
                    vb
                }
                _ => return Status::NotMyVBucket,
            }
        };
        self.drop_vbucket_queues(&vb, Status::NotMyVBucket);
        let blocking = requester.is_some();
        self.schedule_vb_deletion(vbid, false, requester);
        self.schedule_vb_snapshot(true);
        info!(vbucket = vbid, "Deleted vbucket");
        if blocking {
            Status::WouldBlock
        } else {
            Status::Success
        }
    }

    /// Wipe a vbucket's data, keeping its identity and state
    pub fn reset_vbucket(&self, vbid: VBucketId) -> Status {
        let old = {
            let _guard = self.vbset_mutex.lock();
            let Some(old) = self.vbuckets.get_bucket(vbid) else {
                return Status::NotMyVBucket;
            };
            let vb = self.new_vbucket(vbid, old.state(), old.checkpoints.open_checkpoint_id());
            vb.checkpoints
                .reset_cursors(&old.checkpoints.cursor_names());
            self.vbuckets.set_bucket_deletion(vbid, true);
            self.vbuckets.add_bucket(Arc::new(vb));
            old
        };
        self.drop_vbucket_queues(&old, Status::TempFail);
        self.schedule_vb_deletion(vbid, true, None);
        info!(vbucket = vbid, "Reset vbucket");
        Status::Success
    }

    fn drop_vbucket_queues(&self, vb: &VBucket, status: Status) {
        vb.ht.clear();
        let dropped = vb.checkpoints.clear();
        self.stats.queue_decr(dropped);
        vb.fire_all_ops_with(status);
        for requester in vb.drain_bg_fetch_requesters() {
            requester.notify_io_complete(status);
        }
    }

    fn schedule_vb_deletion(&self, vbid: VBucketId, recreate: bool, requester: Option<Requester>) {
        let weak = self.weak_self.clone();
        let backoff = self.config.flusher.commit_retry_backoff();
        let mut requester = requester;
        self.auxio_dispatcher.schedule(
            "vbucket_deletion",
            priority::VBUCKET_DELETION,
            Duration::ZERO,
            move || {
                let Some(store) = weak.upgrade() else {
                    return Next::Done;
                };
                let deleted = store.complete_vbucket_deletion(vbid, recreate);
                // The requester hears the first outcome only.
                if let Some(requester) = requester.take() {
                    requester.notify_io_complete(if deleted {
                        Status::Success
                    } else {
                        Status::TempFail
                    });
                }
                if deleted {
                    Next::Done
                } else {
                    Next::Snooze(backoff)
                }
            },
        );
    }

    fn complete_vbucket_deletion(&self, vbid: VBucketId, recreate: bool) -> bool {
        let _txn = self.flusher.txn_lock.lock();
        if !self.rw_store.del_vbucket(vbid, recreate) {
            self.stats
                .vbucket_deletion_fail
                .fetch_add(1, Ordering::Relaxed);
            warn!(vbucket = vbid, "Failed to delete vbucket data, will retry");
            return false;
        }
        self.mutation_log.delete_all(vbid);
        self.mutation_log.commit1();
        self.mutation_log.commit2();
        self.vbuckets.set_bucket_deletion(vbid, false);
        self.stats.vbucket_deletions.fetch_add(1, Ordering::Relaxed);
        debug!(vbucket = vbid, recreate, "vbucket data deleted");
        // A state snapshot may have raced with the deletion.
        self.schedule_vb_snapshot(true);
        true
    }

    /// Persist the state of every vbucket now
    pub fn snapshot_vbuckets(&self) -> bool {
        let mut states = VBucketStateMap::new();
        let mut creating = Vec::new();
        for vbid in self.vbuckets.bucket_ids() {
            let Some(vb) = self.vbuckets.get_bucket(vbid) else {
                continue;
            };
            states.insert(
                vbid,
                PersistedVBucketState {
                    state: vb.state(),
                    checkpoint_id: self.vbuckets.persistence_checkpoint_id(vbid),
                    max_deleted_seqno: vb.max_deleted_seqno(),
                },
            );
            if self.vbuckets.is_bucket_creation(vbid) {
                creating.push(vbid);
            }
        }
        if !self.rw_store.snapshot_vbuckets(&states) {
            warn!(vbuckets = states.len(), "Failed to snapshot vbucket states");
            return false;
        }
        for vbid in creating {
            self.vbuckets.set_bucket_creation(vbid, false);
        }
        true
    }

    /// Schedule a vbucket state snapshot unless one is already pending
    pub(crate) fn schedule_vb_snapshot(&self, high_priority: bool) {
        if !self.vbuckets.set_snapshot_flag(high_priority, true) {
            return;
        }
        let (name, prio) = if high_priority {
            ("vbucket_snapshot_high", priority::VBUCKET_PERSIST_HIGH)
        } else {
            ("vbucket_snapshot_low", priority::VBUCKET_PERSIST_LOW)
        };
        let weak = self.weak_self.clone();
        let backoff = self.config.flusher.commit_retry_backoff();
        self.auxio_dispatcher
            .schedule(name, prio, Duration::ZERO, move || {
                let Some(store) = weak.upgrade() else {
                    return Next::Done;
                };
                store.vbuckets.set_snapshot_flag(high_priority, false);
                if store.snapshot_vbuckets() {
                    Next::Done
                } else {
                    store.vbuckets.set_snapshot_flag(high_priority, true);
                    Next::Snooze(backoff)
                }
            });
    }

    /// Drop all data, in memory now and on disk at the next flush
    pub fn reset(&self) {
        for vbid in self.vbuckets.bucket_ids() {
            if let Some(vb) = self.vbuckets.get_bucket(vbid) {
                vb.ht.clear();
                let dropped = vb.checkpoints.clear();
                self.stats.queue_decr(dropped);
            }
        }
        if !self.disk_flush_all.swap(true, Ordering::AcqRel) {
            self.stats.queue_incr(1);
        }
        info!("Reset all vbuckets");
        self.flusher.wake();
    }

    // ---- mutation queue ----

    fn queue_stored(
        &self,
        vb: &VBucket,
        bucket: &LockedBucket<'_>,
        key: &str,
        op: QueueOp,
    ) -> MutationResult {
        let Some(v) = bucket.find(key, true) else {
            return MutationResult::failed(Status::KeyNotFound);
        };
        let (cas, row_id, seqno) = (v.cas(), v.row_id(), v.seqno());
        self.queue_dirty(vb, key, op, row_id, seqno);
        MutationResult::stored(cas)
    }

    /// Queue a mutation for persistence; called with the key's lock held
    fn queue_dirty(
        &self,
        vb: &VBucket,
        key: &str,
        op: QueueOp,
        row_id: i64,
        seqno: u64,
    ) {
        let qi = QueuedItem::new(key, vb.id(), op, vb.version(), row_id, seqno);
        if vb.checkpoints.queue_dirty(Arc::new(qi)) {
            self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
            if self.stats.queue_incr(1) == 0 {
                self.flusher.wake();
            }
        }
    }

    // ---- routing ----

    /// Find the vbucket for an operation served in `serves` state
    ///
    /// Pending vbuckets park the requester until they change state.
    fn route(
        &self,
        vbid: VBucketId,
        requester: Option<&Requester>,
        serves: VBucketState,
        force: bool,
    ) -> std::result::Result<Arc<VBucket>, Status> {
        let Some(vb) = self.vbuckets.get_bucket(vbid) else {
            return Err(self.not_my_vbucket());
        };
        let state = vb.state();
        if state == serves || (force && state != VBucketState::Dead) {
            return Ok(vb);
        }
        match (state, requester) {
            (VBucketState::Pending, Some(requester)) if vb.add_pending_op(Arc::clone(requester)) => {
                Err(Status::WouldBlock)
            }
            (VBucketState::Pending, _) => Err(Status::TempFail),
            _ => Err(self.not_my_vbucket()),
        }
    }

    fn active_vbucket(&self, vbid: VBucketId) -> std::result::Result<Arc<VBucket>, Status> {
        match self.vbuckets.get_bucket(vbid) {
            Some(vb) if vb.state() == VBucketState::Active => Ok(vb),
            _ => Err(self.not_my_vbucket()),
        }
    }

    fn not_my_vbucket(&self) -> Status {
        self.stats
            .num_not_my_vbuckets
            .fetch_add(1, Ordering::Relaxed);
        Status::NotMyVBucket
    }

    /// Soft-delete an expired entry of an active vbucket
    fn expire_on_access(&self, vb: &VBucket, bucket: &mut LockedBucket<'_>, key: &str, now: u32) {
        let expired = bucket
            .find(key, false)
            .is_some_and(|v| v.is_expired(now));
        if !expired || vb.state() != VBucketState::Active {
            return;
        }
        if matches!(
            bucket.soft_delete(key, 0, None, &self.cas),
            MutationType::WasClean | MutationType::WasDirty
        ) {
            self.stats.expired_access.fetch_add(1, Ordering::Relaxed);
            self.queue_stored(vb, bucket, key, QueueOp::Del);
        }
    }

    // ---- background fetch ----

    fn multi_fetch_enabled(&self) -> bool {
        self.config.bg_fetch.multi_fetch && self.ro_store.storage_properties().efficient_get_multi
    }

    /// Fetch a value (or only metadata) of `key` from disk
    pub(crate) fn bg_fetch(
        &self,
        vb: &VBucket,
        key: &str,
        row_id: i64,
        requester: Option<Requester>,
        meta_only: bool,
    ) {
        if !meta_only && self.multi_fetch_enabled() {
            let queued = vb.queue_bg_fetch_item(row_id, BgFetchItem::new(key, requester, false));
            debug!(vbucket = vb.id(), key, queued, "queued background fetch");
            self.bg_fetcher.notify_bg_event();
            return;
        }

        self.stats.bg_fetch_queue.fetch_add(1, Ordering::Relaxed);
        let (name, prio): (&str, Priority) = if meta_only {
            ("bg_fetch_meta", priority::BG_FETCHER_GET_META)
        } else {
            ("bg_fetch", priority::BG_FETCHER)
        };
        let weak = self.weak_self.clone();
        let vbid = vb.id();
        let key = key.to_string();
        let delay = Duration::from_secs(u64::from(self.config.bg_fetch.delay_secs));
        let queued_at = Instant::now();
        let mut attempts = 0u8;
        self.ro_dispatcher.schedule(name, prio, delay, move || {
            let Some(store) = weak.upgrade() else {
                return Next::Done;
            };
            attempts += 1;
            let fetch = SingleFetch {
                vbid,
                key: &key,
                row_id,
                meta_only,
                queued_at,
                attempts,
            };
            if store.complete_bg_fetch(&fetch, requester.as_ref()) {
                Next::Done
            } else {
                Next::Snooze(delay)
            }
        });
    }

    /// Run one attempt of a single fetch; `false` asks for a retry
    fn complete_bg_fetch(&self, fetch: &SingleFetch<'_>, requester: Option<&Requester>) -> bool {
        let start = Instant::now();
        let gv = self.ro_store.get(fetch.key, fetch.row_id, fetch.vbid);
        if gv.status == Status::TempFail && fetch.attempts < MAX_BG_FETCH_ATTEMPTS {
            debug!(
                vbucket = fetch.vbid,
                key = fetch.key,
                attempts = fetch.attempts,
                "background fetch failed, retrying"
            );
            return false;
        }

        let status = match self.vbuckets.get_bucket(fetch.vbid) {
            None => {
                warn!(
                    vbucket = fetch.vbid,
                    key = fetch.key,
                    "Dropping background fetch of a deleted vbucket"
                );
                Status::NotMyVBucket
            }
            Some(vb) => {
                if vb.state() == VBucketState::Active {
                    let mut bucket = vb.ht.lock(fetch.key);
                    if fetch.meta_only {
                        if let Some(mut v) = bucket.find_mut(fetch.key, true) {
                            v.restore_meta(gv.item.as_ref(), gv.status);
                        }
                    } else if let (Some(mut v), Some(item)) =
                        (bucket.find_mut(fetch.key, false), gv.item.as_ref())
                    {
                        v.restore_value(item);
                    }
                }
                gv.status
            }
        };

        let counter = if fetch.meta_only {
            &self.stats.bg_meta_fetched
        } else {
            &self.stats.bg_fetched
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .stats
            .bg_fetch_queue
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.stats.record_bg_timing(
            micros(start.duration_since(fetch.queued_at)),
            micros(start.elapsed()),
        );
        if let Some(requester) = requester {
            requester.notify_io_complete(status);
        }
        true
    }

    /// Apply the results of a batched fetch of one vbucket
    ///
    /// Failed reads below the attempt bound go back on the vbucket's queue.
    pub(crate) fn complete_bg_fetches(
        &self,
        vbid: VBucketId,
        queue: BgFetchQueue,
        start: Instant,
    ) -> usize {
        let vb = self.vbuckets.get_bucket(vbid);
        if vb.is_none() {
            warn!(vbucket = vbid, "Dropping background fetches of a deleted vbucket");
        }
        let finished = Instant::now();
        let mut completed = 0;
        let mut requeued = 0;
        for (row_id, items) in queue {
            for mut item in items {
                let gv = item
                    .value
                    .take()
                    .unwrap_or_else(|| GetValue::new(Status::TempFail));
                let Some(vb) = vb.as_ref() else {
                    if let Some(requester) = &item.requester {
                        requester.notify_io_complete(Status::NotMyVBucket);
                    }
                    continue;
                };
                if gv.status == Status::TempFail && item.attempts < MAX_BG_FETCH_ATTEMPTS {
                    vb.queue_bg_fetch_item(row_id, item);
                    requeued += 1;
                    continue;
                }
                if gv.status == Status::Success && vb.state() == VBucketState::Active {
                    let mut bucket = vb.ht.lock(&item.key);
                    if let (Some(mut v), Some(fetched)) =
                        (bucket.find_mut(&item.key, false), gv.item.as_ref())
                    {
                        v.restore_value(fetched);
                    }
                }
                self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
                self.stats.record_bg_timing(
                    micros(start.saturating_duration_since(item.init_time)),
                    micros(finished.duration_since(start)),
                );
                if let Some(requester) = &item.requester {
                    requester.notify_io_complete(gv.status);
                }
                completed += 1;
            }
        }
        if requeued > 0 {
            debug!(vbucket = vbid, requeued, "background fetches requeued");
            self.bg_fetcher.notify_bg_event();
        }
        completed
    }

    // ---- warmup ----

    /// Recreate the vbuckets recorded on disk, returning their ids
    pub(crate) fn load_vbucket_states(&self) -> Vec<VBucketId> {
        let states = self.ro_store.list_persisted_vbuckets();
        let _guard = self.vbset_mutex.lock();
        let mut loaded = Vec::with_capacity(states.len());
        for (vbid, persisted) in states {
            if usize::from(vbid) >= self.vbuckets.size() {
                warn!(vbucket = vbid, "Ignoring persisted vbucket beyond max_vbuckets");
                continue;
            }
            let floor = if persisted.state == VBucketState::Active {
                INITIAL_ACTIVE_CHECKPOINT_ID
            } else {
                1
            };
            let open_id = persisted.checkpoint_id.saturating_add(1).max(floor);
            let vb = self.new_vbucket(vbid, persisted.state, open_id);
            vb.note_deleted_seqno(persisted.max_deleted_seqno);
            self.vbuckets.add_bucket(Arc::new(vb));
            self.vbuckets
                .set_persistence_checkpoint_id(vbid, persisted.checkpoint_id);
            loaded.push(vbid);
        }
        loaded
    }

    /// Load the keys the mutation log knows about
    ///
    /// `None` means the log holds no records and a full scan is needed.
    pub fn warmup_from_log(&self, vbuckets: &[VBucketId]) -> Result<Option<usize>> {
        let mut harvester = MutationLogHarvester::new(&self.mutation_log);
        harvester.set_vbuckets(vbuckets.iter().copied());
        harvester.load()?;
        if harvester.items_seen().values().all(|n| *n == 0) {
            return Ok(None);
        }
        self.mutation_log.reset_counts(harvester.items_seen());
        self.delete_uncommitted(harvester.uncommitted());

        let mut fetches: HashMap<VBucketId, BgFetchQueue> = HashMap::new();
        harvester.apply(|vbid, key, row_id| {
            fetches
                .entry(vbid)
                .or_default()
                .entry(row_id)
                .or_default()
                .push(BgFetchItem::new(key, None, false));
        });

        let mut loaded = 0;
        for (vbid, mut queue) in fetches {
            let Some(vb) = self.vbuckets.get_bucket(vbid) else {
                continue;
            };
            self.ro_store.get_multi(vbid, &mut queue);
            for item in queue.into_values().flatten() {
                match item.value {
                    Some(GetValue {
                        status: Status::Success,
                        item: Some(fetched),
                        ..
                    }) => {
                        if self.warm_item(&vb, &fetched) {
                            loaded += 1;
                        }
                    }
                    Some(gv) if gv.status == Status::KeyNotFound => {
                        debug!(vbucket = vbid, key = %item.key, "logged row is gone");
                    }
                    other => warn!(
                        vbucket = vbid,
                        key = %item.key,
                        status = ?other.map(|gv| gv.status),
                        "Failed to load logged key"
                    ),
                }
            }
        }
        Ok(Some(loaded))
    }

    /// Remove rows written by a transaction the log never saw finish
    fn delete_uncommitted(&self, records: &[LogRecord]) {
        let rows: Vec<&LogRecord> = records
            .iter()
            .filter(|r| r.kind == LogRecordType::New)
            .collect();
        if rows.is_empty() {
            return;
        }
        let _txn = self.flusher.txn_lock.lock();
        if !self.rw_store.begin() {
            warn!("Could not remove rows of an unfinished transaction");
            return;
        }
        for record in &rows {
            let item = Item {
                row_id: record.row_id,
                ..Item::key_only(record.key.clone(), record.vbucket)
            };
            self.rw_store.del(&item, record.row_id, Box::new(|_| {}));
        }
        if self.rw_store.commit() {
            info!(rows = rows.len(), "Removed rows of an unfinished transaction");
        } else {
            self.rw_store.rollback();
            warn!("Could not remove rows of an unfinished transaction");
        }
    }

    /// Load every record of the disk store
    pub(crate) fn warmup_from_dump(&self) -> Result<usize> {
        let mut loaded = 0;
        self.ro_store.dump(&mut |item| {
            if let Some(vb) = self.vbuckets.get_bucket(item.vbucket)
                && self.warm_item(&vb, &item)
            {
                loaded += 1;
            }
        })?;
        Ok(loaded)
    }

    fn warm_item(&self, vb: &VBucket, item: &Item) -> bool {
        self.cas.observe(item.cas);
        let partial = self.stats.mem_used() >= self.stats.mem_high_wat.load(Ordering::Relaxed);
        let inserted = vb.ht.lock(&item.key).insert_from_disk(item, partial);
        if inserted {
            self.stats.warmed_up_keys.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    // ---- maintenance ----

    fn schedule_maintenance(self: &Arc<Self>) {
        let mut tasks = self.maintenance_tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let pager = ItemPager;
        tasks.push(self.schedule_periodic(
            &self.nonio_dispatcher,
            "item_pager",
            priority::ITEM_PAGER,
            Duration::from_secs(self.config.pager.item_pager_secs),
            move |store| {
                pager.run(store);
            },
        ));
        let expiry = ExpiredItemPager;
        tasks.push(self.schedule_periodic(
            &self.nonio_dispatcher,
            "expiry_pager",
            priority::EXPIRY_PAGER,
            Duration::from_secs(self.config.pager.exp_pager_stime),
            move |store| {
                expiry.run(store);
            },
        ));
        tasks.push(self.schedule_periodic(
            &self.auxio_dispatcher,
            "mutation_log_compactor",
            priority::MUTATION_LOG_COMPACTOR,
            Duration::from_secs(self.config.klog.compactor_sleep_secs),
            |store| {
                if store
                    .mutation_log
                    .should_compact(&store.config.klog, store.stats.disk_queue_size())
                    && let Err(e) = store.compact_mutation_log()
                {
                    warn!("Mutation log compaction failed, log disabled: {}", e);
                }
            },
        ));
    }

    fn schedule_periodic(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        name: &str,
        prio: Priority,
        period: Duration,
        mut run: impl FnMut(&Self) + Send + 'static,
    ) -> (Arc<Dispatcher>, TaskId) {
        let weak = Arc::downgrade(self);
        let id = dispatcher.schedule(name, prio, period, move || match weak.upgrade() {
            Some(store) => {
                run(&store);
                Next::Snooze(period)
            }
            None => Next::Done,
        });
        (Arc::clone(dispatcher), id)
    }

    /// Rewrite the mutation log to hold only the current key map
    ///
    /// On failure the log is disabled and emptied; warmup then falls back to
    /// a full scan.
    pub fn compact_mutation_log(&self) -> Result<()> {
        let _txn = self.flusher.txn_lock.lock();
        self.stats
            .mlog_compactor_runs
            .fetch_add(1, Ordering::Relaxed);
        let result = self.write_compacted_log();
        if result.is_err() {
            self.mutation_log.disable();
            self.stats
                .mlog_compactor_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn write_compacted_log(&self) -> Result<()> {
        let before = self.mutation_log.log_size();
        let compacted = self.mutation_log.create_compacted()?;
        let mut entries = 0usize;
        for vbid in self.vbuckets.bucket_ids() {
            let Some(vb) = self.vbuckets.get_bucket(vbid) else {
                continue;
            };
            vb.ht.visit(|v| {
                if v.has_row_id() && !v.is_temp() {
                    compacted.new_item(vbid, v.key(), v.row_id());
                    entries += 1;
                }
            });
        }
        compacted.commit1();
        compacted.commit2();
        self.mutation_log.replace_with(compacted)?;
        info!(
            entries,
            before,
            after = self.mutation_log.log_size(),
            "Compacted mutation log"
        );
        Ok(())
    }
}

/// One queued single-key fetch
struct SingleFetch<'a> {
    vbid: VBucketId,
    key: &'a str,
    row_id: i64,
    meta_only: bool,
    queued_at: Instant,
    attempts: u8,
}

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
