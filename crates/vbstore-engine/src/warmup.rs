//! Warmup: rebuild the in-memory state from disk after a restart.
//!
//! The warmup task runs on the `ro` dispatcher and advances one state per
//! run:
//!
//! ```text
//! Initialize -> LoadingVBucketStates -> LoadingMutationLog -> LoadingData -> Done
//! ```
//!
//! When the mutation log replays cleanly only the keys it names are read
//! back; otherwise the whole disk store is scanned. The flusher does not
//! start writing until warmup is done.

use crate::dispatcher::{Dispatcher, Next, TaskId, priority};
use crate::store::EpStore;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vbstore_common::VBucketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupState {
    Initialize,
    LoadingVBucketStates,
    LoadingMutationLog,
    LoadingData,
    Done,
}

impl WarmupState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::LoadingVBucketStates => "loading vbucket states",
            Self::LoadingMutationLog => "loading mutation log",
            Self::LoadingData => "loading data",
            Self::Done => "done",
        }
    }
}

/// Observer of warmup progress
pub trait WarmupStateListener: Send + Sync {
    fn state_changed(&self, from: WarmupState, to: WarmupState);
}

pub struct Warmup {
    state: Mutex<WarmupState>,
    finished: Condvar,
    stopped: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn WarmupStateListener>>>,
    /// Items expected to load, 0 until known
    estimated_items: AtomicUsize,
    /// The mutation log supplied the key set
    log_loaded: AtomicBool,
    vbuckets: Mutex<Vec<VBucketId>>,
    task: Mutex<Option<TaskId>>,
    started: Mutex<Option<Instant>>,
    dispatcher: Arc<Dispatcher>,
}

impl Warmup {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            state: Mutex::new(WarmupState::Initialize),
            finished: Condvar::new(),
            stopped: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            estimated_items: AtomicUsize::new(0),
            log_loaded: AtomicBool::new(false),
            vbuckets: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            started: Mutex::new(None),
            dispatcher,
        }
    }

    pub fn state(&self) -> WarmupState {
        *self.state.lock()
    }

    pub fn add_listener(&self, listener: Arc<dyn WarmupStateListener>) {
        self.listeners.lock().push(listener);
    }

    /// Number of items warmup expects to load, once known
    pub fn estimated_item_count(&self) -> Option<usize> {
        match self.estimated_items.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    pub(crate) fn start(&self, store: &Arc<EpStore>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        *self.started.lock() = Some(Instant::now());
        let weak = Arc::downgrade(store);
        let id = self
            .dispatcher
            .schedule("warmup", priority::WARMUP, Duration::ZERO, move || {
                weak.upgrade()
                    .map_or(Next::Done, |store| store.warmup().step(&store))
            });
        *task = Some(id);
        info!("Warmup started");
    }

    /// Abandon warmup; waiters are released
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(id) = self.task.lock().take() {
            self.dispatcher.cancel(id);
        }
        let _state = self.state.lock();
        self.finished.notify_all();
    }

    /// Block until warmup is done or stopped
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while *state != WarmupState::Done && !self.stopped.load(Ordering::Acquire) {
            self.finished.wait(&mut state);
        }
    }

    fn transition(&self, to: WarmupState) {
        let from = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, to)
        };
        debug!(from = from.as_str(), to = to.as_str(), "warmup state change");
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.state_changed(from, to);
        }
    }

    fn step(&self, store: &EpStore) -> Next {
        if self.stopped.load(Ordering::Acquire) {
            return Next::Done;
        }
        match self.state() {
            WarmupState::Initialize => {
                self.transition(WarmupState::LoadingVBucketStates);
            }
            WarmupState::LoadingVBucketStates => {
                let loaded = store.load_vbucket_states();
                info!(vbuckets = loaded.len(), "Loaded vbucket states");
                *self.vbuckets.lock() = loaded;
                self.transition(WarmupState::LoadingMutationLog);
            }
            WarmupState::LoadingMutationLog => {
                self.load_mutation_log(store);
                self.transition(WarmupState::LoadingData);
            }
            WarmupState::LoadingData => {
                if !self.log_loaded.load(Ordering::Acquire) {
                    match store.warmup_from_dump() {
                        Ok(loaded) => {
                            self.estimated_items.store(loaded, Ordering::Release);
                        }
                        Err(e) => error!("Failed to scan the store during warmup: {}", e),
                    }
                    self.rebuild_mutation_log(store);
                }
                self.finish(store);
                return Next::Done;
            }
            WarmupState::Done => return Next::Done,
        }
        Next::Snooze(Duration::ZERO)
    }

    fn load_mutation_log(&self, store: &EpStore) {
        if !store.mutation_log().is_enabled() {
            return;
        }
        let vbuckets = self.vbuckets.lock().clone();
        match store.warmup_from_log(&vbuckets) {
            Ok(Some(loaded)) => {
                self.estimated_items.store(loaded, Ordering::Release);
                self.log_loaded.store(true, Ordering::Release);
                info!(keys = loaded, "Warmed up from the mutation log");
            }
            Ok(None) => debug!("mutation log is empty, scanning the store"),
            Err(e) => warn!("Mutation log replay failed, scanning the store: {}", e),
        }
    }

    /// An empty or fresh log only covers keys written from now on; seed it
    /// with the key map the scan just loaded.
    fn rebuild_mutation_log(&self, store: &EpStore) {
        if !store.mutation_log().is_enabled() {
            return;
        }
        match store.compact_mutation_log() {
            Ok(()) => debug!("mutation log rebuilt from the scanned store"),
            Err(e) => warn!("Could not rebuild the mutation log, log disabled: {}", e),
        }
    }

    fn finish(&self, store: &EpStore) {
        store.stats().warmup_complete.store(true, Ordering::Release);
        self.transition(WarmupState::Done);
        {
            let _state = self.state.lock();
            self.finished.notify_all();
        }
        self.task.lock().take();
        let elapsed = self.started.lock().map(|t| t.elapsed());
        info!(
            keys = store.stats().warmed_up_keys.load(Ordering::Relaxed),
            elapsed_ms = elapsed.map_or(0, |d| d.as_millis()),
            "Warmup complete"
        );
        store.flusher().wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::kvstore::{KvStore, MemoryKvStore, VBucketStateMap};
    use crate::testing::{get_value, test_config};
    use vbstore_common::{PersistedVBucketState, Status, VBucketState};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<WarmupState>>,
    }

    impl WarmupStateListener for Recorder {
        fn state_changed(&self, _from: WarmupState, to: WarmupState) {
            self.seen.lock().push(to);
        }
    }

    fn seeded_disk() -> Arc<MemoryKvStore> {
        let disk = Arc::new(MemoryKvStore::new());
        let mut states = VBucketStateMap::new();
        states.insert(0, PersistedVBucketState::new(VBucketState::Active, 4));
        states.insert(1, PersistedVBucketState::new(VBucketState::Replica, 1));
        assert!(disk.snapshot_vbuckets(&states));
        disk.insert_row(&Item::new("a", 0, "1").with_cas(500));
        disk.insert_row(&Item::new("b", 0, "2"));
        disk.insert_row(&Item::new("r", 1, "3"));
        // No state record: never loaded.
        disk.insert_row(&Item::new("orphan", 7, "4"));
        disk
    }

    #[test]
    fn test_warmup_scans_store_without_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.klog.path = None;
        config.warmup.wait_for_warmup = true;
        let store = EpStore::new(config, seeded_disk()).unwrap();
        let recorder = Arc::new(Recorder::default());
        store.warmup().add_listener(recorder.clone());

        store.initialize().unwrap();
        assert_eq!(store.warmup().state(), WarmupState::Done);
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                WarmupState::LoadingVBucketStates,
                WarmupState::LoadingMutationLog,
                WarmupState::LoadingData,
                WarmupState::Done,
            ]
        );
        assert_eq!(store.warmup().estimated_item_count(), Some(3));
        assert_eq!(store.vbucket(1).unwrap().state(), VBucketState::Replica);
        assert_eq!(store.vbuckets().persistence_checkpoint_id(0), 4);
        assert_eq!(get_value(&store, "a", 0).value().unwrap().as_ref(), b"1");
        assert_eq!(store.get_replica("r", 1, None).status, Status::Success);
        assert!(store.vbucket(7).is_none());

        let res = store.set(&Item::new("c", 0, "3"), None);
        assert!(res.cas > 500);
        store.shutdown(false);
    }

    #[test]
    fn test_warmup_drops_unfinished_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let disk = seeded_disk();
        let a_row = disk.stored(0, "a").unwrap().row_id;
        let b_row = disk.stored(0, "b").unwrap().row_id;
        {
            let log = crate::mutation_log::MutationLog::new(&config.klog);
            log.open().unwrap();
            log.new_item(0, "a", a_row);
            log.commit1();
            log.commit2();
            log.new_item(0, "b", b_row);
            log.commit1();
            log.sync();
        }

        let mut config = config;
        config.warmup.wait_for_warmup = true;
        let store = EpStore::new(config, disk.clone()).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.warmup().estimated_item_count(), Some(1));
        assert_eq!(get_value(&store, "a", 0).status, Status::Success);
        assert_eq!(get_value(&store, "b", 0).status, Status::KeyNotFound);
        assert!(disk.stored(0, "b").is_none());
        store.shutdown(false);
    }

    #[test]
    fn test_stop_releases_waiters() {
        let dispatcher = Arc::new(Dispatcher::new("warmup-test").unwrap());
        let warmup = Warmup::new(dispatcher);
        warmup.stop();
        warmup.wait();
        assert_eq!(warmup.state(), WarmupState::Initialize);
        assert_eq!(warmup.estimated_item_count(), None);
    }
}
