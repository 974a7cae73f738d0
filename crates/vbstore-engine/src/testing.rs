//! Fixtures shared by the engine's unit tests.

use crate::item::GetValue;
use crate::kvstore::MemoryKvStore;
use crate::store::EpStore;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use vbstore_common::config::LogSyncMode;
use vbstore_common::{EngineConfig, Status, VBucketId, VBucketState};

/// Small, fast-retrying configuration rooted at `dir`
pub(crate) fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_data_dir(dir);
    config.max_vbuckets = 16;
    config.ht_locks = 7;
    config.flusher.commit_retry_backoff_ms = 1;
    config.flusher.idle_sleep_ms = 10;
    config.bg_fetch.idle_sleep_ms = 10;
    config.klog.block_size = 512;
    config.klog.sync = LogSyncMode::Off;
    config
}

/// A warmed-up store over a memory disk with the given active vbuckets
///
/// No background task runs; tests drive the flusher and fetcher directly.
pub(crate) fn active_store(vbuckets: &[VBucketId]) -> (Arc<EpStore>, Arc<MemoryKvStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(MemoryKvStore::new());
    let store = EpStore::new(test_config(dir.path()), disk.clone()).unwrap();
    store.mutation_log().open().unwrap();
    store.stats().warmup_complete.store(true, Ordering::Release);
    for &vb in vbuckets {
        assert_eq!(store.set_vbucket_state(vb, VBucketState::Active), Status::Success);
    }
    assert!(store.snapshot_vbuckets());
    (store, disk, dir)
}

pub(crate) fn get_value(store: &EpStore, key: &str, vb: VBucketId) -> GetValue {
    store.get(key, vb, None, false)
}
