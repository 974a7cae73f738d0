//! Engine-wide counters.
//!
//! Counters are plain atomics shared through an `Arc`; `snapshot` copies them
//! into a serialisable struct for reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Counters shared by every engine component
#[derive(Debug, Default)]
pub struct EpStats {
    /// Mutations queued for persistence and not yet resolved
    pub disk_queue_size: AtomicUsize,
    pub total_enqueued: AtomicU64,
    pub total_persisted: AtomicU64,
    pub flusher_commits: AtomicU64,
    pub begin_failed: AtomicU64,
    pub commit_failed: AtomicU64,
    /// Mutations bounced to a reject queue
    pub flush_failed: AtomicU64,
    /// Entries found expired while flushing
    pub flush_expired: AtomicU64,
    /// Microseconds the last written mutation spent dirty
    pub dirty_age_us: AtomicU64,
    pub dirty_age_high_wat_us: AtomicU64,
    pub num_not_my_vbuckets: AtomicU64,
    pub bg_fetched: AtomicU64,
    pub bg_meta_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,
    /// Microseconds between a fetch being queued and started
    pub bg_wait_us: AtomicU64,
    /// Microseconds spent loading fetched values
    pub bg_load_us: AtomicU64,
    /// Single-key fetches scheduled and not completed
    pub bg_fetch_queue: AtomicUsize,
    pub vbucket_deletions: AtomicU64,
    pub vbucket_deletion_fail: AtomicU64,
    pub expired_access: AtomicU64,
    pub expired_pager: AtomicU64,
    pub num_value_ejects: AtomicU64,
    pub num_ops_get_meta: AtomicU64,
    pub new_items_logged: AtomicU64,
    pub del_items_logged: AtomicU64,
    pub mlog_compactor_runs: AtomicU64,
    pub mlog_compactor_failures: AtomicU64,
    pub warmed_up_keys: AtomicU64,
    pub warmup_complete: AtomicBool,
    /// Bytes held by stored entries
    pub mem_used: AtomicUsize,
    pub max_data_size: AtomicUsize,
    pub mem_low_wat: AtomicUsize,
    pub mem_high_wat: AtomicUsize,
    pub mutation_mem_limit: AtomicUsize,
    pub force_shutdown: AtomicBool,
}

impl EpStats {
    pub fn new(max_size: usize, low_wat: usize, high_wat: usize, mutation_limit: usize) -> Self {
        let stats = Self::default();
        stats.max_data_size.store(max_size, Ordering::Relaxed);
        stats.mem_low_wat.store(low_wat, Ordering::Relaxed);
        stats.mem_high_wat.store(high_wat, Ordering::Relaxed);
        stats.mutation_mem_limit.store(mutation_limit, Ordering::Relaxed);
        stats
    }

    /// Whether `extra` more bytes fit under the mutation memory limit
    pub fn has_space_for(&self, extra: usize) -> bool {
        self.mem_used.load(Ordering::Relaxed).saturating_add(extra)
            <= self.mutation_mem_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn mem_add(&self, bytes: usize) {
        self.mem_used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn mem_sub(&self, bytes: usize) {
        // Saturating: concurrent resets may race accounting updates.
        let _ = self
            .mem_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Add `n` pending writes, returning the previous count
    pub(crate) fn queue_incr(&self, n: usize) -> usize {
        self.disk_queue_size.fetch_add(n, Ordering::AcqRel)
    }

    /// Resolve `n` pending writes
    pub(crate) fn queue_decr(&self, n: usize) {
        let _ = self
            .disk_queue_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(n))
            });
    }

    pub fn disk_queue_size(&self) -> usize {
        self.disk_queue_size.load(Ordering::Acquire)
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub fn record_bg_timing(&self, wait_us: u64, load_us: u64) {
        self.bg_num_operations.fetch_add(1, Ordering::Relaxed);
        self.bg_wait_us.fetch_add(wait_us, Ordering::Relaxed);
        self.bg_load_us.fetch_add(load_us, Ordering::Relaxed);
    }

    pub(crate) fn record_dirty_age(&self, age_us: u64) {
        self.dirty_age_us.store(age_us, Ordering::Relaxed);
        self.dirty_age_high_wat_us.fetch_max(age_us, Ordering::Relaxed);
    }

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            disk_queue_size: self.disk_queue_size(),
            total_enqueued: r(&self.total_enqueued),
            total_persisted: r(&self.total_persisted),
            flusher_commits: r(&self.flusher_commits),
            begin_failed: r(&self.begin_failed),
            commit_failed: r(&self.commit_failed),
            flush_failed: r(&self.flush_failed),
            flush_expired: r(&self.flush_expired),
            dirty_age_us: r(&self.dirty_age_us),
            dirty_age_high_wat_us: r(&self.dirty_age_high_wat_us),
            num_not_my_vbuckets: r(&self.num_not_my_vbuckets),
            bg_fetched: r(&self.bg_fetched),
            bg_meta_fetched: r(&self.bg_meta_fetched),
            bg_num_operations: r(&self.bg_num_operations),
            bg_wait_us: r(&self.bg_wait_us),
            bg_load_us: r(&self.bg_load_us),
            bg_fetch_queue: self.bg_fetch_queue.load(Ordering::Relaxed),
            vbucket_deletions: r(&self.vbucket_deletions),
            vbucket_deletion_fail: r(&self.vbucket_deletion_fail),
            expired_access: r(&self.expired_access),
            expired_pager: r(&self.expired_pager),
            num_value_ejects: r(&self.num_value_ejects),
            num_ops_get_meta: r(&self.num_ops_get_meta),
            new_items_logged: r(&self.new_items_logged),
            del_items_logged: r(&self.del_items_logged),
            mlog_compactor_runs: r(&self.mlog_compactor_runs),
            mlog_compactor_failures: r(&self.mlog_compactor_failures),
            warmed_up_keys: r(&self.warmed_up_keys),
            warmup_complete: self.warmup_complete.load(Ordering::Relaxed),
            mem_used: self.mem_used(),
            max_data_size: self.max_data_size.load(Ordering::Relaxed),
            mem_low_wat: self.mem_low_wat.load(Ordering::Relaxed),
            mem_high_wat: self.mem_high_wat.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EpStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub disk_queue_size: usize,
    pub total_enqueued: u64,
    pub total_persisted: u64,
    pub flusher_commits: u64,
    pub begin_failed: u64,
    pub commit_failed: u64,
    pub flush_failed: u64,
    pub flush_expired: u64,
    pub dirty_age_us: u64,
    pub dirty_age_high_wat_us: u64,
    pub num_not_my_vbuckets: u64,
    pub bg_fetched: u64,
    pub bg_meta_fetched: u64,
    pub bg_num_operations: u64,
    pub bg_wait_us: u64,
    pub bg_load_us: u64,
    pub bg_fetch_queue: usize,
    pub vbucket_deletions: u64,
    pub vbucket_deletion_fail: u64,
    pub expired_access: u64,
    pub expired_pager: u64,
    pub num_value_ejects: u64,
    pub num_ops_get_meta: u64,
    pub new_items_logged: u64,
    pub del_items_logged: u64,
    pub mlog_compactor_runs: u64,
    pub mlog_compactor_failures: u64,
    pub warmed_up_keys: u64,
    pub warmup_complete: bool,
    pub mem_used: usize,
    pub max_data_size: usize,
    pub mem_low_wat: usize,
    pub mem_high_wat: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_limit() {
        let stats = EpStats::new(1000, 600, 750, 900);
        assert!(stats.has_space_for(900));
        stats.mem_add(500);
        assert!(stats.has_space_for(400));
        assert!(!stats.has_space_for(401));
        stats.mem_sub(10_000);
        assert_eq!(stats.mem_used(), 0);
    }

    #[test]
    fn test_queue_counter_saturates() {
        let stats = EpStats::default();
        assert_eq!(stats.queue_incr(2), 0);
        stats.queue_decr(5);
        assert_eq!(stats.disk_queue_size(), 0);
    }

    #[test]
    fn test_dirty_age_high_watermark() {
        let stats = EpStats::default();
        stats.record_dirty_age(50);
        stats.record_dirty_age(20);
        let snap = stats.snapshot();
        assert_eq!(snap.dirty_age_us, 20);
        assert_eq!(snap.dirty_age_high_wat_us, 50);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = EpStats::new(100, 60, 75, 90);
        stats.total_persisted.fetch_add(3, Ordering::Relaxed);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"total_persisted\":3"));
        assert!(json.contains("\"mem_high_wat\":75"));
    }
}
