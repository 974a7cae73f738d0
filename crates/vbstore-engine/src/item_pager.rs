//! Periodic sweeps run on the `nonio` dispatcher.

use crate::item::now_secs;
use crate::store::EpStore;
use crate::stored_value::TempState;
use crate::vbucket::VBucket;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use vbstore_common::{VBucketId, VBucketState};

/// Ejects values of clean entries while memory is above the high watermark
///
/// Replica vbuckets are paged first. The first pass only takes entries not
/// read since the previous sweep; the second takes anything ejectable. Both
/// stop once memory is at or below the low watermark.
#[derive(Debug, Default, Clone, Copy)]
pub struct ItemPager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Unreferenced,
    Any,
}

impl ItemPager {
    /// Run one sweep, returning the values ejected
    pub fn run(&self, store: &EpStore) -> usize {
        let stats = store.stats();
        let high = stats.mem_high_wat.load(Ordering::Relaxed);
        let low = stats.mem_low_wat.load(Ordering::Relaxed);
        let used = stats.mem_used();
        if used <= high {
            return 0;
        }
        info!(used, high, low, "Memory above high watermark, ejecting values");

        let mut vbuckets: Vec<Arc<VBucket>> = store
            .vbuckets()
            .bucket_ids()
            .into_iter()
            .filter_map(|id| store.vbucket(id))
            .collect();
        vbuckets.sort_by_key(|vb| paging_rank(vb.state()));

        let below_low = || stats.mem_used() <= low;
        let mut ejected = 0usize;
        'passes: for pass in [Pass::Unreferenced, Pass::Any] {
            for vb in &vbuckets {
                vb.ht.visit_mut(|v| {
                    if below_low() {
                        return;
                    }
                    if pass == Pass::Unreferenced && v.is_referenced() {
                        v.set_referenced(false);
                        return;
                    }
                    if v.eject_value() {
                        ejected += 1;
                    }
                });
                if below_low() {
                    break 'passes;
                }
            }
        }
        stats
            .num_value_ejects
            .fetch_add(ejected as u64, Ordering::Relaxed);
        info!(ejected, used = stats.mem_used(), "Item pager finished");
        ejected
    }
}

const fn paging_rank(state: VBucketState) -> u8 {
    match state {
        VBucketState::Replica => 0,
        VBucketState::Active => 1,
        VBucketState::Pending => 2,
        VBucketState::Dead => 3,
    }
}

/// Deletes expired items and drops temp entries whose fetch finished
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpiredItemPager;

impl ExpiredItemPager {
    /// Run one sweep, returning the items expired
    pub fn run(&self, store: &EpStore) -> usize {
        let now = now_secs();
        let mut candidates: Vec<(VBucketId, String)> = Vec::new();
        for vbid in store.vbuckets().bucket_ids() {
            let Some(vb) = store.vbucket(vbid) else {
                continue;
            };
            vb.ht.visit(|v| {
                let finished_temp = matches!(
                    v.temp_state(),
                    Some(TempState::NonExistent | TempState::Deleted)
                );
                if finished_temp || (!v.is_temp() && !v.is_deleted() && v.is_expired(now)) {
                    candidates.push((vbid, v.key().to_string()));
                }
            });
        }
        if candidates.is_empty() {
            return 0;
        }
        let expired = store.delete_expired_items(&candidates);
        debug!(candidates = candidates.len(), expired, "expiry pager finished");
        expired
    }
}
