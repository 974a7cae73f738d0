//! Fixed-size table of vbuckets with per-slot lifecycle flags.

use crate::vbucket::VBucket;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use vbstore_common::{Status, VBucketId};

struct Slot {
    bucket: RwLock<Option<Arc<VBucket>>>,
    deleting: AtomicBool,
    creating: AtomicBool,
    persisted_checkpoint: AtomicU64,
    version: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            bucket: RwLock::new(None),
            deleting: AtomicBool::new(false),
            creating: AtomicBool::new(false),
            persisted_checkpoint: AtomicU64::new(0),
            version: AtomicU64::new(0),
        }
    }
}

/// All vbuckets of a store, indexed by id
pub struct VBucketMap {
    slots: Box<[Slot]>,
    high_priority_snapshot: AtomicBool,
    low_priority_snapshot: AtomicBool,
}

impl VBucketMap {
    pub fn new(max_vbuckets: u16) -> Self {
        Self {
            slots: (0..max_vbuckets).map(|_| Slot::new()).collect(),
            high_priority_snapshot: AtomicBool::new(false),
            low_priority_snapshot: AtomicBool::new(false),
        }
    }

    fn slot(&self, id: VBucketId) -> Option<&Slot> {
        self.slots.get(usize::from(id))
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Install a vbucket, replacing any previous one with the same id
    pub fn add_bucket(&self, vb: Arc<VBucket>) -> Status {
        match self.slot(vb.id()) {
            Some(slot) => {
                *slot.bucket.write() = Some(vb);
                Status::Success
            }
            None => Status::OutOfRange,
        }
    }

    pub fn remove_bucket(&self, id: VBucketId) -> Option<Arc<VBucket>> {
        self.slot(id).and_then(|slot| slot.bucket.write().take())
    }

    pub fn get_bucket(&self, id: VBucketId) -> Option<Arc<VBucket>> {
        self.slot(id).and_then(|slot| slot.bucket.read().clone())
    }

    /// Ids of all installed vbuckets, ascending
    pub fn bucket_ids(&self) -> Vec<VBucketId> {
        self.slots
            .iter()
            .zip(0u16..)
            .filter(|(slot, _)| slot.bucket.read().is_some())
            .map(|(_, id)| id)
            .collect()
    }

    /// Hand out the version for a new incarnation of `id`
    pub fn next_version(&self, id: VBucketId) -> u64 {
        self.slot(id)
            .map_or(0, |slot| slot.version.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn is_bucket_deletion(&self, id: VBucketId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.deleting.load(Ordering::Acquire))
    }

    pub fn set_bucket_deletion(&self, id: VBucketId, deleting: bool) {
        if let Some(slot) = self.slot(id) {
            slot.deleting.store(deleting, Ordering::Release);
        }
    }

    pub fn is_bucket_creation(&self, id: VBucketId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.creating.load(Ordering::Acquire))
    }

    /// Flip the creation flag; returns false if it already had that value
    pub fn set_bucket_creation(&self, id: VBucketId, creating: bool) -> bool {
        self.slot(id).is_some_and(|slot| {
            slot.creating
                .compare_exchange(!creating, creating, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    pub fn persistence_checkpoint_id(&self, id: VBucketId) -> u64 {
        self.slot(id)
            .map_or(0, |slot| slot.persisted_checkpoint.load(Ordering::Acquire))
    }

    pub fn set_persistence_checkpoint_id(&self, id: VBucketId, checkpoint_id: u64) {
        if let Some(slot) = self.slot(id) {
            slot.persisted_checkpoint
                .store(checkpoint_id, Ordering::Release);
        }
    }

    /// Request a snapshot; returns true if this call raised the flag
    pub fn set_snapshot_flag(&self, high_priority: bool, value: bool) -> bool {
        let flag = if high_priority {
            &self.high_priority_snapshot
        } else {
            &self.low_priority_snapshot
        };
        flag.compare_exchange(!value, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn snapshot_flag(&self, high_priority: bool) -> bool {
        if high_priority {
            self.high_priority_snapshot.load(Ordering::Acquire)
        } else {
            self.low_priority_snapshot.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::EpStats;
    use vbstore_common::VBucketState;

    fn vb(id: VBucketId) -> Arc<VBucket> {
        Arc::new(VBucket::new(
            id,
            VBucketState::Active,
            1,
            2,
            3,
            100,
            Arc::new(EpStats::default()),
        ))
    }

    #[test]
    fn test_add_get_remove() {
        let map = VBucketMap::new(4);
        assert_eq!(map.add_bucket(vb(2)), Status::Success);
        assert_eq!(map.add_bucket(vb(0)), Status::Success);
        assert_eq!(map.add_bucket(vb(4)), Status::OutOfRange);
        assert_eq!(map.bucket_ids(), vec![0, 2]);
        assert_eq!(map.get_bucket(2).unwrap().id(), 2);
        assert!(map.remove_bucket(2).is_some());
        assert!(map.get_bucket(2).is_none());
        assert!(map.get_bucket(100).is_none());
    }

    #[test]
    fn test_flags() {
        let map = VBucketMap::new(2);
        assert!(map.set_bucket_creation(1, true));
        assert!(!map.set_bucket_creation(1, true));
        assert!(map.is_bucket_creation(1));
        assert!(map.set_bucket_creation(1, false));

        map.set_bucket_deletion(0, true);
        assert!(map.is_bucket_deletion(0));
        assert!(!map.is_bucket_deletion(1));

        assert!(map.set_snapshot_flag(true, true));
        assert!(!map.set_snapshot_flag(true, true));
        assert!(map.snapshot_flag(true));
        assert!(!map.snapshot_flag(false));
    }

    #[test]
    fn test_versions_increase() {
        let map = VBucketMap::new(2);
        assert_eq!(map.next_version(1), 1);
        assert_eq!(map.next_version(1), 2);
        assert_eq!(map.next_version(0), 1);
        map.set_persistence_checkpoint_id(1, 9);
        assert_eq!(map.persistence_checkpoint_id(1), 9);
    }
}
