//! Checkpoint-ordered dirty queue of one vbucket.
//!
//! Mutations land in the open checkpoint, deduplicated by key: a second
//! mutation of a key already queued there replaces the earlier entry in
//! place. A checkpoint is closed when it reaches `max_items` or when the
//! flusher drains the queue.

use crate::queued_item::QueuedItemRef;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Default)]
struct Checkpoint {
    id: u64,
    items: Vec<QueuedItemRef>,
    index: HashMap<String, usize>,
}

impl Checkpoint {
    fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct CheckpointState {
    open: Checkpoint,
    closed: VecDeque<Checkpoint>,
    last_closed_id: u64,
    /// Named consumers and the checkpoint id they have reached
    cursors: BTreeMap<String, u64>,
}

/// Per-vbucket checkpoint manager
#[derive(Debug)]
pub struct CheckpointManager {
    state: Mutex<CheckpointState>,
    max_items: usize,
}

impl CheckpointManager {
    pub fn new(open_id: u64, max_items: usize) -> Self {
        Self {
            state: Mutex::new(CheckpointState {
                open: Checkpoint::new(open_id),
                closed: VecDeque::new(),
                last_closed_id: open_id.saturating_sub(1),
                cursors: BTreeMap::new(),
            }),
            max_items: max_items.max(1),
        }
    }

    /// Queue a mutation; returns false when it replaced an entry for the same key
    pub fn queue_dirty(&self, item: QueuedItemRef) -> bool {
        let mut state = self.state.lock();
        if let Some(&idx) = state.open.index.get(item.key()) {
            let slot = &mut state.open.items[idx];
            *slot = slot.superseded_by(item);
            return false;
        }
        if state.open.items.len() >= self.max_items {
            Self::close_open(&mut state);
        }
        let idx = state.open.items.len();
        state.open.index.insert(item.key().to_string(), idx);
        state.open.items.push(item);
        true
    }

    fn close_open(state: &mut CheckpointState) {
        let next = Checkpoint::new(state.open.id + 1);
        let closed = std::mem::replace(&mut state.open, next);
        state.closed.push_back(closed);
    }

    /// Drain everything queued, oldest checkpoint first
    ///
    /// Returns the items and the id of the last checkpoint they complete.
    pub fn items_for_persistence(&self) -> (Vec<QueuedItemRef>, u64) {
        let mut state = self.state.lock();
        if !state.open.items.is_empty() {
            Self::close_open(&mut state);
        }
        let mut items = Vec::new();
        while let Some(chk) = state.closed.pop_front() {
            state.last_closed_id = chk.id;
            items.extend(chk.items);
        }
        (items, state.last_closed_id)
    }

    pub fn num_items(&self) -> usize {
        let state = self.state.lock();
        state.open.items.len() + state.closed.iter().map(|c| c.items.len()).sum::<usize>()
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        self.state.lock().open.id
    }

    pub fn set_open_checkpoint_id(&self, id: u64) {
        let mut state = self.state.lock();
        state.open.id = id;
        state.last_closed_id = id.saturating_sub(1);
    }

    /// Drop every queued mutation, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.open.items.len()
            + state.closed.iter().map(|c| c.items.len()).sum::<usize>();
        let next_id = state.open.id + 1;
        state.closed.clear();
        state.open = Checkpoint::new(next_id);
        dropped
    }

    pub fn register_cursor(&self, name: impl Into<String>) {
        let mut state = self.state.lock();
        let id = state.open.id;
        state.cursors.insert(name.into(), id);
    }

    pub fn cursor_names(&self) -> Vec<String> {
        self.state.lock().cursors.keys().cloned().collect()
    }

    /// Re-register cursors (after a reset) at the current open checkpoint
    pub fn reset_cursors(&self, names: &[String]) {
        let mut state = self.state.lock();
        let id = state.open.id;
        state.cursors = names.iter().map(|n| (n.clone(), id)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queued_item::{QueuedItem, dedup_keep_last, sort_for_write};
    use std::sync::Arc;
    use vbstore_common::QueueOp;

    fn qi(key: &str, seqno: u64) -> QueuedItemRef {
        Arc::new(QueuedItem::new(key, 0, QueueOp::Set, 0, -1, seqno))
    }

    #[test]
    fn test_dedup_within_open_checkpoint() {
        let mgr = CheckpointManager::new(1, 100);
        assert!(mgr.queue_dirty(qi("a", 1)));
        assert!(mgr.queue_dirty(qi("b", 1)));
        assert!(!mgr.queue_dirty(qi("a", 2)));
        assert_eq!(mgr.num_items(), 2);

        let (items, chk) = mgr.items_for_persistence();
        assert_eq!(chk, 1);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key(), "a");
        assert_eq!(items[0].seqno(), 2);
        assert_eq!(mgr.open_checkpoint_id(), 2);
        assert_eq!(mgr.num_items(), 0);
    }

    #[test]
    fn test_checkpoint_closes_at_max_items() {
        let mgr = CheckpointManager::new(1, 2);
        mgr.queue_dirty(qi("a", 1));
        mgr.queue_dirty(qi("b", 1));
        assert!(mgr.queue_dirty(qi("c", 1)));
        // "a" now lives in a closed checkpoint, so it is queued again.
        assert!(mgr.queue_dirty(qi("a", 2)));
        let (items, chk) = mgr.items_for_persistence();
        assert_eq!(items.len(), 4);
        assert_eq!(chk, 2);

        // The flusher keeps only the later mutation of "a".
        let mut items = dedup_keep_last(items);
        sort_for_write(&mut items);
        assert_eq!(items.len(), 3);
        let a: Vec<_> = items.iter().filter(|q| q.key() == "a").collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].seqno(), 2);
    }

    #[test]
    fn test_empty_drain_keeps_checkpoint_id() {
        let mgr = CheckpointManager::new(2, 10);
        let (items, chk) = mgr.items_for_persistence();
        assert!(items.is_empty());
        assert_eq!(chk, 1);
        assert_eq!(mgr.open_checkpoint_id(), 2);
    }

    #[test]
    fn test_clear_and_cursors() {
        let mgr = CheckpointManager::new(1, 10);
        mgr.register_cursor("replica-1");
        mgr.queue_dirty(qi("a", 1));
        assert_eq!(mgr.clear(), 1);
        assert_eq!(mgr.num_items(), 0);

        let fresh = CheckpointManager::new(1, 10);
        fresh.reset_cursors(&mgr.cursor_names());
        assert_eq!(fresh.cursor_names(), vec!["replica-1".to_string()]);
    }
}
