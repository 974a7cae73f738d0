//! Mutations waiting to be persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use vbstore_common::{QueueOp, VBucketId};

/// A mutation queued for the flusher
#[derive(Debug, Clone)]
pub struct QueuedItem {
    key: String,
    vbucket: VBucketId,
    op: QueueOp,
    vbucket_version: u64,
    row_id: i64,
    seqno: u64,
    /// When the key first became dirty; survives replacement by later
    /// mutations of the same key
    dirtied: Instant,
}

/// Queued items are shared between checkpoints and reject queues
pub type QueuedItemRef = Arc<QueuedItem>;

impl QueuedItem {
    pub fn new(
        key: impl Into<String>,
        vbucket: VBucketId,
        op: QueueOp,
        vbucket_version: u64,
        row_id: i64,
        seqno: u64,
    ) -> Self {
        Self {
            key: key.into(),
            vbucket,
            op,
            vbucket_version,
            row_id,
            seqno,
            dirtied: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn vbucket(&self) -> VBucketId {
        self.vbucket
    }

    pub const fn op(&self) -> QueueOp {
        self.op
    }

    pub const fn vbucket_version(&self) -> u64 {
        self.vbucket_version
    }

    pub const fn row_id(&self) -> i64 {
        self.row_id
    }

    pub const fn seqno(&self) -> u64 {
        self.seqno
    }

    pub const fn dirtied(&self) -> Instant {
        self.dirtied
    }

    /// `later` replacing `self` in the queue, dirty since the earlier of the two
    pub fn superseded_by(&self, later: QueuedItemRef) -> QueuedItemRef {
        if later.dirtied <= self.dirtied {
            return later;
        }
        let mut item = Arc::unwrap_or_clone(later);
        item.dirtied = self.dirtied;
        Arc::new(item)
    }
}

/// Order a flush batch for the underlying store: entries with a known row id
/// first in row id order, then new entries in insertion order
pub fn sort_for_write(items: &mut [QueuedItemRef]) {
    items.sort_by_key(|qi| (qi.row_id() < 0, qi.row_id().max(0)));
}

/// Keep only the last queued entry per key, preserving relative order
///
/// The survivor keeps the earliest dirtied time of the entries it replaces.
pub fn dedup_keep_last(items: Vec<QueuedItemRef>) -> Vec<QueuedItemRef> {
    let mut last: HashMap<String, (usize, Instant)> = HashMap::with_capacity(items.len());
    for (idx, qi) in items.iter().enumerate() {
        last.entry(qi.key().to_string())
            .and_modify(|(at, dirtied)| {
                *at = idx;
                *dirtied = (*dirtied).min(qi.dirtied());
            })
            .or_insert((idx, qi.dirtied()));
    }
    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, qi)| match last.get(qi.key()) {
            Some(&(at, dirtied)) if at == idx => {
                if dirtied < qi.dirtied() {
                    let mut item = Arc::unwrap_or_clone(qi);
                    item.dirtied = dirtied;
                    Some(Arc::new(item))
                } else {
                    Some(qi)
                }
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qi(key: &str, row_id: i64) -> QueuedItemRef {
        Arc::new(QueuedItem::new(key, 0, QueueOp::Set, 0, row_id, 1))
    }

    #[test]
    fn test_sort_for_write() {
        let mut items = vec![qi("new1", -1), qi("b", 9), qi("new2", -1), qi("a", 3)];
        sort_for_write(&mut items);
        let keys: Vec<_> = items.iter().map(|q| q.key().to_string()).collect();
        assert_eq!(keys, ["a", "b", "new1", "new2"]);
    }

    #[test]
    fn test_dedup_keeps_last() {
        let first = Arc::new(QueuedItem::new("k", 0, QueueOp::Set, 0, -1, 1));
        let second = Arc::new(QueuedItem::new("k", 0, QueueOp::Del, 0, -1, 2));
        let items = dedup_keep_last(vec![first, qi("x", -1), second]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key(), "x");
        assert_eq!(items[1].op(), QueueOp::Del);
    }

    #[test]
    fn test_replacement_keeps_first_dirtied() {
        let first = Arc::new(QueuedItem::new("k", 0, QueueOp::Set, 0, -1, 1));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Arc::new(QueuedItem::new("k", 0, QueueOp::Set, 0, -1, 2));
        assert!(second.dirtied() > first.dirtied());

        let replaced = first.superseded_by(Arc::clone(&second));
        assert_eq!(replaced.seqno(), 2);
        assert_eq!(replaced.dirtied(), first.dirtied());

        let items = dedup_keep_last(vec![Arc::clone(&first), second]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seqno(), 2);
        assert_eq!(items[0].dirtied(), first.dirtied());
    }
}
