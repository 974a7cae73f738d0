//! vbstore Engine - Eventually-persistent vbucket storage
//!
//! This crate implements the storage engine for vbstore including:
//! - Striped in-memory hash tables per vbucket (values may be ejected)
//! - Checkpoint queues of dirty keys and the flusher that persists them
//! - Background fetches of ejected values from the underlying store
//! - A mutation log of key to row id associations for fast warmup
//! - Warmup, item paging and expiry sweeps on dedicated dispatchers

pub mod bgfetcher;
pub mod checkpoint;
pub mod dispatcher;
pub mod flusher;
pub mod hashtable;
pub mod item;
pub mod item_pager;
pub mod kvstore;
pub mod mutation_log;
pub mod notify;
pub mod queued_item;
pub mod stats;
pub mod store;
pub mod stored_value;
pub mod vbucket;
pub mod vbucket_map;
pub mod warmup;

#[cfg(test)]
mod testing;

// Re-exports
pub use bgfetcher::{BgFetcher, MAX_BG_FETCH_ATTEMPTS};
pub use dispatcher::{Dispatcher, Next, TaskId};
pub use flusher::{Flusher, FlusherState};
pub use item::{CasCounter, GetValue, Item, ItemMetaData, NO_ROW_ID};
pub use item_pager::{ExpiredItemPager, ItemPager};
pub use kvstore::{KvStore, MemoryKvStore, RedbKvStore, StorageProperties, WriteResult};
pub use mutation_log::{
    LogRecord, LogRecordType, MutationLog, MutationLogHarvester, MutationLogIterator,
};
pub use notify::{ChannelNotifier, IoNotifier, Requester, Waiter};
pub use stats::{EpStats, StatsSnapshot};
pub use store::{EpStore, GetMetaResult, KeyStats, MutationResult, VBucketStats};
pub use vbucket::VBucket;
pub use vbucket_map::VBucketMap;
pub use warmup::{Warmup, WarmupState, WarmupStateListener};
