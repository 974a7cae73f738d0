//! Batched background fetches.
//!
//! Reads of ejected values queue on their vbucket. The fetcher task on the
//! `ro` dispatcher drains those queues with one `get_multi` per vbucket and
//! hands the results back to the store. A read that fails temporarily is
//! retried, at most [`MAX_BG_FETCH_ATTEMPTS`] times in total.

use crate::dispatcher::{Dispatcher, Next, TaskId, priority};
use crate::store::EpStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use vbstore_common::config::BgFetchConfig;

/// Reads of one key before a temporary failure is reported to the requester
pub const MAX_BG_FETCH_ATTEMPTS: u8 = 5;

pub struct BgFetcher {
    dispatcher: Arc<Dispatcher>,
    task: Mutex<Option<TaskId>>,
    /// Fetches were queued since the last run
    pending: AtomicBool,
    idle_sleep: Duration,
}

impl BgFetcher {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &BgFetchConfig) -> Self {
        Self {
            dispatcher,
            task: Mutex::new(None),
            pending: AtomicBool::new(false),
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
        }
    }

    pub(crate) fn start(&self, store: &Arc<EpStore>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(store);
        let id = self.dispatcher.schedule(
            "bg_fetcher",
            priority::BG_FETCHER,
            Duration::ZERO,
            move || {
                weak.upgrade()
                    .map_or(Next::Done, |store| store.bg_fetcher().step(&store))
            },
        );
        *task = Some(id);
        debug!("background fetcher started");
    }

    pub fn stop(&self) {
        if let Some(id) = self.task.lock().take() {
            self.dispatcher.cancel(id);
            debug!("background fetcher stopped");
        }
    }

    /// Note newly queued fetches and wake the task
    pub fn notify_bg_event(&self) {
        if !self.pending.swap(true, Ordering::AcqRel)
            && let Some(id) = *self.task.lock()
        {
            self.dispatcher.wake(id);
        }
    }

    /// Any vbucket has fetches waiting
    pub fn pending_job(&self, store: &EpStore) -> bool {
        store
            .vbuckets()
            .bucket_ids()
            .into_iter()
            .filter_map(|id| store.vbucket(id))
            .any(|vb| vb.has_pending_bg_fetches())
    }

    /// Serve every queued fetch once, returning the fetches completed
    pub fn run(&self, store: &EpStore) -> usize {
        self.pending.store(false, Ordering::Release);
        let mut completed = 0;
        for vbid in store.vbuckets().bucket_ids() {
            let Some(vb) = store.vbucket(vbid) else {
                continue;
            };
            if !vb.has_pending_bg_fetches() {
                continue;
            }
            let mut queue = vb.take_bg_fetch_items();
            for item in queue.values_mut().flatten() {
                item.attempts = item.attempts.saturating_add(1);
            }
            let start = Instant::now();
            store.ro_store.get_multi(vbid, &mut queue);
            trace!(vbucket = vbid, rows = queue.len(), "batched fetch done");
            completed += store.complete_bg_fetches(vbid, queue, start);
        }
        completed
    }

    fn step(&self, store: &EpStore) -> Next {
        let completed = self.run(store);
        if completed > 0 {
            debug!(completed, "background fetches completed");
        }
        if self.pending_job(store) {
            Next::Snooze(Duration::ZERO)
        } else {
            Next::Snooze(self.idle_sleep)
        }
    }
}
