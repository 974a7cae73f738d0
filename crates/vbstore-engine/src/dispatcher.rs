//! Cooperative task queues.
//!
//! Each dispatcher owns one named worker thread. Tasks are closures that
//! return [`Next`]: either they are done, or they ask to run again after a
//! delay. A task that is woken while it runs is run again as soon as it
//! returns, so wakeups are never lost.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use vbstore_common::Result;

/// Handle of a scheduled task
pub type TaskId = u64;

/// Lower runs first among tasks due at the same time
pub type Priority = u8;

pub mod priority {
    use super::Priority;

    pub const FLUSHER: Priority = 0;
    pub const VBUCKET_PERSIST_HIGH: Priority = 0;
    pub const BG_FETCHER: Priority = 1;
    pub const BG_FETCHER_GET_META: Priority = 1;
    pub const VBUCKET_DELETION: Priority = 2;
    pub const VKEY_STAT_BG_FETCHER: Priority = 3;
    pub const WARMUP: Priority = 3;
    pub const VBUCKET_PERSIST_LOW: Priority = 4;
    pub const ITEM_PAGER: Priority = 5;
    pub const EXPIRY_PAGER: Priority = 6;
    pub const MUTATION_LOG_COMPACTOR: Priority = 7;
}

/// What a task wants after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Done,
    Snooze(Duration),
}

type TaskFn = Box<dyn FnMut() -> Next + Send>;

enum Command {
    Schedule {
        id: TaskId,
        name: String,
        priority: Priority,
        delay: Duration,
        task: TaskFn,
    },
    Wake(TaskId),
    Snooze(TaskId, Duration),
    Cancel(TaskId),
    Stop { force: bool },
}

struct Entry {
    name: String,
    priority: Priority,
    task: TaskFn,
    /// Generation of the heap slot that is currently valid
    seq: u64,
}

#[derive(Default)]
struct TaskQueue {
    tasks: HashMap<TaskId, Entry>,
    heap: BinaryHeap<Reverse<(Instant, Priority, u64, TaskId)>>,
    seq: u64,
}

impl TaskQueue {
    fn arm(&mut self, id: TaskId, at: Instant) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        self.seq += 1;
        entry.seq = self.seq;
        self.heap.push(Reverse((at, entry.priority, self.seq, id)));
    }

    fn insert(&mut self, id: TaskId, entry: Entry, at: Instant) {
        self.tasks.insert(id, entry);
        self.arm(id, at);
    }

    /// Earliest valid wake time, discarding stale heap slots
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, _, seq, id))) = self.heap.peek().copied() {
            if self.tasks.get(&id).is_some_and(|e| e.seq == seq) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_ready(&mut self, now: Instant) -> Option<(TaskId, Entry)> {
        let at = self.next_deadline()?;
        if at > now {
            return None;
        }
        let Reverse((_, _, _, id)) = self.heap.pop()?;
        self.tasks.remove(&id).map(|e| (id, e))
    }

    /// Apply a command; returns the stop request if one arrived
    fn apply(&mut self, cmd: Command) -> Option<bool> {
        match cmd {
            Command::Schedule {
                id,
                name,
                priority,
                delay,
                task,
            } => {
                let entry = Entry {
                    name,
                    priority,
                    task,
                    seq: 0,
                };
                self.insert(id, entry, Instant::now() + delay);
            }
            Command::Wake(id) => self.arm(id, Instant::now()),
            Command::Snooze(id, delay) => self.arm(id, Instant::now() + delay),
            Command::Cancel(id) => {
                self.tasks.remove(&id);
            }
            Command::Stop { force } => return Some(force),
        }
        None
    }
}

/// A named task queue served by one worker thread
pub struct Dispatcher {
    name: String,
    tx: Sender<Command>,
    next_id: Arc<AtomicU64>,
    num_tasks: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start a dispatcher thread named `vbstore-<name>`
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let num_tasks = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            name: name.to_string(),
            rx,
            queue: TaskQueue::default(),
            num_tasks: Arc::clone(&num_tasks),
        };
        let handle = std::thread::Builder::new()
            .name(format!("vbstore-{name}"))
            .spawn(move || worker.run())?;
        debug!(dispatcher = name, "dispatcher started");
        Ok(Self {
            name: name.to_string(),
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            num_tasks,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule `task` to first run after `delay`
    pub fn schedule(
        &self,
        name: &str,
        priority: Priority,
        delay: Duration,
        task: impl FnMut() -> Next + Send + 'static,
    ) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Schedule {
            id,
            name: name.to_string(),
            priority,
            delay,
            task: Box::new(task),
        });
        id
    }

    /// Run a task as soon as possible
    pub fn wake(&self, id: TaskId) {
        self.send(Command::Wake(id));
    }

    pub fn snooze(&self, id: TaskId, delay: Duration) {
        self.send(Command::Snooze(id, delay));
    }

    pub fn cancel(&self, id: TaskId) {
        self.send(Command::Cancel(id));
    }

    /// Tasks currently scheduled (including one that is running)
    pub fn num_tasks(&self) -> usize {
        self.num_tasks.load(Ordering::Relaxed)
    }

    /// Stop the worker thread
    ///
    /// Without `force`, tasks that are already due run once more before the
    /// thread exits.
    pub fn stop(&self, force: bool) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.send(Command::Stop { force });
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(dispatcher = %self.name, "dispatcher thread panicked");
        }
        debug!(dispatcher = %self.name, "dispatcher stopped");
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            trace!(dispatcher = %self.name, "dispatcher already stopped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop(true);
    }
}

struct Worker {
    name: String,
    rx: Receiver<Command>,
    queue: TaskQueue,
    num_tasks: Arc<AtomicUsize>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let cmd = match self.queue.next_deadline() {
                Some(at) if at <= Instant::now() => None,
                Some(at) => match self.rx.recv_deadline(at) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match self.rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => return,
                },
            };

            if let Some(cmd) = cmd {
                if let Some(force) = self.apply(cmd) {
                    self.shutdown(force);
                    return;
                }
                continue;
            }

            if let Some((id, entry)) = self.queue.pop_ready(Instant::now()) {
                self.run_task(id, entry);
                while let Ok(cmd) = self.rx.try_recv() {
                    if let Some(force) = self.apply(cmd) {
                        self.shutdown(force);
                        return;
                    }
                }
            }
        }
    }

    fn apply(&mut self, cmd: Command) -> Option<bool> {
        let stop = self.queue.apply(cmd);
        self.num_tasks.store(self.queue.tasks.len(), Ordering::Relaxed);
        stop
    }

    fn run_task(&mut self, id: TaskId, mut entry: Entry) {
        trace!(dispatcher = %self.name, task = %entry.name, "running task");
        let started = Instant::now();
        let next = (entry.task)();
        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(1) {
            debug!(
                dispatcher = %self.name,
                task = %entry.name,
                elapsed_ms = elapsed.as_millis(),
                "slow task"
            );
        }
        match next {
            Next::Done => {}
            Next::Snooze(delay) => self.queue.insert(id, entry, Instant::now() + delay),
        }
        self.num_tasks
            .store(self.queue.tasks.len(), Ordering::Relaxed);
    }

    fn shutdown(&mut self, force: bool) {
        if !force {
            let now = Instant::now();
            while let Some((id, entry)) = self.queue.pop_ready(now) {
                self.run_task(id, entry);
                self.queue.tasks.remove(&id);
            }
        }
        self.queue.tasks.clear();
        self.num_tasks.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_runs_and_snoozes() {
        let dispatcher = Dispatcher::new("test").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut runs = 0;
        dispatcher.schedule("counter", 0, Duration::ZERO, move || {
            runs += 1;
            tx.send(runs).unwrap();
            if runs < 3 {
                Next::Snooze(Duration::from_millis(5))
            } else {
                Next::Done
            }
        });
        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        dispatcher.stop(false);
    }

    #[test]
    fn test_wake_cuts_snooze_short() {
        let dispatcher = Dispatcher::new("test").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = dispatcher.schedule("sleeper", 0, Duration::from_secs(3600), move || {
            tx.send(()).unwrap();
            Next::Snooze(Duration::from_secs(3600))
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        dispatcher.wake(id);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(dispatcher.num_tasks(), 1);
        dispatcher.cancel(id);
        dispatcher.wake(id);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_earlier_deadline_runs_first() {
        let dispatcher = Dispatcher::new("test").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let late = tx.clone();
        dispatcher.schedule("late", 0, Duration::from_millis(40), move || {
            late.send("late").unwrap();
            Next::Done
        });
        dispatcher.schedule("early", 9, Duration::from_millis(5), move || {
            tx.send("early").unwrap();
            Next::Done
        });
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), ("early", "late"));
    }

    #[test]
    fn test_queue_breaks_ties_by_priority() {
        let mut queue = TaskQueue::default();
        let at = Instant::now();
        for (id, priority) in [(1, 5), (2, 1)] {
            let entry = Entry {
                name: format!("t{id}"),
                priority,
                task: Box::new(|| Next::Done),
                seq: 0,
            };
            queue.insert(id, entry, at);
        }
        assert_eq!(queue.pop_ready(at).unwrap().0, 2);
        assert_eq!(queue.pop_ready(at).unwrap().0, 1);
        assert!(queue.pop_ready(at).is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dispatcher = Dispatcher::new("test").unwrap();
        dispatcher.stop(true);
        dispatcher.stop(true);
        assert_eq!(dispatcher.num_tasks(), 0);
    }
}
