//! Completion notifications for operations that returned `WouldBlock`.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use vbstore_common::Status;

/// Handle of a caller waiting for background I/O
pub trait IoNotifier: Send + Sync {
    fn notify_io_complete(&self, status: Status);
}

/// Shared requester handle
pub type Requester = Arc<dyn IoNotifier>;

/// Notifier that forwards every completion into a channel
pub struct ChannelNotifier {
    tx: Sender<Status>,
}

impl ChannelNotifier {
    pub fn new() -> (Arc<Self>, Receiver<Status>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl IoNotifier for ChannelNotifier {
    fn notify_io_complete(&self, status: Status) {
        // The receiver may have given up waiting.
        let _ = self.tx.send(status);
    }
}

/// One-shot notifier for async callers
pub struct Waiter {
    tx: Mutex<Option<oneshot::Sender<Status>>>,
}

impl Waiter {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Status>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl IoNotifier for Waiter {
    fn notify_io_complete(&self, status: Status) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(status);
        }
    }
}
