//! Bounded drop-oldest message queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Default number of messages held per socket.
pub const DEFAULT_CAPACITY: usize = 5000;

/// A single-consumer queue that never blocks producers: on overflow the
/// oldest message is discarded and counted.
#[derive(Debug)]
pub struct MessageQueue {
    items: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a message. Returns false if the queue is closed.
    pub fn push(&self, msg: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next message. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            if let Some(msg) = self.items.lock().pop_front() {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        self.items.lock().pop_front()
    }

    /// Stop accepting messages; the consumer drains what is left.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
