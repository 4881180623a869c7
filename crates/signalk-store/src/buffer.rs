//! Batching buffer for store records.
//!
//! Records accumulate until the batch is full or the flush interval has
//! elapsed since the last flush, whichever comes first.

use std::time::{Duration, Instant};

pub struct BatchBuffer<T> {
    items: Vec<T>,
    max_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_size: usize, flush_interval: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_size),
            max_size: max_size.max(1),
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Add a record. Returns the batch when this record filled it.
    pub fn add(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// True when records are waiting and the interval has elapsed.
    pub fn should_flush(&self) -> bool {
        !self.items.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    /// Take every buffered record and restart the interval.
    pub fn flush(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
