//! Per-session notification queue.
//!
//! Logically unbounded FIFO: pushes never block the serving path, takes
//! block until an item arrives or the queue is closed. One mutex plus one
//! completion signal per queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("queue is closed")]
pub struct QueueClosed;

pub struct UpdateQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Default for UpdateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UpdateQueue<T> {
    pub fn new() -> Self {
        UpdateQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item. A push onto a closed queue is dropped.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.items.push_back(item);
        self.available.notify_one();
    }

    /// Take the head item without blocking.
    pub fn try_pop(&self) -> Result<Option<T>, QueueClosed> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueClosed);
        }
        Ok(inner.items.pop_front())
    }

    /// Block until an item is available or the queue is closed.
    pub fn pop_wait(&self) -> Result<T, QueueClosed> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(QueueClosed);
            }
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            inner = match self.available.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Close the queue, waking all blocked takers. Items still queued are
    /// discarded; subsequent pops fail.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.items.clear();
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn delivers_in_fifo_order() {
        let queue = UpdateQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop_wait().unwrap(), 1);
        assert_eq!(queue.pop_wait().unwrap(), 2);
        assert_eq!(queue.pop_wait().unwrap(), 3);
    }

    #[test]
    fn pop_wait_blocks_until_push() {
        let queue = Arc::new(UpdateQueue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(queue.pop_wait().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn close_wakes_blocked_taker() {
        let queue: Arc<UpdateQueue<u32>> = Arc::new(UpdateQueue::new());
        let closer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert_eq!(queue.pop_wait(), Err(QueueClosed));
        handle.join().unwrap();
    }

    #[test]
    fn push_after_close_is_dropped() {
        let queue = UpdateQueue::new();
        queue.close();
        queue.push(1);
        assert!(queue.is_closed());
        assert_eq!(queue.pop_wait(), Err(QueueClosed));
    }

    #[test]
    fn close_discards_pending_items() {
        let queue = UpdateQueue::new();
        queue.push(1);
        queue.close();
        assert_eq!(queue.try_pop(), Err(QueueClosed));
    }
}
