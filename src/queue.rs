// ABOUTME: Producer-counted multi-consumer FIFO queue and an atomic counter
// ABOUTME: These are the only concurrency primitives the routing core builds on

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Multi-producer multi-consumer FIFO with producer accounting.
///
/// Consumers block in [`MsgQueue::consume`] until an item is available
/// or the producer count drops to zero, at which point they observe
/// end-of-stream (`None`). Producers register with
/// [`MsgQueue::add_producer`] and must pair it with
/// [`MsgQueue::remove_producer`].
#[derive(Debug)]
pub struct MsgQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    producers: usize,
}

impl<T> MsgQueue<T> {
    pub fn new() -> Self {
        MsgQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                producers: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn add_producer(&self) {
        self.inner.lock().unwrap().producers += 1;
    }

    pub fn remove_producer(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.producers > 0, "remove_producer without add_producer");
        inner.producers -= 1;
        if inner.producers == 0 {
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    pub fn producer_count(&self) -> usize {
        self.inner.lock().unwrap().producers
    }

    /// Append an item and wake one waiting consumer.
    pub fn produce(&self, item: T) {
        self.inner.lock().unwrap().items.push_back(item);
        self.notify.notify_one();
    }

    /// Non-blocking pop.
    pub fn extract(&self) -> Option<T> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Suspend until an item arrives or all producers are gone.
    pub async fn consume(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before re-checking state, otherwise a
            // produce/remove_producer between the check and the await
            // is lost
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.producers == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain everything currently queued.
    pub fn extract_all(&self) -> Vec<T> {
        self.inner.lock().unwrap().items.drain(..).collect()
    }
}

impl<T> Default for MsgQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic atomic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn increase(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
