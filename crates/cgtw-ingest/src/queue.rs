//! A bounded FIFO queue with the put/get shapes the ingest pipeline needs:
//! non-blocking `try_put`/`try_get`, blocking `put`/`get`, and a drop-oldest
//! operation for the decoded queue's overflow policy. `tokio::sync::mpsc` is
//! close but doesn't expose "pop one without the consumer" for drop-oldest,
//! so this is a small `VecDeque` guarded by a plain `Mutex` plus two
//! `Notify`s — mirroring the shape of Python's `asyncio.Queue`, the type this
//! pipeline's queues were ported from.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking put. `Err(item)` hands the item back if the queue is full.
    pub fn try_put(&self, item: T) -> Result<(), T> {
        let mut guard = self.items.lock().unwrap();
        if guard.len() >= self.capacity {
            return Err(item);
        }
        guard.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until there is room.
    pub async fn put(&self, item: T) {
        let mut item = item;
        loop {
            match self.try_put(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            let notified = self.not_full.notified();
            // Re-check under lock after registering interest, closing the
            // race where capacity freed up between the failed try_put and
            // the notified() subscription above.
            let has_room = self.items.lock().unwrap().len() < self.capacity;
            if has_room {
                continue;
            }
            notified.await;
        }
    }

    /// Non-blocking get.
    pub fn try_get(&self) -> Option<T> {
        let mut guard = self.items.lock().unwrap();
        let item = guard.pop_front();
        drop(guard);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Blocks until an item is available.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            let notified = self.not_empty.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Drop the oldest queued item (if any), then enqueue `item`
    /// unconditionally. Used by the decoded queue's `drop_oldest` overflow
    /// policy; never blocks, never fails.
    pub fn drop_oldest_and_put(&self, item: T) {
        let mut guard = self.items.lock().unwrap();
        guard.pop_front();
        guard.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn try_put_fails_when_full_then_get_frees_room() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        assert!(q.try_put(1).is_ok());
        assert!(q.try_put(2).is_ok());
        assert_eq!(q.try_put(3), Err(3));
        assert_eq!(q.try_get(), Some(1));
        assert!(q.try_put(3).is_ok());
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_and_put_keeps_capacity() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        q.try_put(1).unwrap();
        q.try_put(2).unwrap();
        q.drop_oldest_and_put(3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get(), Some(2));
        assert_eq!(q.try_get(), Some(3));
    }

    #[tokio::test]
    async fn blocking_put_unblocks_after_a_get() {
        let q: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        q.try_put(1).unwrap();

        let q2 = q.clone();
        let putter = tokio::spawn(async move {
            q2.put(2).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.try_get(), Some(1));

        tokio::time::timeout(Duration::from_secs(1), putter)
            .await
            .expect("put should unblock")
            .unwrap();
        assert_eq!(q.try_get(), Some(2));
    }

    #[tokio::test]
    async fn blocking_get_unblocks_after_a_put() {
        let q: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(4));
        let q2 = q.clone();
        let getter = tokio::spawn(async move { q2.get().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.try_put(42).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .expect("get should unblock")
            .unwrap();
        assert_eq!(got, 42);
    }
}
