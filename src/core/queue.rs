//! Bounded blocking FIFO shared between a producer thread and its consumers.
//!
//! Used for decoded video frames and for in-flight control messages. Closing
//! the queue evicts everything it holds and releases every blocked caller;
//! a closed queue ignores pushes until it is reopened.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity blocking queue with open/close semantics.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates an open queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// Returns false (dropping `item`) if the queue is or becomes closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Like `push`, but gives up once `timeout` has elapsed.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.closed || state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Removes the front item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop_front(&self) -> Option<T> {
        let mut state = self.state.lock();
        while !state.closed && state.items.is_empty() {
            self.not_empty.wait(&mut state);
        }
        if state.closed {
            return None;
        }
        let item = state.items.pop_front();
        self.not_full.notify_one();
        item
    }

    /// Removes the front item if there is one; never blocks.
    pub fn try_pop_front(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Evaluates `predicate` against the whole backing store and removes the
    /// front item only if it returns true. Never blocks.
    ///
    /// Returns the removed item, or `None` when nothing was removed.
    pub fn pop_front_if<F>(&self, predicate: F) -> Option<T>
    where
        F: FnOnce(&VecDeque<T>) -> bool,
    {
        let mut state = self.state.lock();
        if state.closed || !predicate(&state.items) {
            return None;
        }
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Drops every queued item without changing the open state.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        self.not_full.notify_all();
    }

    /// Closes the queue, evicting its items and waking every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        tracing::trace!("queue closed");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Reopens a closed queue.
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(3);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.try_pop_front(), Some(2));
        assert_eq!(queue.pop_front(), Some(3));
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop_front(), None);
    }

    #[test]
    fn test_push_timeout_when_full() {
        let queue = BoundedQueue::new(1);
        assert!(queue.push(1));
        assert!(!queue.push_timeout(2, Duration::from_millis(20)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_blocked_push_resumes_after_pop() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop_front(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop_front(), Some(2));
    }

    #[test]
    fn test_close_releases_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_front())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_closed_queue_evicts_and_ignores_pushes() {
        let queue = BoundedQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.close();

        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert!(!queue.push(3));
        assert_eq!(queue.pop_front(), None);

        queue.open();
        assert!(queue.push(4));
        assert_eq!(queue.pop_front(), Some(4));
    }

    #[test]
    fn test_pop_front_if_sees_whole_store() {
        let queue = BoundedQueue::new(4);
        queue.push(10);
        queue.push(20);

        // Decide on the second element
        assert_eq!(queue.pop_front_if(|items| items.get(1) == Some(&30)), None);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front_if(|items| items.get(1) == Some(&20)), Some(10));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_front_if_on_empty_does_not_block() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert_eq!(queue.pop_front_if(|_| true), None);
    }

    #[test]
    fn test_clear_keeps_queue_open() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.clear();
        assert!(!queue.is_closed());
        assert!(queue.push(2));
    }
}
