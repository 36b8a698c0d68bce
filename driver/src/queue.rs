//! Bounded FIFO between the dispatcher and the workers
//!
//! Overflow drops the oldest entries: under sustained overload fresh work is
//! preferred over complete work.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ConfigError;

/// Outcome of a timed dequeue
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(T),
    /// Nothing arrived before the timeout
    Empty,
    /// Queue closed; no further items will be handed out
    Closed,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        Ok(Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1 << 16)),
                closed: false,
                evicted: 0,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `items`, optionally clearing the queue first, evicting from the
    /// front whenever the capacity would be exceeded. Returns the number
    /// evicted. The queue never holds more than `capacity` items, however
    /// long the batch.
    pub fn push_batch<I>(&self, items: I, reset: bool) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        self.push_inner(0, items, reset)
    }

    /// Append `count` items built by `make`. Only the newest `capacity` of
    /// them can survive eviction, so the rest are counted as evicted without
    /// being built.
    pub fn push_burst<F>(&self, count: usize, reset: bool, make: F) -> usize
    where
        F: FnMut() -> T,
    {
        let skipped = count.saturating_sub(self.capacity);
        let built = std::iter::repeat_with(make).take(count - skipped);
        self.push_inner(skipped, built, reset)
    }

    fn push_inner<I>(&self, skipped: usize, items: I, reset: bool) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.lock();
        if reset {
            state.items.clear();
        }

        let mut added = 0usize;
        let mut evicted = skipped;
        for item in items {
            if state.items.len() == self.capacity {
                state.items.pop_front();
                evicted += 1;
            }
            state.items.push_back(item);
            added += 1;
        }
        state.evicted += evicted as u64;
        drop(state);

        match added {
            0 => {}
            1 => self.available.notify_one(),
            _ => self.available.notify_all(),
        }
        evicted
    }

    pub fn push(&self, item: T) -> usize {
        self.push_batch(std::iter::once(item), false)
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Pop::Closed;
        }
        match state.items.pop_front() {
            Some(item) => Pop::Item(item),
            None => Pop::Empty,
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Stop handing out items and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove everything still queued, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let mut state = self.lock();
        let n = state.items.len();
        state.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items dropped by the overflow policy since creation
    pub fn total_evicted(&self) -> u64 {
        self.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            BoundedQueue::<u32>::new(0),
            Err(ConfigError::InvalidCapacity)
        ));
    }

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(10).unwrap();
        q.push_batch(1..=3, false);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = BoundedQueue::new(3).unwrap();
        assert_eq!(q.push_batch(1..=2, false), 0);
        assert_eq!(q.push_batch(3..=5, false), 2);
        assert_eq!(q.len(), 3);
        assert_eq!(q.total_evicted(), 2);
        assert_eq!(q.try_pop(), Some(3));
    }

    #[test]
    fn test_reset_clears_before_push() {
        let q = BoundedQueue::new(10).unwrap();
        q.push_batch(1..=5, false);
        q.push_batch(std::iter::once(99), true);
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_pop(), Some(99));
    }

    #[test]
    fn test_stalled_consumer_never_exceeds_capacity() {
        let q = BoundedQueue::new(100).unwrap();
        for burst in 1..500 {
            q.push_batch(0..burst, false);
            assert!(q.len() <= 100);
        }
        assert_eq!(q.len(), 100);
    }

    #[test]
    fn test_huge_batch_stays_within_capacity() {
        let q = BoundedQueue::new(8).unwrap();
        q.push_batch(0..4u64, false);
        let evicted = q.push_batch(0..5_000_000u64, false);
        assert_eq!(evicted, 5_000_000 - 4);
        assert_eq!(q.len(), 8);
        assert_eq!(q.try_pop(), Some(5_000_000 - 8));
    }

    #[test]
    fn test_burst_builds_only_survivors() {
        let q = BoundedQueue::new(16).unwrap();
        q.push_batch(0..3u64, false);
        let mut built = 0u64;
        let evicted = q.push_burst(100_000_000, false, || {
            built += 1;
            built
        });
        assert_eq!(built, 16);
        assert_eq!(evicted, 100_000_000 - 16 + 3);
        assert_eq!(q.total_evicted(), evicted as u64);
        assert_eq!(q.len(), 16);
        assert_eq!(q.try_pop(), Some(1));
    }

    #[test]
    fn test_burst_after_reset() {
        let q = BoundedQueue::new(4).unwrap();
        q.push_batch(0..4u64, false);
        assert_eq!(q.push_burst(2, true, || 7), 0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_pop_timeout_empty() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1).unwrap();
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Pop::Empty);
    }

    #[test]
    fn test_blocked_consumer_woken_by_push() {
        let q = Arc::new(BoundedQueue::new(4).unwrap());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(7u32);
        assert_eq!(consumer.join().unwrap(), Pop::Item(7));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4).unwrap());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let start = Instant::now();
                (q.pop_timeout(Duration::from_secs(10)), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        let (pop, waited) = consumer.join().unwrap();
        assert_eq!(pop, Pop::Closed);
        assert!(waited < Duration::from_secs(5));
        assert!(q.is_closed());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let q = Arc::new(BoundedQueue::new(1_000_000).unwrap());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match q.pop_timeout(Duration::from_millis(100)) {
                        Pop::Item(v) => seen.push(v),
                        Pop::Empty => continue,
                        Pop::Closed => break,
                    }
                    if seen.len() == 10_000 {
                        break;
                    }
                }
                seen
            })
        };
        for chunk in 0..100u32 {
            q.push_batch(chunk * 100..(chunk + 1) * 100, false);
        }
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..10_000).collect::<Vec<u32>>());
    }
}
