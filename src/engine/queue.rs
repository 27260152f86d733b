// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bounded priority queue with load shedding.
//!
//! The wave executor feeds atoms through this queue so in-flight work stays
//! bounded. The contract:
//!
//! * capacity `C`: an enqueue at `size >= C` is rejected immediately,
//! * threshold `T = round(C × θ)`: `at_capacity()` turns true at `T` so
//!   producers can back off before hard rejection,
//! * ordering: min-heap on `(priority, enqueue_seq)`. Lower priority value
//!   dequeues first, FIFO among equals via the sequence number, which makes
//!   dequeue order total and replayable,
//! * items past their deadline are silently dropped (counted as expired)
//!   before selection.
//!
//! One mutex guards the heap; `tokio::sync::Notify` wakes dequeue waiters in
//! FIFO registration order.
//!
//! # Performance Characteristics
//!
//! * `enqueue`: O(log n) heap push, O(1) rejection when full
//! * `dequeue`: O(log n) pop, plus O(k log n) for the k expired items shed
//!   before selection (each item expires at most once)
//! * `at_capacity`: O(1)
//!
//! # Examples
//!
//! ## Priority-ordered round trip
//! ```rust
//! use std::time::{Duration, Instant};
//! use atomwave::engine::queue::{BackpressureQueue, Dequeued};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue: BackpressureQueue<&str> = BackpressureQueue::new(8, 80);
//! let deadline = Instant::now() + Duration::from_secs(60);
//!
//! queue.enqueue("low", 3, deadline).unwrap();
//! queue.enqueue("critical", 0, deadline).unwrap();
//!
//! // Lower priority value dequeues first.
//! match queue.dequeue(Duration::from_millis(10)).await {
//!     Dequeued::Item(item) => assert_eq!(item, "critical"),
//!     other => panic!("expected an item, got {:?}", other),
//! }
//! match queue.dequeue(Duration::from_millis(10)).await {
//!     Dequeued::Item(item) => assert_eq!(item, "low"),
//!     other => panic!("expected an item, got {:?}", other),
//! }
//! # }
//! ```
//!
//! ## Load shedding at capacity
//! ```rust
//! use std::time::{Duration, Instant};
//! use atomwave::engine::queue::{BackpressureQueue, RejectReason};
//!
//! let queue: BackpressureQueue<u32> = BackpressureQueue::new(2, 80);
//! let deadline = Instant::now() + Duration::from_secs(60);
//!
//! queue.enqueue(1, 0, deadline).unwrap();
//! queue.enqueue(2, 0, deadline).unwrap();
//!
//! // The queue is full: producers see an immediate rejection.
//! assert_eq!(queue.enqueue(3, 0, deadline), Err(RejectReason::Full));
//! assert!(queue.at_capacity());
//! assert_eq!(queue.stats().rejected, 1);
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Full,
    Closed,
}

/// Outcome of a `dequeue` call.
#[derive(Debug)]
pub enum Dequeued<T> {
    Item(T),
    /// No item became available within `max_wait`.
    Timeout,
    /// The queue is closed and empty; workers should exit.
    Drained,
}

/// Counters published to the metrics registry by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub expired: u64,
    pub current_size: usize,
    pub peak: usize,
}

struct Entry<T> {
    priority: u8,
    seq: u64,
    deadline: Instant,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; invert so the lowest (priority, seq) pops
    // first. Deadlines do not participate in ordering.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
}

/// Bounded min-heap queue shared between one wave's driver and its workers.
///
/// Dequeue order is total: `(priority, enqueue_seq)` with no ties, so a
/// replay over the same enqueue sequence dequeues identically. See the
/// module documentation for the full contract and usage examples.
pub struct BackpressureQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
    threshold: usize,
}

impl<T> BackpressureQueue<T> {
    /// `threshold_pct` is applied as `round(capacity × pct / 100)`.
    pub fn new(capacity: usize, threshold_pct: u8) -> Self {
        let capacity = capacity.max(1);
        let threshold =
            ((capacity as f64) * (threshold_pct as f64) / 100.0).round() as usize;
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            capacity,
            threshold: threshold.max(1),
        }
    }

    /// Insert an item, or reject immediately when full or closed.
    ///
    /// O(log n) on acceptance; O(1) on rejection.
    pub fn enqueue(&self, item: T, priority: u8, deadline: Instant) -> Result<(), RejectReason> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.closed {
            inner.stats.rejected += 1;
            return Err(RejectReason::Closed);
        }
        if inner.heap.len() >= self.capacity {
            inner.stats.rejected += 1;
            return Err(RejectReason::Full);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority,
            seq,
            deadline,
            item,
        });
        inner.stats.enqueued += 1;
        inner.stats.current_size = inner.heap.len();
        inner.stats.peak = inner.stats.peak.max(inner.heap.len());
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait up to `max_wait` for the next live item.
    ///
    /// O(log n) per pop; expired items are shed at O(log n) each before
    /// selection, and each item can expire at most once.
    pub async fn dequeue(&self, max_wait: Duration) -> Dequeued<T> {
        let wait_until = Instant::now() + max_wait;
        loop {
            // Register interest before re-checking state so a concurrent
            // enqueue between the check and the await cannot be missed.
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let now = Instant::now();
                while let Some(top) = inner.heap.peek() {
                    if top.deadline <= now {
                        inner.heap.pop();
                        inner.stats.expired += 1;
                        inner.stats.current_size = inner.heap.len();
                        continue;
                    }
                    break;
                }
                if let Some(entry) = inner.heap.pop() {
                    inner.stats.dequeued += 1;
                    inner.stats.current_size = inner.heap.len();
                    return Dequeued::Item(entry.item);
                }
                if inner.closed {
                    return Dequeued::Drained;
                }
            }

            let remaining = wait_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Dequeued::Timeout;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Dequeued::Timeout;
            }
        }
    }

    /// Producers should back off once the threshold is reached. O(1).
    pub fn at_capacity(&self) -> bool {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.heap.len() >= self.threshold
    }

    /// Stop accepting work; waiters drain the remainder then see `Drained`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = inner.stats;
        stats.current_size = inner.heap.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let queue: BackpressureQueue<&str> = BackpressureQueue::new(16, 80);
        queue.enqueue("medium-1", 2, far_deadline()).unwrap();
        queue.enqueue("critical", 0, far_deadline()).unwrap();
        queue.enqueue("medium-2", 2, far_deadline()).unwrap();
        queue.enqueue("high", 1, far_deadline()).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            match queue.dequeue(Duration::from_millis(10)).await {
                Dequeued::Item(item) => order.push(item),
                other => panic!("expected item, got {:?}", other),
            }
        }
        assert_eq!(order, vec!["critical", "high", "medium-1", "medium-2"]);
    }

    #[tokio::test]
    async fn enqueue_at_capacity_is_rejected() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(4, 80);
        for i in 0..4 {
            queue.enqueue(i, 1, far_deadline()).unwrap();
        }
        assert_eq!(queue.enqueue(99, 0, far_deadline()), Err(RejectReason::Full));
        assert_eq!(queue.stats().rejected, 1);
        assert_eq!(queue.stats().current_size, 4);
    }

    #[tokio::test]
    async fn threshold_signals_before_capacity() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(10, 80);
        for i in 0..7 {
            queue.enqueue(i, 1, far_deadline()).unwrap();
        }
        assert!(!queue.at_capacity());
        queue.enqueue(7, 1, far_deadline()).unwrap();
        assert!(queue.at_capacity());
        // Still below hard capacity, so enqueue keeps working.
        assert!(queue.enqueue(8, 1, far_deadline()).is_ok());
    }

    #[tokio::test]
    async fn expired_items_are_shed_before_selection() {
        let queue: BackpressureQueue<&str> = BackpressureQueue::new(8, 80);
        queue
            .enqueue("stale", 0, Instant::now() - Duration::from_millis(1))
            .unwrap();
        queue.enqueue("fresh", 1, far_deadline()).unwrap();

        match queue.dequeue(Duration::from_millis(10)).await {
            Dequeued::Item(item) => assert_eq!(item, "fresh"),
            other => panic!("expected fresh item, got {:?}", other),
        }
        let stats = queue.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.dequeued, 1);
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(4, 80);
        assert!(matches!(
            queue.dequeue(Duration::from_millis(5)).await,
            Dequeued::Timeout
        ));
    }

    #[tokio::test]
    async fn closed_queue_drains_then_reports_drained() {
        let queue: BackpressureQueue<u32> = BackpressureQueue::new(4, 80);
        queue.enqueue(1, 0, far_deadline()).unwrap();
        queue.close();

        assert!(matches!(
            queue.dequeue(Duration::from_millis(5)).await,
            Dequeued::Item(1)
        ));
        assert!(matches!(
            queue.dequeue(Duration::from_millis(5)).await,
            Dequeued::Drained
        ));
        assert_eq!(queue.enqueue(2, 0, far_deadline()), Err(RejectReason::Closed));
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        use std::sync::Arc;
        let queue: Arc<BackpressureQueue<u32>> = Arc::new(BackpressureQueue::new(4, 80));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(42, 0, far_deadline()).unwrap();

        match consumer.await.unwrap() {
            Dequeued::Item(v) => assert_eq!(v, 42),
            other => panic!("expected item, got {:?}", other),
        }
    }
}
