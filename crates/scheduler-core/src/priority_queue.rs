//! Blocking priority queue of [`WorkUnit`]s, ordered by priority then FIFO.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::types::{PriorityBucket, WorkUnit};

/// Snapshot of queue depth, split by priority bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Units queued at [`PriorityBucket::Low`].
    pub low: usize,
    /// Units queued at [`PriorityBucket::Normal`].
    pub normal: usize,
    /// Units queued at [`PriorityBucket::High`].
    pub high: usize,
}

impl QueueStats {
    /// Total queued units across all buckets.
    pub fn total(&self) -> usize {
        self.low + self.normal + self.high
    }
}

struct Entry {
    unit: WorkUnit,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.unit.priority == other.unit.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; for equal priority, lower seq (older) first.
        self.unit
            .priority
            .cmp(&other.unit.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of work units, safe to share across dispatcher and worker tasks.
///
/// Ordering is priority-first, then insertion order within equal priority. `pop`
/// blocks until a unit is available or `token` is cancelled, in which case it
/// returns `None` without losing any queued unit.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a unit. Never blocks.
    pub fn push(&self, unit: WorkUnit) -> Result<(), QueueError> {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().expect("queue mutex poisoned").push(Entry { unit, seq });
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority, oldest-within-priority unit.
    ///
    /// Blocks (without busy-waiting) until a unit is enqueued or `token` fires.
    pub async fn pop(&self, token: &CancellationToken) -> Option<WorkUnit> {
        loop {
            if let Some(entry) = self.heap.lock().expect("queue mutex poisoned").pop() {
                return Some(entry.unit);
            }
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = token.cancelled() => return None,
            }
        }
    }

    /// Non-blocking variant of [`PriorityQueue::pop`].
    pub fn try_pop(&self) -> Option<WorkUnit> {
        self.heap.lock().expect("queue mutex poisoned").pop().map(|e| e.unit)
    }

    /// Current depth, split by priority bucket.
    pub fn stats(&self) -> QueueStats {
        let heap = self.heap.lock().expect("queue mutex poisoned");
        let mut stats = QueueStats::default();
        for entry in heap.iter() {
            match PriorityBucket::of(entry.unit.priority) {
                PriorityBucket::Low => stats.low += 1,
                PriorityBucket::Normal => stats.normal += 1,
                PriorityBucket::High => stats.high += 1,
            }
        }
        stats
    }

    /// Drain all queued units, e.g. to redistribute them to another pool.
    pub fn drain(&self) -> Vec<WorkUnit> {
        let mut heap = self.heap.lock().expect("queue mutex poisoned");
        let mut out: Vec<Entry> = std::mem::take(&mut *heap).into_sorted_vec();
        out.reverse();
        out.into_iter().map(|e| e.unit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CpuRequest, WorkPayload};

    fn unit(priority: i64) -> WorkUnit {
        WorkUnit::new(
            priority,
            WorkPayload::Cpu(CpuRequest { task: "noop".into(), data: serde_json::Value::Null }),
        )
    }

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let q = PriorityQueue::new();
        q.push(unit(5)).unwrap();
        q.push(unit(20)).unwrap();
        q.push(unit(10)).unwrap();
        let token = CancellationToken::new();
        assert_eq!(q.pop(&token).await.unwrap().priority, 20);
        assert_eq!(q.pop(&token).await.unwrap().priority, 10);
        assert_eq!(q.pop(&token).await.unwrap().priority, 5);
    }

    #[tokio::test]
    async fn fifo_within_equal_priority() {
        let q = PriorityQueue::new();
        let mut first = unit(10);
        first.id = "first".into();
        let mut second = unit(10);
        second.id = "second".into();
        q.push(first).unwrap();
        q.push(second).unwrap();
        let token = CancellationToken::new();
        assert_eq!(q.pop(&token).await.unwrap().id, "first");
        assert_eq!(q.pop(&token).await.unwrap().id, "second");
    }

    #[tokio::test]
    async fn pop_returns_none_on_cancellation() {
        let q = PriorityQueue::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(q.pop(&token).await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(PriorityQueue::new());
        let token = CancellationToken::new();
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop(&token).await });
        tokio::task::yield_now().await;
        q.push(unit(1)).unwrap();
        let popped = handle.await.unwrap();
        assert!(popped.is_some());
    }

    #[test]
    fn stats_bucket_counts() {
        let q = PriorityQueue::new();
        q.push(unit(1)).unwrap();
        q.push(unit(15)).unwrap();
        q.push(unit(25)).unwrap();
        let stats = q.stats();
        assert_eq!(stats.low, 1);
        assert_eq!(stats.normal, 1);
        assert_eq!(stats.high, 1);
        assert_eq!(stats.total(), 3);
    }
}
