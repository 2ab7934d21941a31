use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// An entry waiting for admission.
#[derive(Debug)]
pub struct Queued<T> {
    pub priority: i32,
    /// Monotonic submission sequence; earlier entries win ties.
    pub seq: u64,
    pub enqueued_at: Instant,
    pub item: T,
}

impl<T> Queued<T> {
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    // BinaryHeap is a max-heap: higher priority first, then lower seq first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Admission queue ordered by priority, then submission order.
///
/// Re-queued entries (retries) receive a fresh sequence number, so they line
/// up behind work of the same priority that was already waiting.
pub struct AdmissionQueue<T> {
    heap: BinaryHeap<Queued<T>>,
    next_seq: u64,
}

impl<T> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Add an item. Returns its sequence number.
    pub fn push(&mut self, priority: i32, item: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority,
            seq,
            enqueued_at: Instant::now(),
            item,
        });
        seq
    }

    /// The entry that would be admitted next.
    pub fn peek(&self) -> Option<&Queued<T>> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<Queued<T>> {
        self.heap.pop()
    }

    /// Entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Queued<T>> {
        self.heap.iter()
    }

    /// Remove and return every entry in admission order.
    pub fn drain_ordered(&mut self) -> Vec<Queued<T>> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
