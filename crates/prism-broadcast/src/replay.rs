use crate::envelope::EventEnvelope;
use std::collections::VecDeque;

/// Ring buffer of recently published envelopes. The oldest entry is evicted
/// first once `capacity` is reached.
pub struct ReplayBuffer {
    capacity: usize,
    entries: VecDeque<EventEnvelope>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, envelope: EventEnvelope) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    /// Up to `limit` of the most recent replayable envelopes, oldest first.
    pub fn recent_replayable(&self, limit: usize) -> Vec<EventEnvelope> {
        let mut picked: Vec<EventEnvelope> = self
            .entries
            .iter()
            .rev()
            .filter(|e| e.is_replayable())
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
