//! Cleanup ordering.
//!
//! Pending cleanups run highest priority first; equal priorities run in
//! submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

/// Priority of a resource's cleanup action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl From<u8> for CleanupPriority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug)]
struct Queued<T> {
    priority: CleanupPriority,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence), // Lower sequence = earlier
            ord => ord,
        }
    }
}

/// Max-heap keyed by (priority, reverse submission order).
#[derive(Debug)]
pub struct CleanupQueue<T> {
    heap: BinaryHeap<Queued<T>>,
    next_sequence: u64,
}

impl<T> CleanupQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: CleanupPriority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Queued { priority, sequence, item });
    }

    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|q| q.item)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|q| &q.item)
    }

    /// Remove the first queued item matching `pred`, keeping the rest in order.
    pub fn remove_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut found = None;
        let rest: Vec<Queued<T>> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter_map(|q| {
                if found.is_none() && pred(&q.item) {
                    found = Some(q.item);
                    None
                } else {
                    Some(q)
                }
            })
            .collect();
        self.heap = BinaryHeap::from(rest);
        found
    }

    /// Take every queued item in execution order.
    pub fn drain_ordered(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|q| &q.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for CleanupQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
