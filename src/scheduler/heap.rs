use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Binary min-heap over `(priority, key)` pairs whose priorities can be
/// changed in place.
///
/// Ties are broken by key so the head is deterministic. The master uses one
/// instance to pick the least-loaded archive and another to pick the archive
/// with the longest output queue (by storing negated lengths).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedHeap {
    entries: Vec<(i64, usize)>,
    positions: BTreeMap<usize, usize>,
}

impl IndexedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key starts at priority 0.
    pub fn with_keys(keys: impl IntoIterator<Item = usize>) -> Self {
        let mut heap = Self::new();
        for key in keys {
            heap.insert(key, 0);
        }
        heap
    }

    /// Insert `key`, or update its priority if it is already present.
    pub fn insert(&mut self, key: usize, priority: i64) {
        if self.positions.contains_key(&key) {
            self.update(key, priority);
            return;
        }
        self.entries.push((priority, key));
        let slot = self.entries.len() - 1;
        self.positions.insert(key, slot);
        self.sift_up(slot);
    }

    /// Key with the lowest priority, lowest key first among equals.
    pub fn head(&self) -> Option<usize> {
        self.entries.first().map(|&(_, key)| key)
    }

    pub fn head_priority(&self) -> Option<i64> {
        self.entries.first().map(|&(priority, _)| priority)
    }

    pub fn priority(&self, key: usize) -> Option<i64> {
        self.positions.get(&key).map(|&slot| self.entries[slot].0)
    }

    /// Returns false if `key` is not in the heap.
    pub fn update(&mut self, key: usize, priority: i64) -> bool {
        let Some(&slot) = self.positions.get(&key) else {
            return false;
        };
        let old = self.entries[slot].0;
        self.entries[slot].0 = priority;
        if priority < old {
            self.sift_up(slot);
        } else {
            self.sift_down(slot);
        }
        true
    }

    pub fn adjust(&mut self, key: usize, delta: i64) -> bool {
        match self.priority(key) {
            Some(current) => self.update(key, current + delta),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: usize) -> bool {
        self.positions.contains_key(&key)
    }

    /// `(key, priority)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        self.positions
            .iter()
            .map(|(&key, &slot)| (key, self.entries[slot].0))
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot] >= self.entries[parent] {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < len && self.entries[left] < self.entries[smallest] {
                smallest = left;
            }
            if right < len && self.entries[right] < self.entries[smallest] {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].1, a);
        self.positions.insert(self.entries[b].1, b);
    }
}
