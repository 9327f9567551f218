//! Bounding-box cache keyed by time code
//!
//! Each proxy shape owns one. Entries are only ever dropped wholesale
//! (stage swap, resync, stage-shaping input change) or, when a capacity is
//! configured, oldest first.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::usd::{BoundingBox, TimeCode};

/// Cache statistics for debugging and tests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Boxes computed and stored
    pub recomputes: u64,
    /// Entries dropped to stay within capacity
    pub evictions: u64,
    /// Wholesale clears that removed at least one entry
    pub clears: u64,
}

impl CacheStatistics {
    pub fn hit_ratio(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundingBoxCache {
    capacity: Option<usize>,
    entries: BTreeMap<TimeCode, BoundingBox>,
    insertion_order: VecDeque<TimeCode>,
    stats: CacheStatistics,
}

impl Default for BoundingBoxCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BoundingBoxCache {
    /// `None` keeps every sampled time code
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            entries: BTreeMap::new(),
            insertion_order: VecDeque::new(),
            stats: CacheStatistics::default(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn get(&mut self, time: TimeCode) -> Option<BoundingBox> {
        match self.entries.get(&time) {
            Some(bounds) => {
                self.stats.hits += 1;
                Some(*bounds)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, time: TimeCode) -> bool {
        self.entries.contains_key(&time)
    }

    /// Store a freshly computed box
    pub fn insert(&mut self, time: TimeCode, bounds: BoundingBox) {
        self.stats.recomputes += 1;
        if self.capacity == Some(0) {
            return;
        }
        if self.entries.insert(time, bounds).is_none() {
            self.insertion_order.push_back(time);
        }
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                let Some(oldest) = self.insertion_order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
            }
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.stats.clears += 1;
        }
        self.entries.clear();
        self.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStatistics {
        &self.stats
    }

    /// Number of boxes computed so far
    pub fn recompute_count(&self) -> u64 {
        self.stats.recomputes
    }
}
