//! Bounded recency list for ghost page ids.
//!
//! Ghost entries are page ids retained after eviction: they carry no
//! data, only the fact that the page was resident recently. Because the
//! keys are plain integers, the list is a ring buffer (MRU at the front)
//! plus a membership set, which gives O(1) record and membership tests
//! without per-node allocation.
//!
//! Removal is lazy: `remove` only drops the id from the membership set
//! and leaves a stale slot in the ring, which `pop_lru` skips over. The
//! ring is compacted when stale slots outnumber live ones.
//!
//! ## Example
//!
//! ```
//! use pagekit::ds::GhostList;
//!
//! let mut ghost = GhostList::new(2);
//! ghost.record(7);
//! ghost.record(8);
//! assert!(ghost.contains(7));
//!
//! // At capacity: the least recent id falls off.
//! ghost.record(9);
//! assert!(!ghost.contains(7));
//! assert!(ghost.contains(8) && ghost.contains(9));
//! ```

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::PageId;

/// Bounded list of recently evicted page ids, most recent first.
#[derive(Debug)]
pub struct GhostList {
    /// MRU at the front; may contain stale slots for removed ids.
    ring: VecDeque<PageId>,
    members: FxHashSet<PageId>,
    capacity: usize,
}

impl GhostList {
    /// Creates a ghost list tracking at most `capacity` ids.
    ///
    /// A capacity of 0 produces a list that ignores all records.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            members: FxHashSet::default(),
            capacity,
        }
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if no ids are tracked.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raises or lowers the capacity, trimming from the LRU end if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.trim_to(capacity);
    }

    /// Membership test; this is the ghost-hit check.
    pub fn contains(&self, page: PageId) -> bool {
        self.members.contains(&page)
    }

    /// Records `page` as most recently evicted.
    ///
    /// An id that is already tracked stays tracked; its position is not
    /// refreshed (a tracked id is always removed on a ghost hit before
    /// it can be recorded again).
    pub fn record(&mut self, page: PageId) {
        if self.capacity == 0 || self.members.contains(&page) {
            return;
        }
        if self.members.len() >= self.capacity {
            self.pop_lru();
        }
        self.ring.push_front(page);
        self.members.insert(page);
        self.maybe_compact();
    }

    /// Forgets `page`; returns `true` if it was tracked.
    pub fn remove(&mut self, page: PageId) -> bool {
        self.members.remove(&page)
    }

    /// Drops and returns the least recently recorded id.
    pub fn pop_lru(&mut self) -> Option<PageId> {
        while let Some(page) = self.ring.pop_back() {
            if self.members.remove(&page) {
                return Some(page);
            }
        }
        None
    }

    /// Trims from the LRU end until at most `target` ids remain.
    pub fn trim_to(&mut self, target: usize) {
        while self.members.len() > target {
            self.pop_lru();
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.members.clear();
    }

    fn maybe_compact(&mut self) {
        if self.ring.len() > self.members.len() * 2 + 16 {
            let members = &self.members;
            self.ring.retain(|page| members.contains(page));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_contains() {
        let mut ghost = GhostList::new(4);
        assert!(ghost.is_empty());
        ghost.record(1);
        ghost.record(2);
        assert_eq!(ghost.len(), 2);
        assert!(ghost.contains(1));
        assert!(!ghost.contains(3));
    }

    #[test]
    fn capacity_evicts_lru() {
        let mut ghost = GhostList::new(2);
        ghost.record(1);
        ghost.record(2);
        ghost.record(3);
        assert_eq!(ghost.len(), 2);
        assert!(!ghost.contains(1));
        assert!(ghost.contains(2));
        assert!(ghost.contains(3));
    }

    #[test]
    fn remove_is_lazy_but_correct() {
        let mut ghost = GhostList::new(3);
        ghost.record(1);
        ghost.record(2);
        ghost.record(3);
        assert!(ghost.remove(2));
        assert!(!ghost.remove(2));
        assert_eq!(ghost.len(), 2);
        // Stale slot for 2 is skipped.
        assert_eq!(ghost.pop_lru(), Some(1));
        assert_eq!(ghost.pop_lru(), Some(3));
        assert_eq!(ghost.pop_lru(), None);
    }

    #[test]
    fn zero_capacity_ignores_records() {
        let mut ghost = GhostList::new(0);
        ghost.record(1);
        assert!(ghost.is_empty());
        assert!(!ghost.contains(1));
    }

    #[test]
    fn shrinking_capacity_trims() {
        let mut ghost = GhostList::new(8);
        for page in 0..8 {
            ghost.record(page);
        }
        ghost.set_capacity(3);
        assert_eq!(ghost.len(), 3);
        // The three most recent survive.
        assert!(ghost.contains(5) && ghost.contains(6) && ghost.contains(7));
    }

    #[test]
    fn compaction_keeps_order() {
        let mut ghost = GhostList::new(64);
        for page in 0..64 {
            ghost.record(page);
        }
        for page in 0..48 {
            ghost.remove(page);
        }
        // Force churn past the compaction threshold.
        for page in 100..110 {
            ghost.record(page);
        }
        assert_eq!(ghost.pop_lru(), Some(48));
    }
}
