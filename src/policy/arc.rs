//! Adaptive Replacement Cache (ARC) engine over page ids.
//!
//! The engine decides which pages stay resident. It balances recency
//! against frequency by keeping two resident lists and two ghost lists
//! and moving a target partition `p` toward whichever ghost list keeps
//! receiving hits.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ArcCache<V> layout                          │
//! │                                                                  │
//! │  map: FxHashMap<PageId, NonNull<Node>>     (resident ids only)   │
//! │                                                                  │
//! │  T1 (seen once)                T2 (seen again)                   │
//! │  MRU ──► [n] ◄──► [n] ◄── LRU  MRU ──► [n] ◄──► [n] ◄── LRU      │
//! │            │                             │                       │
//! │            ▼ demoted                     ▼ demoted               │
//! │  B1 ghost ring (ids only)      B2 ghost ring (ids only)          │
//! │                                                                  │
//! │  p ∈ [0, c]: target size for T1.                                 │
//! │  B1 hit → p grows (favour recency).                              │
//! │  B2 hit → p shrinks (favour frequency).                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Resident values live in heap nodes linked into T1 or T2; ghost lists
//! hold bare ids. An eviction hook, when installed, observes every
//! resident removal with the outgoing value still mapped — the hook runs
//! *before* the id leaves the map, exactly once per removal, and never
//! for ghost ids.
//!
//! Invariants held at every quiescent point:
//!
//! - `|T1| + |T2| ≤ c` and the map holds exactly `T1 ∪ T2`
//! - `|T1| + |B1| ≤ c`, `|T2| + |B2| ≤ 2c`
//! - the four lists are pairwise disjoint
//! - `0 ≤ p ≤ c`
//!
//! ## Example
//!
//! ```
//! use pagekit::policy::ArcCache;
//!
//! let mut cache: ArcCache<&str> = ArcCache::new(2);
//! cache.add(0, "a");
//! cache.add(1, "b");
//! assert_eq!(cache.get(0), Some(&"a")); // promotes page 0 to T2
//!
//! cache.add(2, "c"); // forces a replacement; page 1 becomes a ghost
//! assert!(!cache.contains(1));
//! assert!(cache.b1_contains(1));
//! ```
//!
//! Not thread-safe; the paging layer wraps the engine in a mutex and
//! never holds that mutex across I/O.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::ds::GhostList;
use crate::PageId;

/// Hook observing resident evictions: `(page, &mut value)`.
///
/// Must not re-enter the cache for the same page.
pub type EvictionHook<V> = Box<dyn FnMut(PageId, &mut V) + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ListKind {
    T1,
    T2,
}

/// Node in one of the resident lists. Pointers first for cache-line
/// friendliness.
#[repr(C)]
struct Node<V> {
    prev: Option<NonNull<Node<V>>>,
    next: Option<NonNull<Node<V>>>,
    list: ListKind,
    page: PageId,
    value: V,
}

/// ARC cache keyed by page id.
///
/// `V` is the resident payload — for the paging layer, the slot binding
/// a page to a frame. Ghost promotions rebind `V::default()` and expect
/// the caller to refill it.
pub struct ArcCache<V> {
    map: FxHashMap<PageId, NonNull<Node<V>>>,

    t1_head: Option<NonNull<Node<V>>>,
    t1_tail: Option<NonNull<Node<V>>>,
    t1_len: usize,

    t2_head: Option<NonNull<Node<V>>>,
    t2_tail: Option<NonNull<Node<V>>>,
    t2_len: usize,

    b1: GhostList,
    b2: GhostList,

    /// Target size for T1.
    p: usize,
    capacity: usize,

    on_evict: Option<EvictionHook<V>>,
}

// SAFETY: the raw node pointers are owned exclusively by this struct and
// only dereferenced through &mut self or &self; moving the whole cache
// between threads is sound when the payload is Send.
unsafe impl<V: Send> Send for ArcCache<V> {}

impl<V> ArcCache<V> {
    /// Creates an engine with room for `capacity` resident pages.
    ///
    /// `p` starts at 0, favouring recency until ghost hits say
    /// otherwise.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            t1_head: None,
            t1_tail: None,
            t1_len: 0,
            t2_head: None,
            t2_tail: None,
            t2_len: 0,
            b1: GhostList::new(capacity),
            b2: GhostList::new(capacity.saturating_mul(2)),
            p: 0,
            capacity,
            on_evict: None,
        }
    }

    /// Installs the eviction hook, replacing any previous one.
    pub fn set_eviction_callback(&mut self, hook: EvictionHook<V>) {
        self.on_evict = Some(hook);
    }

    /// Membership in T1 ∪ T2; ghosts do not count as present.
    pub fn contains(&self, page: PageId) -> bool {
        self.map.contains_key(&page)
    }

    /// Returns `true` if `page` is tracked in either ghost list.
    pub fn in_ghost(&self, page: PageId) -> bool {
        self.b1.contains(page) || self.b2.contains(page)
    }

    /// Ghost membership in B1 (demoted from T1).
    pub fn b1_contains(&self, page: PageId) -> bool {
        self.b1.contains(page)
    }

    /// Ghost membership in B2 (demoted from T2).
    pub fn b2_contains(&self, page: PageId) -> bool {
        self.b2.contains(page)
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.t1_len + self.t2_len
    }

    /// Returns `true` if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of resident pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current target size for T1.
    pub fn p_value(&self) -> usize {
        self.p
    }

    /// Entries in T1 (resident, seen once).
    pub fn t1_len(&self) -> usize {
        self.t1_len
    }

    /// Entries in T2 (resident, seen again).
    pub fn t2_len(&self) -> usize {
        self.t2_len
    }

    /// Ids in the B1 ghost list.
    pub fn b1_len(&self) -> usize {
        self.b1.len()
    }

    /// Ids in the B2 ghost list.
    pub fn b2_len(&self) -> usize {
        self.b2.len()
    }

    /// Resident page ids, in no particular order.
    pub fn resident_pages(&self) -> Vec<PageId> {
        self.map.keys().copied().collect()
    }

    /// Raises the capacity (adaptive pool growth). Ghost capacities and
    /// `p` are re-clamped against the new value.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.b1.set_capacity(capacity);
        self.b2.set_capacity(capacity.saturating_mul(2));
        self.p = self.p.min(capacity);
        while self.len() > capacity {
            self.replace(false);
        }
        self.enforce_ghost_bounds();
    }

    /// Inserts a fresh resident entry at the MRU end of T1, making room
    /// first when the cache is full.
    ///
    /// Inserting an id that is already resident replaces its value and
    /// promotes it, like [`set`](Self::set).
    pub fn add(&mut self, page: PageId, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&node_ptr) = self.map.get(&page) {
            // SAFETY: node is alive while mapped.
            unsafe { (*node_ptr.as_ptr()).value = value };
            self.detach(node_ptr);
            self.attach_head(node_ptr, ListKind::T2);
            self.enforce_ghost_bounds();
            return;
        }

        self.b1.remove(page);
        self.b2.remove(page);

        if self.len() >= self.capacity {
            self.evict();
        }

        self.insert_node(page, value, ListKind::T1);
        self.enforce_ghost_bounds();
    }

    /// Returns the resident value for `page`, promoting it to the MRU
    /// end of T2. `None` if the page is not resident.
    pub fn get(&mut self, page: PageId) -> Option<&V> {
        let node_ptr = *self.map.get(&page)?;
        self.detach(node_ptr);
        self.attach_head(node_ptr, ListKind::T2);
        self.enforce_ghost_bounds();
        // SAFETY: node is alive while mapped.
        Some(unsafe { &(*node_ptr.as_ptr()).value })
    }

    /// Mutable access without promotion; used to refill a slot bound by
    /// a ghost hit.
    pub fn get_mut(&mut self, page: PageId) -> Option<&mut V> {
        let node_ptr = *self.map.get(&page)?;
        // SAFETY: node is alive while mapped.
        Some(unsafe { &mut (*node_ptr.as_ptr()).value })
    }

    /// Peeks at the resident value without touching recency state.
    pub fn peek(&self, page: PageId) -> Option<&V> {
        let node_ptr = *self.map.get(&page)?;
        // SAFETY: node is alive while mapped.
        Some(unsafe { &(*node_ptr.as_ptr()).value })
    }

    /// Replaces the value if resident (with promotion), else inserts.
    pub fn set(&mut self, page: PageId, value: V) {
        if let Some(&node_ptr) = self.map.get(&page) {
            // SAFETY: node is alive while mapped.
            unsafe { (*node_ptr.as_ptr()).value = value };
            self.detach(node_ptr);
            self.attach_head(node_ptr, ListKind::T2);
            self.enforce_ghost_bounds();
        } else {
            self.add(page, value);
        }
    }

    /// Removes a resident entry without firing the eviction hook and
    /// without leaving a ghost. Used for entries invalidated by the
    /// caller rather than evicted by the policy.
    pub fn remove(&mut self, page: PageId) -> Option<V> {
        let node_ptr = self.map.remove(&page)?;
        self.detach(node_ptr);
        // SAFETY: the node was just unlinked and unmapped.
        let node = unsafe { Box::from_raw(node_ptr.as_ptr()) };
        Some(node.value)
    }

    /// Drops every entry, resident and ghost, without firing the hook.
    pub fn clear(&mut self) {
        let mut current = self.t1_head;
        while let Some(node_ptr) = current {
            // SAFETY: traversing nodes owned by this list.
            unsafe {
                current = (*node_ptr.as_ptr()).next;
                drop(Box::from_raw(node_ptr.as_ptr()));
            }
        }
        let mut current = self.t2_head;
        while let Some(node_ptr) = current {
            // SAFETY: traversing nodes owned by this list.
            unsafe {
                current = (*node_ptr.as_ptr()).next;
                drop(Box::from_raw(node_ptr.as_ptr()));
            }
        }
        self.map.clear();
        self.t1_head = None;
        self.t1_tail = None;
        self.t1_len = 0;
        self.t2_head = None;
        self.t2_tail = None;
        self.t2_len = 0;
        self.b1.clear();
        self.b2.clear();
        self.p = 0;
    }

    // -- list surgery -----------------------------------------------------

    #[inline(always)]
    fn detach(&mut self, node_ptr: NonNull<Node<V>>) {
        // SAFETY: the node is linked into the list named by node.list.
        unsafe {
            let node = node_ptr.as_ref();
            let (prev, next, list) = (node.prev, node.next, node.list);

            let (head, tail, len) = match list {
                ListKind::T1 => (&mut self.t1_head, &mut self.t1_tail, &mut self.t1_len),
                ListKind::T2 => (&mut self.t2_head, &mut self.t2_tail, &mut self.t2_len),
            };

            match prev {
                Some(mut p) => p.as_mut().next = next,
                None => *head = next,
            }
            match next {
                Some(mut n) => n.as_mut().prev = prev,
                None => *tail = prev,
            }
            *len -= 1;
        }
    }

    #[inline(always)]
    fn attach_head(&mut self, mut node_ptr: NonNull<Node<V>>, list: ListKind) {
        // SAFETY: the node is detached; we relink it at the head.
        unsafe {
            let (head, tail, len) = match list {
                ListKind::T1 => (&mut self.t1_head, &mut self.t1_tail, &mut self.t1_len),
                ListKind::T2 => (&mut self.t2_head, &mut self.t2_tail, &mut self.t2_len),
            };

            let node = node_ptr.as_mut();
            node.prev = None;
            node.next = *head;
            node.list = list;

            match *head {
                Some(mut h) => h.as_mut().prev = Some(node_ptr),
                None => *tail = Some(node_ptr),
            }
            *head = Some(node_ptr);
            *len += 1;
        }
    }

    fn insert_node(&mut self, page: PageId, value: V, list: ListKind) {
        let node = Box::new(Node {
            prev: None,
            next: None,
            list,
            page,
            value,
        });
        let node_ptr = NonNull::from(Box::leak(node));
        self.map.insert(page, node_ptr);
        self.attach_head(node_ptr, list);
    }

    /// Fires the hook, unlinks the LRU entry of `list`, and optionally
    /// records its id in the matching ghost list. Returns the demoted
    /// id.
    fn demote_lru(&mut self, list: ListKind, record_ghost: bool) -> Option<PageId> {
        let tail = match list {
            ListKind::T1 => self.t1_tail,
            ListKind::T2 => self.t2_tail,
        }?;
        // SAFETY: tail is a live node owned by this list.
        let page = unsafe { (*tail.as_ptr()).page };

        if let Some(hook) = self.on_evict.as_mut() {
            // SAFETY: the node stays alive until freed below; the hook
            // sees the value while the id is still mapped.
            let value = unsafe { &mut (*tail.as_ptr()).value };
            hook(page, value);
        }

        self.detach(tail);
        self.map.remove(&page);
        // SAFETY: unlinked and unmapped; last owner.
        unsafe { drop(Box::from_raw(tail.as_ptr())) };

        if record_ghost {
            match list {
                ListKind::T1 => self.b1.record(page),
                ListKind::T2 => self.b2.record(page),
            }
        }
        Some(page)
    }

    // -- ARC proper -------------------------------------------------------

    /// Demotes one resident entry into its ghost list, respecting the
    /// target partition `p`.
    fn replace(&mut self, in_b2: bool) {
        let from_t1 = if self.t1_len > 0
            && (self.t1_len > self.p || (in_b2 && self.t1_len == self.p))
        {
            true
        } else if self.t2_len > 0 {
            false
        } else {
            self.t1_len > 0
        };

        if from_t1 {
            self.demote_lru(ListKind::T1, true);
        } else {
            self.demote_lru(ListKind::T2, true);
        }
        self.enforce_ghost_bounds();
    }

    /// Makes room for one incoming resident entry.
    ///
    /// Two trims run first: the recency side (`T1 ∪ B1`) is brought
    /// under `c`, then the total footprint under `2c`, preferring ghost
    /// drops over resident evictions in both. If the resident lists are
    /// still full afterwards, one `replace` guarantees a free slot.
    fn evict(&mut self) {
        if self.t1_len + self.b1.len() >= self.capacity {
            if self.t1_len < self.capacity {
                self.b1.pop_lru();
            } else {
                self.demote_lru(ListKind::T1, false);
            }
        }

        let total = self.t1_len + self.t2_len + self.b1.len() + self.b2.len();
        if total >= 2 * self.capacity {
            if self.t2_len + self.b2.len() > self.capacity {
                self.b2.pop_lru();
            } else {
                self.demote_lru(ListKind::T2, false);
            }
        }

        if self.t1_len + self.t2_len >= self.capacity {
            self.replace(false);
        }
    }

    fn enforce_ghost_bounds(&mut self) {
        let b1_room = self.capacity.saturating_sub(self.t1_len);
        self.b1.trim_to(b1_room);
        let b2_room = (2 * self.capacity).saturating_sub(self.t2_len);
        self.b2.trim_to(b2_room);
    }

    #[inline]
    fn ratio_delta(numerator: usize, denominator: usize) -> usize {
        (numerator / denominator.max(1)).max(1)
    }
}

impl<V: Default> ArcCache<V> {
    /// Promotes `page` according to the ARC rules. Never touches I/O.
    ///
    /// - resident in T1 or T2: move to the MRU end of T2
    /// - ghost in B1: grow `p`, make room, rebind `V::default()` in T2
    /// - ghost in B2: shrink `p`, make room, rebind `V::default()` in T2
    /// - unknown: no-op
    ///
    /// After a ghost promotion the caller is expected to refill the
    /// default value via [`get_mut`](Self::get_mut).
    pub fn touch(&mut self, page: PageId) {
        if let Some(&node_ptr) = self.map.get(&page) {
            self.detach(node_ptr);
            self.attach_head(node_ptr, ListKind::T2);
            self.enforce_ghost_bounds();
            return;
        }

        if self.b1.contains(page) {
            let delta = Self::ratio_delta(self.b2.len(), self.b1.len());
            self.p = (self.p + delta).min(self.capacity);
            if self.len() >= self.capacity {
                self.replace(false);
            }
            self.b1.remove(page);
            self.insert_node(page, V::default(), ListKind::T2);
            self.enforce_ghost_bounds();
        } else if self.b2.contains(page) {
            let delta = Self::ratio_delta(self.b1.len(), self.b2.len());
            self.p = self.p.saturating_sub(delta);
            if self.len() >= self.capacity {
                self.replace(true);
            }
            self.b2.remove(page);
            self.insert_node(page, V::default(), ListKind::T2);
            self.enforce_ghost_bounds();
        }
    }
}

impl<V> Drop for ArcCache<V> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<V> std::fmt::Debug for ArcCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcCache")
            .field("capacity", &self.capacity)
            .field("t1_len", &self.t1_len)
            .field("t2_len", &self.t2_len)
            .field("b1_len", &self.b1.len())
            .field("b2_len", &self.b2.len())
            .field("p", &self.p)
            .finish()
    }
}

#[cfg(any(test, debug_assertions))]
impl<V> ArcCache<V> {
    /// Panics if any structural invariant is violated.
    pub fn debug_validate_invariants(&self) {
        assert_eq!(
            self.map.len(),
            self.t1_len + self.t2_len,
            "map must hold exactly the resident ids"
        );
        assert!(
            self.t1_len + self.t2_len <= self.capacity,
            "resident bound violated: {} + {} > {}",
            self.t1_len,
            self.t2_len,
            self.capacity
        );
        assert!(
            self.t1_len + self.b1.len() <= self.capacity,
            "recency-side bound violated"
        );
        assert!(
            self.t2_len + self.b2.len() <= 2 * self.capacity,
            "frequency-side bound violated"
        );
        assert!(self.p <= self.capacity, "p out of range");

        let mut seen = std::collections::HashSet::new();
        for (expected, head, len) in [
            (ListKind::T1, self.t1_head, self.t1_len),
            (ListKind::T2, self.t2_head, self.t2_len),
        ] {
            let mut count = 0;
            let mut current = head;
            while let Some(node_ptr) = current {
                // SAFETY: traversal of owned nodes.
                unsafe {
                    let node = node_ptr.as_ref();
                    assert_eq!(node.list, expected, "node linked into wrong list");
                    assert!(seen.insert(node.page), "page linked twice");
                    assert!(self.map.contains_key(&node.page), "linked page not mapped");
                    assert!(!self.b1.contains(node.page), "resident page in B1");
                    assert!(!self.b2.contains(node.page), "resident page in B2");
                    count += 1;
                    current = node.next;
                }
            }
            assert_eq!(count, len, "list length counter out of sync");
        }
    }
}
