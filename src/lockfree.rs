// Copyright (c) 2025 SkipSet Contributors
//
// Lock-free skip list
//
// Harris/Michael-Fraser protocol. Every next pointer carries a deletion
// mark in its low bit; a marked pointer means the node that owns it is
// logically deleted and the unmarked remainder names the true successor.
// Traversal helps: whenever a walker observes a marked successor it swings
// the predecessor past the dead node with a CAS, so the list converges to
// a clean state without any coordinated reclamation pass.
//
// Membership is decided entirely at level 0. The CAS that installs a node
// into its level-0 predecessor linearizes the insert; the CAS that marks a
// node's level-0 next pointer linearizes the remove. Upper levels are a
// performance structure only: building them is bounded by a retry ceiling
// and may be abandoned under heavy interference.
//
// insert/remove are lock-free; contains/get are wait-free (one top-down
// pass, no retries).

use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::backoff::Backoff;
use crate::error::{fail, Error, Result};
use crate::level::random_level;
use crate::marked::{AtomicMarkedPtr, MarkedPtr};
use crate::retired::RetiredList;
use crate::{is_reserved, Key, SkipMap, Value, HEAD_KEY, MAX_LEVEL, TAIL_KEY, TOWER_HEIGHT};

/// Retry ceiling per upper level while completing a tower. Exhausting it
/// abandons the remaining levels; the node stays reachable via level 0.
const LINK_RETRY_LIMIT: usize = 100;

struct Node {
    key: Key,
    value: Value,
    top_level: usize,
    next: [AtomicMarkedPtr<Node>; TOWER_HEIGHT],
}

impl Node {
    fn alloc(key: Key, value: Value, top_level: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            value,
            top_level,
            next: std::array::from_fn(|_| AtomicMarkedPtr::null()),
        }))
    }
}

/// Snapshot produced by `find`: the neighbors of a key at every level,
/// with every marked node on the search path already unlinked.
struct Position {
    preds: [*mut Node; TOWER_HEIGHT],
    succs: [*mut Node; TOWER_HEIGHT],
    found: bool,
}

/// Counter snapshot for the lock-free variant.
#[derive(Debug, Clone)]
pub struct SkipListStats {
    pub len: usize,
    pub inserts: u64,
    pub removes: u64,
    pub searches: u64,
    /// Upper-level link attempts given up after `LINK_RETRY_LIMIT`
    /// failures. Should stay near zero; a climbing rate means pathological
    /// contention.
    pub abandoned_links: u64,
}

/// Skip list synchronized entirely by compare-and-swap.
pub struct LockFreeSkipList {
    head: *mut Node,
    tail: *mut Node,
    size: AtomicUsize,
    retired: RetiredList<Node>,
    inserts: AtomicU64,
    removes: AtomicU64,
    searches: AtomicU64,
    abandoned_links: AtomicU64,
}

impl LockFreeSkipList {
    pub fn new() -> Self {
        let head = Node::alloc(HEAD_KEY, 0, MAX_LEVEL);
        let tail = Node::alloc(TAIL_KEY, 0, MAX_LEVEL);
        // Safety: both sentinels were just allocated and are unshared.
        unsafe {
            for level in 0..TOWER_HEIGHT {
                (*head).next[level].store(MarkedPtr::new(tail, false), Ordering::Relaxed);
            }
        }
        Self {
            head,
            tail,
            size: AtomicUsize::new(0),
            retired: RetiredList::new(),
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            abandoned_links: AtomicU64::new(0),
        }
    }

    /// Locate the neighbors of `key` at every level, unlinking every
    /// marked node encountered on the way. A failed unlink CAS restarts
    /// the traversal from the head with backoff.
    fn find(&self, key: Key) -> Position {
        let mut preds = [ptr::null_mut(); TOWER_HEIGHT];
        let mut succs = [ptr::null_mut(); TOWER_HEIGHT];
        let mut backoff = Backoff::new();

        'retry: loop {
            let mut pred = self.head;
            for level in (0..TOWER_HEIGHT).rev() {
                // Safety: node storage is not reclaimed before drop, so
                // every pointer read from a next slot is dereferenceable.
                let mut curr = unsafe { (*pred).next[level].load(Ordering::Acquire) }.ptr();
                loop {
                    let (succ, curr_marked) =
                        unsafe { (*curr).next[level].load(Ordering::Acquire) }.decompose();
                    if curr_marked {
                        // curr is dead: swing pred past it.
                        let expected = MarkedPtr::new(curr, false);
                        let swung = MarkedPtr::new(succ, false);
                        if unsafe {
                            (*pred).next[level]
                                .compare_exchange(
                                    expected,
                                    swung,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_err()
                        } {
                            backoff.snooze();
                            continue 'retry;
                        }
                        if level == 0 {
                            // The level-0 unlink made curr unreachable;
                            // exactly one thread wins this CAS.
                            self.retired.retire(curr);
                        }
                        curr = succ;
                        continue;
                    }
                    if unsafe { (*curr).key } < key {
                        pred = curr;
                        curr = succ;
                        continue;
                    }
                    break;
                }
                preds[level] = pred;
                succs[level] = curr;
            }
            let found = unsafe { (*succs[0]).key } == key;
            return Position {
                preds,
                succs,
                found,
            };
        }
    }

    pub fn insert(&self, key: Key, value: Value) -> bool {
        if is_reserved(key) {
            return false;
        }
        let mut backoff = Backoff::new();
        loop {
            let pos = self.find(key);
            if pos.found {
                // Safety: as in find.
                let candidate_next =
                    unsafe { (*pos.succs[0]).next[0].load(Ordering::Acquire) };
                if !candidate_next.is_marked() {
                    return false;
                }
                // The key-equal node is already dying; retry so helping
                // unlinks it, then take its place.
                backoff.snooze();
                continue;
            }

            let top_level = random_level();
            let node = Node::alloc(key, value, top_level);
            // Safety: node is unpublished until the CAS below succeeds.
            unsafe {
                for level in 0..=top_level {
                    (*node).next[level]
                        .store(MarkedPtr::new(pos.succs[level], false), Ordering::Relaxed);
                }
            }

            let expected = MarkedPtr::new(pos.succs[0], false);
            let installed = MarkedPtr::new(node, false);
            if unsafe {
                (*pos.preds[0]).next[0]
                    .compare_exchange(expected, installed, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            } {
                // Safety: the node was never published.
                unsafe { drop(Box::from_raw(node)) };
                backoff.snooze();
                continue;
            }

            self.size.fetch_add(1, Ordering::Relaxed);
            self.inserts.fetch_add(1, Ordering::Relaxed);
            if top_level > 0 {
                self.link_upper_levels(node, key, top_level);
            }
            return true;
        }
    }

    /// Wire the new node into levels `1..=top_level`. Stops early if the
    /// node is deleted mid-build or a level exhausts its retry budget;
    /// both are benign because level 0 alone decides membership.
    fn link_upper_levels(&self, node: *mut Node, key: Key, top_level: usize) {
        let mut backoff = Backoff::new();
        'levels: for level in 1..=top_level {
            let mut retries = 0;
            loop {
                // Safety: as in find; the node is kept alive by the
                // retired list even if it is unlinked concurrently.
                if unsafe { (*node).next[0].load(Ordering::Acquire) }.is_marked() {
                    return;
                }
                let pos = self.find(key);
                let succ = pos.succs[level];

                let cur = unsafe { (*node).next[level].load(Ordering::Acquire) };
                if cur.is_marked() {
                    return;
                }
                if cur.ptr() != succ {
                    // Only this thread stores unmarked words into the
                    // node's tower, so a failure means a deleter marked
                    // the slot.
                    if unsafe {
                        (*node).next[level]
                            .compare_exchange(
                                cur,
                                MarkedPtr::new(succ, false),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                    } {
                        return;
                    }
                }

                let expected = MarkedPtr::new(succ, false);
                let linked = MarkedPtr::new(node, false);
                if unsafe {
                    (*pos.preds[level]).next[level]
                        .compare_exchange(expected, linked, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                } {
                    continue 'levels;
                }

                retries += 1;
                if retries >= LINK_RETRY_LIMIT {
                    self.abandoned_links.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "abandoning tower completion for key {key} at level {level} \
                         after {LINK_RETRY_LIMIT} failed links"
                    );
                    return;
                }
                backoff.snooze();
            }
        }
    }

    pub fn remove(&self, key: Key) -> bool {
        if is_reserved(key) {
            return false;
        }
        let pos = self.find(key);
        if !pos.found {
            return false;
        }
        let victim = pos.succs[0];
        let top_level = unsafe { (*victim).top_level };

        // Mark the upper levels top-down. Each level retries until the
        // slot is observed marked, whoever marked it.
        for level in (1..=top_level).rev() {
            // Safety: as in find.
            let mut next = unsafe { (*victim).next[level].load(Ordering::Acquire) };
            while !next.is_marked() {
                match unsafe {
                    (*victim).next[level].compare_exchange(
                        next,
                        next.with_mark(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                } {
                    Ok(_) => break,
                    Err(observed) => next = observed,
                }
            }
        }

        // Level 0: the linearization point. Losing the mark race here
        // means a concurrent remove owns the deletion.
        let mut next = unsafe { (*victim).next[0].load(Ordering::Acquire) };
        loop {
            if next.is_marked() {
                return false;
            }
            match unsafe {
                (*victim).next[0].compare_exchange(
                    next,
                    next.with_mark(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            } {
                Ok(_) => break,
                Err(observed) => next = observed,
            }
        }

        self.size.fetch_sub(1, Ordering::Relaxed);
        self.removes.fetch_add(1, Ordering::Relaxed);
        // Best-effort physical unlink; find's helping does the work.
        let _ = self.find(key);
        true
    }

    /// One top-down pass that skips marked successors without unlinking
    /// them. No CAS, no restarts: wait-free.
    fn lookup(&self, key: Key) -> *mut Node {
        let mut pred = self.head;
        let mut curr = ptr::null_mut();
        for level in (0..TOWER_HEIGHT).rev() {
            // Safety: as in find.
            curr = unsafe { (*pred).next[level].load(Ordering::Acquire) }.ptr();
            loop {
                let (succ, curr_marked) =
                    unsafe { (*curr).next[level].load(Ordering::Acquire) }.decompose();
                if curr_marked {
                    curr = succ;
                    continue;
                }
                if unsafe { (*curr).key } < key {
                    pred = curr;
                    curr = succ;
                    continue;
                }
                break;
            }
        }
        curr
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        if is_reserved(key) {
            return None;
        }
        self.searches.fetch_add(1, Ordering::Relaxed);
        let node = self.lookup(key);
        // Safety: lookup returns the first live level-0 node with
        // key >= `key`; it was observed unmarked.
        unsafe {
            if (*node).key == key {
                Some((*node).value)
            } else {
                None
            }
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Advisory size: exact only at quiescence.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SkipListStats {
        SkipListStats {
            len: self.len(),
            inserts: self.inserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            abandoned_links: self.abandoned_links.load(Ordering::Relaxed),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        let mut lower_keys: Option<HashSet<Key>> = None;
        for level in 0..TOWER_HEIGHT {
            let mut visited = HashSet::new();
            let mut keys = Vec::new();
            // Safety: &mut self guarantees quiescence.
            let mut curr = unsafe { (*self.head).next[level].load(Ordering::Relaxed) }.ptr();
            loop {
                if curr.is_null() {
                    return fail(Error::BrokenChain { level });
                }
                if curr == self.tail {
                    break;
                }
                if !visited.insert(curr as usize) {
                    return fail(Error::Cycle { level });
                }
                let next = unsafe { (*curr).next[level].load(Ordering::Relaxed) };
                if !next.is_marked() {
                    keys.push(unsafe { (*curr).key });
                }
                curr = next.ptr();
            }
            if keys.windows(2).any(|w| w[0] >= w[1]) {
                return fail(Error::Unsorted { level });
            }
            if let Some(lower) = &lower_keys {
                if keys.iter().any(|k| !lower.contains(k)) {
                    return fail(Error::LevelSubset { level });
                }
            }
            if level == 0 && keys.len() != self.len() {
                return fail(Error::SizeMismatch {
                    expected: self.len(),
                    actual: keys.len(),
                });
            }
            lower_keys = Some(keys.into_iter().collect());
        }
        Ok(())
    }
}

impl Default for LockFreeSkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockFreeSkipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeSkipList")
            .field("len", &self.len())
            .field("abandoned_links", &self.abandoned_links.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for LockFreeSkipList {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access; the level-0 chain reaches every
            // still-linked node exactly once, and unlinked nodes are freed
            // by the retired list.
            let next = unsafe { (*curr).next[0].load(Ordering::Relaxed) }.ptr();
            unsafe { drop(Box::from_raw(curr)) };
            curr = next;
        }
    }
}

impl SkipMap for LockFreeSkipList {
    fn insert(&self, key: Key, value: Value) -> bool {
        LockFreeSkipList::insert(self, key, value)
    }

    fn remove(&self, key: Key) -> bool {
        LockFreeSkipList::remove(self, key)
    }

    fn contains(&self, key: Key) -> bool {
        LockFreeSkipList::contains(self, key)
    }

    fn get(&self, key: Key) -> Option<Value> {
        LockFreeSkipList::get(self, key)
    }

    fn len(&self) -> usize {
        LockFreeSkipList::len(self)
    }

    fn validate(&mut self) -> Result<()> {
        LockFreeSkipList::validate(self)
    }
}

// Safety: all shared state is accessed through atomic words, and node
// storage is not reclaimed before drop.
unsafe impl Send for LockFreeSkipList {}
unsafe impl Sync for LockFreeSkipList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_get() {
        let list = LockFreeSkipList::new();

        assert!(list.insert(1, 10));
        assert!(list.insert(2, 20));
        assert!(list.insert(3, 30));

        assert_eq!(list.get(1), Some(10));
        assert_eq!(list.get(2), Some(20));
        assert_eq!(list.get(3), Some(30));
        assert_eq!(list.get(4), None);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_duplicate_insert() {
        let list = LockFreeSkipList::new();

        assert!(list.insert(7, 1));
        assert!(!list.insert(7, 2));
        assert_eq!(list.get(7), Some(1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut list = LockFreeSkipList::new();

        for key in 1..=10 {
            assert!(list.insert(key, key));
        }
        assert!(list.remove(5));
        assert!(!list.contains(5));
        assert!(list.contains(4));
        assert!(list.contains(6));
        assert_eq!(list.len(), 9);
        assert!(!list.remove(5));
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_empty_list() {
        let mut list = LockFreeSkipList::new();

        assert!(!list.remove(7));
        assert!(!list.contains(7));
        assert!(list.is_empty());
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let list = LockFreeSkipList::new();

        assert!(!list.insert(Key::MIN, 0));
        assert!(!list.insert(Key::MAX, 0));
        assert!(!list.contains(Key::MIN));
        assert!(!list.remove(Key::MAX));
        assert!(list.is_empty());
    }

    #[test]
    fn test_reinsert_after_remove() {
        let list = LockFreeSkipList::new();

        assert!(list.insert(3, 1));
        assert!(list.remove(3));
        assert!(list.insert(3, 2));
        assert_eq!(list.get(3), Some(2));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_stats_counters() {
        let list = LockFreeSkipList::new();

        list.insert(1, 1);
        list.insert(2, 2);
        list.remove(1);
        list.contains(1);
        list.contains(2);

        let stats = list.stats();
        assert_eq!(stats.len, 1);
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.searches, 2);
    }

    #[test]
    fn test_validate_after_bulk_churn() {
        let mut list = LockFreeSkipList::new();

        for key in 0..2_000 {
            assert!(list.insert(key, key));
        }
        for key in (0..2_000).step_by(2) {
            assert!(list.remove(key));
        }
        assert_eq!(list.len(), 1_000);
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_concurrent_inserts() {
        let list = Arc::new(LockFreeSkipList::new());
        let mut handles = vec![];

        for worker in 0..8i64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    assert!(list.insert(worker * 200 + i, i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), 1600);
        let mut list = Arc::into_inner(list).unwrap();
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_concurrent_insert_remove_same_keys() {
        let list = Arc::new(LockFreeSkipList::new());
        let mut handles = vec![];

        for _ in 0..4 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for key in 0..200 {
                    list.insert(key, key);
                    list.remove(key);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut list = Arc::into_inner(list).unwrap();
        let live = (0..200).filter(|&k| list.contains(k)).count();
        assert_eq!(list.len(), live);
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_full_height_tower() {
        let mut list = LockFreeSkipList::new();
        let mut key = 0i64;
        let reached = loop {
            if key == 1 << 21 {
                break false;
            }
            assert!(list.insert(key, key));
            key += 1;
            if key % 4096 == 0 {
                // Safety: no concurrent operations in this test.
                let top =
                    unsafe { (*list.head).next[MAX_LEVEL].load(Ordering::Relaxed) }.ptr();
                if top != list.tail {
                    break true;
                }
            }
        };
        // P(no full-height tower in 2^21 draws) ~ e^-32.
        assert!(reached);
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_concurrent_mixed() {
        let list = Arc::new(LockFreeSkipList::new());
        for key in 0..500 {
            list.insert(key, key);
        }

        let mut handles = vec![];
        for _ in 0..5 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for key in 0..500 {
                    list.contains(key);
                }
            }));
        }
        for worker in 0..5i64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    assert!(list.insert(500 + worker * 100 + i, i));
                    assert!(list.remove(worker * 100 + i));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), 500);
        let mut list = Arc::into_inner(list).unwrap();
        assert!(list.validate().is_ok());
    }
}
