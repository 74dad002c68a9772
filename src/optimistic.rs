// Copyright (c) 2025 SkipSet Contributors
//
// Fine-grained optimistic skip list
//
// Lazy-list protocol: traverse without locks, then lock the predecessor
// (and for removal, the victim) and re-check that the optimistically
// discovered neighbor relation still holds. Deletion is logical first (the
// `marked` flag is the linearization point) and physical second, level by
// level under the predecessor's lock. `fully_linked` keeps a half-built
// tower invisible to removers. At most one per-node lock is held at any
// moment, so lock ordering is trivial and deadlock impossible.

use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{fail, Error, Result};
use crate::level::random_level;
use crate::retired::RetiredList;
use crate::{is_reserved, Key, SkipMap, Value, HEAD_KEY, MAX_LEVEL, TAIL_KEY, TOWER_HEIGHT};

struct Node {
    key: Key,
    value: Value,
    top_level: usize,
    next: [AtomicPtr<Node>; TOWER_HEIGHT],
    /// Logical-deletion flag; the store to true is the removal's
    /// linearization point.
    marked: AtomicBool,
    /// True once the tower is wired at every level. Removers treat nodes
    /// that are not fully linked as invisible.
    fully_linked: AtomicBool,
    lock: Mutex<()>,
}

impl Node {
    fn alloc(key: Key, value: Value, top_level: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            value,
            top_level,
            next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            lock: Mutex::new(()),
        }))
    }
}

/// Skip list with per-node locking and optimistic validation.
pub struct OptimisticSkipList {
    head: *mut Node,
    tail: *mut Node,
    size: AtomicUsize,
    retired: RetiredList<Node>,
}

impl OptimisticSkipList {
    pub fn new() -> Self {
        let head = Node::alloc(HEAD_KEY, 0, MAX_LEVEL);
        let tail = Node::alloc(TAIL_KEY, 0, MAX_LEVEL);
        // Safety: both sentinels were just allocated and are unshared.
        unsafe {
            for level in 0..TOWER_HEIGHT {
                (*head).next[level].store(tail, Ordering::Relaxed);
            }
            (*head).fully_linked.store(true, Ordering::Relaxed);
            (*tail).fully_linked.store(true, Ordering::Relaxed);
        }
        Self {
            head,
            tail,
            size: AtomicUsize::new(0),
            retired: RetiredList::new(),
        }
    }

    /// Lock-free top-down search for the neighbors of `key` at every
    /// level. The result is a snapshot; callers must validate after
    /// locking.
    fn find_position(&self, key: Key) -> ([*mut Node; TOWER_HEIGHT], [*mut Node; TOWER_HEIGHT]) {
        let mut preds = [ptr::null_mut(); TOWER_HEIGHT];
        let mut succs = [ptr::null_mut(); TOWER_HEIGHT];
        let mut pred = self.head;
        for level in (0..TOWER_HEIGHT).rev() {
            // Safety: no node is freed before the list drops, so every
            // pointer read from a next slot stays dereferenceable.
            let mut curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
            while unsafe { (*curr).key } < key {
                pred = curr;
                curr = unsafe { (*curr).next[level].load(Ordering::Acquire) };
            }
            preds[level] = pred;
            succs[level] = curr;
        }
        (preds, succs)
    }

    /// Neighbors of `key` on a single level, for re-finding after a failed
    /// validation.
    fn find_level(&self, key: Key, level: usize) -> (*mut Node, *mut Node) {
        let mut pred = self.head;
        // Safety: as in find_position.
        let mut curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
        while unsafe { (*curr).key } < key {
            pred = curr;
            curr = unsafe { (*curr).next[level].load(Ordering::Acquire) };
        }
        (pred, curr)
    }

    /// Post-lock check that `pred` still links to `succ` at `level` and
    /// neither is being removed.
    fn valid(&self, pred: *mut Node, succ: *mut Node, level: usize) -> bool {
        // Safety: as in find_position.
        unsafe {
            !(*pred).marked.load(Ordering::Acquire)
                && !(*succ).marked.load(Ordering::Acquire)
                && (*pred).next[level].load(Ordering::Acquire) == succ
        }
    }

    pub fn insert(&self, key: Key, value: Value) -> bool {
        if is_reserved(key) {
            return false;
        }
        loop {
            let (preds, succs) = self.find_position(key);
            // Safety: nodes outlive every operation.
            unsafe {
                let candidate = succs[0];
                if (*candidate).key == key && !(*candidate).marked.load(Ordering::Acquire) {
                    return false;
                }
            }

            let pred = preds[0];
            let succ = succs[0];
            // Safety: pred is dereferenceable; the guard borrows it for
            // the critical section only.
            let guard = unsafe { &*pred }.lock.lock();
            if !self.valid(pred, succ, 0) {
                drop(guard);
                continue;
            }
            // Validation pinned succ unmarked, so a key match here is a
            // live duplicate.
            if unsafe { (*succ).key } == key {
                drop(guard);
                return false;
            }

            let top_level = random_level();
            let node = Node::alloc(key, value, top_level);
            // Safety: node is unpublished until the release store below.
            unsafe {
                for level in 0..=top_level {
                    (*node).next[level].store(succs[level], Ordering::Relaxed);
                }
                (*pred).next[0].store(node, Ordering::Release);
            }
            drop(guard);
            self.size.fetch_add(1, Ordering::Relaxed);

            for level in 1..=top_level {
                let mut pred = preds[level];
                let mut succ = succs[level];
                loop {
                    let guard = unsafe { &*pred }.lock.lock();
                    if self.valid(pred, succ, level) {
                        // Safety: only the inserting thread wires the new
                        // node's upper levels.
                        unsafe {
                            (*node).next[level].store(succ, Ordering::Release);
                            (*pred).next[level].store(node, Ordering::Release);
                        }
                        drop(guard);
                        break;
                    }
                    drop(guard);
                    let (p, s) = self.find_level(key, level);
                    pred = p;
                    succ = s;
                }
            }

            // Safety: publishing the flag completes the tower.
            unsafe { (*node).fully_linked.store(true, Ordering::Release) };
            return true;
        }
    }

    pub fn remove(&self, key: Key) -> bool {
        if is_reserved(key) {
            return false;
        }
        let (preds, succs) = self.find_position(key);
        let victim = succs[0];
        // Safety: nodes outlive every operation.
        unsafe {
            if (*victim).key != key {
                return false;
            }
            let guard = (*victim).lock.lock();
            if (*victim).marked.load(Ordering::Acquire)
                || !(*victim).fully_linked.load(Ordering::Acquire)
            {
                drop(guard);
                return false;
            }
            (*victim).marked.store(true, Ordering::Release);
            drop(guard);
        }

        let top_level = unsafe { (*victim).top_level };
        for level in (0..=top_level).rev() {
            let mut pred = preds[level];
            loop {
                let guard = unsafe { &*pred }.lock.lock();
                let linked = unsafe {
                    !(*pred).marked.load(Ordering::Acquire)
                        && (*pred).next[level].load(Ordering::Acquire) == victim
                };
                if linked {
                    // Safety: the victim is marked, so its next pointers
                    // are frozen; no insert can slip in behind it.
                    let succ = unsafe { (*victim).next[level].load(Ordering::Acquire) };
                    unsafe { (*pred).next[level].store(succ, Ordering::Release) };
                    drop(guard);
                    break;
                }
                drop(guard);
                match self.find_pred_of(victim, level) {
                    Some(p) => pred = p,
                    None => break,
                }
            }
        }

        self.size.fetch_sub(1, Ordering::Relaxed);
        self.retired.retire(victim);
        true
    }

    /// Current predecessor of `victim` on `level`, or None if the victim
    /// is no longer linked there.
    fn find_pred_of(&self, victim: *mut Node, level: usize) -> Option<*mut Node> {
        let key = unsafe { (*victim).key };
        let mut pred = self.head;
        loop {
            // Safety: as in find_position.
            let curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
            if curr == victim {
                return Some(pred);
            }
            if unsafe { (*curr).key } > key {
                return None;
            }
            pred = curr;
        }
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        if is_reserved(key) {
            return None;
        }
        let mut pred = self.head;
        let mut curr = ptr::null_mut();
        for level in (0..TOWER_HEIGHT).rev() {
            // Safety: as in find_position.
            curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
            while unsafe { (*curr).key } < key {
                pred = curr;
                curr = unsafe { (*curr).next[level].load(Ordering::Acquire) };
            }
        }
        // Safety: curr is the first level-0 node with key >= `key`.
        unsafe {
            if (*curr).key == key
                && (*curr).fully_linked.load(Ordering::Acquire)
                && !(*curr).marked.load(Ordering::Acquire)
            {
                Some((*curr).value)
            } else {
                None
            }
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&mut self) -> Result<()> {
        let mut lower_keys: Option<HashSet<Key>> = None;
        for level in 0..TOWER_HEIGHT {
            let mut visited = HashSet::new();
            let mut keys = Vec::new();
            // Safety: &mut self guarantees quiescence.
            let mut curr = unsafe { (*self.head).next[level].load(Ordering::Relaxed) };
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
                unsafe {
                    if !(*curr).marked.load(Ordering::Relaxed) {
                        keys.push((*curr).key);
                    }
                    curr = (*curr).next[level].load(Ordering::Relaxed);
                }
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

impl Default for OptimisticSkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OptimisticSkipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticSkipList")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Drop for OptimisticSkipList {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            // Safety: exclusive access; the level-0 chain reaches every
            // still-linked node exactly once, and retired nodes are freed
            // by the retired list.
            let next = unsafe { (*curr).next[0].load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(curr)) };
            curr = next;
        }
    }
}

impl SkipMap for OptimisticSkipList {
    fn insert(&self, key: Key, value: Value) -> bool {
        OptimisticSkipList::insert(self, key, value)
    }

    fn remove(&self, key: Key) -> bool {
        OptimisticSkipList::remove(self, key)
    }

    fn contains(&self, key: Key) -> bool {
        OptimisticSkipList::contains(self, key)
    }

    fn get(&self, key: Key) -> Option<Value> {
        OptimisticSkipList::get(self, key)
    }

    fn len(&self) -> usize {
        OptimisticSkipList::len(self)
    }

    fn validate(&mut self) -> Result<()> {
        OptimisticSkipList::validate(self)
    }
}

// Safety: every shared-memory access goes through atomics or a per-node
// mutex, and node storage is not reclaimed before drop.
unsafe impl Send for OptimisticSkipList {}
unsafe impl Sync for OptimisticSkipList {}
