// Copyright (c) 2025 SkipSet Contributors
//
// Coarse-grained skip list
//
// One process-wide mutex serializes every operation, including contains,
// so the variant is trivially linearizable: each operation takes effect
// when it enters the critical section. Inside the lock the next pointers
// are ordinary stores, and a removed node can be freed on the spot since
// no reader can hold a reference without the lock.

use std::collections::HashSet;
use std::fmt;
use std::ptr;

use parking_lot::Mutex;

use crate::error::{fail, Error, Result};
use crate::level::random_level;
use crate::{is_reserved, Key, SkipMap, Value, HEAD_KEY, MAX_LEVEL, TAIL_KEY, TOWER_HEIGHT};

struct Node {
    key: Key,
    value: Value,
    top_level: usize,
    next: [*mut Node; TOWER_HEIGHT],
}

impl Node {
    fn alloc(key: Key, value: Value, top_level: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            value,
            top_level,
            next: [ptr::null_mut(); TOWER_HEIGHT],
        }))
    }
}

struct Inner {
    head: *mut Node,
    tail: *mut Node,
    size: usize,
}

/// Skip list guarded by a single global mutex.
pub struct CoarseSkipList {
    inner: Mutex<Inner>,
}

impl Inner {
    /// Predecessor and successor of `key` at every level.
    fn find_position(&self, key: Key) -> ([*mut Node; TOWER_HEIGHT], [*mut Node; TOWER_HEIGHT]) {
        let mut preds = [ptr::null_mut(); TOWER_HEIGHT];
        let mut succs = [ptr::null_mut(); TOWER_HEIGHT];
        let mut pred = self.head;
        for level in (0..TOWER_HEIGHT).rev() {
            // Safety: all pointers reachable from head are live nodes owned
            // by this list; the caller holds the global lock.
            let mut curr = unsafe { (*pred).next[level] };
            while unsafe { (*curr).key } < key {
                pred = curr;
                curr = unsafe { (*curr).next[level] };
            }
            preds[level] = pred;
            succs[level] = curr;
        }
        (preds, succs)
    }

    fn insert(&mut self, key: Key, value: Value) -> bool {
        let (preds, succs) = self.find_position(key);
        // Safety: find_position pointers are live while the lock is held.
        unsafe {
            if (*succs[0]).key == key {
                return false;
            }
            let top_level = random_level();
            let node = Node::alloc(key, value, top_level);
            for level in 0..=top_level {
                (*node).next[level] = succs[level];
                (*preds[level]).next[level] = node;
            }
        }
        self.size += 1;
        true
    }

    fn remove(&mut self, key: Key) -> bool {
        let (preds, succs) = self.find_position(key);
        let victim = succs[0];
        // Safety: victim is live; unlinking under the lock leaves no
        // other reference to it, so it can be freed immediately.
        unsafe {
            if (*victim).key != key {
                return false;
            }
            for level in (0..=(*victim).top_level).rev() {
                (*preds[level]).next[level] = (*victim).next[level];
            }
            drop(Box::from_raw(victim));
        }
        self.size -= 1;
        true
    }

    fn get(&self, key: Key) -> Option<Value> {
        let (_, succs) = self.find_position(key);
        // Safety: succs[0] is live while the lock is held.
        unsafe {
            if (*succs[0]).key == key {
                Some((*succs[0]).value)
            } else {
                None
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut lower_keys: Option<HashSet<Key>> = None;
        for level in 0..TOWER_HEIGHT {
            let mut visited = HashSet::new();
            let mut keys = Vec::new();
            // Safety: exclusive access; every pointer on the chain is a
            // live node owned by this list.
            let mut curr = unsafe { (*self.head).next[level] };
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
                keys.push(unsafe { (*curr).key });
                curr = unsafe { (*curr).next[level] };
            }
            if keys.windows(2).any(|w| w[0] >= w[1]) {
                return fail(Error::Unsorted { level });
            }
            if let Some(lower) = &lower_keys {
                if keys.iter().any(|k| !lower.contains(k)) {
                    return fail(Error::LevelSubset { level });
                }
            }
            if level == 0 && keys.len() != self.size {
                return fail(Error::SizeMismatch {
                    expected: self.size,
                    actual: keys.len(),
                });
            }
            lower_keys = Some(keys.into_iter().collect());
        }
        Ok(())
    }
}

impl CoarseSkipList {
    /// Create an empty list: head and tail sentinels at full height, head
    /// linked to tail on every level.
    pub fn new() -> Self {
        let head = Node::alloc(HEAD_KEY, 0, MAX_LEVEL);
        let tail = Node::alloc(TAIL_KEY, 0, MAX_LEVEL);
        // Safety: both sentinels were just allocated and are unshared.
        unsafe {
            for level in 0..TOWER_HEIGHT {
                (*head).next[level] = tail;
            }
        }
        Self {
            inner: Mutex::new(Inner { head, tail, size: 0 }),
        }
    }

    pub fn insert(&self, key: Key, value: Value) -> bool {
        if is_reserved(key) {
            return false;
        }
        self.inner.lock().insert(key, value)
    }

    pub fn remove(&self, key: Key) -> bool {
        if is_reserved(key) {
            return false;
        }
        self.inner.lock().remove(key)
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        if is_reserved(key) {
            return None;
        }
        self.inner.lock().get(key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&mut self) -> Result<()> {
        self.inner.get_mut().validate()
    }
}

impl Default for CoarseSkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoarseSkipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoarseSkipList")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Drop for CoarseSkipList {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut curr = inner.head;
        while !curr.is_null() {
            // Safety: exclusive access; the level-0 chain reaches every
            // node exactly once, sentinels included.
            let next = unsafe { (*curr).next[0] };
            unsafe { drop(Box::from_raw(curr)) };
            curr = next;
        }
    }
}

impl SkipMap for CoarseSkipList {
    fn insert(&self, key: Key, value: Value) -> bool {
        CoarseSkipList::insert(self, key, value)
    }

    fn remove(&self, key: Key) -> bool {
        CoarseSkipList::remove(self, key)
    }

    fn contains(&self, key: Key) -> bool {
        CoarseSkipList::contains(self, key)
    }

    fn get(&self, key: Key) -> Option<Value> {
        CoarseSkipList::get(self, key)
    }

    fn len(&self) -> usize {
        CoarseSkipList::len(self)
    }

    fn validate(&mut self) -> Result<()> {
        CoarseSkipList::validate(self)
    }
}

// Safety: the raw node pointers are only dereferenced while holding the
// global mutex or via &mut self.
unsafe impl Send for CoarseSkipList {}
unsafe impl Sync for CoarseSkipList {}
