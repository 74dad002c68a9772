// Copyright (c) 2025 SkipSet Contributors
//
// Retired-node list
//
// A node that has been physically unlinked from every level is unreachable
// from the head sentinel, but concurrent traversers may still hold
// references to it, so its storage cannot be freed until the whole list is
// quiescent. The unlinking thread parks the node here; dropping the list
// (which requires exclusive ownership, i.e. quiescence) drains the chain
// and frees the nodes. Treiber push, no pop.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::backoff::Backoff;

struct RetiredNode<T> {
    ptr: *mut T,
    next: *mut RetiredNode<T>,
}

pub(crate) struct RetiredList<T> {
    head: AtomicPtr<RetiredNode<T>>,
}

impl<T> RetiredList<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Park an unlinked node until the owning list is dropped.
    ///
    /// The caller must be the thread whose unlink made `node` unreachable;
    /// each node may be retired at most once.
    pub(crate) fn retire(&self, node: *mut T) {
        let wrapper = Box::into_raw(Box::new(RetiredNode {
            ptr: node,
            next: ptr::null_mut(),
        }));
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Safety: wrapper is not yet published
            unsafe { (*wrapper).next = head };
            if self
                .head
                .compare_exchange_weak(head, wrapper, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

impl<T> Drop for RetiredList<T> {
    fn drop(&mut self) {
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            // Safety: exclusive access at drop; every retired node was
            // unlinked exactly once, so no double free.
            let wrapper = unsafe { Box::from_raw(curr) };
            unsafe { drop(Box::from_raw(wrapper.ptr)) };
            curr = wrapper.next;
        }
    }
}

// Safety: the chain is only mutated through the atomic head until drop,
// and retired nodes are owned by the list from that point on.
unsafe impl<T: Send> Send for RetiredList<T> {}
unsafe impl<T: Send> Sync for RetiredList<T> {}
