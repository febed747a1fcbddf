// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Unbounded single-producer/single-consumer queue.
//!
//! A chain of [`Ring`] blocks linked by `next` pointers. Adapted from
//! Dmitry Vyukov's unbounded SPSC queue: wait-free for the producer,
//! lock-free for the consumer (the consumer may have to walk forward onto
//! the next node, but never blocks on the producer).

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use crossbeam_utils::CachePadded;

use crate::ring::Ring;

struct Node<T, const BLOCK: usize> {
    next: AtomicPtr<Node<T, BLOCK>>,
    value: Ring<T, BLOCK>,
}

/// An unbounded SPSC queue built from a chain of `BLOCK`-sized [`Ring`]s.
///
/// `BLOCK` must be a power of two, at least 8, and large enough that
/// `BLOCK * size_of::<T>()` is at least 256 bytes — the same sizing the
/// node-recycling scheme assumes.
pub struct Queue<T, const BLOCK: usize> {
    /// Written only by the consumer (`try_pop`); read by the producer when
    /// refreshing `head_copy` during node recycling.
    head: CachePadded<AtomicPtr<Node<T, BLOCK>>>,
    /// Written only by the producer (`push`); read by the consumer to
    /// detect the end of the chain.
    tail: CachePadded<AtomicPtr<Node<T, BLOCK>>>,
    /// Lowest-address node the producer may still recycle. Producer-only.
    first: Cell<*mut Node<T, BLOCK>>,
    /// The producer's last observation of `head`, refreshed lazily.
    /// Producer-only.
    head_copy: Cell<*mut Node<T, BLOCK>>,
}

// Safety: `T` only ever crosses from the producer thread to the consumer
// thread through the queue's atomic node handoff; the producer-only and
// consumer-only fields are each touched by exactly one thread by contract.
unsafe impl<T: Send, const BLOCK: usize> Send for Queue<T, BLOCK> {}
unsafe impl<T: Send, const BLOCK: usize> Sync for Queue<T, BLOCK> {}

impl<T, const BLOCK: usize> Queue<T, BLOCK> {
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(BLOCK.is_power_of_two(), "spsc: queue block size must be a power of two");
            assert!(BLOCK >= 8, "spsc: queue block must hold at least 8 slots");
            assert!(
                BLOCK * core::mem::size_of::<T>() >= 256,
                "spsc: queue block must span at least 256 bytes"
            );
        }

        let dummy = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Ring::new(),
        }));

        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            first: Cell::new(dummy),
            head_copy: Cell::new(dummy),
        }
    }

    /// Pushes `value`. Never blocks; allocates only when the current tail
    /// block is full and no retired node can be recycled.
    ///
    /// # Safety
    ///
    /// Must only be called by the single producer thread for this queue.
    pub unsafe fn push(&self, value: T) {
        let cur_tail = self.tail.load(Ordering::Relaxed);
        debug_assert!(!cur_tail.is_null());

        // Safety: `cur_tail` is a live node; only the producer writes into
        // its ring.
        let result = unsafe { (*cur_tail).value.try_push(value) };

        if let Err(value) = result {
            // Safety: caller contract (single producer).
            let new_tail = unsafe { self.alloc_node() };

            // Safety: `new_tail` is either a fresh allocation or a retired
            // node whose ring was just `reset`; nothing else observes it
            // until we publish it below.
            unsafe {
                let pushed = (*new_tail).value.try_push(value);
                debug_assert!(pushed.is_ok(), "spsc: freshly reset block rejected a push");
                (*new_tail).next.store(ptr::null_mut(), Ordering::Relaxed);
                (*cur_tail).next.store(new_tail, Ordering::Release);
            }
            self.tail.store(new_tail, Ordering::Release);
        }
    }

    /// # Safety
    ///
    /// Must only be called by the producer thread, and only when the
    /// current tail block's ring has just rejected a push.
    unsafe fn alloc_node(&self) -> *mut Node<T, BLOCK> {
        let first = self.first.get();

        if first == self.head_copy.get() {
            // Safety: forwarded by caller.
            return unsafe { self.recycle(first) };
        }

        let fresh_head_copy = self.head.load(Ordering::Acquire);
        self.head_copy.set(fresh_head_copy);

        if first == fresh_head_copy {
            // Safety: forwarded by caller.
            unsafe { self.recycle(first) }
        } else {
            tracing::trace!(block = BLOCK, "spsc: no retired block to recycle, allocating one");
            Box::into_raw(Box::new(Node {
                next: AtomicPtr::new(ptr::null_mut()),
                value: Ring::new(),
            }))
        }
    }

    /// Detaches `node` (already fully behind the consumer's `head`) from
    /// the producer's recycle list and resets its ring for reuse.
    ///
    /// # Safety
    ///
    /// `node` must equal `self.first.get()` and already be fully drained
    /// (the consumer has moved `head` past it).
    unsafe fn recycle(&self, node: *mut Node<T, BLOCK>) -> *mut Node<T, BLOCK> {
        // Safety: forwarded by caller.
        unsafe {
            self.first.set((*node).next.load(Ordering::Relaxed));
            // The recycled ring's counters are stale (equal, but not
            // necessarily zero) from its previous lifetime; `try_push`
            // below must see a fresh empty ring.
            (*node).value.reset();
            node
        }
    }

    /// Pops the oldest value, or `None` if the queue is currently empty.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer thread for this queue.
    pub unsafe fn try_pop(&self) -> Option<T> {
        let mut cur_head = self.head.load(Ordering::Relaxed);

        loop {
            // Safety: `cur_head` is a live node; only the consumer reads
            // from its ring.
            if let Some(value) = unsafe { (*cur_head).value.try_pop() } {
                return Some(value);
            }

            let cur_tail = self.tail.load(Ordering::Acquire);
            if cur_tail == cur_head {
                return None;
            }

            // Safety: `cur_head != cur_tail`, so `next` was published by a
            // prior producer `push` before it advanced `tail` past us.
            let next = unsafe { (*cur_head).next.load(Ordering::Acquire) };
            debug_assert!(!next.is_null());
            self.head.store(next, Ordering::Relaxed);
            cur_head = next;
        }
    }

    /// `true` once the current head block is drained and no further block
    /// follows it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let cur_head = self.head.load(Ordering::Acquire);
        // Safety: `cur_head` is always a live node for the lifetime of `self`.
        let head_ring_empty = unsafe { (*cur_head).value.is_empty() };

        if !head_ring_empty {
            false
        } else {
            let cur_tail = self.tail.load(Ordering::Acquire);
            cur_head == cur_tail
        }
    }
}

impl<T, const BLOCK: usize> Default for Queue<T, BLOCK> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const BLOCK: usize> Drop for Queue<T, BLOCK> {
    fn drop(&mut self) {
        let mut node = *self.first.get_mut();
        while !node.is_null() {
            // Safety: `&mut self` rules out concurrent access; `node` is a
            // live allocation made by `new`/`alloc_node`, and every node
            // reachable from `first` is owned exactly once by this chain.
            unsafe {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crosses_node_boundary_and_recycles() {
        let q: Queue<u32, 8> = Queue::new();

        // Safety: single-threaded test, one producer, one consumer.
        unsafe {
            for v in 0..9 {
                q.push(v);
            }
            for v in 0..9 {
                assert_eq!(q.try_pop(), Some(v));
            }
            assert!(q.is_empty());
            assert_eq!(q.try_pop(), None);

            // The second node should now be `first` again and get reused
            // rather than a third node being allocated.
            let first_before = q.first.get();
            for v in 0..9 {
                q.push(v);
            }
            assert_eq!(q.first.get(), first_before);
            for v in 0..9 {
                assert_eq!(q.try_pop(), Some(v));
            }
        }
    }

    #[test]
    fn fifo_order_within_a_single_block() {
        let q: Queue<u32, 8> = Queue::new();

        // Safety: single-threaded test.
        unsafe {
            for v in [1, 2, 3] {
                q.push(v);
            }
            assert_eq!(q.try_pop(), Some(1));
            assert_eq!(q.try_pop(), Some(2));
            assert_eq!(q.try_pop(), Some(3));
            assert_eq!(q.try_pop(), None);
        }
    }
}
