// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded single-producer/single-consumer ring buffer.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};
use crossbeam_utils::CachePadded;

/// A bounded SPSC ring of `CAP` slots, `CAP` a power of two.
///
/// Exactly one thread may call [`Ring::try_push`] at a time, and exactly one
/// thread (which may differ from the producer) may call [`Ring::try_pop`] at
/// a time; the type does nothing to enforce this, it only guarantees
/// correctness under that usage.
pub struct Ring<T, const CAP: usize> {
    tail: CachePadded<AtomicU32>,
    buf: [UnsafeCell<MaybeUninit<T>>; CAP],
    head: CachePadded<AtomicU32>,
}

// Safety: values only ever cross from the producer thread to the consumer
// thread through the release/acquire handoff on `tail`/`head`, the same
// contract `Send` already requires of `T`.
unsafe impl<T: Send, const CAP: usize> Sync for Ring<T, CAP> {}

impl<T, const CAP: usize> Ring<T, CAP> {
    const MASK: u32 = CAP as u32 - 1;

    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(CAP.is_power_of_two(), "spsc: ring capacity must be a power of two");
        }
        Self {
            tail: CachePadded::new(AtomicU32::new(0)),
            buf: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            head: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Attempts to push `value` into the ring. On failure (ring full),
    /// returns it back to the caller.
    ///
    /// # Safety
    ///
    /// Must only be called by the single producer thread for this ring.
    pub unsafe fn try_push(&self, value: T) -> Result<(), T> {
        // Only the producer writes `tail`, so relaxed is enough for our own
        // last value; `head` is written by the consumer, so we need to
        // acquire its latest store to see freed slots.
        let cur_tail = self.tail.load(Ordering::Relaxed);
        let cur_head = self.head.load(Ordering::Acquire);

        if cur_tail.wrapping_sub(cur_head) < CAP as u32 {
            let slot = &self.buf[(cur_tail & Self::MASK) as usize];
            // Safety: slot `cur_tail & MASK` was last owned by the consumer
            // strictly before its matching pop, and that pop happened-before
            // this push observed the freed `head`; we are the sole producer.
            unsafe {
                (*slot.get()).write(value);
            }
            self.tail.store(cur_tail.wrapping_add(1), Ordering::Release);
            Ok(())
        } else {
            Err(value)
        }
    }

    /// # Safety
    ///
    /// Must only be called by the single consumer thread for this ring.
    pub unsafe fn try_pop(&self) -> Option<T> {
        let cur_tail = self.tail.load(Ordering::Acquire);
        let cur_head = self.head.load(Ordering::Relaxed);

        if cur_tail == cur_head {
            return None;
        }

        let slot = &self.buf[(cur_head & Self::MASK) as usize];
        // Safety: the `Acquire` load of `tail` synchronizes-with the
        // producer's `Release` store that published this slot; we are the
        // sole consumer.
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(cur_head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Number of elements currently queued. Racy with respect to concurrent
    /// push/pop; useful only as a hint.
    #[must_use]
    pub fn current_size(&self) -> u32 {
        let cur_tail = self.tail.load(Ordering::Acquire);
        let cur_head = self.head.load(Ordering::Acquire);
        cur_tail.wrapping_sub(cur_head)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_size() == 0
    }

    /// Resets both counters to zero without dropping any queued values.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive access (no concurrent producer or
    /// consumer) and must guarantee every slot is already logically empty.
    pub(crate) unsafe fn reset(&self) {
        self.tail.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
    }
}

impl<T, const CAP: usize> Default for Ring<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAP: usize> Drop for Ring<T, CAP> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            let slot = &self.buf[(head & Self::MASK) as usize];
            // Safety: `&mut self` rules out any concurrent access; every
            // slot in `[head, tail)` was written by `try_push` and never
            // read back out.
            unsafe {
                (*slot.get()).assume_init_drop();
            }
            head = head.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_empty_transitions() {
        let ring: Ring<u32, 4> = Ring::new();

        // Safety: single-threaded test, one producer, one consumer.
        unsafe {
            for v in 0..4 {
                assert!(ring.try_push(v).is_ok());
            }
            assert_eq!(ring.try_push(4), Err(4));

            for v in 0..4 {
                assert_eq!(ring.try_pop(), Some(v));
            }
            assert_eq!(ring.try_pop(), None);
        }
    }

    #[test]
    fn wraps_around_past_u32_values() {
        let ring: Ring<u32, 4> = Ring::new();

        // Safety: single-threaded test.
        unsafe {
            for round in 0..10 {
                assert!(ring.try_push(round).is_ok());
                assert_eq!(ring.try_pop(), Some(round));
            }
        }
    }

    #[test]
    fn drop_runs_destructors_for_queued_values() {
        use std::rc::Rc;

        let ring: Ring<Rc<()>, 4> = Ring::new();
        let sentinel = Rc::new(());

        // Safety: single-threaded test.
        unsafe {
            ring.try_push(sentinel.clone()).unwrap();
            ring.try_push(sentinel.clone()).unwrap();
        }
        assert_eq!(Rc::strong_count(&sentinel), 3);
        drop(ring);
        assert_eq!(Rc::strong_count(&sentinel), 1);
    }
}
