// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global span cache.
//!
//! One slot per page-count class. Each slot is a single word packing the
//! head span's address with the total number of cached spans: span bases
//! are aligned to `SPAN_GRANULARITY`, so the low 16 bits of the address are
//! free to hold the count. Batches keep their identity inside the cache:
//! insertion records the batch length in the head's `list_size` and the
//! previous head in its `prev` link, so extraction can peel off exactly one
//! batch by following those skip links instead of walking the list.
//!
//! Insertion is a single compare-and-swap. Extraction is a two-step
//! read-modify-write, so it parks a lock sentinel in the slot for its
//! duration; every other operation spins past the sentinel. The packed
//! count doubles as the A-B-A guard for insertion: a stale (head, count)
//! pair can only win the CAS if both halves match, in which case chaining
//! the batch tail to that head is still correct.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sources::MemorySource;
use crate::span::{Span, SPAN_GRANULARITY, SPAN_MASK, SPAN_PAGE_CLASSES};
use crate::util::spin_pause;

/// Spans cached per page-count class before further releases unmap instead.
pub const GLOBAL_CACHE_LIMIT: usize = 4096;

/// Slot value meaning "an extraction is in progress".
const LOCKED: usize = 1;
const COUNT_MASK: usize = SPAN_GRANULARITY - 1;

pub struct GlobalSpanCache {
    slots: [AtomicUsize; SPAN_PAGE_CLASSES],
}

impl GlobalSpanCache {
    pub fn new() -> GlobalSpanCache {
        GlobalSpanCache {
            slots: ::std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Insert a batch of `count` spans of `page_count` pages, chained
    /// through their `next` links from `head` to `tail`. Only as many spans
    /// as fit under the high-water mark are cached; the excess is unmapped
    /// immediately.
    pub unsafe fn insert<S: MemorySource>(
        &self,
        source: &S,
        page_count: usize,
        head: *mut Span,
        tail: *mut Span,
        count: usize,
    ) {
        debug_assert!(count > 0 && count <= COUNT_MASK);
        let slot = &self.slots[page_count - 1];
        loop {
            let cur = slot.load(Ordering::Relaxed);
            if cur == LOCKED {
                spin_pause();
                continue;
            }
            let cur_count = cur & COUNT_MASK;
            let room = GLOBAL_CACHE_LIMIT.saturating_sub(cur_count);
            if room == 0 {
                debug!(
                    "global cache for {} pages at high-water, unmapping {} spans",
                    page_count, count
                );
                unmap_list(source, page_count, head, count);
                return;
            }
            let keep = ::std::cmp::min(count, room);
            let keep_tail = if keep == count {
                tail
            } else {
                let mut t = head;
                for _ in 1..keep {
                    t = (*t).next();
                }
                t
            };
            // The first span past the kept slice; meaningless (but unread)
            // when the whole batch fits.
            let excess = (*keep_tail).next();
            let cur_head = (cur & SPAN_MASK) as *mut Span;
            (*keep_tail).set_next(cur_head);
            (*head).set_prev(cur_head);
            (*head).set_list_size(keep as u32);
            let packed = head as usize | (cur_count + keep);
            if slot
                .compare_exchange_weak(cur, packed, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                detail_event!(GLOBAL_CACHE_INSERTS);
                if keep < count {
                    debug!(
                        "global cache for {} pages over high-water, unmapping {} excess spans",
                        page_count,
                        count - keep
                    );
                    unmap_list(source, page_count, excess, count - keep);
                }
                return;
            }
            // Lost the race; rejoin the split chain before retrying with a
            // fresh view of the slot.
            (*keep_tail).set_next(excess);
        }
    }

    /// Take one batch out of the cache. Returns the batch head and length,
    /// or a null head if the class is empty. The batch is chained through
    /// `next` links; the link of the final span points into the remaining
    /// cache and must not be followed.
    pub unsafe fn extract(&self, page_count: usize) -> (*mut Span, usize) {
        let slot = &self.slots[page_count - 1];
        loop {
            let cur = slot.load(Ordering::Acquire);
            if cur == LOCKED {
                spin_pause();
                continue;
            }
            if cur == 0 {
                return (::std::ptr::null_mut(), 0);
            }
            if slot
                .compare_exchange_weak(cur, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let head = (cur & SPAN_MASK) as *mut Span;
            let total = cur & COUNT_MASK;
            let batch = (*head).list_size() as usize;
            debug_assert!(batch >= 1 && batch <= total);
            let rest_head = (*head).prev();
            let rest = total - batch;
            debug_assert_eq!(rest == 0, rest_head.is_null());
            let packed = if rest_head.is_null() {
                0
            } else {
                rest_head as usize | rest
            };
            slot.store(packed, Ordering::Release);
            detail_event!(GLOBAL_CACHE_EXTRACTS);
            return (head, batch);
        }
    }

    /// Unmap every cached span. Callers must guarantee no concurrent
    /// insertions or extractions.
    pub unsafe fn drain<S: MemorySource>(&self, source: &S) {
        for page_count in 1..=SPAN_PAGE_CLASSES {
            loop {
                let (head, count) = self.extract(page_count);
                if head.is_null() {
                    break;
                }
                unmap_list(source, page_count, head, count);
            }
        }
    }
}

unsafe fn unmap_list<S: MemorySource>(
    source: &S,
    page_count: usize,
    head: *mut Span,
    count: usize,
) {
    let mut cur = head;
    for _ in 0..count {
        debug_assert!(!cur.is_null());
        let next = (*cur).next();
        source.unmap_spans(cur as *mut u8, page_count);
        cur = next;
    }
}
