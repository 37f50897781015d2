// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread heaps.
//!
//! A heap owns, for every size class, the list of spans with at least one
//! free block (the partial list), and, for every page count, a cache of
//! fully free spans. All small and medium allocations run through the heap
//! of the calling thread, so none of this state needs synchronization; the
//! one concurrent structure is the deferred-deallocation stack, where other
//! threads park blocks they freed on our behalf. The owner drains it at the
//! top of every allocation.
//!
//! Heaps live in pages mapped straight from the OS and are never destroyed;
//! see the `registry` module for their lifecycle. A zero-filled page is a
//! valid empty heap, which is exactly how the registry creates them.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::classes::CLASS_COUNT;
use crate::registry::Registry;
use crate::sources::MemorySource;
use crate::span::{Span, SPAN_PAGE_CLASSES};
use crate::util::likely;

/// Empty spans cached per page count before half are shipped to the global
/// cache.
pub const THREAD_CACHE_LIMIT: u32 = 32;
const RELEASE_BATCH: u32 = 16;

pub struct Heap {
    pub id: u32,
    /// Heads of the per-class partial-span lists, doubly linked through the
    /// span headers.
    partial: [Cell<*mut Span>; CLASS_COUNT],
    /// Heads of the per-page-count free-span lists, singly linked.
    cache: [Cell<*mut Span>; SPAN_PAGE_CLASSES],
    cache_size: [Cell<u32>; SPAN_PAGE_CLASSES],
    /// Intrusive lock-free stack of blocks freed by other threads. The low
    /// word of each block holds the next link.
    deferred: AtomicUsize,
    pub next_in_bucket: AtomicPtr<Heap>,
    pub next_orphan: Cell<*mut Heap>,
    #[cfg(feature = "pending-span")]
    pending: Cell<*mut Span>,
    #[cfg(feature = "pending-span")]
    pending_pages: Cell<u32>,
}

impl Heap {
    /// Serve one block of the class covering `size` bytes.
    pub unsafe fn allocate(&self, registry: &Registry, size: usize) -> *mut u8 {
        if self.deferred.load(Ordering::Relaxed) != 0 {
            self.drain_deferred(registry);
        }
        detail_event!(ALLOCATIONS);
        let (idx, class) = registry.classes().class_for(size);

        let span = self.partial[idx].get();
        if likely(!span.is_null()) {
            let s = &*span;
            let block = match s.pop_block(class) {
                Some(block) => block,
                None => {
                    debug_assert!(false, "partial span with no free block");
                    return ptr::null_mut();
                }
            };
            if s.is_full() {
                // Allocation always works on the list head, so unlinking is
                // a head pop.
                let next = s.next();
                self.partial[idx].set(next);
                if !next.is_null() {
                    (*next).set_prev(ptr::null_mut());
                }
                s.set_next(ptr::null_mut());
            }
            return block;
        }

        let span = match self.acquire_span(registry, class.page_count as usize) {
            Some(span) => span,
            None => return ptr::null_mut(),
        };
        let s = &*span;
        let block = s.init_for_class(idx as u8, class, self.id);
        if class.block_count > 1 {
            self.partial_push(idx, span);
        }
        block
    }

    /// Free a block whose span this heap owns.
    pub unsafe fn deallocate_local(&self, registry: &Registry, span: *mut Span, p: *mut u8) {
        let s = &*span;
        let idx = s.class_idx() as usize;
        let class = registry.classes().get(idx);
        let was_full = s.is_full();
        s.push_block(class, p);
        debug_assert!(s.free_count() <= s.block_count());
        if s.is_free() {
            if !was_full {
                self.partial_unlink(idx, span);
            }
            self.cache_span(registry, span, class.page_count as usize);
        } else if was_full {
            self.partial_push(idx, span);
        }
    }

    /// Park a block freed from a foreign thread; the owner picks it up at
    /// its next allocation.
    pub unsafe fn defer_push(&self, p: *mut u8) {
        detail_event!(REMOTE_FREES);
        let mut cur = self.deferred.load(Ordering::Relaxed);
        loop {
            ptr::write(p as *mut usize, cur);
            match self.deferred.compare_exchange_weak(
                cur,
                p as usize,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Swap the deferred stack empty and free every block on it through the
    /// local path.
    pub unsafe fn drain_deferred(&self, registry: &Registry) {
        let mut cur = self.deferred.swap(0, Ordering::Acquire) as *mut u8;
        while !cur.is_null() {
            // Read the link before the local free tramples it.
            let next = ptr::read(cur as *const usize) as *mut u8;
            self.deallocate_local(registry, Span::of(cur), cur);
            cur = next;
        }
    }

    fn partial_push(&self, idx: usize, span: *mut Span) {
        unsafe {
            let old = self.partial[idx].get();
            (*span).set_prev(ptr::null_mut());
            (*span).set_next(old);
            if !old.is_null() {
                (*old).set_prev(span);
            }
            self.partial[idx].set(span);
        }
    }

    unsafe fn partial_unlink(&self, idx: usize, span: *mut Span) {
        let s = &*span;
        let prev = s.prev();
        let next = s.next();
        if prev.is_null() {
            debug_assert_eq!(self.partial[idx].get(), span);
            self.partial[idx].set(next);
        } else {
            (*prev).set_next(next);
        }
        if !next.is_null() {
            (*next).set_prev(prev);
        }
        s.set_next(ptr::null_mut());
        s.set_prev(ptr::null_mut());
    }

    /// Get a fully free span of `page_count` pages: the heap cache first,
    /// then a batch from the global cache, then fresh pages from the OS.
    unsafe fn acquire_span(&self, registry: &Registry, page_count: usize) -> Option<*mut Span> {
        #[cfg(feature = "pending-span")]
        {
            if self.pending_pages.get() as usize == page_count {
                let span = self.pending.replace(ptr::null_mut());
                if !span.is_null() {
                    self.pending_pages.set(0);
                    return Some(span);
                }
            }
        }
        let pc = page_count - 1;
        let head = self.cache[pc].get();
        if !head.is_null() {
            self.cache[pc].set((*head).next());
            self.cache_size[pc].set(self.cache_size[pc].get() - 1);
            return Some(head);
        }
        let (batch, count) = registry.global_cache().extract(page_count);
        if !batch.is_null() {
            // Keep the head for ourselves and thread the rest into the
            // local cache. The last link of the batch points back into the
            // global cache, so the walk is strictly count-bounded.
            let mut cur = (*batch).next();
            for _ in 1..count {
                let next = (*cur).next();
                (*cur).set_next(self.cache[pc].get());
                self.cache[pc].set(cur);
                self.cache_size[pc].set(self.cache_size[pc].get() + 1);
                cur = next;
            }
            return Some(batch);
        }
        registry.source().map_spans(page_count).map(|p| p as *mut Span)
    }

    /// Put a fully free span into the heap cache, spilling half the cache
    /// to the global one past the high-water mark.
    unsafe fn cache_span(&self, registry: &Registry, span: *mut Span, page_count: usize) {
        #[cfg(feature = "pending-span")]
        {
            if self.pending.get().is_null() {
                self.pending.set(span);
                self.pending_pages.set(page_count as u32);
                return;
            }
        }
        let pc = page_count - 1;
        (*span).set_next(self.cache[pc].get());
        self.cache[pc].set(span);
        let size = self.cache_size[pc].get() + 1;
        self.cache_size[pc].set(size);
        if size > THREAD_CACHE_LIMIT {
            self.spill_cache(registry, pc, page_count);
        }
    }

    unsafe fn spill_cache(&self, registry: &Registry, pc: usize, page_count: usize) {
        let head = self.cache[pc].get();
        let mut tail = head;
        for _ in 1..RELEASE_BATCH {
            tail = (*tail).next();
        }
        self.cache[pc].set((*tail).next());
        self.cache_size[pc]
            .set(self.cache_size[pc].get() - RELEASE_BATCH);
        debug!(
            "heap {} spilling {} spans of {} pages to the global cache",
            self.id, RELEASE_BATCH, page_count
        );
        registry
            .global_cache()
            .insert(registry.source(), page_count, head, tail, RELEASE_BATCH as usize);
    }

    /// Thread-exit flush: drain the deferred stack and donate every cached
    /// span to the global cache. Partial spans stay behind; their blocks
    /// are still live and will keep routing frees to this heap.
    pub unsafe fn flush(&self, registry: &Registry) {
        self.drain_deferred(registry);
        #[cfg(feature = "pending-span")]
        {
            let span = self.pending.replace(ptr::null_mut());
            if !span.is_null() {
                let pages = self.pending_pages.replace(0) as usize;
                let pc = pages - 1;
                (*span).set_next(self.cache[pc].get());
                self.cache[pc].set(span);
                self.cache_size[pc].set(self.cache_size[pc].get() + 1);
            }
        }
        for pc in 0..SPAN_PAGE_CLASSES {
            let head = self.cache[pc].replace(ptr::null_mut());
            if head.is_null() {
                continue;
            }
            let count = self.cache_size[pc].replace(0);
            let mut tail = head;
            for _ in 1..count {
                tail = (*tail).next();
            }
            registry
                .global_cache()
                .insert(registry.source(), pc + 1, head, tail, count as usize);
        }
    }

    /// Finalize-time teardown: unmap every span this heap still references.
    /// Blocks that are still live are gone after this; the caller guarantees
    /// quiescence.
    pub unsafe fn release_all(&self, registry: &Registry) {
        for idx in 0..CLASS_COUNT {
            let mut span = self.partial[idx].replace(ptr::null_mut());
            while !span.is_null() {
                let next = (*span).next();
                let pages = registry.classes().get((*span).class_idx() as usize).page_count;
                registry.source().unmap_spans(span as *mut u8, pages as usize);
                span = next;
            }
        }
        #[cfg(feature = "pending-span")]
        {
            let span = self.pending.replace(ptr::null_mut());
            if !span.is_null() {
                let pages = self.pending_pages.replace(0) as usize;
                registry.source().unmap_spans(span as *mut u8, pages);
            }
        }
        for pc in 0..SPAN_PAGE_CLASSES {
            let mut span = self.cache[pc].replace(ptr::null_mut());
            self.cache_size[pc].set(0);
            while !span.is_null() {
                let next = (*span).next();
                registry.source().unmap_spans(span as *mut u8, pc + 1);
                span = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SPAN_GRANULARITY;

    fn registry() -> &'static Registry {
        &crate::registry::REGISTRY
    }

    unsafe fn fresh_heap() -> *mut Heap {
        let heap = registry().create_heap();
        assert!(!heap.is_null());
        heap
    }

    #[test]
    fn allocates_distinct_blocks() {
        unsafe {
            let heap = &*fresh_heap();
            let mut blocks = Vec::new();
            for _ in 0..100 {
                let p = heap.allocate(registry(), 48);
                assert!(!p.is_null());
                assert_eq!(p as usize % 16, 0);
                blocks.push(p as usize);
            }
            blocks.sort();
            blocks.dedup();
            assert_eq!(blocks.len(), 100);
            for p in blocks {
                heap.deallocate_local(registry(), Span::of(p as *mut u8), p as *mut u8);
            }
        }
    }

    #[test]
    fn span_recycles_through_cache() {
        unsafe {
            let heap = &*fresh_heap();
            // A medium class with a low block count cycles spans quickly.
            let p = heap.allocate(registry(), 30000);
            assert!(!p.is_null());
            let span = Span::of(p);
            heap.deallocate_local(registry(), span, p);
            // The span is fully free again; the next allocation of the same
            // class reuses it rather than mapping.
            let q = heap.allocate(registry(), 30000);
            assert_eq!(Span::of(q), span);
            heap.deallocate_local(registry(), Span::of(q), q);
        }
    }

    #[test]
    fn deferred_blocks_are_drained() {
        use std::thread;

        unsafe {
            let heap = &*fresh_heap();
            let mut ptrs = Vec::new();
            for _ in 0..64 {
                let p = heap.allocate(registry(), 128);
                assert!(!p.is_null());
                ptrs.push(p as usize);
            }
            let heap_addr = heap as *const Heap as usize;
            let handles: Vec<_> = ptrs
                .chunks(16)
                .map(|chunk| {
                    let chunk = chunk.to_vec();
                    thread::spawn(move || unsafe {
                        let heap = &*(heap_addr as *const Heap);
                        for p in chunk {
                            heap.defer_push(p as *mut u8);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().expect("threads should exit successfully");
            }
            assert_ne!(heap.deferred.load(Ordering::Relaxed), 0);
            // The next allocation drains all 64 blocks back into spans.
            let p = heap.allocate(registry(), 128);
            assert!(!p.is_null());
            assert_eq!(heap.deferred.load(Ordering::Relaxed), 0);
            heap.deallocate_local(registry(), Span::of(p), p);
        }
    }

    #[test]
    fn partial_list_survives_interleaved_frees() {
        unsafe {
            let heap = &*fresh_heap();
            let (_, class) = registry().classes().class_for(256);
            let per_span = class.block_count as usize;
            // Fill two spans' worth, then free in a stride pattern so both
            // spans sit on the partial list with holes.
            let mut blocks = Vec::new();
            for _ in 0..per_span * 2 {
                blocks.push(heap.allocate(registry(), 256));
            }
            for chunk in blocks.chunks(3) {
                heap.deallocate_local(registry(), Span::of(chunk[0]), chunk[0]);
            }
            // Everything still allocates fine.
            let p = heap.allocate(registry(), 256);
            assert!(!p.is_null());
            heap.deallocate_local(registry(), Span::of(p), p);
            for chunk in blocks.chunks(3) {
                for &b in &chunk[1..] {
                    heap.deallocate_local(registry(), Span::of(b), b);
                }
            }
        }
    }

    #[test]
    fn spans_stay_within_granularity() {
        unsafe {
            let heap = &*fresh_heap();
            for size in &[16usize, 500, 2048, 10000, 60000] {
                let p = heap.allocate(registry(), *size);
                assert!(!p.is_null());
                let span = Span::of(p) as usize;
                assert!(p as usize - span < SPAN_GRANULARITY);
                heap.deallocate_local(registry(), Span::of(p), p);
            }
        }
    }
}
