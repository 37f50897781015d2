// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide allocator state: the heap registry and the orphan list.
//!
//! Heaps are looked up by identity: a deallocating thread reads the heap id
//! out of a span header and finds the owning heap through a fixed-size hash
//! table of lock-free bucket chains. Heaps are mapped directly from the OS,
//! registered once, and never destroyed; a heap whose thread has exited
//! waits on the orphan list until another thread adopts it. Both properties
//! together make cross-thread deallocation simple: a heap id read from any
//! span is always valid.
//!
//! The registry itself is a process singleton, created on first use and
//! alive until `finalize` tears it down. `finalize` assumes no allocator
//! operation is in flight.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::cache::GlobalSpanCache;
use crate::classes::ClassTable;
use crate::heap::Heap;
use crate::sources::{MapFailure, MemorySource, MmapSource};
use crate::stats;
use crate::tagged;
use crate::util::align_up;

pub const HEAP_BUCKETS: usize = 64;

pub struct Registry {
    source: MmapSource,
    classes: ClassTable,
    global_cache: GlobalSpanCache,
    buckets: [AtomicPtr<Heap>; HEAP_BUCKETS],
    /// Tagged head of the orphaned-heap stack.
    orphans: AtomicUsize,
    /// Heap ids are never reused, even across finalize/initialize cycles.
    next_heap_id: AtomicU32,
    live: AtomicBool,
}

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
}

impl Registry {
    fn new() -> Registry {
        let source = MmapSource::new();
        let classes = ClassTable::build(source.page_size(), source.max_span_pages());
        info!(
            "allocator bring-up: page size {}, {} pages per span",
            source.page_size(),
            source.max_span_pages()
        );
        Registry {
            source,
            classes,
            global_cache: GlobalSpanCache::new(),
            buckets: ::std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            orphans: AtomicUsize::new(0),
            next_heap_id: AtomicU32::new(1),
            live: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn source(&self) -> &MmapSource {
        &self.source
    }

    #[inline]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    #[inline]
    pub fn global_cache(&self) -> &GlobalSpanCache {
        &self.global_cache
    }

    pub fn mark_initialized(&self) -> Result<(), MapFailure> {
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn heap_footprint(&self) -> usize {
        align_up(mem::size_of::<Heap>(), self.source.page_size())
    }

    /// Map and register a fresh heap. Null on map failure.
    pub unsafe fn create_heap(&self) -> *mut Heap {
        let bytes = self.heap_footprint();
        let mem = match self.source.map_raw(bytes) {
            Some(mem) => mem,
            None => return ptr::null_mut(),
        };
        // Fresh pages are zeroed, which is a valid empty heap; only the id
        // needs writing.
        let heap = mem as *mut Heap;
        let id = self.next_heap_id.fetch_add(1, Ordering::Relaxed);
        (*heap).id = id;
        let bucket = &self.buckets[id as usize & (HEAP_BUCKETS - 1)];
        loop {
            let cur = bucket.load(Ordering::Acquire);
            (*heap).next_in_bucket.store(cur, Ordering::Relaxed);
            if bucket
                .compare_exchange_weak(cur, heap, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        stats::note_heap_created();
        info!("created heap {}", id);
        heap
    }

    /// Find the heap with the given id. The result is always non-null for
    /// ids read out of live span headers.
    pub unsafe fn lookup_heap(&self, id: u32) -> *mut Heap {
        let mut cur = self.buckets[id as usize & (HEAP_BUCKETS - 1)].load(Ordering::Acquire);
        while !cur.is_null() {
            if (*cur).id == id {
                return cur;
            }
            cur = (*cur).next_in_bucket.load(Ordering::Acquire);
        }
        cur
    }

    /// Hand a heap whose thread is exiting to the orphan list.
    pub unsafe fn push_orphan(&self, heap: *mut Heap) {
        loop {
            let cur = self.orphans.load(Ordering::Acquire);
            (*heap).next_orphan.set(tagged::ptr_of(cur));
            let next = tagged::pack(heap, tagged::next_tag(cur));
            if self
                .orphans
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                debug!("heap {} orphaned", (*heap).id);
                return;
            }
        }
    }

    unsafe fn pop_orphan(&self) -> *mut Heap {
        loop {
            let cur = self.orphans.load(Ordering::Acquire);
            let heap: *mut Heap = tagged::ptr_of(cur);
            if heap.is_null() {
                return heap;
            }
            let next = tagged::pack((*heap).next_orphan.get(), tagged::next_tag(cur));
            if self
                .orphans
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                (*heap).next_orphan.set(ptr::null_mut());
                return heap;
            }
        }
    }

    /// Heap acquisition for a thread that has none: adopt an orphan or
    /// create a fresh heap.
    pub unsafe fn adopt_or_create(&self) -> *mut Heap {
        let heap = self.pop_orphan();
        if !heap.is_null() {
            detail_event!(HEAP_ADOPTIONS);
            debug!("adopted heap {}", (*heap).id);
            return heap;
        }
        self.create_heap()
    }

    /// Tear down all process-wide state: every cached span, every heap.
    /// Callers must guarantee no allocator operation is in flight, and that
    /// no thread still holds a reference to a heap.
    pub unsafe fn finalize(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let bytes = self.heap_footprint();
        for bucket in &self.buckets {
            let mut heap = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            while !heap.is_null() {
                let next = (*heap).next_in_bucket.load(Ordering::Acquire);
                (*heap).drain_deferred(self);
                (*heap).release_all(self);
                self.source.unmap_raw(heap as *mut u8, bytes);
                heap = next;
            }
        }
        // Heaps were unmapped through the buckets; the orphan list only
        // holds duplicates of those pointers.
        let cur = self.orphans.load(Ordering::Acquire);
        self.orphans
            .store(tagged::pack(ptr::null_mut::<Heap>(), tagged::next_tag(cur)), Ordering::Release);
        self.global_cache.drain(&self.source);
        info!("allocator finalized; {} bytes still mapped", stats::mapped_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn lookup_finds_created_heaps() {
        // A private registry keeps this test deterministic even while other
        // tests churn the process-wide one.
        let registry = Registry::new();
        registry.mark_initialized().unwrap();
        unsafe {
            let a = registry.create_heap();
            let b = registry.create_heap();
            assert!(!a.is_null() && !b.is_null());
            assert_ne!((*a).id, (*b).id);
            assert_eq!(registry.lookup_heap((*a).id), a);
            assert_eq!(registry.lookup_heap((*b).id), b);
            assert!(registry.lookup_heap(0xdead_beef).is_null());
            registry.finalize();
        }
    }

    #[test]
    fn orphans_are_adopted_lifo() {
        let registry = Registry::new();
        registry.mark_initialized().unwrap();
        unsafe {
            let a = registry.create_heap();
            let b = registry.create_heap();
            registry.push_orphan(a);
            registry.push_orphan(b);
            assert_eq!(registry.pop_orphan(), b);
            assert_eq!(registry.pop_orphan(), a);
            assert!(registry.pop_orphan().is_null());
            // Adoption falls back to creation once the list is dry.
            let c = registry.adopt_or_create();
            assert!(!c.is_null());
            assert_ne!(c, a);
            assert_ne!(c, b);
            registry.finalize();
        }
    }

    #[test]
    fn concurrent_orphan_traffic() {
        let mut threads = Vec::new();
        for _ in 0..4 {
            threads.push(thread::spawn(|| unsafe {
                for _ in 0..100 {
                    let heap = REGISTRY.adopt_or_create();
                    assert!(!heap.is_null());
                    REGISTRY.push_orphan(heap);
                }
            }));
        }
        for t in threads {
            t.join().expect("threads should exit successfully");
        }
        // Adoption keeps the heap population bounded by peak concurrency.
        assert!(stats::heaps_created() >= 1);
    }
}
