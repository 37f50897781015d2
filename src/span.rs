// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spans: aligned page runs carved into equal-sized blocks.
//!
//! A span is a contiguous run of OS pages whose base address is aligned to
//! `SPAN_GRANULARITY`. The header lives at byte 0, so any pointer into the
//! span recovers it with `Span::of`. All blocks in a span belong to one size
//! class; free blocks form an intrusive singly-linked list whose link lives
//! in the first two bytes of each block.
//!
//! Only the `owner` word is shared between threads: a heap publishes a
//! freshly initialized span by storing its id with release ordering, and
//! deallocating threads load it with acquire ordering before touching the
//! rest of the header. Every other field is confined to the owning thread.
//!
//! Neighbour links are stored as signed offsets in units of the span
//! granularity rather than raw pointers. A 32-bit offset reaches
//! ±2^31 spans, i.e. ±128 TiB, which covers the canonical 48-bit address
//! space; the `full-address-range` feature widens the offsets to 64 bits
//! for five-level paging.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::classes::SizeClass;

pub const SPAN_SHIFT: usize = 16;
/// Span alignment: the mask-recovery granularity G.
pub const SPAN_GRANULARITY: usize = 1 << SPAN_SHIFT;
pub const SPAN_MASK: usize = !(SPAN_GRANULARITY - 1);
/// Reserved bytes at the start of every span.
pub const SPAN_HEADER_SIZE: usize = 64;
/// Page-count classes a heap or the global cache can hold: spans are 1 to
/// `SPAN_PAGE_CLASSES` pages (fewer on systems with pages larger than
/// 4 KiB).
pub const SPAN_PAGE_CLASSES: usize = 16;

/// Size-class byte marking a span that is a single oversize allocation.
pub const CLASS_HUGE: u8 = 0xff;

/// Freelist head value meaning "no free block".
pub const BLOCK_NONE: u8 = 0xff;
/// Link marker meaning "my successor is the next block by index, and it is
/// a terminator like me". Writing it into the first freed-to block of a
/// span defers threading the rest of the freelist until blocks are actually
/// handed out.
const BLOCK_AUTO_LINK: u16 = 0xffff;
/// Block indices must fit the one-byte freelist head with `BLOCK_NONE`
/// reserved.
pub const BLOCK_LIMIT: usize = 254;

#[cfg(feature = "full-address-range")]
pub type SpanOffset = i64;
#[cfg(not(feature = "full-address-range"))]
pub type SpanOffset = i32;

/// The span header.
///
/// Confinement rules: `owner` is written by the initializing heap and read
/// by anyone; `class_idx` is written before the owner is published; the
/// rest belongs to whichever thread currently owns the span (the heap named
/// by `owner`, or the cache holding it).
#[repr(C)]
pub struct Span {
    owner: AtomicU32,
    class_idx: Cell<u8>,
    free_list: Cell<u8>,
    block_count: Cell<u16>,
    free_count: Cell<u16>,
    /// Next neighbour, in granularity units relative to this span. Zero is
    /// "none". For oversize spans this field is repurposed to hold the
    /// mapped page count.
    next: Cell<SpanOffset>,
    prev: Cell<SpanOffset>,
    /// Length of the list hanging off this span; meaningful only while the
    /// span heads a batch in a cache.
    list_size: Cell<u32>,
}

const _: () = assert!(::std::mem::size_of::<Span>() <= SPAN_HEADER_SIZE);

impl Span {
    /// Recover the span containing `p`.
    #[inline]
    pub fn of(p: *mut u8) -> *mut Span {
        (p as usize & SPAN_MASK) as *mut Span
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self as *const Span as *mut u8
    }

    #[inline]
    pub fn owner(&self, order: Ordering) -> u32 {
        self.owner.load(order)
    }

    #[inline]
    pub fn class_idx(&self) -> u8 {
        self.class_idx.get()
    }

    #[inline]
    pub fn block_count(&self) -> u16 {
        self.block_count.get()
    }

    #[inline]
    pub fn free_count(&self) -> u16 {
        self.free_count.get()
    }

    /// No block is free: every block is either live or in transit through a
    /// deferred-deallocation queue.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_count.get() == 0
    }

    /// Every block is free; the span can move to a cache or be rebuilt for
    /// another class.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.free_count.get() == self.block_count.get()
    }

    #[inline]
    pub fn list_size(&self) -> u32 {
        self.list_size.get()
    }

    #[inline]
    pub fn set_list_size(&self, n: u32) {
        self.list_size.set(n);
    }

    #[inline]
    unsafe fn block_at(&self, class: SizeClass, idx: usize) -> *mut u8 {
        debug_assert!(idx < class.block_count as usize);
        self.base()
            .add(class.block_offset as usize + idx * class.block_size as usize)
    }

    /// Rebuild this span for `class`, publish it as owned by `heap_id`, and
    /// hand back block 0. Block 1 becomes the freelist head, marked as an
    /// auto-link terminator so the remaining blocks need no threading up
    /// front.
    pub unsafe fn init_for_class(&self, idx: u8, class: SizeClass, heap_id: u32) -> *mut u8 {
        debug_assert!(class.block_count >= 1);
        debug_assert!(class.block_count as usize <= BLOCK_LIMIT);
        self.class_idx.set(idx);
        self.block_count.set(class.block_count as u16);
        self.next.set(0);
        self.prev.set(0);
        self.list_size.set(0);
        if class.block_count > 1 {
            ptr::write(self.block_at(class, 1) as *mut u16, BLOCK_AUTO_LINK);
            self.free_list.set(1);
            self.free_count.set(class.block_count as u16 - 1);
        } else {
            self.free_list.set(BLOCK_NONE);
            self.free_count.set(0);
        }
        self.owner.store(heap_id, Ordering::Release);
        self.block_at(class, 0)
    }

    /// Mark this span as one oversize allocation of `page_count` mapped
    /// pages. Oversize spans belong to no heap.
    pub unsafe fn init_oversize(&self, page_count: u32) {
        self.class_idx.set(CLASS_HUGE);
        self.free_list.set(BLOCK_NONE);
        self.block_count.set(0);
        self.free_count.set(0);
        self.next.set(page_count as SpanOffset);
        self.prev.set(0);
        self.list_size.set(0);
        self.owner.store(0, Ordering::Release);
    }

    /// The mapped page count of an oversize span.
    #[inline]
    pub fn oversize_pages(&self) -> u32 {
        debug_assert_eq!(self.class_idx.get(), CLASS_HUGE);
        self.next.get() as u32
    }

    /// Pop the head block of the freelist.
    pub unsafe fn pop_block(&self, class: SizeClass) -> Option<*mut u8> {
        let head = self.free_list.get();
        if head == BLOCK_NONE {
            return None;
        }
        let block = self.block_at(class, head as usize);
        let marker = ptr::read(block as *const u16);
        let next = if marker == BLOCK_AUTO_LINK {
            let n = head + 1;
            if (n as u16) < self.block_count.get() {
                ptr::write(self.block_at(class, n as usize) as *mut u16, BLOCK_AUTO_LINK);
                n
            } else {
                BLOCK_NONE
            }
        } else {
            debug_assert!(marker == BLOCK_NONE as u16 || marker < self.block_count.get());
            marker as u8
        };
        self.free_list.set(next);
        self.free_count.set(self.free_count.get() - 1);
        Some(block)
    }

    /// Push a block back onto the freelist.
    pub unsafe fn push_block(&self, class: SizeClass, p: *mut u8) {
        let off = p as usize - self.base() as usize - class.block_offset as usize;
        debug_assert_eq!(off % class.block_size as usize, 0);
        let idx = (off / class.block_size as usize) as u8;
        ptr::write(p as *mut u16, self.free_list.get() as u16);
        self.free_list.set(idx);
        self.free_count.set(self.free_count.get() + 1);
        debug_assert!(self.free_count.get() <= self.block_count.get());
    }

    #[inline]
    fn encode_link(&self, target: *mut Span) -> SpanOffset {
        if target.is_null() {
            0
        } else {
            let delta = ((target as isize) - (self as *const Span as isize)) >> SPAN_SHIFT;
            debug_assert_eq!(delta as SpanOffset as isize, delta);
            delta as SpanOffset
        }
    }

    #[inline]
    fn decode_link(&self, off: SpanOffset) -> *mut Span {
        if off == 0 {
            ptr::null_mut()
        } else {
            ((self as *const Span as isize) + ((off as isize) << SPAN_SHIFT)) as *mut Span
        }
    }

    #[inline]
    pub fn next(&self) -> *mut Span {
        self.decode_link(self.next.get())
    }

    #[inline]
    pub fn set_next(&self, target: *mut Span) {
        self.next.set(self.encode_link(target));
    }

    #[inline]
    pub fn prev(&self) -> *mut Span {
        self.decode_link(self.prev.get())
    }

    #[inline]
    pub fn set_prev(&self, target: *mut Span) {
        self.prev.set(self.encode_link(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{MemorySource, MmapSource};
    use std::ptr;

    fn test_class() -> SizeClass {
        SizeClass {
            block_size: 64,
            block_offset: 64,
            page_count: 1,
            block_count: 62,
        }
    }

    #[test]
    fn recovery_by_mask() {
        let source = MmapSource::new();
        let base = source.map_spans(1).expect("map failed");
        let span = Span::of(base);
        assert_eq!(span as usize, base as usize);
        unsafe {
            // Every interior pointer maps back to the base.
            assert_eq!(Span::of(base.add(1)), span);
            assert_eq!(Span::of(base.add(source.page_size() - 1)), span);
            source.unmap_spans(base, 1);
        }
    }

    #[test]
    fn freelist_pop_all_disjoint() {
        let source = MmapSource::new();
        let class = test_class();
        let base = source.map_spans(class.page_count as usize).expect("map failed");
        unsafe {
            let span = &*Span::of(base);
            let first = span.init_for_class(3, class, 7);
            assert_eq!(span.owner(Ordering::Acquire), 7);
            assert_eq!(span.class_idx(), 3);
            assert_eq!(first as usize, base as usize + 64);

            let mut blocks = vec![first];
            while let Some(b) = span.pop_block(class) {
                blocks.push(b);
            }
            assert_eq!(blocks.len(), class.block_count as usize);
            assert!(span.is_full());
            for (i, b) in blocks.iter().enumerate() {
                assert_eq!(
                    *b as usize,
                    base as usize + 64 + i * class.block_size as usize
                );
            }

            for b in blocks {
                span.push_block(class, b);
            }
            assert!(span.is_free());
            source.unmap_spans(base, class.page_count as usize);
        }
    }

    #[test]
    fn freelist_is_lifo_after_free() {
        let source = MmapSource::new();
        let class = test_class();
        let base = source.map_spans(class.page_count as usize).expect("map failed");
        unsafe {
            let span = &*Span::of(base);
            let b0 = span.init_for_class(0, class, 1);
            let b1 = span.pop_block(class).unwrap();
            let b2 = span.pop_block(class).unwrap();
            span.push_block(class, b1);
            // The most recently freed block comes back first.
            assert_eq!(span.pop_block(class).unwrap(), b1);
            span.push_block(class, b0);
            span.push_block(class, b2);
            assert_eq!(span.pop_block(class).unwrap(), b2);
            assert_eq!(span.pop_block(class).unwrap(), b0);
            source.unmap_spans(base, class.page_count as usize);
        }
    }

    #[test]
    fn single_block_span_starts_full() {
        let source = MmapSource::new();
        let class = SizeClass {
            block_size: 4000,
            block_offset: 64,
            page_count: 1,
            block_count: 1,
        };
        let base = source.map_spans(1).expect("map failed");
        unsafe {
            let span = &*Span::of(base);
            let b = span.init_for_class(9, class, 2);
            assert!(!b.is_null());
            assert!(span.is_full());
            assert_eq!(span.pop_block(class), None);
            span.push_block(class, b);
            assert!(span.is_free());
            source.unmap_spans(base, 1);
        }
    }

    #[test]
    fn neighbour_links_round_trip() {
        let source = MmapSource::new();
        let a = source.map_spans(1).expect("map failed");
        let b = source.map_spans(1).expect("map failed");
        unsafe {
            let sa = &*Span::of(a);
            sa.set_next(Span::of(b));
            sa.set_prev(ptr::null_mut());
            assert_eq!(sa.next(), Span::of(b));
            assert!(sa.prev().is_null());
            sa.set_next(ptr::null_mut());
            assert!(sa.next().is_null());
            source.unmap_spans(a, 1);
            source.unmap_spans(b, 1);
        }
    }

    #[test]
    fn oversize_page_count_round_trips() {
        let source = MmapSource::new();
        let base = source.map_spans(1).expect("map failed");
        unsafe {
            let span = &*Span::of(base);
            span.init_oversize(4097);
            assert_eq!(span.class_idx(), CLASS_HUGE);
            assert_eq!(span.oversize_pages(), 4097);
            source.unmap_spans(base, 1);
        }
    }
}
