// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Oversize allocations: requests too large for a span.
//!
//! These bypass the heaps entirely and map pages straight from the source,
//! with the usual span alignment so deallocation routes them by the same
//! mask-and-inspect test as everything else. The span header carries the
//! oversize sentinel and the mapped page count; the block starts right
//! after the header, or at the first aligned offset for aligned requests.

use std::ptr;

use crate::registry::Registry;
use crate::sources::MemorySource;
use crate::span::{Span, SPAN_GRANULARITY, SPAN_HEADER_SIZE};
use crate::util::align_up;

/// Map an oversize block of `size` bytes aligned to `align`. `align` must
/// be a power of two below the span granularity.
pub unsafe fn allocate(registry: &Registry, size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two() && align < SPAN_GRANULARITY);
    let offset = align_up(SPAN_HEADER_SIZE, align);
    let total = match size.checked_add(offset) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    let page_size = registry.source().page_size();
    let page_count = crate::util::pages_for(total, page_size);
    let base = match registry.source().map_spans(page_count) {
        Some(base) => base,
        None => return ptr::null_mut(),
    };
    detail_event!(OVERSIZE_ALLOCATIONS);
    let span = &*Span::of(base);
    span.init_oversize(page_count as u32);
    base.add(offset)
}

pub unsafe fn deallocate(registry: &Registry, span: *mut Span) {
    let page_count = (*span).oversize_pages() as usize;
    registry.source().unmap_spans(span as *mut u8, page_count);
}

/// Bytes usable from `p` to the end of the mapped region.
pub unsafe fn usable_size(registry: &Registry, span: *const Span, p: *const u8) -> usize {
    let page_count = (*span).oversize_pages() as usize;
    page_count * registry.source().page_size() - (p as usize - span as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::REGISTRY;
    use crate::span::CLASS_HUGE;

    #[test]
    fn round_trip_is_usable() {
        unsafe {
            let p = allocate(&REGISTRY, 3 << 20, 16);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            let span = Span::of(p);
            assert_eq!((*span).class_idx(), CLASS_HUGE);
            assert!(usable_size(&REGISTRY, span, p) >= 3 << 20);
            // The whole region is writable.
            p.write_bytes(0x5a, 3 << 20);
            deallocate(&REGISTRY, span);
        }
    }

    #[test]
    fn alignment_is_honored() {
        unsafe {
            for &align in &[4096usize, 16384, 32768] {
                let p = allocate(&REGISTRY, 100_000, align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                let span = Span::of(p);
                // The aligned block still lives inside the first
                // granularity unit, so mask recovery keeps working.
                assert!((p as usize - span as usize) < SPAN_GRANULARITY);
                deallocate(&REGISTRY, span);
            }
        }
    }

    #[test]
    fn tiny_oversize_request_is_fine() {
        // The path also backs allocations made while thread-local state is
        // unavailable, so it must handle small sizes.
        unsafe {
            let p = allocate(&REGISTRY, 16, 16);
            assert!(!p.is_null());
            let span = Span::of(p);
            assert!(usable_size(&REGISTRY, span, p) >= 16);
            deallocate(&REGISTRY, span);
        }
    }
}
