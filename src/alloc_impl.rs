// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A `GlobalAlloc` adapter over the allocator.
//!
//! Rust allocators pass size and alignment at the deallocation site, which
//! this allocator does not need: everything it wants is recoverable from
//! the pointer. The adapter therefore ignores the layout on `dealloc` and
//! forwards the rest.
//!
//! Installing this as `#[global_allocator]` works in ordinary programs, but
//! be aware that the allocator keeps per-thread state in `thread_local!`
//! storage. Allocations made while a thread's TLS block is being torn down
//! fall back to an internal path that maps pages directly, so they remain
//! correct but slow; programs that free enormous numbers of objects from
//! TLS destructors will feel it.

use std::alloc::{GlobalAlloc, Layout};

use crate::api;

/// Zero-sized handle implementing `GlobalAlloc` for the process-wide
/// allocator.
pub struct SpanAllocGlobal;

unsafe impl GlobalAlloc for SpanAllocGlobal {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        api::allocate(layout.size(), layout.align(), 0)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        api::allocate(layout.size(), layout.align(), api::ZERO_INITIALIZED)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        api::deallocate(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        api::reallocate(ptr, new_size, layout.align(), layout.size(), 0)
    }
}
