// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The public allocation interface.
//!
//! Four operations (`allocate`, `reallocate`, `deallocate`, `usable_size`)
//! plus process- and thread-lifecycle hooks. Allocation routes through the
//! calling thread's heap, lazily acquired on first use; deallocation routes
//! by the span header recovered from the pointer, deferring to the owning
//! heap's lock-free stack when the span belongs to another thread.
//!
//! Allocation failure surfaces as a null pointer and nothing else; the one
//! condition treated as fatal is the OS refusing to take mapped pages back.
//! Passing a pointer that did not come from `allocate`/`reallocate`, or
//! freeing one twice, is undefined behaviour by contract and is not
//! detected.

use std::cell::Cell;
use std::cmp;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::classes::{MEDIUM_SIZE_LIMIT, SMALL_SIZE_LIMIT};
use crate::heap::Heap;
use crate::large;
use crate::registry::REGISTRY;
use crate::sources::MapFailure;
use crate::span::{Span, CLASS_HUGE, SPAN_GRANULARITY, SPAN_HEADER_SIZE};
use crate::util::{likely, unlikely};

/// Alignment every allocation satisfies; smaller hints take the natural
/// path.
pub const MIN_ALIGN: usize = 16;

/// Flag: return zero-filled memory. On `reallocate`, also zero the grown
/// tail beyond `old_size`.
pub const ZERO_INITIALIZED: u32 = 1 << 0;
/// Flag: `reallocate` may discard the old contents.
pub const NO_PRESERVE: u32 = 1 << 1;

thread_local! {
    static THREAD_HEAP: Cell<*mut Heap> = Cell::new(ptr::null_mut());
}

/// Bring up the process-wide allocator state. Idempotent; must be balanced
/// by `finalize`.
pub fn initialize() -> Result<(), MapFailure> {
    REGISTRY.mark_initialized()
}

/// Tear down all process-wide state and return every mapped region to the
/// OS. No allocator operation may be in flight, and pointers from before
/// `finalize` are dead afterwards.
pub fn finalize() {
    let _ = THREAD_HEAP.try_with(|slot| slot.set(ptr::null_mut()));
    unsafe {
        REGISTRY.finalize();
    }
}

/// Bind a heap to the calling thread, adopting an orphaned one when
/// available. Optional: the first allocation does the same thing.
pub fn thread_initialize() {
    unsafe {
        let _ = current_heap();
    }
}

/// Release the calling thread's heap: flush its caches to the global span
/// cache and donate it to the orphan list. Pointers into its spans stay
/// valid and may still be freed from any thread.
pub fn thread_finalize() {
    let heap = THREAD_HEAP
        .try_with(|slot| slot.replace(ptr::null_mut()))
        .unwrap_or(ptr::null_mut());
    if !heap.is_null() {
        unsafe {
            (*heap).flush(&REGISTRY);
            REGISTRY.push_orphan(heap);
        }
    }
}

#[inline]
unsafe fn current_heap() -> *mut Heap {
    THREAD_HEAP
        .try_with(|slot| {
            let heap = slot.get();
            if likely(!heap.is_null()) {
                return heap;
            }
            let heap = REGISTRY.adopt_or_create();
            slot.set(heap);
            heap
        })
        .unwrap_or(ptr::null_mut())
}

/// Allocate `size` bytes aligned to at least `align`. Returns null on OS
/// map failure, for non-power-of-two alignments, and for alignments at or
/// above the span granularity (64 KiB).
pub unsafe fn allocate(size: usize, align: usize, flags: u32) -> *mut u8 {
    let p = if unlikely(align > MIN_ALIGN) {
        allocate_aligned(size, align)
    } else {
        natural_allocate(size)
    };
    if !p.is_null() && flags & ZERO_INITIALIZED != 0 {
        ptr::write_bytes(p, 0, size);
    }
    p
}

unsafe fn natural_allocate(size: usize) -> *mut u8 {
    if likely(size <= MEDIUM_SIZE_LIMIT) {
        let heap = current_heap();
        if unlikely(heap.is_null()) {
            // Heap acquisition failed, or thread-local storage is mid
            // teardown. The oversize path needs neither.
            return large::allocate(&REGISTRY, size, MIN_ALIGN);
        }
        (*heap).allocate(&REGISTRY, size)
    } else {
        large::allocate(&REGISTRY, size, MIN_ALIGN)
    }
}

unsafe fn allocate_aligned(size: usize, align: usize) -> *mut u8 {
    if !align.is_power_of_two() || align >= SPAN_GRANULARITY {
        return ptr::null_mut();
    }
    // Power-of-two classes are naturally aligned to their size: small ones
    // through their padded block offset, medium ones to the header size.
    // Round the request into one of them when possible; otherwise fall
    // through to an aligned oversize mapping.
    let limit = if align <= SPAN_HEADER_SIZE {
        MEDIUM_SIZE_LIMIT
    } else {
        SMALL_SIZE_LIMIT
    };
    let rounded = cmp::max(cmp::max(size, align), 1).checked_next_power_of_two();
    let p = match rounded {
        Some(rounded) if rounded <= limit => {
            let heap = current_heap();
            if unlikely(heap.is_null()) {
                large::allocate(&REGISTRY, size, align)
            } else {
                (*heap).allocate(&REGISTRY, rounded)
            }
        }
        _ => large::allocate(&REGISTRY, size, align),
    };
    debug_assert_eq!(p as usize % align, 0);
    p
}

/// Free a block returned by `allocate` or `reallocate`. Null is a no-op.
pub unsafe fn deallocate(p: *mut u8) {
    if p.is_null() {
        return;
    }
    detail_event!(DEALLOCATIONS);
    let span = Span::of(p);
    // The acquire load pairs with the release store that published the
    // span, making the rest of the header safe to read.
    let owner = (*span).owner(Ordering::Acquire);
    if unlikely((*span).class_idx() == CLASS_HUGE) {
        large::deallocate(&REGISTRY, span);
        return;
    }
    let local = THREAD_HEAP
        .try_with(|slot| slot.get())
        .unwrap_or(ptr::null_mut());
    if likely(!local.is_null() && (*local).id == owner) {
        (*local).deallocate_local(&REGISTRY, span, p);
    } else {
        let target = REGISTRY.lookup_heap(owner);
        if unlikely(target.is_null()) {
            warn!("deallocate({:p}): unknown owning heap {}", p, owner);
            return;
        }
        (*target).defer_push(p);
    }
}

/// The real capacity of the block at `p`: its size class, or the mapped
/// extent for oversize blocks. At least as large as the size requested.
pub unsafe fn usable_size(p: *const u8) -> usize {
    if p.is_null() {
        return 0;
    }
    let span = Span::of(p as *mut u8);
    let _ = (*span).owner(Ordering::Acquire);
    if unlikely((*span).class_idx() == CLASS_HUGE) {
        large::usable_size(&REGISTRY, span, p)
    } else {
        REGISTRY
            .classes()
            .get((*span).class_idx() as usize)
            .block_size as usize
    }
}

/// Resize the block at `p` to `new_size` bytes.
///
/// Stays in place when the current block already fits; otherwise allocates,
/// copies `min(new_size, usable_size(p))` bytes (unless `NO_PRESERVE` is
/// set) and frees the old block through the public path, regardless of
/// which heap owns it. A null `p` allocates; a zero `new_size` frees and
/// returns null. On failure the old block is untouched and null is
/// returned.
pub unsafe fn reallocate(
    p: *mut u8,
    new_size: usize,
    align: usize,
    old_size: usize,
    flags: u32,
) -> *mut u8 {
    if p.is_null() {
        return allocate(new_size, align, flags);
    }
    if new_size == 0 {
        deallocate(p);
        return ptr::null_mut();
    }
    let usable = usable_size(p);
    let aligned = align <= MIN_ALIGN || p as usize & (align - 1) == 0;
    if aligned && new_size <= usable && new_size >= usable / 2 {
        if flags & ZERO_INITIALIZED != 0 && old_size > 0 && new_size > old_size {
            ptr::write_bytes(p.add(old_size), 0, new_size - old_size);
        }
        return p;
    }
    let q = allocate(new_size, align, 0);
    if q.is_null() {
        return ptr::null_mut();
    }
    if flags & NO_PRESERVE == 0 {
        ptr::copy_nonoverlapping(p, q, cmp::min(new_size, usable));
    }
    if flags & ZERO_INITIALIZED != 0 {
        let tail = if old_size > 0 {
            old_size
        } else {
            cmp::min(new_size, usable)
        };
        if new_size > tail {
            ptr::write_bytes(q.add(tail), 0, new_size - tail);
        }
    }
    deallocate(p);
    q
}

/// The full interface as a table of entry points, for callers that route
/// allocation through indirection.
#[derive(Copy, Clone)]
pub struct MemorySystem {
    pub initialize: fn() -> Result<(), MapFailure>,
    pub finalize: fn(),
    pub thread_initialize: fn(),
    pub thread_finalize: fn(),
    pub allocate: unsafe fn(usize, usize, u32) -> *mut u8,
    pub reallocate: unsafe fn(*mut u8, usize, usize, usize, u32) -> *mut u8,
    pub deallocate: unsafe fn(*mut u8),
    pub usable_size: unsafe fn(*const u8) -> usize,
}

pub fn memory_system() -> MemorySystem {
    MemorySystem {
        initialize,
        finalize,
        thread_initialize,
        thread_finalize,
        allocate,
        reallocate,
        deallocate,
        usable_size,
    }
}
