// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level data-structures for getting more memory from the system.
//!
//! Everything above this module deals in *spans*: page runs whose base is
//! aligned to `SPAN_GRANULARITY`. The alignment is what lets a deallocation
//! recover the span header from an interior pointer with a single mask, so
//! it is mandatory here, not best-effort. On Unix we over-map by one
//! granularity unit and trim the misaligned head and tail; on Windows the
//! allocation granularity already matches ours.

use std::fmt;

use crate::span::SPAN_GRANULARITY;
use crate::stats;

/// The operating system refused to map memory.
///
/// This is the only error the allocator ever reports; every other failure
/// mode surfaces as a null pointer from the allocation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFailure;

impl fmt::Display for MapFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "operating system refused to map memory")
    }
}

impl ::std::error::Error for MapFailure {}

/// A source of page-aligned memory from the OS.
///
/// `map_spans`/`unmap_spans` deal in span-aligned regions; `map_raw` hands
/// back plain page-aligned memory for internal bookkeeping structures.
pub trait MemorySource {
    /// The system page size.
    fn page_size(&self) -> usize;

    /// How many pages fit in one span granularity unit.
    fn max_span_pages(&self) -> usize;

    /// Map `page_count` pages whose base is aligned to `SPAN_GRANULARITY`.
    fn map_spans(&self, page_count: usize) -> Option<*mut u8>;

    /// Return a region obtained from `map_spans` to the OS.
    unsafe fn unmap_spans(&self, base: *mut u8, page_count: usize);

    /// Map at least `bytes` of page-aligned memory with no span alignment.
    fn map_raw(&self, bytes: usize) -> Option<*mut u8>;

    /// Return a region obtained from `map_raw` to the OS.
    unsafe fn unmap_raw(&self, base: *mut u8, bytes: usize);
}

/// A `MemorySource` backed directly by the OS virtual-memory interface.
#[derive(Copy, Clone)]
pub struct MmapSource {
    page_size: usize,
}

impl MmapSource {
    pub fn new() -> MmapSource {
        MmapSource {
            page_size: ::sysconf::page::pagesize(),
        }
    }
}

impl Default for MmapSource {
    fn default() -> MmapSource {
        MmapSource::new()
    }
}

impl MemorySource for MmapSource {
    #[inline]
    fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    fn max_span_pages(&self) -> usize {
        SPAN_GRANULARITY / self.page_size
    }

    fn map_spans(&self, page_count: usize) -> Option<*mut u8> {
        let size = page_count * self.page_size;
        let base = os::map_aligned(size, self.page_size)?;
        stats::note_map(size);
        detail_event!(SPANS_MAPPED);
        trace!("mapped {} pages at {:p}", page_count, base);
        Some(base)
    }

    unsafe fn unmap_spans(&self, base: *mut u8, page_count: usize) {
        debug_assert_eq!(base as usize & (SPAN_GRANULARITY - 1), 0);
        let size = page_count * self.page_size;
        os::unmap(base, size);
        stats::note_unmap(size);
        detail_event!(SPANS_UNMAPPED);
        trace!("unmapped {} pages at {:p}", page_count, base);
    }

    fn map_raw(&self, bytes: usize) -> Option<*mut u8> {
        let size = crate::util::align_up(bytes, self.page_size);
        let base = unsafe { os::map(size) }?;
        stats::note_map(size);
        Some(base)
    }

    unsafe fn unmap_raw(&self, base: *mut u8, bytes: usize) {
        let size = crate::util::align_up(bytes, self.page_size);
        os::unmap(base, size);
        stats::note_unmap(size);
    }
}

#[cfg(unix)]
mod os {
    use std::ptr;

    use crate::span::SPAN_GRANULARITY;

    pub unsafe fn map(size: usize) -> Option<*mut u8> {
        let mem = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mem == libc::MAP_FAILED {
            warn!("mmap of {} bytes failed", size);
            None
        } else {
            Some(mem as *mut u8)
        }
    }

    pub unsafe fn unmap(base: *mut u8, size: usize) {
        // A failed unmap leaves pages the allocator believes are gone; crash
        // loudly rather than carry on with corrupt accounting.
        let ret = libc::munmap(base as *mut libc::c_void, size);
        assert_eq!(
            ret,
            0,
            "munmap({:p}, {}) failed: {}",
            base,
            size,
            ::std::io::Error::last_os_error()
        );
    }

    /// Map `size` bytes aligned to the span granularity by over-mapping and
    /// trimming. The trimmed head and tail are whole system pages because
    /// the granularity is a multiple of the page size, so handing them back
    /// piecemeal is legal.
    pub fn map_aligned(size: usize, page_size: usize) -> Option<*mut u8> {
        debug_assert_eq!(SPAN_GRANULARITY % page_size, 0);
        unsafe {
            let mem = map(size + SPAN_GRANULARITY)?;
            let addr = mem as usize;
            let rem = addr & (SPAN_GRANULARITY - 1);
            let front = if rem == 0 { 0 } else { SPAN_GRANULARITY - rem };
            let back = SPAN_GRANULARITY - front;
            debug_assert_eq!(front % page_size, 0);
            let base = mem.add(front);
            if front > 0 {
                unmap(mem, front);
            }
            if back > 0 {
                unmap(base.add(size), back);
            }
            Some(base)
        }
    }
}

#[cfg(windows)]
mod os {
    use std::ptr;

    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    use crate::span::SPAN_GRANULARITY;
    use crate::util::align_up;

    pub unsafe fn map(size: usize) -> Option<*mut u8> {
        let mem = VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        );
        if mem.is_null() {
            warn!("VirtualAlloc of {} bytes failed", size);
            None
        } else {
            Some(mem as *mut u8)
        }
    }

    pub unsafe fn unmap(base: *mut u8, _size: usize) {
        // VirtualFree releases the whole region; the kernel knows the length.
        // A failed release is silent corruption waiting to happen, so it is
        // fatal in every build.
        let ret = VirtualFree(base as *mut _, 0, MEM_RELEASE);
        assert_ne!(
            ret,
            0,
            "VirtualFree({:p}) failed: {}",
            base,
            ::std::io::Error::last_os_error()
        );
    }

    /// The Windows allocation granularity is 64 KiB, matching ours, so a
    /// plain VirtualAlloc is normally aligned already. If it is not, probe
    /// for an aligned slot by reserving an oversized region, releasing it,
    /// and re-reserving at the aligned address inside it.
    pub fn map_aligned(size: usize, _page_size: usize) -> Option<*mut u8> {
        unsafe {
            let mem = map(size)?;
            if mem as usize & (SPAN_GRANULARITY - 1) == 0 {
                return Some(mem);
            }
            unmap(mem, size);
            for _ in 0..16 {
                let probe = VirtualAlloc(
                    ptr::null_mut(),
                    size + SPAN_GRANULARITY,
                    MEM_RESERVE,
                    PAGE_NOACCESS,
                );
                if probe.is_null() {
                    return None;
                }
                let target = align_up(probe as usize, SPAN_GRANULARITY) as *mut u8;
                VirtualFree(probe, 0, MEM_RELEASE);
                let mem = VirtualAlloc(
                    target as *mut _,
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if !mem.is_null() {
                    debug_assert_eq!(mem as usize & (SPAN_GRANULARITY - 1), 0);
                    return Some(mem as *mut u8);
                }
                // Someone raced us into the gap; try again.
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_are_aligned() {
        let source = MmapSource::new();
        for &pages in &[1usize, 2, 3, source.max_span_pages()] {
            let base = source.map_spans(pages).expect("map_spans failed");
            assert_eq!(base as usize & (SPAN_GRANULARITY - 1), 0);
            unsafe {
                // The region must be writable end to end.
                base.write_bytes(0xa5, pages * source.page_size());
                source.unmap_spans(base, pages);
            }
        }
    }

    #[test]
    fn raw_maps_are_page_aligned() {
        let source = MmapSource::new();
        let base = source.map_raw(100).expect("map_raw failed");
        assert_eq!(base as usize % source.page_size(), 0);
        unsafe {
            base.write_bytes(0, 100);
            source.unmap_raw(base, 100);
        }
    }

    #[test]
    fn granularity_is_page_multiple() {
        let source = MmapSource::new();
        assert_eq!(SPAN_GRANULARITY % source.page_size(), 0);
        assert!(source.max_span_pages() >= 1);
    }
}
