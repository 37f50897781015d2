// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lightweight counters tracing allocator activity.
//!
//! Mapped-byte accounting is always maintained: it is how callers observe
//! that balanced workloads return memory to the operating system. The
//! per-event counters are only inflated when the `detailed-stats` feature is
//! enabled, keeping the extra atomic traffic off the hot path by default.

use std::sync::atomic::{AtomicUsize, Ordering};

static MAPPED_BYTES: AtomicUsize = AtomicUsize::new(0);
static HEAPS_CREATED: AtomicUsize = AtomicUsize::new(0);

/// Record `bytes` freshly mapped from the OS.
#[inline]
pub fn note_map(bytes: usize) {
    MAPPED_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

/// Record `bytes` returned to the OS.
#[inline]
pub fn note_unmap(bytes: usize) {
    MAPPED_BYTES.fetch_sub(bytes, Ordering::Relaxed);
}

#[inline]
pub fn note_heap_created() {
    HEAPS_CREATED.fetch_add(1, Ordering::Relaxed);
}

/// Bytes currently mapped from the OS on behalf of the allocator.
pub fn mapped_bytes() -> usize {
    MAPPED_BYTES.load(Ordering::Relaxed)
}

/// Number of heaps ever created. Heaps are never destroyed, so a workload
/// that recycles threads should see this stop growing once the orphan list
/// warms up.
pub fn heaps_created() -> usize {
    HEAPS_CREATED.load(Ordering::Relaxed)
}

macro_rules! detail_event {
    ($fld:ident) => {
        #[cfg(feature = "detailed-stats")]
        {
            $crate::stats::detail::$fld.fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
        }
    };
}

#[cfg(feature = "detailed-stats")]
pub mod detail {
    use std::sync::atomic::AtomicUsize;

    pub static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
    pub static DEALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
    pub static REMOTE_FREES: AtomicUsize = AtomicUsize::new(0);
    pub static OVERSIZE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
    pub static SPANS_MAPPED: AtomicUsize = AtomicUsize::new(0);
    pub static SPANS_UNMAPPED: AtomicUsize = AtomicUsize::new(0);
    pub static GLOBAL_CACHE_INSERTS: AtomicUsize = AtomicUsize::new(0);
    pub static GLOBAL_CACHE_EXTRACTS: AtomicUsize = AtomicUsize::new(0);
    pub static HEAP_ADOPTIONS: AtomicUsize = AtomicUsize::new(0);
}

/// A copyable snapshot of every counter. Detailed fields read zero unless
/// the `detailed-stats` feature is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Snapshot {
    pub mapped_bytes: usize,
    pub heaps_created: usize,
    pub allocations: usize,
    pub deallocations: usize,
    pub remote_frees: usize,
    pub oversize_allocations: usize,
    pub spans_mapped: usize,
    pub spans_unmapped: usize,
    pub global_cache_inserts: usize,
    pub global_cache_extracts: usize,
    pub heap_adoptions: usize,
}

pub fn snapshot() -> Snapshot {
    #[allow(unused_mut)]
    let mut snap = Snapshot {
        mapped_bytes: mapped_bytes(),
        heaps_created: heaps_created(),
        ..Snapshot::default()
    };
    #[cfg(feature = "detailed-stats")]
    {
        use std::sync::atomic::Ordering::Relaxed;
        snap.allocations = detail::ALLOCATIONS.load(Relaxed);
        snap.deallocations = detail::DEALLOCATIONS.load(Relaxed);
        snap.remote_frees = detail::REMOTE_FREES.load(Relaxed);
        snap.oversize_allocations = detail::OVERSIZE_ALLOCATIONS.load(Relaxed);
        snap.spans_mapped = detail::SPANS_MAPPED.load(Relaxed);
        snap.spans_unmapped = detail::SPANS_UNMAPPED.load(Relaxed);
        snap.global_cache_inserts = detail::GLOBAL_CACHE_INSERTS.load(Relaxed);
        snap.global_cache_extracts = detail::GLOBAL_CACHE_EXTRACTS.load(Relaxed);
        snap.heap_adoptions = detail::HEAP_ADOPTIONS.load(Relaxed);
    }
    snap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        // Counters are shared with concurrently running tests, so only
        // check internal consistency, not absolute values.
        note_map(1 << 20);
        note_unmap(1 << 20);
        let snap = snapshot();
        assert!(snap.heaps_created <= heaps_created());
        assert!(snap.mapped_bytes < usize::MAX / 2, "accounting underflowed");
    }
}
