// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Whole-process lifecycle checks.
//!
//! These run in their own test binary because `finalize` tears down the
//! process-wide allocator state; sharing a process with the concurrent unit
//! tests would pull the rug out from under them. Keep this file to a single
//! `#[test]` so nothing here races either.

use std::thread;

#[test]
fn lifecycle_and_leak_accounting() {
    let _ = env_logger::builder().is_test(true).try_init();

    // An initialize/finalize pair with nothing in between must be clean.
    spanalloc::initialize().expect("initialize should succeed");
    spanalloc::thread_initialize();
    spanalloc::thread_finalize();
    spanalloc::finalize();
    assert_eq!(
        spanalloc::snapshot().mapped_bytes,
        0,
        "empty lifecycle leaked mappings"
    );

    // Second bring-up after a full teardown.
    spanalloc::initialize().expect("re-initialize should succeed");
    spanalloc::thread_initialize();

    // Oversize allocations map and unmap symmetrically.
    let baseline = spanalloc::snapshot().mapped_bytes;
    unsafe {
        let p = spanalloc::allocate(2 << 20, 16, 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        assert!(spanalloc::usable_size(p) >= 2 << 20);
        assert!(spanalloc::snapshot().mapped_bytes >= baseline + (2 << 20));
        p.write_bytes(0x6b, 2 << 20);
        spanalloc::deallocate(p);
    }
    assert_eq!(
        spanalloc::snapshot().mapped_bytes,
        baseline,
        "oversize round trip leaked mappings"
    );

    // A balanced multi-threaded workout, including cross-thread frees.
    let producer = thread::spawn(|| {
        spanalloc::thread_initialize();
        let mut ptrs = Vec::new();
        unsafe {
            for i in 0..2048usize {
                let p = spanalloc::allocate(64 + (i % 1500), 16, 0);
                assert!(!p.is_null());
                ptrs.push(p as usize);
            }
        }
        spanalloc::thread_finalize();
        ptrs
    });
    let ptrs = producer.join().expect("producer thread failed");
    unsafe {
        for p in ptrs {
            spanalloc::deallocate(p as *mut u8);
        }
        for size in (1..60_000usize).step_by(997) {
            let p = spanalloc::allocate(size, 16, 0);
            assert!(!p.is_null());
            spanalloc::deallocate(p);
        }
    }

    // Tearing down returns every mapped byte: heaps, caches, and the spans
    // still held by orphaned heaps.
    spanalloc::thread_finalize();
    spanalloc::finalize();
    assert_eq!(
        spanalloc::snapshot().mapped_bytes,
        0,
        "workout left mappings behind after finalize"
    );

    // The allocator comes back up once more after all that.
    spanalloc::initialize().expect("third initialize should succeed");
    spanalloc::thread_initialize();
    unsafe {
        let p = spanalloc::allocate(500, 16, 0);
        assert!(!p.is_null());
        spanalloc::deallocate(p);
    }
    spanalloc::thread_finalize();
    spanalloc::finalize();
    assert_eq!(spanalloc::snapshot().mapped_bytes, 0);
}
