// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free, span-based dynamic memory allocator.
//!
//! Memory is carved out of *spans*: page runs aligned to a 64 KiB
//! granularity, each dedicated to one block size class. The span header is
//! recoverable from any pointer into the span by masking, which is what
//! lets `deallocate` and `usable_size` work from a bare pointer. Every
//! thread that allocates owns a heap of partially used spans; fully free
//! spans are cached per page count, first thread-locally and then in a
//! process-wide cache, before being returned to the OS. Requests too large
//! for a span map pages directly.
//!
//! Cross-thread frees never touch another thread's lists: they push the
//! block onto the owning heap's lock-free deferred stack, and the owner
//! drains it on its next allocation. Heaps themselves are never destroyed;
//! exiting threads donate them to an orphan list for adoption, so the heap
//! id stamped in a span header is valid forever.
//!
//! The entry points live in the [`api`] module and are re-exported here;
//! [`alloc_impl::SpanAllocGlobal`] adapts them to `GlobalAlloc`.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

#[macro_use]
mod stats;

mod cache;
mod classes;
mod heap;
mod large;
mod registry;
mod sources;
mod span;
mod tagged;
mod util;

pub mod alloc_impl;
pub mod api;

pub use crate::api::{
    allocate, deallocate, finalize, initialize, memory_system, reallocate, thread_finalize,
    thread_initialize, usable_size, MemorySystem, MIN_ALIGN, NO_PRESERVE, ZERO_INITIALIZED,
};
pub use crate::sources::MapFailure;
pub use crate::stats::{snapshot, Snapshot};
