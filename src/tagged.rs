// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tagged-pointer packing for ABA-guarded lock-free stacks.
//!
//! A pointer and a monotonically incremented tag share a single word so that
//! a compare-and-swap covers both. Every structure threaded through these
//! helpers (heaps, spans) is aligned to at least a page, so the low 12 bits
//! of the pointer are always zero and can carry the tag. The tag wraps after
//! 4096 increments, which bounds the window in which an A-B-A reuse of the
//! same address could go unnoticed; a stack would need that many pushes and
//! pops between one thread's load and its CAS for the guard to fail.

pub const TAG_BITS: u32 = 12;
pub const TAG_MASK: usize = (1 << TAG_BITS) - 1;

/// Pack `ptr` and `tag` into one word. The pointer must have its low
/// `TAG_BITS` bits clear.
#[inline]
pub fn pack<T>(ptr: *mut T, tag: usize) -> usize {
    debug_assert_eq!(ptr as usize & TAG_MASK, 0);
    ptr as usize | (tag & TAG_MASK)
}

/// The pointer half of a packed word.
#[inline]
pub fn ptr_of<T>(word: usize) -> *mut T {
    (word & !TAG_MASK) as *mut T
}

/// The tag half of a packed word.
#[inline]
pub fn tag_of(word: usize) -> usize {
    word & TAG_MASK
}

/// The tag to use for the word replacing `word`.
#[inline]
pub fn next_tag(word: usize) -> usize {
    (tag_of(word) + 1) & TAG_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let p = 0x7f00_dead_0000usize as *mut u8;
        let word = pack(p, 7);
        assert_eq!(ptr_of::<u8>(word), p);
        assert_eq!(tag_of(word), 7);
    }

    #[test]
    fn tag_wraps() {
        let p = ::std::ptr::null_mut::<u8>();
        let word = pack(p, TAG_MASK);
        assert_eq!(tag_of(word), TAG_MASK);
        assert_eq!(next_tag(word), 0);
    }

    #[test]
    fn null_is_representable() {
        let word = pack(::std::ptr::null_mut::<u8>(), 3);
        assert!(ptr_of::<u8>(word).is_null());
        assert_eq!(tag_of(word), 3);
    }
}
