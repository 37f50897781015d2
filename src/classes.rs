// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The size-class table.
//!
//! Requests up to `MEDIUM_SIZE_LIMIT` are served from spans carved into
//! equal blocks. The table maps a request to a `(block_size, page_count,
//! block_count)` configuration picked once at startup: small classes are
//! multiples of 16 bytes up to 2 KiB, medium classes are multiples of 512
//! bytes up to one span minus its header. For each class the page count is
//! grown until the overhead ratio is acceptable, and neighbouring classes
//! that end up with identical layouts are folded together by marking the
//! smaller one unused; lookups then advance to the surviving class.
//!
//! Power-of-two classes keep their first block at an offset aligned to the
//! block size instead of the plain header offset, which makes every block of
//! the class naturally aligned to its size. Those classes are exempt from
//! folding, since the aligned-allocation path relies on hitting them
//! exactly.

use crate::span::{BLOCK_LIMIT, SPAN_HEADER_SIZE};

/// Granularity of the small classes, and the alignment every returned
/// pointer satisfies.
pub const BLOCK_GRANULARITY: usize = 16;
pub const SMALL_CLASS_COUNT: usize = 128;
/// Largest small-class block: 2 KiB.
pub const SMALL_SIZE_LIMIT: usize = BLOCK_GRANULARITY * SMALL_CLASS_COUNT;

pub const MEDIUM_GRANULARITY: usize = 512;
pub const MEDIUM_CLASS_COUNT: usize = 123;
/// Largest block served from a span; anything bigger maps pages directly.
pub const MEDIUM_SIZE_LIMIT: usize = SMALL_SIZE_LIMIT + MEDIUM_GRANULARITY * MEDIUM_CLASS_COUNT;

pub const CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT;

/// One size-class configuration. A `block_size` of zero marks a class folded
/// into its larger neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub block_size: u32,
    /// Offset of block 0 from the span base.
    pub block_offset: u32,
    pub page_count: u32,
    pub block_count: u32,
}

impl SizeClass {
    const UNUSED: SizeClass = SizeClass {
        block_size: 0,
        block_offset: 0,
        page_count: 0,
        block_count: 0,
    };
}

pub struct ClassTable {
    classes: [SizeClass; CLASS_COUNT],
}

impl ClassTable {
    /// Build the table for the given system page size. `max_span_pages` is
    /// the number of pages in one span granularity unit.
    pub fn build(page_size: usize, max_span_pages: usize) -> ClassTable {
        let mut classes = [SizeClass::UNUSED; CLASS_COUNT];
        for (i, slot) in classes.iter_mut().enumerate() {
            let block_size = Self::nominal_size(i);
            *slot = fit_class(block_size, page_size, max_span_pages);
        }
        // Fold classes whose layout matches the next larger class. The
        // larger class survives, so a request landing on a folded entry
        // still fits after advancing. Power-of-two classes always survive.
        for i in 1..CLASS_COUNT {
            let prev = classes[i - 1];
            let cur = classes[i];
            let prev_size = prev.block_size as usize;
            let keeps_alignment = prev_size.is_power_of_two() && prev_size <= SMALL_SIZE_LIMIT;
            if prev.page_count == cur.page_count
                && prev.block_count == cur.block_count
                && prev.block_offset == cur.block_offset
                && !keeps_alignment
            {
                classes[i - 1].block_size = 0;
            }
        }
        debug_assert_ne!(classes[CLASS_COUNT - 1].block_size, 0);
        ClassTable { classes }
    }

    /// The block size class `i` is built for, before folding.
    #[inline]
    fn nominal_size(i: usize) -> usize {
        if i < SMALL_CLASS_COUNT {
            (i + 1) * BLOCK_GRANULARITY
        } else {
            SMALL_SIZE_LIMIT + (i - SMALL_CLASS_COUNT + 1) * MEDIUM_GRANULARITY
        }
    }

    /// Closed-form mapping from a request to its class index, before
    /// advancing past folded entries.
    #[inline]
    pub fn index_of(size: usize) -> usize {
        if size <= BLOCK_GRANULARITY {
            0
        } else if size <= SMALL_SIZE_LIMIT {
            (size + BLOCK_GRANULARITY - 1) / BLOCK_GRANULARITY - 1
        } else {
            debug_assert!(size <= MEDIUM_SIZE_LIMIT);
            SMALL_CLASS_COUNT + (size - SMALL_SIZE_LIMIT + MEDIUM_GRANULARITY - 1) / MEDIUM_GRANULARITY
                - 1
        }
    }

    /// The effective class for a request: the smallest surviving class whose
    /// block size covers `size`.
    #[inline]
    pub fn class_for(&self, size: usize) -> (usize, SizeClass) {
        let mut idx = Self::index_of(size);
        while self.classes[idx].block_size == 0 {
            idx += 1;
        }
        let class = self.classes[idx];
        debug_assert!(class.block_size as usize >= size);
        (idx, class)
    }

    #[inline]
    pub fn get(&self, idx: usize) -> SizeClass {
        debug_assert!(idx < CLASS_COUNT);
        debug_assert_ne!(self.classes[idx].block_size, 0);
        self.classes[idx]
    }
}

/// Pick the page count for a class of `block_size`-byte blocks: start at the
/// smallest page count that fits one block and grow while the wasted space
/// per block exceeds 1/32nd of the block size, keeping the configuration
/// with the lowest overhead ratio.
fn fit_class(block_size: usize, page_size: usize, max_span_pages: usize) -> SizeClass {
    // Only small classes get the natural-alignment padding; padding a large
    // power-of-two class would sacrifice up to half of its span.
    let block_offset = if block_size.is_power_of_two() && block_size <= SMALL_SIZE_LIMIT {
        ::std::cmp::max(SPAN_HEADER_SIZE, block_size)
    } else {
        SPAN_HEADER_SIZE
    };

    let layout = |page_count: usize| -> (usize, usize) {
        let total = page_count * page_size;
        debug_assert!(total > block_offset);
        let count = ::std::cmp::min((total - block_offset) / block_size, BLOCK_LIMIT);
        let waste = total - block_offset - count * block_size;
        (count, waste)
    };
    let ratio = |count: usize, waste: usize| -> f64 {
        (waste + block_offset) as f64 / (count * block_size) as f64
    };

    let mut page_count = crate::util::pages_for(block_offset + block_size, page_size);
    let (mut count, mut waste) = layout(page_count);
    let mut best = (page_count, count);
    let mut best_ratio = ratio(count, waste);
    while (waste + block_offset) * 32 > block_size * count && page_count < max_span_pages {
        page_count += 1;
        let (c, w) = layout(page_count);
        let r = ratio(c, w);
        if r < best_ratio {
            best = (page_count, c);
            best_ratio = r;
        }
        count = c;
        waste = w;
    }

    SizeClass {
        block_size: block_size as u32,
        block_offset: block_offset as u32,
        page_count: best.0 as u32,
        block_count: best.1 as u32,
    }
}
