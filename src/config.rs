//! Tuning constants and the size-class map.
//!
//! Size classes are uniformly spaced: class `i` holds blocks of exactly
//! `(i + 1) * ALIGNMENT` bytes, so mapping a byte count to a class and
//! back is pure arithmetic with no lookup table.

/// Word alignment and minimum block size, in bytes.
pub const ALIGNMENT: usize = 8;

/// Largest request served by the tiered path; anything bigger bypasses
/// the tiers and goes straight to the OS allocator.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes.
pub const FREE_LIST_SIZE: usize = MAX_BYTES / ALIGNMENT;

/// Page unit used by the page cache.
pub const PAGE_SIZE: usize = 4096;

/// Default span size the central cache requests, in pages.
pub const SPAN_PAGES: usize = 8;

/// Thread-cache list length past which blocks are handed back to the
/// central cache.
pub const THREAD_MAX_SIZE: usize = 64;

// A free block stores its next-link in its first word.
const _: () = assert!(ALIGNMENT >= core::mem::size_of::<usize>());
const _: () = assert!(PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!(PAGE_SIZE.is_power_of_two());

/// Rounds `bytes` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Maps a byte count to its size-class index.
///
/// Zero behaves as [`ALIGNMENT`]. The result is only meaningful for
/// `bytes <= MAX_BYTES`.
#[inline]
pub const fn class_of(bytes: usize) -> usize {
    let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
    (bytes + ALIGNMENT - 1) / ALIGNMENT - 1
}

/// The exact block size of size class `index`.
#[inline]
pub const fn class_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}
