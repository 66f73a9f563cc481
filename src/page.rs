//! The page cache: spans of OS pages, best-fit served, right-coalesced.
//!
//! Every mapping the cache ever obtains stays under its ownership; blocks
//! cut from a span are on loan to the upper tiers and are never tracked
//! here. Span records live in the span map for the lifetime of their
//! pages, flipping between free and loaned.

use core::{alloc::Layout, ptr::NonNull};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use crate::{
    base::{BaseAlloc, Chunk},
    config::PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanState {
    /// On a free-spans list, available for best-fit allocation.
    Free,
    /// Handed out whole to a caller.
    Loaned,
}

/// Bookkeeping for a contiguous run of pages, keyed by its page address.
struct Span {
    pages: usize,
    state: SpanState,
    /// Next span of the same page count on the free-spans list.
    next: Option<usize>,
}

struct Inner<B: BaseAlloc> {
    /// Page count -> head address of the singly linked list of free spans
    /// with exactly that count. Best fit is the first entry at or above
    /// the requested count.
    free_spans: BTreeMap<usize, usize>,
    /// Page address -> span record, for deallocation lookup and adjacency
    /// tests. Loaned spans stay in here too.
    spans: BTreeMap<usize, Span>,
    /// OS mappings, retained until the cache itself is dropped.
    chunks: Vec<Chunk<B>>,
}

impl<B: BaseAlloc> Inner<B> {
    /// Detaches `target` from the free list for `pages`-page spans.
    /// Answers whether it was found there.
    fn unlink_free(&mut self, pages: usize, target: usize) -> bool {
        let Some(&head) = self.free_spans.get(&pages) else {
            return false;
        };
        if head == target {
            let after = self.spans[&target].next;
            match after {
                Some(next) => self.free_spans.insert(pages, next),
                None => self.free_spans.remove(&pages),
            };
            return true;
        }
        let mut prev = head;
        loop {
            let next = self.spans[&prev].next;
            match next {
                Some(found) if found == target => {
                    let after = self.spans[&target].next;
                    if let Some(prev_span) = self.spans.get_mut(&prev) {
                        prev_span.next = after;
                    }
                    return true;
                }
                Some(found) => prev = found,
                None => return false,
            }
        }
    }

    /// Pushes the span at `addr` onto the head of its size's free list.
    fn push_free(&mut self, addr: usize) {
        let pages = self.spans[&addr].pages;
        let old_head = self.free_spans.insert(pages, addr);
        if let Some(span) = self.spans.get_mut(&addr) {
            span.state = SpanState::Free;
            span.next = old_head;
        }
    }
}

/// Process-level owner of all OS-backed pages.
///
/// Serves whole spans of `pages * PAGE_SIZE` bytes under a single mutex;
/// requests here are rare (one per span's worth of block traffic), so one
/// lock is enough.
pub struct PageCache<B: BaseAlloc = crate::base::Mmap> {
    base: B,
    inner: Mutex<Inner<B>>,
}

impl<B: BaseAlloc> PageCache<B> {
    pub const fn new(base: B) -> Self {
        PageCache {
            base,
            inner: Mutex::new(Inner {
                free_spans: BTreeMap::new(),
                spans: BTreeMap::new(),
                chunks: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner<B>> {
        // A poisoning panic cannot leave the maps mid-edit in a way we
        // could repair; keep serving.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the start of a span of exactly `pages` pages, or `None`
    /// when no memory can be obtained.
    ///
    /// The smallest free span that fits is used; an oversized one is
    /// split, its surplus going back on the shelf.
    pub fn allocate_span(&self, pages: usize) -> Option<NonNull<u8>> {
        if pages == 0 {
            return None;
        }
        let mut inner = self.inner();

        let found = inner
            .free_spans
            .range(pages..)
            .next()
            .map(|(&list_pages, &addr)| (list_pages, addr));
        if let Some((list_pages, addr)) = found {
            // Detach the list head.
            let head_next = inner.spans[&addr].next;
            match head_next {
                Some(next) => inner.free_spans.insert(list_pages, next),
                None => inner.free_spans.remove(&list_pages),
            };
            if list_pages > pages {
                // Split: the surplus tail becomes its own span.
                let tail_addr = addr + pages * PAGE_SIZE;
                let surplus = list_pages - pages;
                inner.spans.insert(
                    tail_addr,
                    Span { pages: surplus, state: SpanState::Free, next: None },
                );
                inner.push_free(tail_addr);
            }
            if let Some(span) = inner.spans.get_mut(&addr) {
                span.pages = pages;
                span.state = SpanState::Loaned;
                span.next = None;
            }
            return NonNull::new(addr as *mut u8);
        }

        // No fit anywhere: map fresh pages.
        let layout =
            Layout::from_size_align(pages.checked_mul(PAGE_SIZE)?, PAGE_SIZE).ok()?;
        match self.base.allocate(layout) {
            Ok(chunk) => {
                let addr = chunk.pointer().as_ptr() as usize;
                inner
                    .spans
                    .insert(addr, Span { pages, state: SpanState::Loaned, next: None });
                inner.chunks.push(chunk);
                NonNull::new(addr as *mut u8)
            }
            Err(err) => {
                #[cfg(feature = "error-log")]
                log::error!("page cache: mapping {pages} page(s) failed: {err}");
                #[cfg(not(feature = "error-log"))]
                let _ = err;
                None
            }
        }
    }

    /// Marks the span at `addr` free again, absorbing a free right
    /// neighbor when there is one. Addresses this cache never handed out
    /// are ignored.
    pub fn deallocate_span(&self, addr: NonNull<u8>, pages: usize) {
        let addr = addr.as_ptr() as usize;
        let mut inner = self.inner();

        let Some(span) = inner.spans.get(&addr) else {
            return; // not ours
        };
        if span.state == SpanState::Free {
            return; // already on the shelf
        }
        debug_assert_eq!(span.pages, pages);
        let span_pages = span.pages;

        // Absorb the right neighbor when it exists and is free.
        let next_addr = addr + span_pages * PAGE_SIZE;
        let neighbor = inner.spans.get(&next_addr).map(|n| (n.pages, n.state));
        if let Some((neighbor_pages, SpanState::Free)) = neighbor {
            if inner.unlink_free(neighbor_pages, next_addr) {
                inner.spans.remove(&next_addr);
                if let Some(span) = inner.spans.get_mut(&addr) {
                    span.pages += neighbor_pages;
                }
            }
        }

        // Back on the shelf, coalesced or not.
        inner.push_free(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Mmap;

    fn cache() -> PageCache<Mmap> {
        PageCache::new(Mmap)
    }

    impl<B: BaseAlloc> PageCache<B> {
        /// Head address of the free list for `pages`-page spans.
        fn free_head(&self, pages: usize) -> Option<usize> {
            self.inner().free_spans.get(&pages).copied()
        }

        fn free_list_count(&self) -> usize {
            self.inner().free_spans.len()
        }
    }

    #[test]
    fn fresh_span_is_writable_and_reinserted_without_neighbor() {
        let pc = cache();
        let span = pc.allocate_span(8).unwrap();
        assert_eq!(span.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { core::ptr::write_bytes(span.as_ptr(), 0x5a, 8 * PAGE_SIZE) };

        // No right neighbor exists, yet the span must land on the shelf.
        pc.deallocate_span(span, 8);
        assert_eq!(pc.free_head(8), Some(span.as_ptr() as usize));
    }

    #[test]
    fn oversized_span_is_split() {
        let pc = cache();
        let span = pc.allocate_span(8).unwrap();
        pc.deallocate_span(span, 8);

        let small = pc.allocate_span(3).unwrap();
        assert_eq!(small, span);
        let tail = span.as_ptr() as usize + 3 * PAGE_SIZE;
        assert_eq!(pc.free_head(5), Some(tail));
        assert_eq!(pc.free_head(8), None);
    }

    #[test]
    fn right_coalesce_restores_whole_span() {
        let pc = cache();
        let span = pc.allocate_span(8).unwrap();
        pc.deallocate_span(span, 8);
        let small = pc.allocate_span(3).unwrap();

        // Freeing the 3-page span next to the free 5-page tail leaves one
        // 8-page span on the shelf.
        pc.deallocate_span(small, 3);
        assert_eq!(pc.free_head(8), Some(span.as_ptr() as usize));
        assert_eq!(pc.free_head(5), None);
        assert_eq!(pc.free_head(3), None);
        assert_eq!(pc.free_list_count(), 1);
    }

    #[test]
    fn best_fit_prefers_smallest_span() {
        let pc = cache();
        // Carve one 16-page mapping into loaned spans of 4, 4 and 8 pages,
        // then free the outer two; the loaned middle keeps them apart.
        let whole = pc.allocate_span(16).unwrap();
        pc.deallocate_span(whole, 16);
        let first = pc.allocate_span(4).unwrap();
        let middle = pc.allocate_span(4).unwrap();
        let last = pc.allocate_span(8).unwrap();
        assert_eq!(first, whole);
        pc.deallocate_span(first, 4);
        pc.deallocate_span(last, 8);

        // 3 pages fit both; the 4-page span must win and split.
        let small = pc.allocate_span(3).unwrap();
        assert_eq!(small, first);
        assert_eq!(pc.free_head(1), Some(first.as_ptr() as usize + 3 * PAGE_SIZE));
        assert_eq!(pc.free_head(8), Some(last.as_ptr() as usize));

        pc.deallocate_span(middle, 4);
    }

    #[test]
    fn unknown_address_is_ignored() {
        let pc = cache();
        let span = pc.allocate_span(2).unwrap();

        let bogus = NonNull::new(0x10_0000 as *mut u8).unwrap();
        pc.deallocate_span(bogus, 2);
        assert_eq!(pc.free_list_count(), 0);

        // Double release keeps the shelf intact.
        pc.deallocate_span(span, 2);
        pc.deallocate_span(span, 2);
        assert_eq!(pc.free_head(2), Some(span.as_ptr() as usize));
        assert_eq!(pc.free_list_count(), 1);
    }

    #[test]
    fn split_spans_keep_their_records() {
        let pc = cache();
        let whole = pc.allocate_span(8).unwrap();
        pc.deallocate_span(whole, 8);

        // Two successive splits: 8 -> 2 + 6 -> 2 + 2 + 4.
        let a = pc.allocate_span(2).unwrap();
        let b = pc.allocate_span(2).unwrap();
        assert_eq!(a, whole);
        assert_eq!(b.as_ptr() as usize, whole.as_ptr() as usize + 2 * PAGE_SIZE);
        assert_eq!(pc.free_head(4), Some(whole.as_ptr() as usize + 4 * PAGE_SIZE));

        // b's right neighbor (the 4-page tail) is free: coalesce to 6.
        pc.deallocate_span(b, 2);
        assert_eq!(pc.free_head(6), Some(b.as_ptr() as usize));
        // a's right neighbor is now the free 6-page span: back to 8.
        pc.deallocate_span(a, 2);
        assert_eq!(pc.free_head(8), Some(whole.as_ptr() as usize));
        assert_eq!(pc.free_list_count(), 1);
    }
}
