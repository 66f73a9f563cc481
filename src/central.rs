//! The central cache: one shared free list per size class.
//!
//! Each class carries its own spinlock, so hot classes never contend
//! with cold ones. An empty class refills itself by taking a whole span
//! from the page cache and slicing it into blocks; spans are never handed
//! back, since nothing here tracks when all of a span's blocks are free.

use core::ptr::NonNull;

use crate::{
    base::BaseAlloc,
    block::{Block, Chain},
    config::{class_size, FREE_LIST_SIZE, PAGE_SIZE, SPAN_PAGES},
    page::PageCache,
    sync::SpinMutex,
};

/// Head of one class's shared list. Blocks link through their first
/// word; mutation happens only under the class spinlock.
struct ClassList {
    head: Option<NonNull<Block>>,
}

// SAFETY: the list owns its blocks, and access goes through the lock.
unsafe impl Send for ClassList {}

impl ClassList {
    const fn new() -> Self {
        ClassList { head: None }
    }
}

/// Per-size-class shared block pools, refilled from the page cache one
/// span at a time.
pub struct CentralCache {
    classes: [SpinMutex<ClassList>; FREE_LIST_SIZE],
}

impl CentralCache {
    pub const fn new() -> Self {
        CentralCache {
            classes: [const { SpinMutex::new(ClassList::new()) }; FREE_LIST_SIZE],
        }
    }

    /// Hands out a chain of at most `batch` blocks of class `index`, or
    /// `None` when memory cannot be obtained.
    ///
    /// The chain may be shorter than requested (the batch size is
    /// advisory); callers must count what they actually receive.
    pub fn fetch_range<B: BaseAlloc>(
        &self,
        index: usize,
        batch: usize,
        pages: &PageCache<B>,
    ) -> Option<Chain> {
        if index >= FREE_LIST_SIZE || batch == 0 {
            return None;
        }
        let mut list = self.classes[index].lock();
        let current = list.head;
        match current {
            Some(head) => {
                // Walk at most `batch` blocks and cut the chain there.
                let mut tail = head;
                let mut taken = 1;
                // SAFETY: list blocks are live free blocks of this class.
                unsafe {
                    while taken < batch {
                        match Block::next(tail) {
                            Some(next) => {
                                tail = next;
                                taken += 1;
                            }
                            None => break,
                        }
                    }
                    list.head = Block::next(tail);
                    Block::set_next(tail, None);
                    Some(Chain::from_raw(head, taken))
                }
            }
            None => refill(index, batch, &mut list, pages),
        }
    }

    /// Prepends a returned chain to class `index`'s list.
    ///
    /// The chain is walked to its tail before splicing; when it is
    /// shorter than its count claims, a diagnostic is emitted and what
    /// was actually found gets linked.
    pub fn return_range(&self, chain: Chain, index: usize) {
        if index >= FREE_LIST_SIZE {
            return;
        }
        let (head, claimed) = chain.into_raw();
        let mut list = self.classes[index].lock();
        // SAFETY: the chain's blocks are owned free blocks of this class.
        unsafe {
            let mut tail = head;
            let mut found = 1;
            while found < claimed {
                match Block::next(tail) {
                    Some(next) => {
                        tail = next;
                        found += 1;
                    }
                    None => break,
                }
            }
            if found < claimed {
                #[cfg(feature = "error-log")]
                log::warn!(
                    "central cache: class {index} got a {found}-block chain claimed as {claimed}"
                );
            }
            Block::set_next(tail, list.head);
            list.head = Some(head);
        }
    }

    /// Walks class `index`'s list, counting its blocks.
    #[cfg(test)]
    pub fn class_len(&self, index: usize) -> usize {
        let list = self.classes[index].lock();
        let mut count = 0;
        let mut cursor = list.head;
        while let Some(block) = cursor {
            count += 1;
            // SAFETY: list blocks are live free blocks.
            cursor = unsafe { Block::next(block) };
        }
        count
    }
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Takes a span from the page cache and slices it into class-`index`
/// blocks: a chain of at most `batch` for the caller, the remainder
/// installed as the class head.
fn refill<B: BaseAlloc>(
    index: usize,
    batch: usize,
    list: &mut ClassList,
    pages: &PageCache<B>,
) -> Option<Chain> {
    let size = class_size(index);
    let span_pages = if size <= SPAN_PAGES * PAGE_SIZE {
        SPAN_PAGES
    } else {
        size.div_ceil(PAGE_SIZE)
    };
    let start = pages.allocate_span(span_pages)?;

    let total = span_pages * PAGE_SIZE / size;
    let taken = batch.min(total);
    // SAFETY: the span is a fresh, exclusively owned run of
    // `span_pages * PAGE_SIZE` bytes; every block offset below stays
    // inside it, and `size` is a multiple of the block alignment.
    unsafe {
        let handout = carve(start, size, 0, taken);
        if total > taken {
            let (rest_head, _) = carve(start, size, taken, total).into_raw();
            list.head = Some(rest_head);
        }
        Some(handout)
    }
}

/// Links blocks `first..last` of the span at `start` into a chain.
///
/// # Safety
///
/// The span must exclusively cover at least `last * size` writable bytes
/// at `start`, with `start` and `size` aligned to the block alignment.
unsafe fn carve(start: NonNull<u8>, size: usize, first: usize, last: usize) -> Chain {
    debug_assert!(first < last);
    // SAFETY: per the contract, each offset is an in-span, aligned block.
    unsafe {
        let block_at =
            |i: usize| Block::from_user(NonNull::new_unchecked(start.as_ptr().add(i * size)));
        let head = block_at(first);
        let mut cursor = head;
        for i in first + 1..last {
            let next = block_at(i);
            Block::set_next(cursor, Some(next));
            cursor = next;
        }
        Block::set_next(cursor, None);
        Chain::from_raw(head, last - first)
    }
}
