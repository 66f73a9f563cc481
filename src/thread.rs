//! The thread cache: per-thread free lists, no synchronization on the
//! fast path.
//!
//! Each size class keeps a singly linked list with an exact length
//! counter. Misses pull a batch from the central cache; lists that
//! outgrow `THREAD_MAX_SIZE` hand three quarters of their blocks back.

use core::ptr::NonNull;

use crate::{
    base::BaseAlloc,
    block::{Block, FreeList},
    central::CentralCache,
    config::{class_of, class_size, FREE_LIST_SIZE, MAX_BYTES, THREAD_MAX_SIZE},
    page::PageCache,
};

/// Largest payload a single refill batch aims for, in bytes.
const MAX_BATCH_BYTES: usize = 4 * 1024;

pub struct ThreadCache {
    lists: Box<[FreeList]>,
}

impl ThreadCache {
    pub fn new() -> Self {
        ThreadCache {
            lists: (0..FREE_LIST_SIZE).map(|_| FreeList::new()).collect(),
        }
    }

    /// Returns a block of at least `round_up(size)` bytes, or `None`
    /// when memory cannot be obtained. `size` must not exceed
    /// [`MAX_BYTES`]; zero behaves as the minimum block size.
    pub fn allocate<B: BaseAlloc>(
        &mut self,
        size: usize,
        central: &CentralCache,
        pages: &PageCache<B>,
    ) -> Option<NonNull<u8>> {
        debug_assert!(size <= MAX_BYTES);
        let index = class_of(size);
        if let Some(block) = self.lists[index].pop() {
            return Some(Block::into_user(block));
        }
        self.fetch_from_central(index, central, pages)
    }

    /// Miss path: pull a batch from the central cache, keep all but the
    /// first block.
    #[cold]
    fn fetch_from_central<B: BaseAlloc>(
        &mut self,
        index: usize,
        central: &CentralCache,
        pages: &PageCache<B>,
    ) -> Option<NonNull<u8>> {
        let batch = batch_count(class_size(index));
        let chain = central.fetch_range(index, batch, pages)?;
        debug_assert!(chain.len() <= batch);
        let (first, rest) = chain.pop_front();
        if let Some(rest) = rest {
            // SAFETY: the chain's blocks are class-`index` blocks we own.
            unsafe { self.lists[index].prepend(rest) };
        }
        Some(Block::into_user(first))
    }

    /// Releases a block previously obtained with the same `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(size)` on this pool and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize, central: &CentralCache) {
        debug_assert!(size <= MAX_BYTES);
        let index = class_of(size);
        // SAFETY: the block is ours again and at least one word wide.
        unsafe { self.lists[index].push(Block::from_user(ptr)) };
        if self.lists[index].len() > THREAD_MAX_SIZE {
            self.return_to_central(index, central);
        }
    }

    /// Keeps a quarter of the list, handing the rest back.
    fn return_to_central(&mut self, index: usize, central: &CentralCache) {
        let len = self.lists[index].len();
        if len <= 1 {
            return;
        }
        let keep = (len / 4).max(1);
        if let Some(chain) = self.lists[index].split_off(keep) {
            central.return_range(chain, index);
        }
    }

    /// Hands every cached block back to the central cache. Called when a
    /// thread retires so its blocks are not stranded.
    pub fn flush(&mut self, central: &CentralCache) {
        for index in 0..FREE_LIST_SIZE {
            if let Some(chain) = self.lists[index].take_all() {
                central.return_range(chain, index);
            }
        }
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

/// How many blocks to request from the central cache for `size`-byte
/// blocks: roughly 2 KiB worth, capped at `MAX_BATCH_BYTES` of payload.
fn batch_count(size: usize) -> usize {
    let base = match size {
        0..=32 => 64,
        33..=64 => 32,
        65..=128 => 16,
        129..=256 => 8,
        257..=512 => 4,
        513..=1024 => 2,
        _ => 1,
    };
    base.min(MAX_BATCH_BYTES / size).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Mmap;

    fn env() -> (Box<CentralCache>, PageCache<Mmap>) {
        (Box::new(CentralCache::new()), PageCache::new(Mmap))
    }

    #[test]
    fn batch_targets_two_kib() {
        assert_eq!(batch_count(8), 64);
        assert_eq!(batch_count(32), 64);
        assert_eq!(batch_count(64), 32);
        assert_eq!(batch_count(1024), 2);
        assert_eq!(batch_count(2048), 1);
        assert_eq!(batch_count(MAX_BYTES), 1);
    }

    #[test]
    fn reuses_freed_blocks_lifo() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();

        let ptr = tc.allocate(24, &central, &pc).unwrap();
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xee, 24);
            tc.deallocate(ptr, 24, &central);
        }
        let again = tc.allocate(24, &central, &pc).unwrap();
        assert_eq!(ptr, again);
        unsafe { tc.deallocate(again, 24, &central) };
    }

    #[test]
    fn zero_size_serves_the_smallest_class() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();

        let ptr = tc.allocate(0, &central, &pc).unwrap();
        let after_alloc = tc.lists[0].len();
        unsafe { tc.deallocate(ptr, 0, &central) };
        assert_eq!(tc.lists[0].len(), after_alloc + 1);
    }

    #[test]
    fn counter_matches_reachable_blocks() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();
        let index = class_of(48);

        let ptrs: Vec<_> = (0..20)
            .map(|_| tc.allocate(48, &central, &pc).unwrap())
            .collect();
        for &p in &ptrs {
            unsafe { tc.deallocate(p, 48, &central) };
        }

        let counted = tc.lists[index].len();
        let mut walked = 0;
        while tc.lists[index].pop().is_some() {
            walked += 1;
        }
        assert_eq!(counted, walked);
    }

    #[test]
    fn overflow_returns_three_quarters() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();
        let index = class_of(64);

        // 65 blocks pushed into a fresh cache: the 65th crosses
        // THREAD_MAX_SIZE and triggers the give-back.
        let chain = central.fetch_range(index, 65, &pc).unwrap();
        assert_eq!(chain.len(), 65);
        let central_before = central.class_len(index);

        let mut blocks = Vec::new();
        let mut rest = Some(chain);
        while let Some(chain) = rest {
            let (block, tail) = chain.pop_front();
            blocks.push(Block::into_user(block));
            rest = tail;
        }
        for (i, &ptr) in blocks.iter().enumerate() {
            unsafe { tc.deallocate(ptr, 64, &central) };
            let expected = if i < 64 { i + 1 } else { 16 };
            assert_eq!(tc.lists[index].len(), expected);
        }

        // keep = 65 / 4 = 16, so 49 went back to the central list.
        assert_eq!(central.class_len(index), central_before + 49);
    }

    #[test]
    fn fetch_tolerates_short_central_chains() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();
        // 200 KiB blocks: each central fetch yields exactly one block.
        let ptr = tc.allocate(200 * 1024, &central, &pc).unwrap();
        assert_eq!(tc.lists[class_of(200 * 1024)].len(), 0);
        unsafe { tc.deallocate(ptr, 200 * 1024, &central) };
        assert_eq!(tc.lists[class_of(200 * 1024)].len(), 1);
    }

    #[test]
    fn flush_strands_nothing() {
        let (central, pc) = env();
        let mut tc = ThreadCache::new();

        let small: Vec<_> = (0..10)
            .map(|_| tc.allocate(16, &central, &pc).unwrap())
            .collect();
        let large = tc.allocate(4096, &central, &pc).unwrap();
        unsafe {
            for &p in &small {
                tc.deallocate(p, 16, &central);
            }
            tc.deallocate(large, 4096, &central);
        }

        let cached: usize = [class_of(16), class_of(4096)]
            .iter()
            .map(|&i| tc.lists[i].len())
            .sum();
        assert!(cached > 0);
        let before: usize = central.class_len(class_of(16)) + central.class_len(class_of(4096));

        tc.flush(&central);
        assert_eq!(tc.lists[class_of(16)].len(), 0);
        assert_eq!(tc.lists[class_of(4096)].len(), 0);
        let after = central.class_len(class_of(16)) + central.class_len(class_of(4096));
        assert_eq!(after, before + cached);
    }
}
