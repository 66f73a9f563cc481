//! Process-wide tiers and the public front-end.
//!
//! The central and page caches are process-lifetime statics; each thread
//! grows its own cache on first use and flushes it back into the central
//! tier when it retires.

use core::ptr::{null_mut, NonNull};
use std::{alloc::Layout, cell::RefCell};

use crate::{
    base::Mmap,
    block::{Block, Chain},
    central::CentralCache,
    config::{class_of, ALIGNMENT, MAX_BYTES},
    page::PageCache,
    thread::ThreadCache,
};

static CENTRAL: CentralCache = CentralCache::new();
static PAGES: PageCache<Mmap> = PageCache::new(Mmap);

thread_local! {
    static CACHE: RefCell<CacheGuard> = RefCell::new(CacheGuard(ThreadCache::new()));
}

/// Flushes the thread cache into the central tier at thread exit so its
/// blocks are not stranded in dead thread-local storage.
struct CacheGuard(ThreadCache);

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.0.flush(&CENTRAL);
    }
}

/// The three-tier memory pool.
///
/// ```
/// use tieralloc::TierAlloc;
///
/// let ptr = TierAlloc.allocate(24);
/// assert!(!ptr.is_null());
/// unsafe { TierAlloc.deallocate(ptr, 24) };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TierAlloc;

impl TierAlloc {
    /// Returns a pointer to at least [`round_up(size)`](crate::config::round_up)
    /// writable bytes aligned to [`ALIGNMENT`], or null when memory
    /// cannot be obtained.
    ///
    /// A zero `size` is served as [`ALIGNMENT`] bytes; requests over
    /// [`MAX_BYTES`] bypass the tiers and go straight to the OS
    /// allocator.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size > MAX_BYTES {
            return oversize_alloc(size);
        }
        let block = CACHE
            .try_with(|cache| cache.borrow_mut().0.allocate(size, &CENTRAL, &PAGES))
            .unwrap_or_else(|_| allocate_unattended(size));
        block.map_or(null_mut(), |ptr| ptr.as_ptr())
    }

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this pool with the same `size`
    /// (up to rounding) and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if size > MAX_BYTES {
            // SAFETY: oversize blocks were obtained from the OS allocator.
            unsafe { oversize_dealloc(ptr, size) };
            return;
        }
        let cached = CACHE.try_with(|cache| {
            // SAFETY: forwarded caller contract.
            unsafe { cache.borrow_mut().0.deallocate(ptr, size, &CENTRAL) }
        });
        if cached.is_err() {
            deallocate_unattended(ptr, size);
        }
    }
}

/// Tiered allocation when this thread's cache is already torn down:
/// fetch a single block straight from the central cache.
#[cold]
fn allocate_unattended(size: usize) -> Option<NonNull<u8>> {
    let chain = CENTRAL.fetch_range(class_of(size), 1, &PAGES)?;
    let (block, rest) = chain.pop_front();
    debug_assert!(rest.is_none());
    Some(Block::into_user(block))
}

#[cold]
fn deallocate_unattended(ptr: NonNull<u8>, size: usize) {
    // SAFETY: the block is ours again; relink it as a one-block chain.
    let chain = unsafe { Chain::singleton(Block::from_user(ptr)) };
    CENTRAL.return_range(chain, class_of(size));
}

fn oversize_alloc(size: usize) -> *mut u8 {
    match Layout::from_size_align(size, ALIGNMENT) {
        // SAFETY: `size` is nonzero here (it exceeds MAX_BYTES).
        Ok(layout) => unsafe { std::alloc::alloc(layout) },
        Err(_) => null_mut(),
    }
}

/// # Safety
///
/// `ptr` must have been produced by [`oversize_alloc`] with this `size`.
unsafe fn oversize_dealloc(ptr: NonNull<u8>, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, ALIGNMENT) {
        // SAFETY: the layout reconstruction mirrors `oversize_alloc`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
