//! The OS boundary: whole-page mappings and their owned handles.
//!
//! The page cache is generic over a [`BaseAlloc`] so tests can substitute
//! providers; production use goes through [`Mmap`], which maps anonymous,
//! private, read-write pages that the OS hands out zeroed.

use core::{alloc::Layout, fmt, mem::ManuallyDrop, ptr::NonNull};

use region::{Allocation, Protection};

/// A provider of page-granular memory mappings.
///
/// # Safety
///
/// `allocate` must return a valid, exclusively owned memory block
/// containing `layout`, or an error.
pub unsafe trait BaseAlloc: Clone {
    type Handle;
    type Error: fmt::Display;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error>;

    /// # Safety
    ///
    /// `chunk` must have been allocated by this provider and must not be
    /// used afterwards.
    unsafe fn deallocate(chunk: &mut Chunk<Self>);
}

/// An owned memory mapping. `Clone` and `Copy` are banned for its unique
/// ownership; dropping it returns the memory to its provider.
pub struct Chunk<B: BaseAlloc> {
    ptr: NonNull<u8>,
    layout: Layout,
    handle: B::Handle,
}

unsafe impl<B: BaseAlloc> Send for Chunk<B> where B::Handle: Send {}
unsafe impl<B: BaseAlloc> Sync for Chunk<B> where B::Handle: Sync {}

impl<B: BaseAlloc> Chunk<B> {
    /// # Safety
    ///
    /// `ptr` must point to a valid, owned block of memory of `layout`,
    /// allocated from the provider that issued `handle`.
    pub unsafe fn new(ptr: NonNull<u8>, layout: Layout, handle: B::Handle) -> Self {
        Chunk { ptr, layout, handle }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn pointer(&self) -> NonNull<u8> {
        self.ptr
    }

    fn handle_mut(&mut self) -> &mut B::Handle {
        &mut self.handle
    }
}

impl<B: BaseAlloc> Drop for Chunk<B> {
    fn drop(&mut self) {
        // SAFETY: the chunk owns its memory and is not used afterwards.
        unsafe { B::deallocate(self) }
    }
}

/// Owned token for one anonymous mapping.
///
/// The mapping is process-wide state; unmapping from a thread other than
/// the mapping one is sound.
pub struct MmapHandle(ManuallyDrop<Allocation>);

// SAFETY: the token is only ever used to unmap; see above.
unsafe impl Send for MmapHandle {}
unsafe impl Sync for MmapHandle {}

/// A base allocator backed by anonymous, private, read-write mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mmap;

unsafe impl BaseAlloc for Mmap {
    type Handle = MmapHandle;
    type Error = region::Error;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        let mut mapping = region::alloc(layout.size(), Protection::READ_WRITE)?;
        // The OS hands mappings out at page granularity, which satisfies
        // any alignment up to the platform page size.
        let ptr = NonNull::new(mapping.as_mut_ptr::<u8>()).expect("fresh mapping is null");
        debug_assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        // SAFETY: the mapping is fresh and exclusively ours.
        Ok(unsafe { Chunk::new(ptr, layout, MmapHandle(ManuallyDrop::new(mapping))) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: the handle is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut chunk.handle_mut().0) }
    }
}
