//! A three-tier thread-caching memory pool for small objects.
//!
//! Requests up to [`config::MAX_BYTES`] are served from a per-thread
//! cache of intrusive free lists with no synchronization at all; empty
//! lists refill in batches from a shared central cache whose size classes
//! lock independently, and the central cache in turn slices whole spans
//! of pages taken from a process-wide page cache that splits and
//! coalesces its inventory best-fit. Anything larger bypasses the tiers
//! and goes straight to the OS allocator.
//!
//! # Usage
//!
//! ```
//! use tieralloc::TierAlloc;
//!
//! let ptr = TierAlloc.allocate(24);
//! assert!(!ptr.is_null());
//! unsafe {
//!     ptr.write_bytes(0, 24);
//!     TierAlloc.deallocate(ptr, 24);
//! }
//! ```
//!
//! Deallocation must pass the size used at allocation (up to rounding);
//! the pool keeps no per-block headers.
//!
//! This is a *library* allocator: the page cache keeps its span records
//! in ordinary collections backed by the host allocator, so the crate
//! cannot be installed as `#[global_allocator]`.

pub mod base;
mod block;
mod central;
pub mod config;
mod global;
pub mod page;
mod sync;
mod thread;

pub use self::{
    base::{BaseAlloc, Chunk, Mmap},
    global::TierAlloc,
    page::PageCache,
};
