//! Buffer allocators for tensor storage.
//!
//! Tensors get their storage from a [`BufferAllocator`] during a graph resize
//! pass: one `alloc` when a tensor's lifetime begins, one `free` when it ends.
//! Two strategies implement the contract:
//!
//! - [`EagerBufferAllocator`] - resolves addresses immediately and reuses
//!   freed blocks at once through a size-ordered free list
//! - [`DeferBufferAllocator`] - records an address-ordered interval plan and
//!   resolves every address in one [`compute`](BufferAllocator::compute) pass
//!
//! Both obtain raw memory from an [`Allocator`] source, which may itself rent
//! from another buffer allocator ([`RecurseAllocator`]).
//!
//! # Example
//!
//! ```rust
//! use tactics_core::memory::{BufferAllocator, EagerBufferAllocator, create_default};
//!
//! let mut allocator = EagerBufferAllocator::new(create_default());
//! let a = allocator.alloc(256, false, 0);
//! let _b = allocator.alloc(128, false, 0);
//! allocator.free(&a);
//!
//! // The freed 256-byte block is reused.
//! let c = allocator.alloc(200, false, 0);
//! assert_eq!(c.ptr(), a.ptr());
//! assert_eq!(allocator.total_size(), 384);
//! ```
//!
//! # Contract
//!
//! Allocators are single-owner: nothing here synchronizes internally. Freeing
//! a chunk that is not live, allocating zero bytes, and closing a barrier or
//! group that was never opened are caller errors. They panic in debug builds
//! and are logged and ignored in release builds.

mod arena;
mod chunk;
mod defer;
mod eager;
mod scope;
mod source;

pub use chunk::MemChunk;
pub use defer::{ApplyFn, DeferBufferAllocator, IntervalSnapshot};
pub use eager::EagerBufferAllocator;
pub use scope::ScopeKind;
pub use source::{Allocator, DefaultAllocator, RecurseAllocator, create_default, create_recurse};

use tactics_common::utils::error::Result;

/// Allocation strategy consumed by the backend layer.
pub trait BufferAllocator {
    /// Requests at least `size` bytes aligned to `align`.
    ///
    /// An `align` of zero selects the allocator's configured alignment.
    /// `separate` requests a standalone block that never takes part in
    /// reuse. Returns an invalid chunk when the raw source is exhausted.
    fn alloc(&mut self, size: usize, separate: bool, align: usize) -> MemChunk;

    /// Releases a live chunk for reuse.
    fn free(&mut self, chunk: &MemChunk) -> bool;

    /// Drops all bookkeeping.
    ///
    /// With `all_release` the raw memory goes back to the source as well;
    /// without it the raw blocks are kept for an immediate re-plan.
    fn release(&mut self, all_release: bool);

    /// Bytes currently obtained (or planned, for deferred strategies) from
    /// the raw source.
    fn total_size(&self) -> usize;

    /// Opens a region whose frees are not reused until it closes.
    fn barrier_begin(&mut self);

    /// Closes the innermost barrier.
    fn barrier_end(&mut self);

    /// Opens a group of allocations that must not alias each other.
    fn begin_group(&mut self);

    /// Closes the innermost group.
    ///
    /// Frees made inside an outermost group stay unusable until the next
    /// outermost barrier closes, so sibling groups never share a buffer.
    fn end_group(&mut self);

    /// Forgets everything and returns all memory to the raw source.
    fn reset(&mut self) {
        self.release(true);
    }

    /// Resolves deferred addresses.
    ///
    /// Immediate strategies have nothing to resolve and succeed. An error
    /// means the plan cannot be placed and must be discarded.
    fn compute(&mut self) -> Result<()> {
        Ok(())
    }
}
