//! # tactics-core
//!
//! Memory arena subsystem for Tactics: buffer allocators that hand out tensor
//! storage during a graph resize pass, and the backend-facing pool that
//! drives them.
//!
//! This crate depends only on `tactics-common`.
//!
//! ## Modules
//!
//! - [`memory`] - Chunks, raw sources, and the eager and deferred strategies
//! - [`backend`] - Configuration, the per-backend memory pool, and the
//!   allocator registry

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod memory;

// Re-export commonly used types
pub use backend::{AllocatorKind, AllocatorRegistry, BackendConfig, MemoryMode, MemoryPool, StorageType};
pub use memory::{
    Allocator, BufferAllocator, DeferBufferAllocator, EagerBufferAllocator, MemChunk, create_default,
    create_recurse,
};
