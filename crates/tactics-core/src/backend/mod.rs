//! Backend-facing layer over the allocators.
//!
//! A backend owns one [`MemoryPool`]: a static eager allocator for buffers
//! that live as long as the backend, and a dynamic allocator (eager or
//! deferred, per [`BackendConfig`]) that rents from it for buffers planned
//! during a resize pass. Raw sources are looked up by name in an
//! [`AllocatorRegistry`].

pub mod config;
pub mod pool;
pub mod registry;

pub use config::{AllocatorKind, BackendConfig, MemoryMode};
pub use pool::{MemoryPool, StorageType};
pub use registry::{AllocatorRegistry, DEFAULT_SOURCE};
