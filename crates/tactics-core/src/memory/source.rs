//! Raw memory sources.
//!
//! A [`BufferAllocator`] never touches the system heap directly. It asks an
//! [`Allocator`] for raw blocks and hands them back when it releases them.
//!
//! - [`DefaultAllocator`] - aligned heap allocation
//! - [`RecurseAllocator`] - rents blocks from a parent [`BufferAllocator`],
//!   so a per-graph arena can live inside a per-process one
//!
//! Sources are shared through `Rc`: several buffer allocators may draw from
//! one source as long as a single execution context drives all of them.

// Raw heap allocation requires unsafe code
#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use tactics_common::memory::{MEMORY_ALIGN_DEFAULT, is_aligned};
use tactics_common::utils::hash::FxHashMap;

use super::BufferAllocator;
use super::chunk::MemChunk;

/// Source of untyped memory for a buffer allocator.
pub trait Allocator {
    /// Obtains a block of at least `size` bytes aligned to `align`.
    ///
    /// Returns an invalid chunk when the source is exhausted.
    fn on_alloc(&self, size: usize, align: usize) -> MemChunk;

    /// Returns a block previously obtained from [`on_alloc`](Self::on_alloc).
    fn on_release(&self, chunk: MemChunk);
}

/// Creates the default heap-backed source.
#[must_use]
pub fn create_default() -> Rc<dyn Allocator> {
    Rc::new(DefaultAllocator::new())
}

/// Creates a source that rents its blocks from `parent`.
#[must_use]
pub fn create_recurse(parent: Rc<RefCell<dyn BufferAllocator>>) -> Rc<dyn Allocator> {
    Rc::new(RecurseAllocator::new(parent))
}

/// Aligned heap allocation through the global allocator.
///
/// The layout of every outstanding block is remembered so it can be released
/// with the layout it was allocated with. Blocks still outstanding when the
/// source is dropped are reclaimed.
#[derive(Debug, Default)]
pub struct DefaultAllocator {
    blocks: RefCell<FxHashMap<usize, (NonNull<u8>, Layout)>>,
    reserved: Cell<usize>,
}

impl DefaultAllocator {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks handed out and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.blocks.borrow().len()
    }

    /// Bytes currently handed out.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.get()
    }
}

impl Allocator for DefaultAllocator {
    fn on_alloc(&self, size: usize, align: usize) -> MemChunk {
        debug_assert!(size > 0, "zero-sized raw allocation");
        if size == 0 {
            return MemChunk::default();
        }
        let align = if align == 0 { MEMORY_ALIGN_DEFAULT } else { align };
        let Ok(layout) = Layout::from_size_align(size, align) else {
            tracing::warn!("Invalid raw layout: size {}, align {}", size, align);
            return MemChunk::default();
        };

        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(ptr) else {
            tracing::warn!("Raw allocation of {} bytes failed", size);
            return MemChunk::default();
        };

        debug_assert!(is_aligned(base.as_ptr() as usize, align));
        self.blocks
            .borrow_mut()
            .insert(base.as_ptr() as usize, (base, layout));
        self.reserved.set(self.reserved.get() + size);
        tracing::debug!("Raw block of {} bytes at {:p}", size, base.as_ptr());
        MemChunk::new(base, 0)
    }

    fn on_release(&self, chunk: MemChunk) {
        let addr = chunk.base() as usize;
        let Some((base, layout)) = self.blocks.borrow_mut().remove(&addr) else {
            debug_assert!(false, "release of unknown raw block {:?}", chunk);
            tracing::error!("Release of unknown raw block {:?}", chunk);
            return;
        };
        self.reserved.set(self.reserved.get() - layout.size());
        tracing::debug!("Raw block of {} bytes at {:p} released", layout.size(), base.as_ptr());
        // SAFETY: `base` was allocated by `on_alloc` with exactly this layout
        // and has just been removed from the table, so it is freed once.
        unsafe { alloc::dealloc(base.as_ptr(), layout) };
    }
}

impl Drop for DefaultAllocator {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();
        if !blocks.is_empty() {
            tracing::warn!("Reclaiming {} raw blocks still outstanding", blocks.len());
        }
        for (_, (base, layout)) in blocks.drain() {
            // SAFETY: every table entry is a live block allocated with its layout.
            unsafe { alloc::dealloc(base.as_ptr(), layout) };
        }
    }
}

/// Source that forwards to a parent buffer allocator.
pub struct RecurseAllocator {
    parent: Rc<RefCell<dyn BufferAllocator>>,
}

impl RecurseAllocator {
    /// Creates a source renting from `parent`.
    #[must_use]
    pub fn new(parent: Rc<RefCell<dyn BufferAllocator>>) -> Self {
        Self { parent }
    }
}

impl Allocator for RecurseAllocator {
    fn on_alloc(&self, size: usize, align: usize) -> MemChunk {
        match self.parent.try_borrow_mut() {
            Ok(mut parent) => parent.alloc(size, false, align),
            Err(_) => {
                debug_assert!(false, "parent allocator re-entered");
                tracing::error!("Parent allocator is already borrowed");
                MemChunk::default()
            }
        }
    }

    fn on_release(&self, chunk: MemChunk) {
        match self.parent.try_borrow_mut() {
            Ok(mut parent) => {
                parent.free(&chunk);
            }
            Err(_) => {
                debug_assert!(false, "parent allocator re-entered");
                tracing::error!("Parent allocator is already borrowed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EagerBufferAllocator;

    #[test]
    fn test_default_alloc_release() {
        let source = DefaultAllocator::new();
        let chunk = source.on_alloc(100, 64);

        assert!(!chunk.invalid());
        assert_eq!(chunk.ptr() as usize % 64, 0);
        assert_eq!(source.outstanding(), 1);
        assert_eq!(source.reserved_bytes(), 100);

        source.on_release(chunk);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(source.reserved_bytes(), 0);
    }

    #[test]
    fn test_default_zero_align_uses_default() {
        let source = DefaultAllocator::new();
        let chunk = source.on_alloc(8, 0);
        assert_eq!(chunk.ptr() as usize % MEMORY_ALIGN_DEFAULT, 0);
        source.on_release(chunk);
    }

    #[test]
    fn test_default_rejects_bad_alignment() {
        let source = DefaultAllocator::new();
        assert!(source.on_alloc(64, 48).invalid());
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn test_default_drop_reclaims() {
        let source = DefaultAllocator::new();
        let _a = source.on_alloc(32, 16);
        let _b = source.on_alloc(32, 16);
        assert_eq!(source.outstanding(), 2);
        drop(source);
    }

    #[test]
    fn test_recurse_rents_from_parent() {
        let parent = Rc::new(RefCell::new(EagerBufferAllocator::new(create_default())));
        let source = RecurseAllocator::new(parent.clone());

        let chunk = source.on_alloc(256, 64);
        assert!(!chunk.invalid());
        assert_eq!(parent.borrow().total_size(), 256);

        source.on_release(chunk);
        // The parent keeps the block for reuse.
        assert_eq!(parent.borrow().total_size(), 256);
        let again = source.on_alloc(256, 64);
        assert_eq!(parent.borrow().total_size(), 256);
        source.on_release(again);
    }
}
