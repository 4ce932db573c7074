//! Handles to byte ranges inside an arena.
//!
//! A [`MemChunk`] is addressed one of two ways:
//!
//! - **Pointer**: a concrete base pointer plus a byte offset. Produced by raw
//!   sources and by the eager allocator.
//! - **Node**: a shared reference to a deferred allocator's interval node plus
//!   a local byte offset. The node's base and offset are filled in by
//!   `compute()`, so the address is `base + node_offset + local_offset`.
//!
//! A chunk with neither is the canonical invalid/out-of-memory value.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Add;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use smallvec::SmallVec;
use tactics_common::types::TensorHandle;

use super::arena::NodeId;

/// Resolution state of a deferred interval node, shared with every chunk
/// that refers to it.
#[derive(Debug)]
pub(crate) struct NodeCell {
    /// Arena slot of the owning node.
    pub(crate) id: NodeId,
    /// Base pointer of the backing block, null until resolved.
    pub(crate) base: Cell<*mut u8>,
    /// Byte offset of the node inside the backing block.
    pub(crate) offset: Cell<usize>,
    /// Tensors mapped onto this node.
    pub(crate) tensors: RefCell<SmallVec<[TensorHandle; 2]>>,
}

impl NodeCell {
    pub(crate) fn new(id: NodeId) -> Rc<Self> {
        Rc::new(Self {
            id,
            base: Cell::new(ptr::null_mut()),
            offset: Cell::new(0),
            tensors: RefCell::new(SmallVec::new()),
        })
    }

    pub(crate) fn is_resolved(&self) -> bool {
        !self.base.get().is_null()
    }

    pub(crate) fn resolve(&self, base: *mut u8, offset: usize) {
        self.base.set(base);
        self.offset.set(offset);
    }
}

#[derive(Clone, Default)]
enum Target {
    #[default]
    None,
    Pointer(NonNull<u8>),
    Node(Rc<NodeCell>),
}

/// Identity of a chunk used as a bookkeeping key.
///
/// Two chunks have the same key when they were produced from the same base
/// (pointer or node) with the same local offset.
pub(crate) type ChunkKey = (usize, usize);

/// Handle to a byte range inside an arena.
#[derive(Clone, Default)]
pub struct MemChunk {
    target: Target,
    offset: usize,
}

impl MemChunk {
    /// Creates a pointer-addressed chunk.
    #[must_use]
    pub fn new(base: NonNull<u8>, offset: usize) -> Self {
        Self {
            target: Target::Pointer(base),
            offset,
        }
    }

    /// Creates a pointer-addressed chunk from a raw pointer.
    ///
    /// A null `base` yields the invalid chunk.
    #[must_use]
    pub fn from_raw(base: *mut u8, offset: usize) -> Self {
        match NonNull::new(base) {
            Some(base) => Self::new(base, offset),
            None => Self::default(),
        }
    }

    pub(crate) fn from_node(cell: Rc<NodeCell>) -> Self {
        Self {
            target: Target::Node(cell),
            offset: 0,
        }
    }

    /// Returns true if the chunk has no backing pointer or node.
    #[must_use]
    pub fn invalid(&self) -> bool {
        matches!(self.target, Target::None)
    }

    /// Returns true if the chunk refers to a deferred interval node.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self.target, Target::Node(_))
    }

    /// Returns true if [`ptr`](Self::ptr) yields a meaningful address.
    ///
    /// Deferred chunks resolve once their allocator has run `compute()`.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match &self.target {
            Target::None => false,
            Target::Pointer(_) => true,
            Target::Node(cell) => cell.is_resolved(),
        }
    }

    /// Base pointer of the range (the backing block for deferred chunks).
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        match &self.target {
            Target::None => ptr::null_mut(),
            Target::Pointer(base) => base.as_ptr(),
            Target::Node(cell) => cell.base.get(),
        }
    }

    /// Byte offset of the range from [`base`](Self::base).
    #[must_use]
    pub fn offset(&self) -> usize {
        match &self.target {
            Target::Node(cell) => cell.offset.get() + self.offset,
            _ => self.offset,
        }
    }

    /// Resolved address of the first byte.
    ///
    /// Deferred chunks must be resolved by `compute()` first.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        debug_assert!(
            self.invalid() || self.is_resolved(),
            "deferred chunk used before compute()"
        );
        self.base().wrapping_add(self.offset())
    }

    /// Records that `tensor` is mapped onto this chunk.
    ///
    /// Deferred allocators pass attached tensors to their apply function once
    /// the address is known. Pointer chunks are already resolved, so nothing
    /// is recorded for them.
    pub fn attach(&self, tensor: TensorHandle) {
        if let Target::Node(cell) = &self.target {
            cell.tensors.borrow_mut().push(tensor);
        }
    }

    /// Tensors attached through this chunk's node.
    #[must_use]
    pub fn attached(&self) -> Vec<TensorHandle> {
        match &self.target {
            Target::Node(cell) => cell.tensors.borrow().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Local offset, excluding any offset resolved for the node.
    pub(crate) fn local_offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn node(&self) -> Option<&Rc<NodeCell>> {
        match &self.target {
            Target::Node(cell) => Some(cell),
            _ => None,
        }
    }

    pub(crate) fn key(&self) -> ChunkKey {
        let identity = match &self.target {
            Target::None => 0,
            Target::Pointer(base) => base.as_ptr() as usize,
            Target::Node(cell) => Rc::as_ptr(cell) as usize,
        };
        (identity, self.offset)
    }
}

impl Add<usize> for MemChunk {
    type Output = MemChunk;

    fn add(mut self, extra: usize) -> MemChunk {
        self.offset += extra;
        self
    }
}

impl Add<usize> for &MemChunk {
    type Output = MemChunk;

    fn add(self, extra: usize) -> MemChunk {
        self.clone() + extra
    }
}

impl PartialEq for MemChunk {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for MemChunk {}

impl fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::None => write!(f, "MemChunk(INVALID)"),
            Target::Pointer(base) => write!(f, "MemChunk({:p} + {})", base.as_ptr(), self.offset),
            Target::Node(cell) => write!(
                f,
                "MemChunk(node {} @ {:p} + {} + {})",
                cell.id.index(),
                cell.base.get(),
                cell.offset.get(),
                self.offset
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_invalid() {
        let chunk = MemChunk::default();
        assert!(chunk.invalid());
        assert!(!chunk.is_resolved());
        assert!(chunk.base().is_null());
        assert_eq!(chunk.offset(), 0);
        assert!(MemChunk::from_raw(ptr::null_mut(), 16).invalid());
    }

    #[test]
    fn test_pointer_chunk_arithmetic() {
        let mut storage = [0u8; 64];
        let base = NonNull::new(storage.as_mut_ptr()).unwrap();
        let chunk = MemChunk::new(base, 8);

        assert!(!chunk.invalid());
        assert_eq!(chunk.ptr(), storage.as_mut_ptr().wrapping_add(8));

        let sub = &chunk + 16;
        assert_eq!(sub.base(), chunk.base());
        assert_eq!(sub.offset(), 24);
        assert_eq!(sub.ptr(), storage.as_mut_ptr().wrapping_add(24));
        assert_ne!(sub, chunk);
        assert_eq!(sub, chunk.clone() + 16);
    }

    #[test]
    fn test_node_chunk_resolution() {
        let mut storage = [0u8; 256];
        let cell = NodeCell::new(NodeId::MIN);
        let chunk = MemChunk::from_node(cell.clone());
        assert!(chunk.is_deferred());
        assert!(!chunk.is_resolved());

        cell.resolve(storage.as_mut_ptr(), 128);
        let sub = chunk.clone() + 4;
        assert!(sub.is_resolved());
        assert_eq!(sub.base(), storage.as_mut_ptr());
        assert_eq!(sub.offset(), 132);
        assert_eq!(sub.local_offset(), 4);
        assert_eq!(sub.ptr(), storage.as_mut_ptr().wrapping_add(132));
    }

    #[test]
    fn test_attach_records_on_node_only() {
        let cell = NodeCell::new(NodeId::MIN);
        let chunk = MemChunk::from_node(cell);
        chunk.attach(TensorHandle::new(1));
        (chunk.clone() + 8).attach(TensorHandle::new(2));
        assert_eq!(
            chunk.attached(),
            vec![TensorHandle::new(1), TensorHandle::new(2)]
        );

        let mut storage = [0u8; 8];
        let flat = MemChunk::from_raw(storage.as_mut_ptr(), 0);
        flat.attach(TensorHandle::new(3));
        assert!(flat.attached().is_empty());
    }
}
