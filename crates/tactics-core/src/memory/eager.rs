//! Immediate-reuse allocator over a size-ordered free list.
//!
//! Every raw block starts as one node. Serving a request from a larger free
//! node shrinks it to the requested size and links a free remainder node in
//! after it, so the nodes of a block always tile it in address order. A
//! freed node fuses with whichever neighbours in the same block are free,
//! so any run of adjacent free bytes is a single free-list entry.

use std::collections::BTreeSet;
use std::rc::Rc;

use tactics_common::memory::{MEMORY_ALIGN_DEFAULT, align_up};
use tactics_common::utils::hash::FxHashMap;

use super::BufferAllocator;
use super::arena::{NodeArena, NodeId};
use super::chunk::{ChunkKey, MemChunk};
use super::scope::{ScopeKind, ScopeStack};
use super::source::Allocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    Used,
}

#[derive(Debug)]
struct Node {
    /// Raw block this node was carved from.
    block: MemChunk,
    /// Offset of the node inside `block`.
    offset: usize,
    size: usize,
    /// Address-order neighbours inside `block`.
    left: Option<NodeId>,
    right: Option<NodeId>,
    state: NodeState,
    separate: bool,
}

impl Node {
    fn whole(block: MemChunk, size: usize, separate: bool) -> Self {
        Self {
            block,
            offset: 0,
            size,
            left: None,
            right: None,
            state: NodeState::Used,
            separate,
        }
    }
}

/// Allocator that resolves addresses immediately and reuses freed blocks at
/// once.
///
/// Requests are rounded up to the configured alignment and served best-fit
/// by size from the free list; only when nothing fits is a new raw block
/// requested.
pub struct EagerBufferAllocator {
    allocator: Rc<dyn Allocator>,
    align: usize,
    nodes: NodeArena<Node>,
    /// Live chunks and the node backing each.
    used: FxHashMap<ChunkKey, NodeId>,
    /// Free nodes ordered by `(size, id)`.
    free_list: BTreeSet<(usize, NodeId)>,
    scopes: ScopeStack<NodeId>,
    total_size: usize,
}

impl EagerBufferAllocator {
    /// Creates an allocator with the default 64-byte alignment.
    #[must_use]
    pub fn new(allocator: Rc<dyn Allocator>) -> Self {
        Self::with_align(allocator, MEMORY_ALIGN_DEFAULT)
    }

    /// Creates an allocator with a custom alignment (a power of two).
    #[must_use]
    pub fn with_align(allocator: Rc<dyn Allocator>, align: usize) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self {
            allocator,
            align: align.max(1),
            nodes: NodeArena::new(),
            used: FxHashMap::default(),
            free_list: BTreeSet::new(),
            scopes: ScopeStack::new(),
            total_size: 0,
        }
    }

    /// Configured alignment.
    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Number of live chunks.
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        self.used.len()
    }

    /// Number of blocks on the free list.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Bytes on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_list.iter().map(|&(size, _)| size).sum()
    }

    /// Bytes needed in front of `offset` to reach `align`.
    fn padding(block: &MemChunk, offset: usize, align: usize) -> usize {
        let position = if block.is_resolved() {
            block.ptr() as usize + offset
        } else {
            block.offset() + offset
        };
        align_up(position, align) - position
    }

    /// Serves `size` bytes from the free list, splitting when the best fit
    /// is larger than needed.
    fn take_free(&mut self, size: usize, align: usize) -> Option<MemChunk> {
        let needs_padding = self.align % align != 0;
        let search = if needs_padding { size + align - 1 } else { size };
        let &(node_size, id) = self.free_list.range((search, NodeId::MIN)..).next()?;
        self.free_list.remove(&(node_size, id));

        let (block, offset, right) = {
            let node = &self.nodes[id];
            (node.block.clone(), node.offset, node.right)
        };
        let padding = if needs_padding {
            Self::padding(&block, offset, align)
        } else {
            0
        };

        let chunk = &block + (offset + padding);
        let taken = align_up(size + padding, self.align);
        self.nodes[id].state = NodeState::Used;
        self.used.insert(chunk.key(), id);
        if taken >= node_size {
            return Some(chunk);
        }

        let rest = node_size - taken;
        let remainder = self.nodes.insert(Node {
            block,
            offset: offset + taken,
            size: rest,
            left: Some(id),
            right,
            state: NodeState::Free,
            separate: false,
        });
        if let Some(right) = right {
            self.nodes[right].left = Some(remainder);
        }
        let node = &mut self.nodes[id];
        node.size = taken;
        node.right = Some(remainder);

        self.free_list.insert((rest, remainder));
        tracing::trace!("Split {} bytes into {} + {}", node_size, taken, rest);
        Some(chunk)
    }

    /// Absorbs `right` into its left neighbour `left` and returns `left`.
    fn fuse_to_left(&mut self, left: NodeId, right: NodeId) -> NodeId {
        let Some(absorbed) = self.nodes.remove(right) else {
            return left;
        };
        if let Some(next) = absorbed.right {
            self.nodes[next].left = Some(left);
        }
        let node = &mut self.nodes[left];
        tracing::trace!("Fused {} + {} bytes", node.size, absorbed.size);
        node.size += absorbed.size;
        node.right = absorbed.right;
        left
    }

    /// Puts a freed node back on the free list, fused with any free
    /// neighbours in its block.
    fn return_memory(&mut self, id: NodeId) {
        if self.nodes[id].separate {
            if let Some(node) = self.nodes.remove(id) {
                self.total_size -= node.size;
                self.allocator.on_release(node.block);
            }
            return;
        }

        let node = &mut self.nodes[id];
        node.state = NodeState::Free;
        let (left, right) = (node.left, node.right);

        let mut id = id;
        if let Some(right) = right.filter(|&right| self.nodes[right].state == NodeState::Free) {
            self.free_list.remove(&(self.nodes[right].size, right));
            id = self.fuse_to_left(id, right);
        }
        if let Some(left) = left.filter(|&left| self.nodes[left].state == NodeState::Free) {
            self.free_list.remove(&(self.nodes[left].size, left));
            id = self.fuse_to_left(left, id);
        }
        self.free_list.insert((self.nodes[id].size, id));
    }

    /// Ids of the first node of every raw block.
    fn heads(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.left.is_none())
            .map(|(id, _)| id)
            .collect()
    }
}

impl BufferAllocator for EagerBufferAllocator {
    fn alloc(&mut self, size: usize, separate: bool, align: usize) -> MemChunk {
        debug_assert!(size > 0, "zero-sized allocation");
        if size == 0 {
            tracing::error!("Zero-sized allocation requested");
            return MemChunk::default();
        }
        let align = if align == 0 { self.align } else { align };
        let size = align_up(size, self.align);

        if !separate {
            if let Some(chunk) = self.take_free(size, align) {
                return chunk;
            }
        }

        let chunk = self.allocator.on_alloc(size, align.max(self.align));
        if chunk.invalid() {
            tracing::warn!("Raw source exhausted while allocating {} bytes", size);
            return chunk;
        }
        self.total_size += size;
        let id = self.nodes.insert(Node::whole(chunk.clone(), size, separate));
        self.used.insert(chunk.key(), id);
        chunk
    }

    fn free(&mut self, chunk: &MemChunk) -> bool {
        let Some(id) = self.used.remove(&chunk.key()) else {
            debug_assert!(false, "free of a chunk that is not live: {:?}", chunk);
            tracing::error!("Free of a chunk that is not live: {:?}", chunk);
            return false;
        };
        if let Some(id) = self.scopes.park(id) {
            self.return_memory(id);
        }
        true
    }

    fn release(&mut self, all_release: bool) {
        self.scopes.drain();
        self.used.clear();
        self.free_list.clear();

        if all_release {
            for id in self.heads() {
                self.allocator.on_release(self.nodes[id].block.clone());
            }
            self.nodes.clear();
            self.total_size = 0;
            return;
        }

        // Keep every raw block, each as a single free node.
        for id in self.heads() {
            if self.nodes[id].separate {
                if let Some(node) = self.nodes.remove(id) {
                    self.total_size -= node.size;
                    self.allocator.on_release(node.block);
                }
                continue;
            }
            while let Some(right) = self.nodes[id].right {
                self.fuse_to_left(id, right);
            }
            let node = &mut self.nodes[id];
            node.state = NodeState::Free;
            self.free_list.insert((node.size, id));
        }
    }

    fn total_size(&self) -> usize {
        self.total_size
    }

    fn barrier_begin(&mut self) {
        self.scopes.open(ScopeKind::Barrier);
    }

    fn barrier_end(&mut self) {
        for id in self.scopes.close(ScopeKind::Barrier) {
            self.return_memory(id);
        }
    }

    fn begin_group(&mut self) {
        self.scopes.open(ScopeKind::Group);
    }

    fn end_group(&mut self) {
        for id in self.scopes.close(ScopeKind::Group) {
            self.return_memory(id);
        }
    }
}

impl Drop for EagerBufferAllocator {
    fn drop(&mut self) {
        self.release(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::source::DefaultAllocator;

    fn allocator() -> (Rc<DefaultAllocator>, EagerBufferAllocator) {
        let source = Rc::new(DefaultAllocator::new());
        let eager = EagerBufferAllocator::new(source.clone());
        (source, eager)
    }

    #[test]
    fn test_best_fit_reuses_freed_block() {
        let (source, mut eager) = allocator();

        let a = eager.alloc(256, false, 0);
        let _b = eager.alloc(128, false, 0);
        assert_eq!(eager.total_size(), 384);
        assert_eq!(source.outstanding(), 2);

        assert!(eager.free(&a));
        let c = eager.alloc(200, false, 0);
        assert_eq!(c.ptr(), a.ptr());
        assert_eq!(eager.total_size(), 384);
        assert_eq!(source.outstanding(), 2);
    }

    #[test]
    fn test_split_and_merge() {
        let (_source, mut eager) = allocator();

        let whole = eager.alloc(512, false, 0);
        eager.free(&whole);

        let a = eager.alloc(128, false, 0);
        let b = eager.alloc(128, false, 0);
        assert_eq!(a.ptr(), whole.ptr());
        assert_eq!(b.ptr(), whole.ptr().wrapping_add(128));
        assert_eq!(eager.free_bytes(), 256);

        eager.free(&a);
        eager.free(&b);
        assert_eq!(eager.free_blocks(), 1);
        assert_eq!(eager.free_bytes(), 512);

        let c = eager.alloc(512, false, 0);
        assert_eq!(c.ptr(), whole.ptr());
        assert_eq!(eager.total_size(), 512);
    }

    #[test]
    fn test_free_fuses_both_neighbours() {
        let (_source, mut eager) = allocator();

        let whole = eager.alloc(256, false, 0);
        eager.free(&whole);
        let a = eager.alloc(64, false, 0);
        let b = eager.alloc(64, false, 0);
        let c = eager.alloc(64, false, 0);

        eager.free(&a);
        eager.free(&c);
        assert_eq!(eager.free_blocks(), 2);

        eager.free(&b);
        assert_eq!(eager.free_blocks(), 1);
        assert_eq!(eager.free_bytes(), 256);
    }

    #[test]
    fn test_partial_free_keeps_split() {
        let (_source, mut eager) = allocator();

        let whole = eager.alloc(256, false, 0);
        eager.free(&whole);
        let a = eager.alloc(64, false, 0);
        let b = eager.alloc(64, false, 0);

        eager.free(&a);
        // `b` is still live, so the block cannot be reassembled.
        let c = eager.alloc(256, false, 0);
        assert_ne!(c.ptr(), whole.ptr());
        assert_eq!(eager.total_size(), 512);

        eager.free(&b);
        eager.free(&c);
        assert_eq!(eager.free_blocks(), 2);
    }

    #[test]
    fn test_separate_is_never_reused() {
        let (source, mut eager) = allocator();

        let big = eager.alloc(1 << 20, true, 0);
        let small = eager.alloc(64, false, 0);
        assert_ne!(small.ptr(), big.ptr());
        assert_eq!(eager.total_size(), (1 << 20) + 64);

        eager.free(&big);
        assert_eq!(eager.total_size(), 64);
        assert_eq!(source.outstanding(), 1);
    }

    #[test]
    fn test_separate_skips_free_list() {
        let (_source, mut eager) = allocator();

        let a = eager.alloc(256, false, 0);
        eager.free(&a);
        let b = eager.alloc(256, true, 0);
        assert_ne!(b.ptr(), a.ptr());
        assert_eq!(eager.free_blocks(), 1);
    }

    #[test]
    fn test_barrier_defers_reuse() {
        let (_source, mut eager) = allocator();

        let a = eager.alloc(256, false, 0);
        eager.barrier_begin();
        eager.free(&a);
        let b = eager.alloc(256, false, 0);
        assert_ne!(b.ptr(), a.ptr());
        eager.barrier_end();

        let c = eager.alloc(256, false, 0);
        assert_eq!(c.ptr(), a.ptr());
    }

    #[test]
    fn test_group_inside_barrier() {
        let (_source, mut eager) = allocator();

        let a = eager.alloc(128, false, 0);
        eager.barrier_begin();
        eager.begin_group();
        eager.free(&a);
        eager.end_group();

        eager.begin_group();
        let b = eager.alloc(128, false, 0);
        assert_ne!(b.ptr(), a.ptr());
        eager.end_group();
        eager.barrier_end();

        let c = eager.alloc(128, false, 0);
        assert_eq!(c.ptr(), a.ptr());
    }

    #[test]
    fn test_coarse_alignment_padding() {
        let (_source, mut eager) = allocator();

        let whole = eager.alloc(512, false, 0);
        eager.free(&whole);

        let a = eager.alloc(64, false, 128);
        assert_eq!(a.ptr() as usize % 128, 0);
        assert_eq!(eager.total_size(), 512);

        eager.free(&a);
        assert_eq!(eager.free_blocks(), 1);
    }

    #[test]
    fn test_release_keeps_raw_blocks() {
        let (source, mut eager) = allocator();

        let a = eager.alloc(256, false, 0);
        let _b = eager.alloc(128, false, 0);
        let _s = eager.alloc(64, true, 0);
        eager.free(&a);
        let _c = eager.alloc(64, false, 0);

        eager.release(false);
        assert_eq!(eager.live_chunks(), 0);
        assert_eq!(eager.total_size(), 384);
        assert_eq!(eager.free_bytes(), 384);
        assert_eq!(source.outstanding(), 2);

        let d = eager.alloc(256, false, 0);
        assert_eq!(d.ptr(), a.ptr());
        assert_eq!(eager.total_size(), 384);
    }

    #[test]
    fn test_release_all_returns_everything() {
        let (source, mut eager) = allocator();

        let a = eager.alloc(512, false, 0);
        eager.free(&a);
        let _b = eager.alloc(64, false, 0);
        let _c = eager.alloc(1000, false, 0);

        eager.release(true);
        assert_eq!(eager.total_size(), 0);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(eager.free_blocks(), 0);
    }

    #[test]
    fn test_drop_returns_memory() {
        let (source, mut eager) = allocator();
        let _a = eager.alloc(64, false, 0);
        drop(eager);
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "free of a chunk that is not live")]
    fn test_double_free_panics_in_debug() {
        let (_source, mut eager) = allocator();
        let a = eager.alloc(64, false, 0);
        eager.free(&a);
        eager.free(&a);
    }
}
