//! Deferred allocator that plans intervals and resolves them in one pass.
//!
//! Allocation and free only edit an address-ordered chain of interval nodes;
//! no raw memory is touched until [`compute`](BufferAllocator::compute).
//! A free node that borders another free node is fused into it, and the
//! absorbed node is remembered as a child at its offset inside the survivor.
//! `compute` acquires one backing block sized for the whole chain, walks it
//! assigning offsets, resolves every fused child below its parent, and hands
//! each attached tensor its final address through the apply function.

use std::collections::BTreeSet;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tactics_common::memory::{MEMORY_ALIGN_DEFAULT, align_up};
use tactics_common::types::TensorHandle;
use tactics_common::utils::error::{Error, Result};

use super::BufferAllocator;
use super::arena::{NodeArena, NodeId};
use super::chunk::{MemChunk, NodeCell};
use super::scope::{ScopeKind, ScopeStack};
use super::source::Allocator;

/// Callback invoked by `compute()` for every attached tensor with the
/// backing base pointer and the byte offset of the tensor's interval.
pub type ApplyFn = Box<dyn FnMut(*mut u8, usize, TensorHandle)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
    Free,
    Used,
    /// Freed inside an open barrier or group.
    Parked,
}

#[derive(Debug)]
struct MemNode {
    size: usize,
    usage: Usage,
    left: Option<NodeId>,
    right: Option<NodeId>,
    /// Offset inside the node this one was fused into.
    fused_offset: usize,
    children: SmallVec<[NodeId; 2]>,
    cell: Rc<NodeCell>,
    /// Alignment of a node kept outside the chain.
    separate: Option<usize>,
}

impl MemNode {
    fn new(id: NodeId, size: usize, usage: Usage, separate: Option<usize>) -> Self {
        Self {
            size,
            usage,
            left: None,
            right: None,
            fused_offset: 0,
            children: SmallVec::new(),
            cell: NodeCell::new(id),
            separate,
        }
    }
}

/// One interval of the current plan, in address order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSnapshot {
    /// Planned offset inside the backing block.
    pub offset: usize,
    /// Interval size in bytes.
    pub size: usize,
    /// Whether a live chunk occupies the interval.
    pub used: bool,
    /// Whether the interval sits outside the reusable chain.
    pub separate: bool,
    /// Tensors attached to the interval and everything fused into it.
    pub tensors: usize,
}

/// Allocator that records an interval plan and resolves every address at
/// once in [`compute`](BufferAllocator::compute).
///
/// Chunks handed out are deferred: [`MemChunk::ptr`] is meaningless until the
/// next successful `compute`. Requests are served best-fit from free
/// intervals; when nothing fits, the largest free interval is enlarged, and
/// only when there is none is a new interval appended to the chain.
pub struct DeferBufferAllocator {
    allocator: Rc<dyn Allocator>,
    align: usize,
    nodes: NodeArena<MemNode>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    /// Free chain nodes ordered by `(size, id)`.
    free_index: BTreeSet<(usize, NodeId)>,
    /// Nodes placed after the chain, in allocation order.
    separate: Vec<NodeId>,
    backing: MemChunk,
    backing_size: usize,
    backing_align: usize,
    total_size: usize,
    scopes: ScopeStack<NodeId>,
    apply: Option<ApplyFn>,
}

impl DeferBufferAllocator {
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
            head: None,
            tail: None,
            free_index: BTreeSet::new(),
            separate: Vec::new(),
            backing: MemChunk::default(),
            backing_size: 0,
            backing_align: 0,
            total_size: 0,
            scopes: ScopeStack::new(),
            apply: None,
        }
    }

    /// Installs the function `compute()` calls for every attached tensor.
    #[must_use]
    pub fn with_apply_fn(mut self, apply: impl FnMut(*mut u8, usize, TensorHandle) + 'static) -> Self {
        self.set_apply_fn(Box::new(apply));
        self
    }

    /// Replaces the apply function.
    pub fn set_apply_fn(&mut self, apply: ApplyFn) {
        self.apply = Some(apply);
    }

    /// Configured alignment.
    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Size of the backing block held from the raw source, zero if none.
    #[must_use]
    pub fn backing_size(&self) -> usize {
        self.backing_size
    }

    /// Number of free intervals in the chain.
    #[must_use]
    pub fn free_intervals(&self) -> usize {
        self.free_index.len()
    }

    /// Current plan in address order: the chain first, then the separate
    /// intervals at the offsets `compute()` would give them.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IntervalSnapshot> {
        let mut intervals = Vec::new();
        let mut offset = 0;
        for id in self.chain() {
            let node = &self.nodes[id];
            intervals.push(self.describe(id, offset));
            offset += node.size;
        }
        let (separate_offsets, _, _) = self.separate_layout(offset);
        for (&id, &offset) in self.separate.iter().zip(&separate_offsets) {
            intervals.push(self.describe(id, offset));
        }
        intervals
    }

    fn describe(&self, id: NodeId, offset: usize) -> IntervalSnapshot {
        let node = &self.nodes[id];
        let mut tensors = 0;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            tensors += node.cell.tensors.borrow().len();
            stack.extend(node.children.iter().copied());
        }
        IntervalSnapshot {
            offset,
            size: node.size,
            used: node.usage != Usage::Free,
            separate: node.separate.is_some(),
            tensors,
        }
    }

    fn chain(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.head, |&id| self.nodes[id].right)
    }

    /// Offsets of the separate nodes placed after a chain of `chain_size`
    /// bytes, the total footprint, and the strictest alignment involved.
    fn separate_layout(&self, chain_size: usize) -> (Vec<usize>, usize, usize) {
        let mut offsets = Vec::with_capacity(self.separate.len());
        let mut footprint = chain_size;
        let mut max_align = self.align;
        for &id in &self.separate {
            let node = &self.nodes[id];
            let align = node.separate.unwrap_or(self.align);
            footprint = align_up(footprint, align);
            offsets.push(footprint);
            footprint += node.size;
            max_align = max_align.max(align);
        }
        (offsets, footprint, max_align)
    }

    fn create_node(&mut self, size: usize, usage: Usage, separate: Option<usize>) -> NodeId {
        self.nodes
            .insert_with(|id| MemNode::new(id, size, usage, separate))
    }

    /// Links `id` into the chain after `pos`, or at the tail.
    fn insert_after(&mut self, id: NodeId, pos: Option<NodeId>) {
        let left = pos.or(self.tail);
        let right = match left {
            Some(left) => self.nodes[left].right,
            None => None,
        };
        {
            let node = &mut self.nodes[id];
            node.left = left;
            node.right = right;
        }
        match left {
            Some(left) => self.nodes[left].right = Some(id),
            None => self.head = Some(id),
        }
        match right {
            Some(right) => self.nodes[right].left = Some(id),
            None => self.tail = Some(id),
        }
    }

    /// Unlinks `id` from the chain.
    fn erase_node(&mut self, id: NodeId) {
        let (left, right) = {
            let node = &mut self.nodes[id];
            (node.left.take(), node.right.take())
        };
        match left {
            Some(left) => self.nodes[left].right = right,
            None => self.head = right,
        }
        match right {
            Some(right) => self.nodes[right].left = left,
            None => self.tail = left,
        }
    }

    /// Absorbs `right` into its left neighbour `left` and returns `left`.
    fn fuse_to_left(&mut self, left: NodeId, right: NodeId) -> NodeId {
        let left_size = self.nodes[left].size;
        let right_size = {
            let node = &mut self.nodes[right];
            node.fused_offset = left_size;
            node.usage = Usage::Free;
            node.size
        };
        self.erase_node(right);
        let node = &mut self.nodes[left];
        node.size += right_size;
        node.children.push(right);
        tracing::trace!("Fused {} + {} bytes", left_size, right_size);
        left
    }

    /// Looks up the node behind a live chunk handed out by this allocator.
    fn live_node(&self, chunk: &MemChunk) -> Option<NodeId> {
        let cell = chunk.node()?;
        let node = self.nodes.get(cell.id)?;
        let live = Rc::ptr_eq(&node.cell, cell)
            && node.usage == Usage::Used
            && chunk.local_offset() == 0;
        live.then_some(cell.id)
    }

    /// Makes a freed node reusable, fusing it with free neighbours.
    fn return_memory(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.usage = Usage::Free;
        // Separate intervals stay reserved until the next release.
        if node.separate.is_some() {
            return;
        }
        let (left, right) = (node.left, node.right);

        let mut id = id;
        if let Some(left) = left.filter(|&left| self.nodes[left].usage == Usage::Free) {
            self.free_index.remove(&(self.nodes[left].size, left));
            id = self.fuse_to_left(left, id);
        }
        if let Some(right) = right.filter(|&right| self.nodes[right].usage == Usage::Free) {
            self.free_index.remove(&(self.nodes[right].size, right));
            id = self.fuse_to_left(id, right);
        }
        self.free_index.insert((self.nodes[id].size, id));
    }

    /// Assigns `offset` to `root` and every node fused below it, then runs
    /// the apply function for their tensors.
    fn resolve_tree(
        nodes: &NodeArena<MemNode>,
        apply: &mut Option<ApplyFn>,
        root: NodeId,
        base: *mut u8,
        offset: usize,
    ) {
        let mut stack = vec![(root, offset)];
        while let Some((id, offset)) = stack.pop() {
            let node = &nodes[id];
            node.cell.resolve(base, offset);
            for &child in &node.children {
                stack.push((child, offset + nodes[child].fused_offset));
            }
            if let Some(apply) = apply.as_mut() {
                let tensors = node.cell.tensors.borrow().clone();
                for tensor in tensors {
                    apply(base, offset, tensor);
                }
            }
        }
    }

    /// Makes sure the backing block can hold `footprint` bytes at `align`.
    fn ensure_backing(&mut self, footprint: usize, align: usize) -> Result<()> {
        if !self.backing.invalid() && self.backing_size >= footprint && self.backing_align >= align {
            return Ok(());
        }
        if !self.backing.invalid() {
            let old = std::mem::take(&mut self.backing);
            self.allocator.on_release(old);
            self.backing_size = 0;
            self.backing_align = 0;
        }
        let backing = self.allocator.on_alloc(footprint, align);
        if backing.invalid() {
            tracing::warn!("Raw source exhausted while placing a {} byte plan", footprint);
            return Err(Error::OutOfMemory {
                requested: footprint,
                align,
            });
        }
        tracing::debug!("Acquired backing block of {} bytes", footprint);
        self.backing = backing;
        self.backing_size = footprint;
        self.backing_align = align;
        Ok(())
    }
}

impl BufferAllocator for DeferBufferAllocator {
    fn alloc(&mut self, size: usize, separate: bool, align: usize) -> MemChunk {
        debug_assert!(size > 0, "zero-sized allocation");
        if size == 0 {
            tracing::error!("Zero-sized allocation requested");
            return MemChunk::default();
        }
        let align = if align == 0 { self.align } else { align };
        let size = align_up(size, self.align);

        // Chain offsets are only multiples of the base alignment.
        if separate || self.align % align != 0 {
            let id = self.create_node(size, Usage::Used, Some(align.max(self.align)));
            self.separate.push(id);
            self.total_size += size;
            return MemChunk::from_node(self.nodes[id].cell.clone());
        }

        let best_fit = self.free_index.range((size, NodeId::MIN)..).next().copied();
        let id = if let Some((found, id)) = best_fit {
            self.free_index.remove(&(found, id));
            if found > size {
                self.nodes[id].size = size;
                let rest = self.create_node(found - size, Usage::Free, None);
                self.insert_after(rest, Some(id));
                self.free_index.insert((found - size, rest));
                tracing::trace!("Split {} bytes into {} + {}", found, size, found - size);
            }
            id
        } else if let Some((largest, id)) = self.free_index.pop_last() {
            self.nodes[id].size = size;
            self.total_size += size - largest;
            tracing::trace!("Enlarged free interval from {} to {} bytes", largest, size);
            id
        } else {
            let id = self.create_node(size, Usage::Used, None);
            self.insert_after(id, None);
            self.total_size += size;
            id
        };

        let node = &mut self.nodes[id];
        node.usage = Usage::Used;
        MemChunk::from_node(node.cell.clone())
    }

    fn free(&mut self, chunk: &MemChunk) -> bool {
        let Some(id) = self.live_node(chunk) else {
            debug_assert!(false, "free of a chunk that is not live: {:?}", chunk);
            tracing::error!("Free of a chunk that is not live: {:?}", chunk);
            return false;
        };
        match self.scopes.park(id) {
            Some(id) => self.return_memory(id),
            None => self.nodes[id].usage = Usage::Parked,
        }
        true
    }

    fn release(&mut self, all_release: bool) {
        self.scopes.drain();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        self.free_index.clear();
        self.separate.clear();
        self.total_size = 0;

        if all_release && !self.backing.invalid() {
            let backing = std::mem::take(&mut self.backing);
            self.allocator.on_release(backing);
            self.backing_size = 0;
            self.backing_align = 0;
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

    fn compute(&mut self) -> Result<()> {
        debug_assert!(self.scopes.is_empty(), "compute() inside an open barrier or group");
        let chain_size: usize = self.chain().map(|id| self.nodes[id].size).sum();
        let (separate_offsets, footprint, align) = self.separate_layout(chain_size);
        if footprint == 0 {
            return Ok(());
        }

        self.ensure_backing(footprint, align)?;
        if !self.backing.is_resolved() {
            tracing::error!("Backing block {:?} is unresolved", self.backing);
            return Err(Error::UnresolvedBacking);
        }
        let base = self.backing.ptr();

        let mut offset = 0;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            Self::resolve_tree(&self.nodes, &mut self.apply, id, base, offset);
            let node = &self.nodes[id];
            offset += node.size;
            cursor = node.right;
        }
        for (&id, &offset) in self.separate.iter().zip(&separate_offsets) {
            Self::resolve_tree(&self.nodes, &mut self.apply, id, base, offset);
        }
        tracing::debug!(
            "Resolved plan of {} bytes ({} nodes, {} separate)",
            footprint,
            self.nodes.len(),
            self.separate.len()
        );
        Ok(())
    }
}

impl Drop for DeferBufferAllocator {
    fn drop(&mut self) {
        self.release(true);
    }
}
