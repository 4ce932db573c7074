//! Per-backend memory pool.
//!
//! Buffers come in three storage types:
//!
//! | Storage | On acquire | On release | On clear |
//! |---------|------------|------------|----------|
//! | [`Static`](StorageType::Static) | allocate | free | nothing |
//! | [`Dynamic`](StorageType::Dynamic) | allocate or reuse | collect for reuse | release |
//! | [`DynamicSeparate`](StorageType::DynamicSeparate) | allocate | nothing | release |
//!
//! Static buffers come from an eager allocator owned by the pool. The dynamic
//! allocator rents its raw blocks from that static allocator, so dynamic
//! memory dropped by a re-plan stays inside the pool.
//!
//! # Example
//!
//! ```rust
//! use tactics_common::TensorHandle;
//! use tactics_core::backend::{BackendConfig, MemoryPool, StorageType};
//! use tactics_core::memory::create_default;
//!
//! let mut pool = MemoryPool::new(create_default(), &BackendConfig::low_memory()).unwrap();
//! let (a, b) = (TensorHandle::new(1), TensorHandle::new(2));
//!
//! pool.on_resize_begin();
//! pool.on_acquire(a, 256, StorageType::Dynamic).unwrap();
//! pool.on_release(a, StorageType::Dynamic);
//! pool.on_acquire(b, 256, StorageType::Dynamic).unwrap();
//! pool.on_resize_end().unwrap();
//!
//! // `a` was dead before `b` was born, so they share storage.
//! assert_eq!(pool.tensor_address(a), pool.tensor_address(b));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tactics_common::types::TensorHandle;
use tactics_common::utils::error::{Error, Result};
use tactics_common::utils::hash::FxHashMap;

use super::config::{AllocatorKind, BackendConfig};
use crate::memory::{
    Allocator, BufferAllocator, DeferBufferAllocator, EagerBufferAllocator, MemChunk, create_recurse,
};

/// Lifetime class of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// Not reusable; lives until released or the pool is dropped.
    Static,
    /// Reusable once released.
    Dynamic,
    /// Not reusable; lives until the dynamic buffers are cleared.
    DynamicSeparate,
}

type AddressMap = Rc<RefCell<FxHashMap<TensorHandle, *mut u8>>>;

/// Owner of a backend's static and dynamic allocators.
pub struct MemoryPool {
    static_allocator: Rc<RefCell<EagerBufferAllocator>>,
    dynamic: Box<dyn BufferAllocator>,
    kind: AllocatorKind,
    align: usize,
    /// Buffers currently held, by tensor.
    buffers: FxHashMap<TensorHandle, (MemChunk, StorageType)>,
    /// Resolved addresses, shared with the deferred apply function.
    addresses: AddressMap,
}

impl MemoryPool {
    /// Creates a pool drawing raw memory from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(source: Rc<dyn Allocator>, config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let static_allocator = Rc::new(RefCell::new(EagerBufferAllocator::with_align(
            source,
            config.align,
        )));
        let parent: Rc<RefCell<dyn BufferAllocator>> = static_allocator.clone();
        let rented = create_recurse(parent);
        let addresses = AddressMap::default();

        let kind = config.dynamic_allocator();
        let dynamic: Box<dyn BufferAllocator> = match kind {
            AllocatorKind::Eager => Box::new(EagerBufferAllocator::with_align(rented, config.align)),
            AllocatorKind::Defer => {
                let sink = Rc::clone(&addresses);
                Box::new(
                    DeferBufferAllocator::with_align(rented, config.align).with_apply_fn(
                        move |base, offset, tensor| {
                            sink.borrow_mut().insert(tensor, base.wrapping_add(offset));
                        },
                    ),
                )
            }
        };
        tracing::debug!("Memory pool created with {:?} dynamic allocator", kind);

        Ok(Self {
            static_allocator,
            dynamic,
            kind,
            align: config.align,
            buffers: FxHashMap::default(),
            addresses,
        })
    }

    /// Strategy of the dynamic allocator.
    #[must_use]
    pub fn allocator_kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Bytes the static allocator holds from the raw source, including the
    /// blocks rented to the dynamic allocator.
    #[must_use]
    pub fn static_size(&self) -> usize {
        self.static_allocator.borrow().total_size()
    }

    /// Bytes the dynamic allocator holds or plans.
    #[must_use]
    pub fn dynamic_size(&self) -> usize {
        self.dynamic.total_size()
    }

    /// Starts a resize pass, dropping every dynamic buffer so it can be
    /// planned again. Raw blocks are kept.
    pub fn on_resize_begin(&mut self) {
        self.forget_dynamic();
        self.dynamic.release(false);
    }

    /// Ends a resize pass, resolving the dynamic plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the plan cannot be placed.
    pub fn on_resize_end(&mut self) -> Result<()> {
        self.dynamic.compute()?;
        tracing::debug!(
            "Resize pass resolved: {} static bytes, {} dynamic bytes",
            self.static_size(),
            self.dynamic_size()
        );
        Ok(())
    }

    /// Gives `tensor` a buffer of `size` bytes.
    ///
    /// A tensor that already holds a buffer has it released first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLayout`] for a zero size and
    /// [`Error::OutOfMemory`] when the raw source is exhausted.
    pub fn on_acquire(&mut self, tensor: TensorHandle, size: usize, storage: StorageType) -> Result<MemChunk> {
        if size == 0 {
            return Err(Error::InvalidLayout {
                size,
                align: self.align,
            });
        }
        if let Some(&(_, held)) = self.buffers.get(&tensor) {
            self.on_release(tensor, held);
        }

        let chunk = match storage {
            StorageType::Static => self.static_allocator.borrow_mut().alloc(size, false, 0),
            StorageType::Dynamic => self.dynamic.alloc(size, false, 0),
            StorageType::DynamicSeparate => self.dynamic.alloc(size, true, 0),
        };
        if chunk.invalid() {
            return Err(Error::OutOfMemory {
                requested: size,
                align: self.align,
            });
        }

        chunk.attach(tensor);
        {
            let mut addresses = self.addresses.borrow_mut();
            if chunk.is_resolved() {
                addresses.insert(tensor, chunk.ptr());
            } else {
                addresses.remove(&tensor);
            }
        }
        self.buffers.insert(tensor, (chunk.clone(), storage));
        tracing::trace!("Tensor {} acquired {} bytes ({:?})", tensor, size, storage);
        Ok(chunk)
    }

    /// Ends `tensor`'s use of its buffer.
    ///
    /// Returns false if the tensor holds no buffer of that storage type.
    /// The resolved address of a dynamic tensor stays readable until the
    /// next resize pass.
    pub fn on_release(&mut self, tensor: TensorHandle, storage: StorageType) -> bool {
        let Some((chunk, held)) = self.buffers.get(&tensor).cloned() else {
            tracing::warn!("Tensor {} released without a buffer", tensor);
            return false;
        };
        if held != storage {
            tracing::warn!("Tensor {} holds {:?} storage, not {:?}", tensor, held, storage);
            return false;
        }
        self.buffers.remove(&tensor);

        match storage {
            StorageType::Static => {
                self.addresses.borrow_mut().remove(&tensor);
                self.static_allocator.borrow_mut().free(&chunk)
            }
            StorageType::Dynamic => self.dynamic.free(&chunk),
            StorageType::DynamicSeparate => true,
        }
    }

    /// Releases every dynamic buffer and returns the dynamic allocator's
    /// memory to the static allocator. Static buffers are untouched.
    pub fn on_clear_buffer(&mut self) {
        self.forget_dynamic();
        self.dynamic.release(true);
    }

    /// Opens a barrier on the dynamic allocator.
    pub fn barrier_begin(&mut self) {
        self.dynamic.barrier_begin();
    }

    /// Closes the innermost barrier on the dynamic allocator.
    pub fn barrier_end(&mut self) {
        self.dynamic.barrier_end();
    }

    /// Opens a group on the dynamic allocator.
    pub fn begin_group(&mut self) {
        self.dynamic.begin_group();
    }

    /// Closes the innermost group on the dynamic allocator.
    pub fn end_group(&mut self) {
        self.dynamic.end_group();
    }

    /// Buffer currently held by `tensor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTensor`] if the tensor holds no buffer.
    pub fn buffer(&self, tensor: TensorHandle) -> Result<MemChunk> {
        self.buffers
            .get(&tensor)
            .map(|(chunk, _)| chunk.clone())
            .ok_or(Error::UnknownTensor(tensor))
    }

    /// Resolved address of `tensor`'s buffer.
    ///
    /// None until the address is known: deferred buffers resolve at
    /// [`on_resize_end`](Self::on_resize_end).
    #[must_use]
    pub fn tensor_address(&self, tensor: TensorHandle) -> Option<*mut u8> {
        self.addresses.borrow().get(&tensor).copied()
    }

    fn forget_dynamic(&mut self) {
        self.buffers
            .retain(|_, (_, storage)| *storage == StorageType::Static);
        let buffers = &self.buffers;
        self.addresses
            .borrow_mut()
            .retain(|tensor, _| buffers.contains_key(tensor));
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("kind", &self.kind)
            .field("align", &self.align)
            .field("buffers", &self.buffers.len())
            .field("static_size", &self.static_size())
            .field("dynamic_size", &self.dynamic_size())
            .finish()
    }
}
