//! Opaque tensor identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a tensor owned by the caller.
///
/// Allocators attach handles to chunks and hand them back, together with a
/// resolved address, once the address is known. They never look behind the
/// handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct TensorHandle(pub u64);

impl TensorHandle {
    /// Wraps the caller's id for a tensor.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The caller's id, as passed to [`TensorHandle::new`].
    #[inline]
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

impl fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TensorHandle {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
