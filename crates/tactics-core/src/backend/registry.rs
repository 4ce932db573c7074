//! Named raw memory sources.
//!
//! Backends look their raw source up by name instead of reaching for a
//! process-wide singleton. The registry is an ordinary value: build one at
//! startup, register device sources next to the default `"cpu"` one, and
//! create a [`MemoryPool`] per backend from it.

use std::fmt;
use std::rc::Rc;

use tactics_common::utils::error::{Error, Result};
use tactics_common::utils::hash::FxHashMap;

use super::config::BackendConfig;
use super::pool::MemoryPool;
use crate::memory::{Allocator, create_default};

/// Name of the heap-backed source registered by [`AllocatorRegistry::with_defaults`].
pub const DEFAULT_SOURCE: &str = "cpu";

/// Registry of raw memory sources keyed by name.
#[derive(Default)]
pub struct AllocatorRegistry {
    sources: FxHashMap<String, Rc<dyn Allocator>>,
}

impl AllocatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the default heap source as `"cpu"`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .sources
            .insert(DEFAULT_SOURCE.to_string(), create_default());
        registry
    }

    /// Registers `source` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateAllocator`] if the name is taken.
    pub fn register(&mut self, name: impl Into<String>, source: Rc<dyn Allocator>) -> Result<()> {
        let name = name.into();
        if self.sources.contains_key(&name) {
            return Err(Error::DuplicateAllocator(name));
        }
        tracing::debug!("Registered raw source '{}'", name);
        self.sources.insert(name, source);
        Ok(())
    }

    /// Source registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Rc<dyn Allocator>> {
        self.sources.get(name).cloned()
    }

    /// Returns true if a source is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Creates a memory pool over the source registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAllocator`] if nothing is registered under
    /// `name`, or [`Error::InvalidConfig`] if `config` does not validate.
    pub fn create_pool(&self, name: &str, config: &BackendConfig) -> Result<MemoryPool> {
        let source = self
            .get(name)
            .ok_or_else(|| Error::UnknownAllocator(name.to_string()))?;
        MemoryPool::new(source, config)
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::config::AllocatorKind;
    use crate::memory::DefaultAllocator;

    #[test]
    fn test_defaults_register_cpu() {
        let registry = AllocatorRegistry::with_defaults();
        assert!(registry.contains(DEFAULT_SOURCE));
        assert!(registry.get("cpu").is_some());
        assert_eq!(registry.names(), vec!["cpu"]);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = AllocatorRegistry::with_defaults();
        registry
            .register("device", Rc::new(DefaultAllocator::new()))
            .unwrap();
        assert_eq!(registry.names(), vec!["cpu", "device"]);

        let err = registry
            .register("cpu", Rc::new(DefaultAllocator::new()))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateAllocator("cpu".to_string()));
    }

    #[test]
    fn test_create_pool() {
        let registry = AllocatorRegistry::with_defaults();
        let pool = registry
            .create_pool("cpu", &BackendConfig::low_memory())
            .unwrap();
        assert_eq!(pool.allocator_kind(), AllocatorKind::Defer);

        let err = registry
            .create_pool("gpu", &BackendConfig::default())
            .unwrap_err();
        assert_eq!(err, Error::UnknownAllocator("gpu".to_string()));
    }

    #[test]
    fn test_pools_share_a_source() {
        let source = Rc::new(DefaultAllocator::new());
        let mut registry = AllocatorRegistry::new();
        registry.register("shared", source.clone()).unwrap();

        let mut first = registry.create_pool("shared", &BackendConfig::default()).unwrap();
        let mut second = registry.create_pool("shared", &BackendConfig::default()).unwrap();
        first
            .on_acquire(tactics_common::TensorHandle::new(1), 64, crate::StorageType::Static)
            .unwrap();
        second
            .on_acquire(tactics_common::TensorHandle::new(1), 64, crate::StorageType::Static)
            .unwrap();
        assert_eq!(source.outstanding(), 2);
    }
}
