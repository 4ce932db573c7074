//! Backend configuration.

use serde::{Deserialize, Serialize};
use tactics_common::memory::MEMORY_ALIGN_DEFAULT;
use tactics_common::utils::error::{Error, Result};

/// Memory/speed trade-off requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryMode {
    /// Balanced.
    #[default]
    Normal,
    /// Favour speed over footprint.
    High,
    /// Favour footprint over speed.
    Low,
}

/// Strategy behind the dynamic allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatorKind {
    /// Immediate addresses with best-fit reuse.
    Eager,
    /// Interval planning resolved at the end of the resize pass.
    Defer,
}

/// Backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Memory mode.
    pub memory: MemoryMode,

    /// Explicit dynamic strategy (None to derive it from `memory`).
    pub allocator: Option<AllocatorKind>,

    /// Alignment of every buffer, in bytes.
    pub align: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            memory: MemoryMode::Normal,
            allocator: None,
            align: MEMORY_ALIGN_DEFAULT,
        }
    }
}

impl BackendConfig {
    /// Creates a configuration tuned for a small footprint.
    #[must_use]
    pub fn low_memory() -> Self {
        Self {
            memory: MemoryMode::Low,
            ..Default::default()
        }
    }

    /// Sets the memory mode.
    #[must_use]
    pub fn with_memory_mode(mut self, memory: MemoryMode) -> Self {
        self.memory = memory;
        self
    }

    /// Forces the dynamic strategy.
    #[must_use]
    pub fn with_allocator(mut self, allocator: AllocatorKind) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets the buffer alignment.
    #[must_use]
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Strategy the dynamic allocator uses.
    #[must_use]
    pub fn dynamic_allocator(&self) -> AllocatorKind {
        match (self.allocator, self.memory) {
            (Some(kind), _) => kind,
            (None, MemoryMode::Low) => AllocatorKind::Defer,
            (None, _) => AllocatorKind::Eager,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the alignment is not a non-zero
    /// power of two.
    pub fn validate(&self) -> Result<()> {
        if !self.align.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "align ({}) must be a non-zero power of two",
                self.align
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.memory, MemoryMode::Normal);
        assert_eq!(config.align, 64);
        assert_eq!(config.dynamic_allocator(), AllocatorKind::Eager);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_low_memory_selects_defer() {
        assert_eq!(
            BackendConfig::low_memory().dynamic_allocator(),
            AllocatorKind::Defer
        );
        assert_eq!(
            BackendConfig::default()
                .with_memory_mode(MemoryMode::High)
                .dynamic_allocator(),
            AllocatorKind::Eager
        );
    }

    #[test]
    fn test_explicit_allocator_wins() {
        let config = BackendConfig::low_memory().with_allocator(AllocatorKind::Eager);
        assert_eq!(config.dynamic_allocator(), AllocatorKind::Eager);
    }

    #[test]
    fn test_validate_align() {
        assert!(BackendConfig::default().with_align(128).validate().is_ok());
        for align in [0, 3, 48] {
            let err = BackendConfig::default().with_align(align).validate();
            assert!(matches!(err, Err(Error::InvalidConfig(_))));
        }
    }
}
