//! # tactics-common
//!
//! Foundation layer for Tactics: types, alignment helpers, and utilities.
//!
//! This crate provides the building blocks shared by the allocator crates.
//! It has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`types`] - Core type definitions ([`TensorHandle`])
//! - [`memory`] - Alignment constants and helpers
//! - [`utils`] - Utility functions and helpers (hashing, errors)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;
pub mod types;
pub mod utils;

// Re-export commonly used types at crate root
pub use memory::align::{MEMORY_ALIGN_DEFAULT, align_up, is_aligned};
pub use types::TensorHandle;
pub use utils::error::{Error, Result};
