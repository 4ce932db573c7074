//! Memory helpers shared by every allocator.
//!
//! - [`align`] - Default alignment and rounding helpers

pub mod align;

pub use align::{MEMORY_ALIGN_DEFAULT, align_up, is_aligned};
