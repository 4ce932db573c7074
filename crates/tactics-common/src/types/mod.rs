//! Core type definitions for Tactics.
//!
//! - Identifier types ([`TensorHandle`])

mod handle;

pub use handle::TensorHandle;
