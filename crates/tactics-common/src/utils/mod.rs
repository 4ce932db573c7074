//! Common utilities used throughout Tactics.
//!
//! - [`error`] - Error types like [`Error`]
//! - [`hash`] - Fast hash maps

pub mod error;
pub mod hash;

pub use error::{Error, Result};
pub use hash::FxHashMap;
