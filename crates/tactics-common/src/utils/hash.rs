//! Hash map alias.
//!
//! Allocator bookkeeping is keyed by small integers and addresses, so the
//! alias pairs hashbrown with ahash rather than SipHash.

/// Single-threaded hash map used for allocator bookkeeping.
pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;
