//! Barrier and group bookkeeping shared by both allocator strategies.
//!
//! Barriers and groups are logical markers over the scheduled graph, not
//! threads. While one is open, whatever is freed must not be handed out
//! again, so `free` parks it in the innermost scope's side list. Closing a
//! scope forwards its list to the enclosing scope. Sibling groups may run
//! concurrently, so an outermost group's list stays held until the next
//! outermost barrier closes; only then is everything given back to the
//! allocator for reuse.

use std::fmt;

/// Kind of an open scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Opened by `barrier_begin`.
    Barrier,
    /// Opened by `begin_group`.
    Group,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::Barrier => write!(f, "barrier"),
            ScopeKind::Group => write!(f, "group"),
        }
    }
}

#[derive(Debug)]
struct Scope<T> {
    kind: ScopeKind,
    parked: Vec<T>,
}

/// LIFO stack of open barriers and groups with their side lists.
#[derive(Debug)]
pub(crate) struct ScopeStack<T> {
    scopes: Vec<Scope<T>>,
    /// Lists of closed outermost groups, waiting for a barrier.
    held: Vec<T>,
}

impl<T> ScopeStack<T> {
    pub(crate) fn new() -> Self {
        Self {
            scopes: Vec::new(),
            held: Vec::new(),
        }
    }

    pub(crate) fn open(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope {
            kind,
            parked: Vec::new(),
        });
    }

    /// Closes the innermost scope, which must be of `kind`.
    ///
    /// Returns the items that became reusable: empty while an enclosing scope
    /// is still open, since the items move to it instead, and empty for an
    /// outermost group, whose items are held for the next outermost barrier.
    /// A close without a matching open is a contract violation and returns
    /// nothing.
    pub(crate) fn close(&mut self, kind: ScopeKind) -> Vec<T> {
        let matches = self.scopes.last().is_some_and(|scope| scope.kind == kind);
        debug_assert!(matches, "{} closed without a matching begin", kind);
        if !matches {
            tracing::error!("{} closed without a matching begin", kind);
            return Vec::new();
        }
        let Some(scope) = self.scopes.pop() else {
            return Vec::new();
        };
        match (self.scopes.last_mut(), kind) {
            (Some(enclosing), _) => {
                enclosing.parked.extend(scope.parked);
                Vec::new()
            }
            (None, ScopeKind::Group) => {
                self.held.extend(scope.parked);
                Vec::new()
            }
            (None, ScopeKind::Barrier) => {
                let mut reusable = std::mem::take(&mut self.held);
                reusable.extend(scope.parked);
                reusable
            }
        }
    }

    /// Parks `item` in the innermost scope.
    ///
    /// Hands the item back when no scope is open.
    pub(crate) fn park(&mut self, item: T) -> Option<T> {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.parked.push(item);
                None
            }
            None => Some(item),
        }
    }

    /// Number of open scopes.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Drops every scope, returning all parked and held items.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut items = std::mem::take(&mut self.held);
        items.extend(self.scopes.drain(..).flat_map(|scope| scope.parked));
        items
    }
}

impl<T> Default for ScopeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
