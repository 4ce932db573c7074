//! Index-addressed node storage.
//!
//! Both allocator strategies keep their bookkeeping nodes here and link them
//! by [`NodeId`] instead of pointers. Removing a node only marks its slot
//! vacant; the slot is handed out again by a later insert.

use std::ops::{Index, IndexMut};

/// Stable index of a node inside a [`NodeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeId(usize);

impl NodeId {
    /// Smallest id, used as the lower bound of `(size, id)` range searches.
    pub(crate) const MIN: Self = Self(0);

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Slot vector with a vacant-slot stack.
#[derive(Debug)]
pub(crate) struct NodeArena<T> {
    slots: Vec<Option<T>>,
    vacant: Vec<usize>,
    len: usize,
}

impl<T> NodeArena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value` and returns its id.
    pub(crate) fn insert(&mut self, value: T) -> NodeId {
        self.insert_with(|_| value)
    }

    /// Stores the value built by `make`, which receives the id it will get.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(NodeId) -> T) -> NodeId {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(make(NodeId(index)));
        self.len += 1;
        NodeId(index)
    }

    /// Removes the node, leaving its slot vacant.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<T> {
        let value = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&T> {
        self.slots.get(id.0)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (NodeId(index), value)))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.len = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl<T> Default for NodeArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<NodeId> for NodeArena<T> {
    type Output = T;

    fn index(&self, id: NodeId) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

impl<T> IndexMut<NodeId> for NodeArena<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut T {
        match self.get_mut(id) {
            Some(value) => value,
            None => panic!("dangling node id {}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = NodeArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena[a], "a");
        assert_eq!(arena[b], "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_remove_reuses_slot() {
        let mut arena = NodeArena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);

        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.remove(a), None);

        let c = arena.insert(3);
        assert_eq!(c, a);
        assert_eq!(arena[c], 3);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_insert_with_sees_own_id() {
        let mut arena = NodeArena::new();
        let a = arena.insert_with(|id| id.index() * 10);
        let b = arena.insert_with(|id| id.index() * 10);
        assert_eq!(arena[a], 0);
        assert_eq!(arena[b], 10);
    }

    #[test]
    fn test_clear() {
        let mut arena = NodeArena::new();
        arena.insert(1);
        arena.clear();
        assert_eq!(arena.len(), 0);
        assert_eq!(arena.iter().count(), 0);
    }
}
