//! Reference-counted arena backing all heap runtime objects.
//!
//! Values of tag `Ref` share ownership of a slot in this arena; cloning a
//! value through [`crate::value::Value::clone_with_heap`] increments the
//! slot's refcount, dropping it through `drop_with_heap` decrements and
//! frees at zero. Freed slot ids go on a free list for reuse, keeping memory
//! flat across long loops that allocate and release repeatedly.
//!
//! The refcount is a plain `Cell`: the VM is strictly single-threaded, and
//! interior mutability lets lookups that only read the arena still hand out
//! new references. Reference cycles (a lambda capturing itself, a list
//! containing itself) are broken at teardown: dropping the arena frees every
//! surviving slot regardless of its count, so no reachable object outlives
//! the VM.

use std::cell::Cell;

use crate::object::HeapData;

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct HeapEntry {
    refcount: Cell<usize>,
    data: HeapData,
}

/// Reference-counted arena of runtime objects.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// Ids of freed slots available for reuse. Populated by `dec_ref`,
    /// consumed by `allocate`.
    free_list: Vec<HeapId>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new object with refcount 1 and returns its id.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let entry = HeapEntry {
            refcount: Cell::new(1),
            data,
        };

        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Increments the reference count of a live slot.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Decrements the reference count, freeing the object and releasing its
    /// children once the count reaches zero.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let entry = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.get();
            if count > 1 {
                entry.refcount.set(count - 1);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        self.free_list.push(id);

        let mut child_ids = Vec::new();
        entry.data.collect_child_ids(&mut child_ids);
        drop(entry);
        for child in child_ids {
            self.dec_ref(child);
        }
    }

    /// Returns the object stored at the given id.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .map(|entry| &entry.data)
            .expect("Heap::get: object already freed")
    }

    /// Returns a mutable reference to the object stored at the given id.
    ///
    /// # Panics
    /// Panics if the slot is missing or already freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .map(|entry| &mut entry.data)
            .expect("Heap::get_mut: object already freed")
    }

    /// Current reference count of a live slot (0 if freed).
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |entry| entry.refcount.get())
    }

    /// Number of live objects in the arena.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::List,
        value::Value,
    };

    #[test]
    fn allocate_reuses_freed_slots() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::List(List::new(Vec::new())));
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::List(List::new(Vec::new())));
        assert_eq!(a, b);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn clone_and_drop_restore_refcount() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::List(List::new(Vec::new())));
        let value = Value::Ref(id);
        assert_eq!(heap.refcount(id), 1);

        let clone = value.clone_with_heap(&heap);
        assert_eq!(heap.refcount(id), 2);
        clone.drop_with_heap(&mut heap);
        assert_eq!(heap.refcount(id), 1);

        value.drop_with_heap(&mut heap);
        assert_eq!(heap.refcount(id), 0);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn freeing_a_container_releases_children() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::List(List::new(Vec::new())));
        heap.inc_ref(inner);
        let outer = heap.allocate(HeapData::List(List::new(vec![Value::Ref(inner)])));
        assert_eq!(heap.refcount(inner), 2);

        heap.dec_ref(outer);
        assert_eq!(heap.refcount(inner), 1);
        heap.dec_ref(inner);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn cyclic_list_is_freed_by_child_walk() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::List(List::new(Vec::new())));
        // the list holds itself; give it the extra count that membership implies
        heap.inc_ref(id);
        if let HeapData::List(list) = heap.get_mut(id) {
            list.append(Value::Ref(id));
        }

        // the external owner lets go; the cycle keeps one count alive
        heap.dec_ref(id);
        assert_eq!(heap.refcount(id), 1);
        assert_eq!(heap.live_objects(), 1);
        // teardown: dropping the arena frees the slot regardless of the cycle
        drop(heap);
    }
}
