//! Open-addressed set of values.
//!
//! Same cell/state layout as Dict but storing member values directly.
//! The algebra operations allocate fresh sets on the heap.

use crate::{
    heap::{Heap, HeapId},
    object::HeapData,
    types::hashable::{CellState, GROW_FACTOR, INITIAL_CAPACITY, needs_growth},
    value::Value,
};

#[derive(Debug)]
pub struct Set {
    cells: Vec<Value>,
    states: Vec<CellState>,
    size: usize,
    generation: u64,
}

impl Default for Set {
    fn default() -> Self {
        Self::new()
    }
}

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: empty_cells(INITIAL_CAPACITY),
            states: vec![CellState::NeverUsed; INITIAL_CAPACITY],
            size: 0,
            generation: 0,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn states(&self) -> &[CellState] {
        &self.states
    }

    #[must_use]
    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    /// References to the member values, in cell order.
    #[must_use]
    pub fn occupied(&self) -> Vec<&Value> {
        self.states
            .iter()
            .zip(&self.cells)
            .filter(|(state, _)| **state == CellState::Occupied)
            .map(|(_, cell)| cell)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        matches!(self.find_slot(value), Slot::Found(_))
    }

    fn find_slot(&self, value: &Value) -> Slot {
        let capacity = self.capacity();
        let mut index = (value.hash_value() as usize) % capacity;
        let mut first_vacant = None;

        for _ in 0..capacity {
            match self.states[index] {
                CellState::NeverUsed => return Slot::Vacant(first_vacant.unwrap_or(index)),
                CellState::Occupied => {
                    if self.cells[index].equals(value) {
                        return Slot::Found(index);
                    }
                }
                CellState::Tombstone => {
                    if first_vacant.is_none() {
                        first_vacant = Some(index);
                    }
                }
            }
            index = (index + 1) % capacity;
        }

        Slot::Vacant(first_vacant.expect("set probe found no usable cell"))
    }
}

enum Slot {
    Found(usize),
    Vacant(usize),
}

fn empty_cells(capacity: usize) -> Vec<Value> {
    (0..capacity).map(|_| Value::None).collect()
}

fn as_set(data: &HeapData) -> &Set {
    data.as_set().expect("expected Set on heap")
}

fn as_set_mut(data: &mut HeapData) -> &mut Set {
    data.as_set_mut().expect("expected Set on heap")
}

/// Inserts `value` unless already present. Consumes the value either way.
pub fn try_insert(heap: &mut Heap, set_id: HeapId, value: Value) -> bool {
    let slot = as_set(heap.get(set_id)).find_slot(&value);
    match slot {
        Slot::Found(_) => {
            value.drop_with_heap(heap);
            false
        }
        Slot::Vacant(index) => {
            {
                let set = as_set_mut(heap.get_mut(set_id));
                set.states[index] = CellState::Occupied;
                set.cells[index] = value;
                set.size += 1;
                set.generation += 1;
            }
            let (size, capacity) = {
                let set = as_set(heap.get(set_id));
                (set.size(), set.capacity())
            };
            if needs_growth(size, capacity) {
                grow_and_rehash(heap, set_id);
            }
            true
        }
    }
}

/// Removes `value` if present.
pub fn remove(heap: &mut Heap, set_id: HeapId, value: &Value) -> bool {
    let slot = as_set(heap.get(set_id)).find_slot(value);
    match slot {
        Slot::Found(index) => {
            let old = {
                let set = as_set_mut(heap.get_mut(set_id));
                set.states[index] = CellState::Tombstone;
                set.size -= 1;
                set.generation += 1;
                std::mem::replace(&mut set.cells[index], Value::None)
            };
            old.drop_with_heap(heap);
            true
        }
        Slot::Vacant(_) => false,
    }
}

fn grow_and_rehash(heap: &mut Heap, set_id: HeapId) {
    let values: Vec<Value> = {
        let set = as_set_mut(heap.get_mut(set_id));
        let capacity = set.capacity() * GROW_FACTOR;
        let old_cells = std::mem::replace(&mut set.cells, empty_cells(capacity));
        let old_states = std::mem::replace(&mut set.states, vec![CellState::NeverUsed; capacity]);
        set.size = 0;
        old_states
            .into_iter()
            .zip(old_cells)
            .filter(|(state, _)| *state == CellState::Occupied)
            .map(|(_, cell)| cell)
            .collect()
    };

    for value in values {
        let hash = value.hash_value();
        let set = as_set_mut(heap.get_mut(set_id));
        let capacity = set.capacity();
        let mut index = (hash as usize) % capacity;
        while set.states[index] == CellState::Occupied {
            index = (index + 1) % capacity;
        }
        set.states[index] = CellState::Occupied;
        set.cells[index] = value;
        set.size += 1;
    }
}

/// Builds a Set from constructor arguments.
pub fn from_values(heap: &mut Heap, values: Vec<Value>) -> Value {
    let set_id = heap.allocate(HeapData::Set(Set::new()));
    for value in values {
        try_insert(heap, set_id, value);
    }
    Value::Ref(set_id)
}

fn cloned_members(heap: &Heap, set_id: HeapId) -> Vec<Value> {
    let set = as_set(heap.get(set_id));
    set.occupied().into_iter().map(|v| v.clone_with_heap(heap)).collect()
}

#[must_use]
pub fn is_subset(heap: &Heap, set_id: HeapId, other_id: HeapId) -> bool {
    if set_id == other_id {
        return true;
    }
    let set = as_set(heap.get(set_id));
    let other = as_set(heap.get(other_id));
    set.occupied().into_iter().all(|v| other.contains(v))
}

#[must_use]
pub fn is_superset(heap: &Heap, set_id: HeapId, other_id: HeapId) -> bool {
    is_subset(heap, other_id, set_id)
}

pub fn union(heap: &mut Heap, a: HeapId, b: HeapId) -> Value {
    let mut members = cloned_members(heap, a);
    members.extend(cloned_members(heap, b));
    from_values(heap, members)
}

pub fn intersection(heap: &mut Heap, a: HeapId, b: HeapId) -> Value {
    let members: Vec<Value> = {
        let h: &Heap = heap;
        let left = as_set(h.get(a));
        let right = as_set(h.get(b));
        left.occupied()
            .into_iter()
            .filter(|v| right.contains(v))
            .map(|v| v.clone_with_heap(h))
            .collect()
    };
    from_values(heap, members)
}

pub fn difference(heap: &mut Heap, a: HeapId, b: HeapId) -> Value {
    let members: Vec<Value> = {
        let h: &Heap = heap;
        let left = as_set(h.get(a));
        let right = as_set(h.get(b));
        left.occupied()
            .into_iter()
            .filter(|v| !right.contains(v))
            .map(|v| v.clone_with_heap(h))
            .collect()
    };
    from_values(heap, members)
}

pub fn symmetric_difference(heap: &mut Heap, a: HeapId, b: HeapId) -> Value {
    let members: Vec<Value> = {
        let h: &Heap = heap;
        let left = as_set(h.get(a));
        let right = as_set(h.get(b));
        let mut out: Vec<Value> = left
            .occupied()
            .into_iter()
            .filter(|v| !right.contains(v))
            .map(|v| v.clone_with_heap(h))
            .collect();
        out.extend(
            right
                .occupied()
                .into_iter()
                .filter(|v| !left.contains(v))
                .map(|v| v.clone_with_heap(h)),
        );
        out
    };
    from_values(heap, members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(heap: &mut Heap, values: &[i64]) -> HeapId {
        let value = from_values(heap, values.iter().map(|&v| Value::Int(v)).collect());
        value.ref_id().unwrap()
    }

    fn sorted_members(heap: &Heap, id: HeapId) -> Vec<i64> {
        let mut out: Vec<i64> = as_set(heap.get(id))
            .occupied()
            .into_iter()
            .map(|v| match v {
                Value::Int(i) => *i,
                other => panic!("unexpected member {other:?}"),
            })
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn duplicate_insertion_is_rejected() {
        let mut heap = Heap::new();
        let id = set_of(&mut heap, &[1, 2, 2, 3]);
        assert_eq!(as_set(heap.get(id)).size(), 3);
        assert!(!try_insert(&mut heap, id, Value::Int(3)));
        assert!(try_insert(&mut heap, id, Value::Int(4)));
        heap.dec_ref(id);
    }

    #[test]
    fn remove_and_contains() {
        let mut heap = Heap::new();
        let id = set_of(&mut heap, &[1, 2, 3]);
        assert!(remove(&mut heap, id, &Value::Int(2)));
        assert!(!remove(&mut heap, id, &Value::Int(2)));
        assert!(!as_set(heap.get(id)).contains(&Value::Int(2)));
        assert!(as_set(heap.get(id)).contains(&Value::Int(3)));
        heap.dec_ref(id);
    }

    #[test]
    fn growth_keeps_all_members() {
        let mut heap = Heap::new();
        let members: Vec<i64> = (0..100).collect();
        let id = set_of(&mut heap, &members);
        let set = as_set(heap.get(id));
        assert_eq!(set.size(), 100);
        assert!(set.capacity().is_power_of_two() && set.capacity() >= 8);
        assert!((set.size() as f32) / (set.capacity() as f32) < 0.75);
        assert_eq!(sorted_members(&heap, id), members);
        heap.dec_ref(id);
    }

    #[test]
    fn union_of_intersection_and_difference_restores_the_set() {
        let mut heap = Heap::new();
        let a = set_of(&mut heap, &[1, 2, 3, 4]);
        let b = set_of(&mut heap, &[3, 4, 5]);

        let inter = intersection(&mut heap, a, b).ref_id().unwrap();
        let diff = difference(&mut heap, a, b).ref_id().unwrap();
        let rebuilt = union(&mut heap, inter, diff).ref_id().unwrap();

        assert_eq!(sorted_members(&heap, rebuilt), sorted_members(&heap, a));
        assert!(is_subset(&heap, rebuilt, a) && is_superset(&heap, rebuilt, a));

        for id in [a, b, inter, diff, rebuilt] {
            heap.dec_ref(id);
        }
    }

    #[test]
    fn symmetric_difference_excludes_shared_members() {
        let mut heap = Heap::new();
        let a = set_of(&mut heap, &[1, 2, 3]);
        let b = set_of(&mut heap, &[2, 3, 4]);
        let sym = symmetric_difference(&mut heap, a, b).ref_id().unwrap();
        assert_eq!(sorted_members(&heap, sym), vec![1, 4]);
        for id in [a, b, sym] {
            heap.dec_ref(id);
        }
    }

    #[test]
    fn subset_and_superset() {
        let mut heap = Heap::new();
        let a = set_of(&mut heap, &[1, 2]);
        let b = set_of(&mut heap, &[1, 2, 3]);
        assert!(is_subset(&heap, a, b));
        assert!(!is_subset(&heap, b, a));
        assert!(is_superset(&heap, b, a));
        assert!(is_subset(&heap, a, a));
        for id in [a, b] {
            heap.dec_ref(id);
        }
    }
}
