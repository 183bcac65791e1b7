//! Open-addressed dictionary of key-value Tuples.
//!
//! Cells hold heap references to two-element Tuples; the parallel state
//! vector distinguishes never-used, occupied and tombstoned cells. Probing
//! is linear. The heap-facing operations live as free functions because key
//! comparison has to read the stored tuples back out of the arena.

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    object::HeapData,
    types::{
        Tuple,
        hashable::{CellState, GROW_FACTOR, INITIAL_CAPACITY, needs_growth},
    },
    value::Value,
};

#[derive(Debug)]
pub struct Dict {
    cells: Vec<Value>,
    states: Vec<CellState>,
    size: usize,
    generation: u64,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
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

    /// References to the occupied cells (the key-value tuples), in cell order.
    #[must_use]
    pub fn occupied(&self) -> Vec<&Value> {
        self.states
            .iter()
            .zip(&self.cells)
            .filter(|(state, _)| **state == CellState::Occupied)
            .map(|(_, cell)| cell)
            .collect()
    }
}

fn empty_cells(capacity: usize) -> Vec<Value> {
    (0..capacity).map(|_| Value::None).collect()
}

fn as_dict(data: &HeapData) -> &Dict {
    data.as_dict().expect("expected Dict on heap")
}

fn as_dict_mut(data: &mut HeapData) -> &mut Dict {
    data.as_dict_mut().expect("expected Dict on heap")
}

enum Slot {
    Found(usize),
    Vacant(usize),
}

/// Probes for `key`, returning its cell or the cell an insertion would use.
fn find_slot(heap: &Heap, dict_id: HeapId, key: &Value) -> Slot {
    let dict = as_dict(heap.get(dict_id));
    let capacity = dict.capacity();
    let mut index = (key.hash_value() as usize) % capacity;
    let mut first_vacant = None;

    for _ in 0..capacity {
        match dict.states[index] {
            CellState::NeverUsed => return Slot::Vacant(first_vacant.unwrap_or(index)),
            CellState::Occupied => {
                let tuple_id = dict.cells[index].ref_id().expect("dict cell is not a tuple ref");
                let pair = heap.get(tuple_id).as_tuple().expect("dict cell is not a Tuple");
                if pair.at(0).is_some_and(|stored| stored.equals(key)) {
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

    Slot::Vacant(first_vacant.expect("dict probe found no usable cell"))
}

#[must_use]
pub fn contains_key(heap: &Heap, dict_id: HeapId, key: &Value) -> bool {
    matches!(find_slot(heap, dict_id, key), Slot::Found(_))
}

/// Looks up `key`, returning a fresh reference to its value.
pub fn at(heap: &Heap, dict_id: HeapId, key: &Value) -> RunResult<Value> {
    match find_slot(heap, dict_id, key) {
        Slot::Found(index) => {
            let dict = as_dict(heap.get(dict_id));
            let tuple_id = dict.cells[index].ref_id().expect("dict cell is not a tuple ref");
            let pair = heap.get(tuple_id).as_tuple().expect("dict cell is not a Tuple");
            Ok(pair.at(1).expect("dict pair has no value").clone_with_heap(heap))
        }
        Slot::Vacant(_) => Err(PoiseException::new(
            ExcType::KeyNotFound,
            format!("{} was not present in the Dict", key.to_display_string(heap)),
        )),
    }
}

/// Inserts `key -> value` only when the key is absent. Consumes both values
/// either way.
pub fn try_insert(heap: &mut Heap, dict_id: HeapId, key: Value, value: Value) -> bool {
    match find_slot(heap, dict_id, &key) {
        Slot::Found(_) => {
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            false
        }
        Slot::Vacant(index) => {
            place_pair(heap, dict_id, index, true, key, value);
            true
        }
    }
}

/// Inserts `key -> value`, replacing the value when the key is present.
pub fn insert_or_update(heap: &mut Heap, dict_id: HeapId, key: Value, value: Value) {
    match find_slot(heap, dict_id, &key) {
        Slot::Found(index) => place_pair(heap, dict_id, index, false, key, value),
        Slot::Vacant(index) => place_pair(heap, dict_id, index, true, key, value),
    }
}

/// Removes `key` if present.
pub fn remove_key(heap: &mut Heap, dict_id: HeapId, key: &Value) -> bool {
    match find_slot(heap, dict_id, key) {
        Slot::Found(index) => {
            let old = {
                let dict = as_dict_mut(heap.get_mut(dict_id));
                dict.states[index] = CellState::Tombstone;
                dict.size -= 1;
                dict.generation += 1;
                std::mem::replace(&mut dict.cells[index], Value::None)
            };
            old.drop_with_heap(heap);
            true
        }
        Slot::Vacant(_) => false,
    }
}

fn place_pair(heap: &mut Heap, dict_id: HeapId, index: usize, is_new_key: bool, key: Value, value: Value) {
    let pair_id = heap.allocate(HeapData::Tuple(Tuple::new(vec![key, value])));
    let old = {
        let dict = as_dict_mut(heap.get_mut(dict_id));
        dict.states[index] = CellState::Occupied;
        dict.generation += 1;
        if is_new_key {
            dict.size += 1;
        }
        std::mem::replace(&mut dict.cells[index], Value::Ref(pair_id))
    };
    old.drop_with_heap(heap);

    let (size, capacity) = {
        let dict = as_dict(heap.get(dict_id));
        (dict.size(), dict.capacity())
    };
    if is_new_key && needs_growth(size, capacity) {
        grow_and_rehash(heap, dict_id);
    }
}

fn grow_and_rehash(heap: &mut Heap, dict_id: HeapId) {
    let pairs: Vec<Value> = {
        let dict = as_dict_mut(heap.get_mut(dict_id));
        let capacity = dict.capacity() * GROW_FACTOR;
        let old_cells = std::mem::replace(&mut dict.cells, empty_cells(capacity));
        let old_states = std::mem::replace(&mut dict.states, vec![CellState::NeverUsed; capacity]);
        dict.size = 0;
        old_states
            .into_iter()
            .zip(old_cells)
            .filter(|(state, _)| *state == CellState::Occupied)
            .map(|(_, cell)| cell)
            .collect()
    };

    // re-placing existing pairs; no duplicates, so a vacant probe suffices
    for pair in pairs {
        let key_hash = {
            let tuple_id = pair.ref_id().expect("dict cell is not a tuple ref");
            let tuple = heap.get(tuple_id).as_tuple().expect("dict cell is not a Tuple");
            tuple.at(0).expect("dict pair has no key").hash_value()
        };
        let index = {
            let dict = as_dict(heap.get(dict_id));
            let capacity = dict.capacity();
            let mut index = (key_hash as usize) % capacity;
            while dict.states[index] == CellState::Occupied {
                index = (index + 1) % capacity;
            }
            index
        };
        let dict = as_dict_mut(heap.get_mut(dict_id));
        dict.states[index] = CellState::Occupied;
        dict.cells[index] = pair;
        dict.size += 1;
    }
}

/// Builds a Dict from constructor arguments, each a two-element Tuple.
pub fn from_pairs(heap: &mut Heap, pairs: Vec<Value>) -> RunResult<Value> {
    let dict_id = heap.allocate(HeapData::Dict(Dict::new()));
    let mut pending = pairs.into_iter();

    while let Some(pair) = pending.next() {
        let tuple_ok = pair
            .ref_id()
            .and_then(|id| heap.get(id).as_tuple())
            .is_some_and(|tuple| tuple.len() == 2);
        if !tuple_ok {
            let kind = pair.type_of(heap);
            pair.drop_with_heap(heap);
            for rest in pending {
                rest.drop_with_heap(heap);
            }
            heap.dec_ref(dict_id);
            return Err(PoiseException::new(
                ExcType::InvalidArgument,
                format!("Dict entries must be Tuples of size 2 but got {kind}"),
            ));
        }

        let tuple_id = pair.ref_id().expect("checked above");
        let (key, value) = {
            let tuple = heap.get(tuple_id).as_tuple().expect("checked above");
            (
                tuple.at(0).expect("pair key").clone_with_heap(heap),
                tuple.at(1).expect("pair value").clone_with_heap(heap),
            )
        };
        pair.drop_with_heap(heap);
        insert_or_update(heap, dict_id, key, value);
    }

    Ok(Value::Ref(dict_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_dict(heap: &mut Heap) -> HeapId {
        heap.allocate(HeapData::Dict(Dict::new()))
    }

    #[test]
    fn try_insert_keeps_first_binding() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);

        assert!(try_insert(&mut heap, dict, Value::Str("k".into()), Value::Int(1)));
        assert!(!try_insert(&mut heap, dict, Value::Str("k".into()), Value::Int(2)));

        let got = at(&heap, dict, &Value::Str("k".into())).unwrap();
        assert!(got.equals(&Value::Int(1)));
        got.drop_with_heap(&mut heap);
        heap.dec_ref(dict);
    }

    #[test]
    fn insert_or_update_replaces_without_growing_size() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);

        insert_or_update(&mut heap, dict, Value::Str("k".into()), Value::Int(1));
        insert_or_update(&mut heap, dict, Value::Str("k".into()), Value::Int(2));

        let size = as_dict(heap.get(dict)).size();
        assert_eq!(size, 1);
        let got = at(&heap, dict, &Value::Str("k".into())).unwrap();
        assert!(got.equals(&Value::Int(2)));
        got.drop_with_heap(&mut heap);
        heap.dec_ref(dict);
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        let err = at(&heap, dict, &Value::Int(42)).unwrap_err();
        assert_eq!(err.kind(), ExcType::KeyNotFound);
        heap.dec_ref(dict);
    }

    #[test]
    fn load_factor_stays_under_threshold_and_capacity_doubles() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);

        for i in 0..64 {
            assert!(try_insert(&mut heap, dict, Value::Int(i), Value::Int(i * 10)));
            let d = as_dict(heap.get(dict));
            assert!(d.size() < (d.capacity() * 3).div_ceil(4) + 1);
            assert!((d.size() as f32) / (d.capacity() as f32) < LOAD_THRESHOLD_CHECK);
            assert!(d.capacity().is_power_of_two() && d.capacity() >= 8);
        }

        for i in 0..64 {
            let got = at(&heap, dict, &Value::Int(i)).unwrap();
            assert!(got.equals(&Value::Int(i * 10)));
            got.drop_with_heap(&mut heap);
        }
        heap.dec_ref(dict);
    }

    const LOAD_THRESHOLD_CHECK: f32 = 0.75;

    #[test]
    fn remove_tombstones_and_keeps_probe_chains_intact() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        for i in 0..6 {
            try_insert(&mut heap, dict, Value::Int(i), Value::Int(i));
        }
        assert!(remove_key(&mut heap, dict, &Value::Int(3)));
        assert!(!remove_key(&mut heap, dict, &Value::Int(3)));
        assert!(!contains_key(&heap, dict, &Value::Int(3)));
        assert!(contains_key(&heap, dict, &Value::Int(5)));
        heap.dec_ref(dict);
    }

    #[test]
    fn mutation_bumps_generation() {
        let mut heap = Heap::new();
        let dict = new_dict(&mut heap);
        let g0 = as_dict(heap.get(dict)).generation();
        try_insert(&mut heap, dict, Value::Int(1), Value::Int(1));
        assert!(as_dict(heap.get(dict)).generation() > g0);
        heap.dec_ref(dict);
    }
}
