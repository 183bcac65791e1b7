//! Iterator objects for `for` loops.
//!
//! An iterator snapshots its iterable's generation counter at construction;
//! any user-visible mutation of the iterable bumps the counter and thereby
//! invalidates every live iterator at once. Using an invalidated iterator
//! raises InvalidIterator. The iterator holds a strong reference to its
//! iterable, so the iterable cannot be destroyed underneath it.
//!
//! Iteration is index-based to avoid borrow conflicts with the heap: the
//! index points into the iterable's cell array (Dict/Set skip non-occupied
//! cells) or its materialized data (List/Tuple/Range). Advancing over a
//! Range may extend its materialized chunk.

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    object::HeapData,
    types::hashable::CellState,
    value::Value,
};

#[derive(Debug)]
pub struct PoiseIter {
    iterable: Value,
    index: usize,
    generation: u64,
}

impl PoiseIter {
    #[must_use]
    pub fn iterable(&self) -> &Value {
        &self.iterable
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

fn as_iter(data: &HeapData) -> &PoiseIter {
    data.as_iterator().expect("expected Iterator on heap")
}

fn as_iter_mut(data: &mut HeapData) -> &mut PoiseIter {
    data.as_iterator_mut().expect("expected Iterator on heap")
}

/// Creates an iterator over `iterable` positioned at the first element.
///
/// Consumes `iterable` (its reference moves into the iterator). Fails with
/// InvalidType when the value is not iterable.
pub fn init(heap: &mut Heap, iterable: Value) -> RunResult<Value> {
    let Some(iterable_id) = iterable.ref_id() else {
        let kind = iterable.type_of(heap);
        iterable.drop_with_heap(heap);
        return Err(PoiseException::new(
            ExcType::InvalidType,
            format!("{kind} is not iterable"),
        ));
    };

    let Some(generation) = heap.get(iterable_id).iterable_generation() else {
        let kind = iterable.type_of(heap);
        iterable.drop_with_heap(heap);
        return Err(PoiseException::new(
            ExcType::InvalidType,
            format!("{kind} is not iterable"),
        ));
    };

    let index = first_index(heap.get(iterable_id));
    let iter_id = heap.allocate(HeapData::Iterator(PoiseIter {
        iterable,
        index,
        generation,
    }));
    Ok(Value::Ref(iter_id))
}

fn first_index(data: &HeapData) -> usize {
    match data {
        HeapData::Dict(dict) => dict
            .states()
            .iter()
            .position(|state| *state == CellState::Occupied)
            .unwrap_or(dict.capacity()),
        HeapData::Set(set) => set
            .states()
            .iter()
            .position(|state| *state == CellState::Occupied)
            .unwrap_or(set.capacity()),
        _ => 0,
    }
}

/// True while the iterator has not been invalidated by a mutation.
#[must_use]
pub fn is_valid(heap: &Heap, iter_id: HeapId) -> bool {
    let iter = as_iter(heap.get(iter_id));
    let Some(iterable_id) = iter.iterable.ref_id() else {
        return false;
    };
    heap.get(iterable_id)
        .iterable_generation()
        .is_some_and(|generation| generation == iter.generation)
}

fn check_valid(heap: &Heap, iter_id: HeapId) -> RunResult<HeapId> {
    if !is_valid(heap, iter_id) {
        return Err(PoiseException::new(
            ExcType::InvalidIterator,
            "Iterator is no longer valid due to the collection being modified or destroyed",
        ));
    }
    Ok(as_iter(heap.get(iter_id))
        .iterable
        .ref_id()
        .expect("valid iterator has an iterable"))
}

/// Whether the iterator sits past the last element.
pub fn is_at_end(heap: &Heap, iter_id: HeapId) -> RunResult<bool> {
    let iterable_id = check_valid(heap, iter_id)?;
    let index = as_iter(heap.get(iter_id)).index;
    Ok(at_end_at(heap.get(iterable_id), index))
}

fn at_end_at(data: &HeapData, index: usize) -> bool {
    match data {
        HeapData::List(list) => index >= list.len(),
        HeapData::Tuple(tuple) => index >= tuple.len(),
        HeapData::Range(range) => range.is_past_end(index),
        HeapData::Dict(dict) => index >= dict.capacity(),
        HeapData::Set(set) => index >= set.capacity(),
        _ => true,
    }
}

/// Advances one element, skipping unoccupied hash cells and extending a
/// Range's materialized chunk as needed.
pub fn advance(heap: &mut Heap, iter_id: HeapId) -> RunResult<()> {
    let iterable_id = check_valid(heap, iter_id)?;
    let index = as_iter(heap.get(iter_id)).index;

    let next = match heap.get(iterable_id) {
        HeapData::Dict(dict) => {
            let mut next = index + 1;
            while next < dict.capacity() && dict.states()[next] != CellState::Occupied {
                next += 1;
            }
            next
        }
        HeapData::Set(set) => {
            let mut next = index + 1;
            while next < set.capacity() && set.states()[next] != CellState::Occupied {
                next += 1;
            }
            next
        }
        _ => index + 1,
    };

    if let HeapData::Range(range) = heap.get_mut(iterable_id) {
        range.ensure_materialized(next);
    }

    as_iter_mut(heap.get_mut(iter_id)).index = next;
    Ok(())
}

/// The element under the cursor.
pub fn current(heap: &Heap, iter_id: HeapId) -> RunResult<Value> {
    let iterable_id = check_valid(heap, iter_id)?;
    let index = as_iter(heap.get(iter_id)).index;
    let data = heap.get(iterable_id);
    if at_end_at(data, index) {
        return Err(PoiseException::new(
            ExcType::IteratorOutOfBounds,
            "Iterator has already been incremented past the end of the collection",
        ));
    }

    let value = match data {
        HeapData::List(list) => list.at(index).expect("checked bounds"),
        HeapData::Tuple(tuple) => tuple.at(index).expect("checked bounds"),
        HeapData::Range(range) => range.items().get(index).expect("range index materialized"),
        HeapData::Dict(dict) => &dict.cells()[index],
        HeapData::Set(set) => &set.cells()[index],
        _ => unreachable!("non-iterable behind iterator"),
    };
    Ok(value.clone_with_heap(heap))
}

/// The element under the cursor as a two-variable loop binding.
///
/// Dicts bind (key, value); every other iterable binds (element, none).
pub fn current_pair(heap: &mut Heap, iter_id: HeapId) -> RunResult<(Value, Value)> {
    let iterable_id = check_valid(heap, iter_id)?;
    let element = current(heap, iter_id)?;

    if matches!(heap.get(iterable_id), HeapData::Dict(_)) {
        let pair_id = element.ref_id().expect("dict element is a tuple ref");
        let (key, value) = {
            let tuple = heap.get(pair_id).as_tuple().expect("dict element is a Tuple");
            (
                tuple.at(0).expect("pair key").clone_with_heap(heap),
                tuple.at(1).expect("pair value").clone_with_heap(heap),
            )
        };
        element.drop_with_heap(heap);
        Ok((key, value))
    } else {
        Ok((element, Value::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dict, List, Range, dict};

    #[test]
    fn list_iteration_yields_in_order() {
        let mut heap = Heap::new();
        let list_id = heap.allocate(HeapData::List(List::new(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ])));
        heap.inc_ref(list_id);
        let iter = init(&mut heap, Value::Ref(list_id)).unwrap();
        let iter_id = iter.ref_id().unwrap();

        let mut seen = Vec::new();
        while !is_at_end(&heap, iter_id).unwrap() {
            let value = current(&heap, iter_id).unwrap();
            if let Value::Int(i) = value {
                seen.push(i);
            }
            advance(&mut heap, iter_id).unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);

        iter.drop_with_heap(&mut heap);
        heap.dec_ref(list_id);
    }

    #[test]
    fn mutation_invalidates_live_iterators() {
        let mut heap = Heap::new();
        let list_id = heap.allocate(HeapData::List(List::new(vec![Value::Int(1)])));
        heap.inc_ref(list_id);
        let iter = init(&mut heap, Value::Ref(list_id)).unwrap();
        let iter_id = iter.ref_id().unwrap();
        assert!(is_valid(&heap, iter_id));

        if let HeapData::List(list) = heap.get_mut(list_id) {
            list.append(Value::Int(4));
        }

        assert!(!is_valid(&heap, iter_id));
        let err = current(&heap, iter_id).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidIterator);
        let err = is_at_end(&heap, iter_id).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidIterator);

        iter.drop_with_heap(&mut heap);
        heap.dec_ref(list_id);
    }

    #[test]
    fn range_iteration_extends_chunks_lazily() {
        let mut heap = Heap::new();
        let range_id = heap.allocate(HeapData::Range(Range::new(0, 20, 1, false)));
        heap.inc_ref(range_id);
        let iter = init(&mut heap, Value::Ref(range_id)).unwrap();
        let iter_id = iter.ref_id().unwrap();

        let mut total = 0;
        while !is_at_end(&heap, iter_id).unwrap() {
            if let Value::Int(i) = current(&heap, iter_id).unwrap() {
                total += i;
            }
            advance(&mut heap, iter_id).unwrap();
        }
        assert_eq!(total, (0..20).sum::<i64>());

        iter.drop_with_heap(&mut heap);
        heap.dec_ref(range_id);
    }

    #[test]
    fn infinite_range_iterates_zero_times() {
        let mut heap = Heap::new();
        let range_id = heap.allocate(HeapData::Range(Range::new(0, -5, 1, false)));
        heap.inc_ref(range_id);
        let iter = init(&mut heap, Value::Ref(range_id)).unwrap();
        let iter_id = iter.ref_id().unwrap();
        assert!(is_at_end(&heap, iter_id).unwrap());
        iter.drop_with_heap(&mut heap);
        heap.dec_ref(range_id);
    }

    #[test]
    fn dict_iteration_binds_key_value_pairs() {
        let mut heap = Heap::new();
        let dict_id = heap.allocate(HeapData::Dict(Dict::new()));
        dict::try_insert(&mut heap, dict_id, Value::Str("a".into()), Value::Int(1));
        dict::try_insert(&mut heap, dict_id, Value::Str("b".into()), Value::Int(2));

        heap.inc_ref(dict_id);
        let iter = init(&mut heap, Value::Ref(dict_id)).unwrap();
        let iter_id = iter.ref_id().unwrap();

        let mut seen = Vec::new();
        while !is_at_end(&heap, iter_id).unwrap() {
            let (key, value) = current_pair(&mut heap, iter_id).unwrap();
            seen.push((key.to_display_string(&heap), value.to_display_string(&heap)));
            key.drop_with_heap(&mut heap);
            value.drop_with_heap(&mut heap);
            advance(&mut heap, iter_id).unwrap();
        }
        seen.sort();
        assert_eq!(seen, vec![("a".into(), "1".into()), ("b".into(), "2".into())]);

        iter.drop_with_heap(&mut heap);
        heap.dec_ref(dict_id);
    }

    #[test]
    fn non_iterable_values_are_rejected() {
        let mut heap = Heap::new();
        let err = init(&mut heap, Value::Int(5)).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidType);
    }
}
