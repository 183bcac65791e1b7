//! The native-function registry and its core catalog.
//!
//! Natives are addressed by the 64-bit hash of their `__NATIVE_*` name and
//! declare a fixed arity, both validated at the call site by the compiler.
//! Each entry receives its arguments by value and owns dropping them. The
//! standard library binds these to extension functions; only files loaded
//! from the std path may call them directly.

use ahash::AHashMap;

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    intern::hash_string,
    object::HeapData,
    types::{Type, dict, set},
    value::Value,
};

pub type NativeFn = fn(&mut Heap, Vec<Value>) -> RunResult<Value>;

#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    pub arity: u8,
    pub func: NativeFn,
}

pub fn register_all(natives: &mut AHashMap<u64, NativeFunction>, names: &mut AHashMap<String, u64>) {
    let mut add = |name: &str, arity: u8, func: NativeFn| {
        let hash = hash_string(name);
        natives.insert(hash, NativeFunction { arity, func });
        names.insert(name.to_owned(), hash);
    };

    add("__NATIVE_INT_POW", 2, int_pow);
    add("__NATIVE_INT_SQRT", 1, int_sqrt);
    add("__NATIVE_INT_ABS", 1, int_abs);

    add("__NATIVE_FLOAT_POW", 2, float_pow);
    add("__NATIVE_FLOAT_SQRT", 1, float_sqrt);
    add("__NATIVE_FLOAT_ABS", 1, float_abs);

    add("__NATIVE_LIST_APPEND", 2, list_append);
    add("__NATIVE_LIST_INSERT", 3, list_insert);
    add("__NATIVE_LIST_REMOVE", 2, list_remove);
    add("__NATIVE_LIST_REMOVE_FIRST", 2, list_remove_first);
    add("__NATIVE_LIST_REMOVE_AT", 2, list_remove_at);
    add("__NATIVE_LIST_CLEAR", 1, list_clear);
    add("__NATIVE_LIST_SIZE", 1, list_size);

    add("__NATIVE_TUPLE_SIZE", 1, tuple_size);

    add("__NATIVE_RANGE_START", 1, range_start);
    add("__NATIVE_RANGE_END", 1, range_end);
    add("__NATIVE_RANGE_INCREMENT", 1, range_increment);
    add("__NATIVE_RANGE_INCLUSIVE", 1, range_inclusive);
    add("__NATIVE_RANGE_IS_INFINITE", 1, range_is_infinite);

    add("__NATIVE_DICT_CONTAINS_KEY", 2, dict_contains_key);
    add("__NATIVE_DICT_TRY_INSERT", 3, dict_try_insert);
    add("__NATIVE_DICT_INSERT_OR_UPDATE", 3, dict_insert_or_update);
    add("__NATIVE_DICT_REMOVE", 2, dict_remove);
    add("__NATIVE_DICT_SIZE", 1, dict_size);
    add("__NATIVE_DICT_CAPACITY", 1, dict_capacity);

    add("__NATIVE_SET_CONTAINS", 2, set_contains);
    add("__NATIVE_SET_TRY_INSERT", 2, set_try_insert);
    add("__NATIVE_SET_REMOVE", 2, set_remove);
    add("__NATIVE_SET_IS_SUBSET", 2, set_is_subset);
    add("__NATIVE_SET_IS_SUPERSET", 2, set_is_superset);
    add("__NATIVE_SET_UNION", 2, set_union);
    add("__NATIVE_SET_INTERSECTION", 2, set_intersection);
    add("__NATIVE_SET_DIFFERENCE", 2, set_difference);
    add("__NATIVE_SET_SYMMETRIC_DIFFERENCE", 2, set_symmetric_difference);
    add("__NATIVE_SET_SIZE", 1, set_size);

    add("__NATIVE_EXCEPTION_MESSAGE", 1, exception_message);
}

fn take1(mut args: Vec<Value>) -> Value {
    args.pop().expect("native arity checked at compile time")
}

fn take2(mut args: Vec<Value>) -> (Value, Value) {
    let b = args.pop().expect("native arity checked at compile time");
    let a = args.pop().expect("native arity checked at compile time");
    (a, b)
}

fn take3(mut args: Vec<Value>) -> (Value, Value, Value) {
    let c = args.pop().expect("native arity checked at compile time");
    let b = args.pop().expect("native arity checked at compile time");
    let a = args.pop().expect("native arity checked at compile time");
    (a, b, c)
}

fn wrong_type(heap: &mut Heap, value: Value, expected: Type, position: usize) -> PoiseException {
    let actual = value.type_of(heap);
    value.drop_with_heap(heap);
    PoiseException::new(
        ExcType::InvalidType,
        format!("Expected {expected} at position {position} but got {actual}"),
    )
}

fn expect_ref(heap: &mut Heap, value: Value, expected: Type, position: usize) -> RunResult<(Value, HeapId)> {
    match value.ref_id() {
        Some(id) if heap.get(id).type_of() == expected => Ok((value, id)),
        _ => Err(wrong_type(heap, value, expected, position)),
    }
}

// ---- int ----

fn int_pow(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (base, exponent) = take2(args);
    match (base, exponent) {
        (Value::Int(b), Value::Int(e)) => Ok(Value::Int(b.wrapping_pow(u32::try_from(e).unwrap_or(0)))),
        (Value::Int(_), other) => Err(wrong_type(heap, other, Type::Int, 1)),
        (other, second) => {
            second.drop_with_heap(heap);
            Err(wrong_type(heap, other, Type::Int, 0))
        }
    }
}

fn int_sqrt(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    match take1(args) {
        Value::Int(i) => Ok(Value::Int((i as f64).sqrt() as i64)),
        other => Err(wrong_type(heap, other, Type::Int, 0)),
    }
}

fn int_abs(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    match take1(args) {
        Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
        other => Err(wrong_type(heap, other, Type::Int, 0)),
    }
}

// ---- float ----

fn float_pow(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (base, exponent) = take2(args);
    let b = match base {
        Value::Float(b) => b,
        other => {
            exponent.drop_with_heap(heap);
            return Err(wrong_type(heap, other, Type::Float, 0));
        }
    };
    let e = match exponent {
        Value::Float(e) => e,
        Value::Int(e) => e as f64,
        other => return Err(wrong_type(heap, other, Type::Float, 1)),
    };
    Ok(Value::Float(b.powf(e)))
}

fn float_sqrt(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    match take1(args) {
        Value::Float(f) => Ok(Value::Float(f.sqrt())),
        other => Err(wrong_type(heap, other, Type::Float, 0)),
    }
}

fn float_abs(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    match take1(args) {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(wrong_type(heap, other, Type::Float, 0)),
    }
}

// ---- list ----

fn list_append(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (list, value) = take2(args);
    let (list, id) = match expect_ref(heap, list, Type::List, 0) {
        Ok(found) => found,
        Err(exc) => {
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    heap.get_mut(id).as_list_mut().expect("checked type").append(value);
    list.drop_with_heap(heap);
    Ok(Value::None)
}

fn list_insert(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (list, index, value) = take3(args);
    let (list, id) = match expect_ref(heap, list, Type::List, 0) {
        Ok(found) => found,
        Err(exc) => {
            index.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let position = match index {
        Value::Int(position) => position,
        other => {
            list.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(wrong_type(heap, other, Type::Int, 1));
        }
    };

    let Ok(position) = usize::try_from(position) else {
        list.drop_with_heap(heap);
        value.drop_with_heap(heap);
        return Err(PoiseException::new(
            ExcType::ArgumentOutOfRange,
            format!("Insert index {position} is out of range"),
        ));
    };

    let inserted = heap.get_mut(id).as_list_mut().expect("checked type").insert(position, value);
    list.drop_with_heap(heap);
    match inserted {
        Ok(()) => Ok(Value::None),
        Err(value) => {
            value.drop_with_heap(heap);
            Err(PoiseException::new(
                ExcType::ArgumentOutOfRange,
                format!("Insert index {position} is out of range"),
            ))
        }
    }
}

fn list_remove(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (list, target) = take2(args);
    let (list, id) = match expect_ref(heap, list, Type::List, 0) {
        Ok(found) => found,
        Err(exc) => {
            target.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let removed = heap.get_mut(id).as_list_mut().expect("checked type").remove_all(&target);
    let count = removed.len();
    for value in removed {
        value.drop_with_heap(heap);
    }
    target.drop_with_heap(heap);
    list.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(count).expect("count fits i64")))
}

fn list_remove_first(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (list, target) = take2(args);
    let (list, id) = match expect_ref(heap, list, Type::List, 0) {
        Ok(found) => found,
        Err(exc) => {
            target.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let removed = heap.get_mut(id).as_list_mut().expect("checked type").remove_first(&target);
    let found = removed.is_some();
    if let Some(value) = removed {
        value.drop_with_heap(heap);
    }
    target.drop_with_heap(heap);
    list.drop_with_heap(heap);
    Ok(Value::Bool(found))
}

fn list_remove_at(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (list, index) = take2(args);
    let (list, id) = match expect_ref(heap, list, Type::List, 0) {
        Ok(found) => found,
        Err(exc) => {
            index.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let position = match index {
        Value::Int(position) => position,
        other => {
            list.drop_with_heap(heap);
            return Err(wrong_type(heap, other, Type::Int, 1));
        }
    };

    let removed = usize::try_from(position)
        .ok()
        .and_then(|position| heap.get_mut(id).as_list_mut().expect("checked type").remove_at(position));
    let found = removed.is_some();
    if let Some(value) = removed {
        value.drop_with_heap(heap);
    }
    list.drop_with_heap(heap);
    Ok(Value::Bool(found))
}

fn list_clear(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let list = take1(args);
    let (list, id) = expect_ref(heap, list, Type::List, 0)?;
    let drained = heap.get_mut(id).as_list_mut().expect("checked type").clear();
    for value in drained {
        value.drop_with_heap(heap);
    }
    list.drop_with_heap(heap);
    Ok(Value::None)
}

fn list_size(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let list = take1(args);
    let (list, id) = expect_ref(heap, list, Type::List, 0)?;
    let size = heap.get(id).as_list().expect("checked type").len();
    list.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(size).expect("size fits i64")))
}

// ---- tuple ----

fn tuple_size(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let tuple = take1(args);
    let (tuple, id) = expect_ref(heap, tuple, Type::Tuple, 0)?;
    let size = heap.get(id).as_tuple().expect("checked type").len();
    tuple.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(size).expect("size fits i64")))
}

// ---- range ----

fn range_field(heap: &mut Heap, args: Vec<Value>, read: fn(&crate::types::Range) -> Value) -> RunResult<Value> {
    let range = take1(args);
    let (range, id) = expect_ref(heap, range, Type::Range, 0)?;
    let result = read(heap.get(id).as_range().expect("checked type"));
    range.drop_with_heap(heap);
    Ok(result)
}

fn range_start(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    range_field(heap, args, |range| Value::Int(range.start()))
}

fn range_end(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    range_field(heap, args, |range| Value::Int(range.end()))
}

fn range_increment(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    range_field(heap, args, |range| Value::Int(range.increment()))
}

fn range_inclusive(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    range_field(heap, args, |range| Value::Bool(range.inclusive()))
}

fn range_is_infinite(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    range_field(heap, args, |range| Value::Bool(range.is_infinite_loop()))
}

// ---- dict ----

fn dict_contains_key(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, key) = take2(args);
    let (target, id) = match expect_ref(heap, target, Type::Dict, 0) {
        Ok(found) => found,
        Err(exc) => {
            key.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let result = dict::contains_key(heap, id, &key);
    key.drop_with_heap(heap);
    target.drop_with_heap(heap);
    Ok(Value::Bool(result))
}

fn dict_try_insert(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, key, value) = take3(args);
    let (target, id) = match expect_ref(heap, target, Type::Dict, 0) {
        Ok(found) => found,
        Err(exc) => {
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let inserted = dict::try_insert(heap, id, key, value);
    target.drop_with_heap(heap);
    Ok(Value::Bool(inserted))
}

fn dict_insert_or_update(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, key, value) = take3(args);
    let (target, id) = match expect_ref(heap, target, Type::Dict, 0) {
        Ok(found) => found,
        Err(exc) => {
            key.drop_with_heap(heap);
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    dict::insert_or_update(heap, id, key, value);
    target.drop_with_heap(heap);
    Ok(Value::None)
}

fn dict_remove(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, key) = take2(args);
    let (target, id) = match expect_ref(heap, target, Type::Dict, 0) {
        Ok(found) => found,
        Err(exc) => {
            key.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let removed = dict::remove_key(heap, id, &key);
    key.drop_with_heap(heap);
    target.drop_with_heap(heap);
    Ok(Value::Bool(removed))
}

fn dict_size(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let target = take1(args);
    let (target, id) = expect_ref(heap, target, Type::Dict, 0)?;
    let size = heap.get(id).as_dict().expect("checked type").size();
    target.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(size).expect("size fits i64")))
}

fn dict_capacity(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let target = take1(args);
    let (target, id) = expect_ref(heap, target, Type::Dict, 0)?;
    let capacity = heap.get(id).as_dict().expect("checked type").capacity();
    target.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(capacity).expect("capacity fits i64")))
}

// ---- set ----

fn two_sets(heap: &mut Heap, args: Vec<Value>) -> RunResult<(Value, HeapId, Value, HeapId)> {
    let (a, b) = take2(args);
    let (a, a_id) = match expect_ref(heap, a, Type::Set, 0) {
        Ok(found) => found,
        Err(exc) => {
            b.drop_with_heap(heap);
            return Err(exc);
        }
    };
    match expect_ref(heap, b, Type::Set, 1) {
        Ok((b, b_id)) => Ok((a, a_id, b, b_id)),
        Err(exc) => {
            a.drop_with_heap(heap);
            Err(exc)
        }
    }
}

fn set_contains(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, value) = take2(args);
    let (target, id) = match expect_ref(heap, target, Type::Set, 0) {
        Ok(found) => found,
        Err(exc) => {
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let result = heap.get(id).as_set().expect("checked type").contains(&value);
    value.drop_with_heap(heap);
    target.drop_with_heap(heap);
    Ok(Value::Bool(result))
}

fn set_try_insert(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, value) = take2(args);
    let (target, id) = match expect_ref(heap, target, Type::Set, 0) {
        Ok(found) => found,
        Err(exc) => {
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let inserted = set::try_insert(heap, id, value);
    target.drop_with_heap(heap);
    Ok(Value::Bool(inserted))
}

fn set_remove(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (target, value) = take2(args);
    let (target, id) = match expect_ref(heap, target, Type::Set, 0) {
        Ok(found) => found,
        Err(exc) => {
            value.drop_with_heap(heap);
            return Err(exc);
        }
    };
    let removed = set::remove(heap, id, &value);
    value.drop_with_heap(heap);
    target.drop_with_heap(heap);
    Ok(Value::Bool(removed))
}

fn set_is_subset(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::is_subset(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(Value::Bool(result))
}

fn set_is_superset(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::is_superset(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(Value::Bool(result))
}

fn set_union(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::union(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(result)
}

fn set_intersection(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::intersection(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(result)
}

fn set_difference(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::difference(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(result)
}

fn set_symmetric_difference(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let (a, a_id, b, b_id) = two_sets(heap, args)?;
    let result = set::symmetric_difference(heap, a_id, b_id);
    a.drop_with_heap(heap);
    b.drop_with_heap(heap);
    Ok(result)
}

fn set_size(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let target = take1(args);
    let (target, id) = expect_ref(heap, target, Type::Set, 0)?;
    let size = heap.get(id).as_set().expect("checked type").size();
    target.drop_with_heap(heap);
    Ok(Value::Int(i64::try_from(size).expect("size fits i64")))
}

// ---- exception ----

fn exception_message(heap: &mut Heap, args: Vec<Value>) -> RunResult<Value> {
    let exception = take1(args);
    let (exception, id) = expect_ref(heap, exception, Type::Exception, 0)?;
    let message = heap
        .get(id)
        .as_exception()
        .expect("checked type")
        .message()
        .to_owned();
    exception.drop_with_heap(heap);
    Ok(Value::Str(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::List;

    #[test]
    fn registry_resolves_by_name_hash() {
        let mut natives = AHashMap::new();
        let mut names = AHashMap::new();
        register_all(&mut natives, &mut names);

        let hash = names["__NATIVE_LIST_APPEND"];
        assert_eq!(natives[&hash].arity, 2);
        assert_eq!(hash, hash_string("__NATIVE_LIST_APPEND"));
    }

    #[test]
    fn append_native_mutates_the_list() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::List(List::new(vec![Value::Int(1)])));
        heap.inc_ref(id);

        let result = list_append(&mut heap, vec![Value::Ref(id), Value::Int(2)]).unwrap();
        assert!(result.equals(&Value::None));
        assert_eq!(heap.get(id).as_list().unwrap().len(), 2);
        heap.dec_ref(id);
    }

    #[test]
    fn type_mismatch_raises_invalid_type() {
        let mut heap = Heap::new();
        let err = list_append(&mut heap, vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidType);
    }

    #[test]
    fn int_natives() {
        let mut heap = Heap::new();
        let result = int_pow(&mut heap, vec![Value::Int(2), Value::Int(10)]).unwrap();
        assert!(result.equals(&Value::Int(1024)));
        let result = int_sqrt(&mut heap, vec![Value::Int(81)]).unwrap();
        assert!(result.equals(&Value::Int(9)));
        let result = int_abs(&mut heap, vec![Value::Int(-5)]).unwrap();
        assert!(result.equals(&Value::Int(5)));
    }
}
