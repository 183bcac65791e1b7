//! The closed object hierarchy stored in the heap arena.
//!
//! Each heap slot holds one [`HeapData`] variant. Dispatch that the original
//! design expressed with virtual methods and downcasts is a `match` here:
//! type tags, display, child-reference collection for freeing, and
//! `Option<&T>` accessors per variant.

use std::fmt::Write as _;

use crate::{
    exception::PoiseException,
    function::Function,
    heap::{Heap, HeapId},
    types::{Dict, List, PoiseIter, Range, Set, Struct, Tuple, Type, TypeObject, hashable::CellState},
    value::Value,
};

#[derive(Debug)]
pub enum HeapData {
    Function(Function),
    Exception(PoiseException),
    Type(TypeObject),
    List(List),
    Tuple(Tuple),
    Range(Range),
    Dict(Dict),
    Set(Set),
    Iterator(PoiseIter),
    Struct(Struct),
}

impl HeapData {
    #[must_use]
    pub fn type_of(&self) -> Type {
        match self {
            Self::Function(_) => Type::Function,
            Self::Exception(_) => Type::Exception,
            Self::Type(_) => Type::Type,
            Self::List(_) => Type::List,
            Self::Tuple(_) => Type::Tuple,
            Self::Range(_) => Type::Range,
            Self::Dict(_) => Type::Dict,
            Self::Set(_) => Type::Set,
            Self::Iterator(_) => Type::Iterator,
            Self::Struct(_) => Type::Struct,
        }
    }

    /// The generation counter iterators validate against; `None` for
    /// non-iterable objects.
    #[must_use]
    pub fn iterable_generation(&self) -> Option<u64> {
        match self {
            Self::List(list) => Some(list.generation()),
            Self::Tuple(_) => Some(0),
            Self::Range(range) => Some(range.generation()),
            Self::Dict(dict) => Some(dict.generation()),
            Self::Set(set) => Some(set.generation()),
            _ => None,
        }
    }

    /// Collects the heap ids this object holds strong references to.
    ///
    /// Called when the object is freed so the children's counts drop too.
    pub fn collect_child_ids(&self, out: &mut Vec<HeapId>) {
        let mut push = |value: &Value| {
            if let Some(id) = value.ref_id() {
                out.push(id);
            }
        };

        match self {
            Self::Function(function) => {
                for constant in function.constants() {
                    push(constant);
                }
                for capture in function.captures() {
                    push(capture);
                }
            }
            Self::Exception(_) => {}
            Self::Type(type_object) => {
                for extension in type_object.extensions() {
                    push(extension);
                }
            }
            Self::List(list) => {
                for item in list.items() {
                    push(item);
                }
            }
            Self::Tuple(tuple) => {
                for item in tuple.items() {
                    push(item);
                }
            }
            Self::Range(_) => {}
            Self::Dict(dict) => {
                for cell in dict.occupied() {
                    push(cell);
                }
            }
            Self::Set(set) => {
                for cell in set.occupied() {
                    push(cell);
                }
            }
            Self::Iterator(iter) => push(iter.iterable()),
            Self::Struct(strukt) => {
                for member in strukt.members() {
                    push(&member.value);
                }
            }
        }
    }

    /// Structural display; `chain` holds the ids being rendered so cycles
    /// print `...` instead of recursing forever.
    pub fn write_display(&self, id: HeapId, out: &mut String, heap: &Heap, chain: &mut Vec<HeapId>) {
        match self {
            Self::Function(function) => {
                let _ = write!(out, "<function instance '{}' at {:#x}>", function.name(), id.index());
            }
            Self::Exception(exception) => {
                let _ = write!(out, "{exception}");
            }
            Self::Type(type_object) => {
                let _ = write!(out, "<type instance '{}' at {:#x}>", type_object.name(), id.index());
            }
            Self::List(list) => {
                out.push('[');
                for (index, item) in list.items().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_display(out, heap, chain);
                }
                out.push(']');
            }
            Self::Tuple(tuple) => {
                out.push('(');
                for (index, item) in tuple.items().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_display(out, heap, chain);
                }
                out.push(')');
            }
            Self::Range(range) => {
                let _ = write!(
                    out,
                    "{}{}{} by {}",
                    range.start(),
                    if range.inclusive() { "..=" } else { ".." },
                    range.end(),
                    range.increment()
                );
            }
            Self::Dict(dict) => {
                out.push('{');
                let mut first = true;
                for (state, cell) in dict.states().iter().zip(dict.cells()) {
                    if *state != CellState::Occupied {
                        continue;
                    }
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    cell.write_display(out, heap, chain);
                }
                out.push('}');
            }
            Self::Set(set) => {
                out.push('{');
                let mut first = true;
                for (state, cell) in set.states().iter().zip(set.cells()) {
                    if *state != CellState::Occupied {
                        continue;
                    }
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    cell.write_display(out, heap, chain);
                }
                out.push('}');
            }
            Self::Iterator(_) => {
                let _ = write!(out, "<iterator instance at {:#x}>", id.index());
            }
            Self::Struct(strukt) => {
                let _ = write!(out, "<struct {}>", strukt.name());
            }
        }
    }

    #[must_use]
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut Function> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_exception(&self) -> Option<&PoiseException> {
        match self {
            Self::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_type(&self) -> Option<&TypeObject> {
        match self {
            Self::Type(type_object) => Some(type_object),
            _ => None,
        }
    }

    pub fn as_type_mut(&mut self) -> Option<&mut TypeObject> {
        match self {
            Self::Type(type_object) => Some(type_object),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut List> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Self::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_range(&self) -> Option<&Range> {
        match self {
            Self::Range(range) => Some(range),
            _ => None,
        }
    }

    pub fn as_range_mut(&mut self) -> Option<&mut Range> {
        match self {
            Self::Range(range) => Some(range),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            Self::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_set(&self) -> Option<&Set> {
        match self {
            Self::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut Set> {
        match self {
            Self::Set(set) => Some(set),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_iterator(&self) -> Option<&PoiseIter> {
        match self {
            Self::Iterator(iter) => Some(iter),
            _ => None,
        }
    }

    pub fn as_iterator_mut(&mut self) -> Option<&mut PoiseIter> {
        match self {
            Self::Iterator(iter) => Some(iter),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Self::Struct(strukt) => Some(strukt),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut Struct> {
        match self {
            Self::Struct(strukt) => Some(strukt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_referential_list_displays_ellipsis() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::List(List::new(vec![Value::Int(1)])));
        heap.inc_ref(id);
        if let HeapData::List(list) = heap.get_mut(id) {
            list.append(Value::Ref(id));
        }

        let rendered = Value::Ref(id).to_display_string(&heap);
        assert_eq!(rendered, "[1, ...]");

        // undo the cycle so the refcount test harness stays balanced
        heap.dec_ref(id);
        drop(heap);
    }

    #[test]
    fn container_displays() {
        let mut heap = Heap::new();
        let tuple_id = heap.allocate(HeapData::Tuple(Tuple::new(vec![
            Value::Str("a".into()),
            Value::Int(1),
        ])));
        assert_eq!(Value::Ref(tuple_id).to_display_string(&heap), "(a, 1)");

        let range_id = heap.allocate(HeapData::Range(Range::new(0, 5, 1, true)));
        assert_eq!(Value::Ref(range_id).to_display_string(&heap), "0..=5 by 1");
    }
}
