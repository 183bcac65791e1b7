//! Runtime type tags and reflection objects.
//!
//! Every value has a [`Type`] tag; each tag also has one registered
//! [`TypeObject`] on the heap (owned by the VM's type registry) carrying the
//! display name, the constructor dispatch, and the extension functions
//! registered against the type with `this`-parameters.

use strum::{Display, FromRepr, IntoStaticStr};

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    object::HeapData,
    types::{List, Range, Tuple, dict, set},
    value::Value,
};

/// Runtime type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[repr(u8)]
pub enum Type {
    Bool,
    Float,
    Int,
    None,
    String,
    Exception,
    Function,
    List,
    Range,
    Tuple,
    Dict,
    Set,
    Iterator,
    Struct,
    Type,
}

impl Type {
    /// All tags that have a registered reflection object.
    pub const ALL: [Self; 15] = [
        Self::Bool,
        Self::Float,
        Self::Int,
        Self::None,
        Self::String,
        Self::Exception,
        Self::Function,
        Self::List,
        Self::Range,
        Self::Tuple,
        Self::Dict,
        Self::Set,
        Self::Iterator,
        Self::Struct,
        Self::Type,
    ];
}

/// Reflection object for one runtime type.
#[derive(Debug)]
pub struct TypeObject {
    tag: Type,
    name: &'static str,
    extensions: Vec<Value>,
}

impl TypeObject {
    #[must_use]
    pub fn new(tag: Type) -> Self {
        Self {
            tag,
            name: tag.into(),
            extensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn tag(&self) -> Type {
        self.tag
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn extensions(&self) -> &[Value] {
        &self.extensions
    }

    /// Registers an extension function value (owns the reference).
    pub fn add_extension(&mut self, function: Value) {
        self.extensions.push(function);
    }
}

/// Finds the extension function registered on `type_id` for `name_hash`.
///
/// More than one registration with the same name is an AmbiguousCall.
pub fn find_extension(heap: &Heap, type_id: HeapId, name_hash: u64) -> RunResult<Option<Value>> {
    let type_object = heap.get(type_id).as_type().expect("expected Type on heap");

    let mut matches = Vec::new();
    for extension in type_object.extensions() {
        let function_id = extension.ref_id().expect("extension is a function ref");
        let function = heap.get(function_id).as_function().expect("extension is a Function");
        if function.name_hash() == name_hash {
            matches.push((extension, function.name().to_owned(), function.file_path().to_owned()));
        }
    }

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0].0.clone_with_heap(heap))),
        _ => {
            let name = matches[0].1.clone();
            let paths: Vec<String> = matches.into_iter().map(|(_, _, path)| path).collect();
            Err(PoiseException::new(
                ExcType::AmbiguousCall,
                format!(
                    "Ambiguous extension function call: '{name}()' defined in {}",
                    paths.join(" and ")
                ),
            ))
        }
    }
}

fn drop_args(heap: &mut Heap, args: Vec<Value>) {
    for arg in args {
        arg.drop_with_heap(heap);
    }
}

fn expect_arg_count(heap: &mut Heap, tag: Type, args: Vec<Value>, expected: usize) -> RunResult<Vec<Value>> {
    if args.len() == expected {
        Ok(args)
    } else {
        let given = args.len();
        drop_args(heap, args);
        Err(PoiseException::new(
            ExcType::IncorrectArgCount,
            format!("'{tag}' constructor takes {expected} argument(s) but was given {given}"),
        ))
    }
}

fn at_most_one(heap: &mut Heap, tag: Type, args: Vec<Value>) -> RunResult<Option<Value>> {
    match args.len() {
        0 => Ok(None),
        1 => Ok(args.into_iter().next()),
        given => {
            drop_args(heap, args);
            Err(PoiseException::new(
                ExcType::IncorrectArgCount,
                format!("'{tag}' constructor takes at most 1 argument but was given {given}"),
            ))
        }
    }
}

/// Dispatches `ConstructBuiltin`: builds a value of `tag` from `args`.
///
/// `inclusive` only applies to Range construction.
pub fn construct_builtin(heap: &mut Heap, tag: Type, args: Vec<Value>, inclusive: bool) -> RunResult<Value> {
    match tag {
        Type::Bool => {
            let arg = at_most_one(heap, tag, args)?;
            let result = arg.as_ref().is_some_and(Value::to_bool);
            if let Some(arg) = arg {
                arg.drop_with_heap(heap);
            }
            Ok(Value::Bool(result))
        }
        Type::Int => {
            let arg = at_most_one(heap, tag, args)?;
            match arg {
                Some(arg) => {
                    let result = arg.to_int(heap);
                    arg.drop_with_heap(heap);
                    Ok(Value::Int(result?))
                }
                None => Ok(Value::Int(0)),
            }
        }
        Type::Float => {
            let arg = at_most_one(heap, tag, args)?;
            match arg {
                Some(arg) => {
                    let result = arg.to_float(heap);
                    arg.drop_with_heap(heap);
                    Ok(Value::Float(result?))
                }
                None => Ok(Value::Float(0.0)),
            }
        }
        Type::String => {
            let arg = at_most_one(heap, tag, args)?;
            match arg {
                Some(arg) => {
                    let result = arg.to_display_string(heap);
                    arg.drop_with_heap(heap);
                    Ok(Value::Str(result))
                }
                None => Ok(Value::Str(String::new())),
            }
        }
        Type::None => {
            let arg = at_most_one(heap, tag, args)?;
            match arg {
                Some(Value::None) | None => Ok(Value::None),
                Some(arg) => {
                    let kind = arg.type_of(heap);
                    arg.drop_with_heap(heap);
                    Err(PoiseException::new(
                        ExcType::InvalidType,
                        format!("Cannot construct None from '{kind}'"),
                    ))
                }
            }
        }
        Type::Exception => {
            let mut args = expect_arg_count(heap, tag, args, 1)?;
            let arg = args.pop().expect("checked length");
            let message = arg.to_display_string(heap);
            arg.drop_with_heap(heap);
            let id = heap.allocate(HeapData::Exception(PoiseException::plain(message)));
            Ok(Value::Ref(id))
        }
        Type::Function => {
            let mut args = expect_arg_count(heap, tag, args, 1)?;
            let arg = args.pop().expect("checked length");
            let is_function = arg
                .ref_id()
                .is_some_and(|id| heap.get(id).as_function().is_some());
            if is_function {
                Ok(arg)
            } else {
                arg.drop_with_heap(heap);
                Err(PoiseException::new(
                    ExcType::InvalidType,
                    "'Function' can only be constructed from Function or Lambda",
                ))
            }
        }
        Type::List => {
            let id = heap.allocate(HeapData::List(List::new(args)));
            Ok(Value::Ref(id))
        }
        Type::Tuple => {
            let id = heap.allocate(HeapData::Tuple(Tuple::new(args)));
            Ok(Value::Ref(id))
        }
        Type::Dict => dict::from_pairs(heap, args),
        Type::Set => Ok(set::from_values(heap, args)),
        Type::Range => {
            let args = expect_arg_count(heap, tag, args, 3)?;
            let mut bounds = [0i64; 3];
            let mut failed = None;
            for (slot, arg) in bounds.iter_mut().zip(&args) {
                if arg.is_number() {
                    *slot = arg.to_int(heap).expect("numbers convert to Int");
                } else {
                    failed = Some(arg.type_of(heap));
                }
            }
            drop_args(heap, args);
            if let Some(kind) = failed {
                return Err(PoiseException::new(
                    ExcType::InvalidType,
                    format!("Range bounds must be numbers but got '{kind}'"),
                ));
            }
            let id = heap.allocate(HeapData::Range(Range::new(bounds[0], bounds[1], bounds[2], inclusive)));
            Ok(Value::Ref(id))
        }
        Type::Iterator | Type::Struct | Type::Type => {
            drop_args(heap, args);
            Err(PoiseException::new(
                ExcType::InvalidType,
                format!("Cannot construct {tag}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrips_through_repr() {
        for tag in Type::ALL {
            assert_eq!(Type::from_repr(tag as u8), Some(tag));
        }
    }

    #[test]
    fn primitive_constructors_convert() {
        let mut heap = Heap::new();
        let b = construct_builtin(&mut heap, Type::Bool, vec![Value::Int(2)], false).unwrap();
        assert!(b.equals(&Value::Bool(true)));

        let i = construct_builtin(&mut heap, Type::Int, vec![Value::Str("42".into())], false).unwrap();
        assert!(i.equals(&Value::Int(42)));

        let f = construct_builtin(&mut heap, Type::Float, vec![], false).unwrap();
        assert!(f.equals(&Value::Float(0.0)));

        let s = construct_builtin(&mut heap, Type::String, vec![Value::Int(7)], false).unwrap();
        assert!(s.equals(&Value::Str("7".into())));
    }

    #[test]
    fn range_constructor_checks_numbers() {
        let mut heap = Heap::new();
        let r = construct_builtin(
            &mut heap,
            Type::Range,
            vec![Value::Int(0), Value::Int(10), Value::Int(2)],
            false,
        )
        .unwrap();
        let range_id = r.ref_id().unwrap();
        assert_eq!(heap.get(range_id).as_range().unwrap().to_values(), vec![0, 2, 4, 6, 8]);
        r.drop_with_heap(&mut heap);

        let err = construct_builtin(
            &mut heap,
            Type::Range,
            vec![Value::Str("x".into()), Value::Int(1), Value::Int(1)],
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidType);
    }

    #[test]
    fn type_itself_cannot_be_constructed() {
        let mut heap = Heap::new();
        let err = construct_builtin(&mut heap, Type::Type, vec![], false).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidType);
    }
}
