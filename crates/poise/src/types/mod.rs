//! Runtime object types: containers, iterators, structs and reflection.

pub mod dict;
pub mod hashable;
pub mod iter;
pub mod list;
pub mod range;
pub mod set;
pub mod structs;
pub mod tuple;
pub mod r#type;

pub(crate) use dict::Dict;
pub(crate) use iter::PoiseIter;
pub(crate) use list::List;
pub(crate) use range::Range;
pub(crate) use set::Set;
pub(crate) use structs::{Struct, StructMember};
pub(crate) use tuple::Tuple;
pub(crate) use r#type::{Type, TypeObject};
