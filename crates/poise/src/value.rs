//! The tagged runtime value.
//!
//! Primitives (`Bool`, `Int`, `Float`, `Str`, `None`) are stored inline;
//! everything else is a [`HeapId`] into the refcounted arena. `Clone` is
//! intentionally not derived: use [`Value::clone_with_heap`] so the
//! referenced object's refcount tracks every holder, and release values with
//! [`Value::drop_with_heap`].
//!
//! The unary/binary operator implementations live here and are shared
//! between the VM's op handlers and the compiler's constant-expression
//! evaluator, both of which surface failures as [`PoiseException`]s.

use std::fmt::Write as _;

use crate::{
    exception::{ExcType, PoiseException, RunResult},
    heap::{Heap, HeapId},
    intern,
    object::HeapData,
    types::{List, Tuple, Type},
};

/// Primary runtime value.
#[derive(Debug)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    None,
    Ref(HeapId),
}

impl Value {
    #[must_use]
    pub fn none() -> Self {
        Self::None
    }

    /// Wraps a 64-bit name/path hash as a bytecode constant.
    #[must_use]
    pub fn from_hash(hash: u64) -> Self {
        Self::Int(hash as i64)
    }

    /// Reads back a hash constant emitted with [`Value::from_hash`].
    ///
    /// # Panics
    /// Panics when the constant is not an integer; that is a codegen bug.
    #[must_use]
    pub fn as_hash(&self) -> u64 {
        match self {
            Self::Int(i) => *i as u64,
            other => panic!("expected hash constant, got {other:?}"),
        }
    }

    /// Reads an index-valued constant (jump targets, local slots, counts).
    ///
    /// # Panics
    /// Panics when the constant is not a non-negative integer.
    #[must_use]
    pub fn as_index(&self) -> usize {
        match self {
            Self::Int(i) if *i >= 0 => usize::try_from(*i).expect("index constant out of range"),
            other => panic!("expected index constant, got {other:?}"),
        }
    }

    /// Reads a flag constant (unpack/dot-call/newline markers).
    ///
    /// # Panics
    /// Panics when the constant is not a boolean.
    #[must_use]
    pub fn as_flag(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            other => panic!("expected flag constant, got {other:?}"),
        }
    }

    #[must_use]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Duplicates this value, sharing ownership of any referenced object.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::Str(s) => Self::Str(s.clone()),
            Self::None => Self::None,
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
        }
    }

    /// Releases this value, freeing the referenced object at refcount zero.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    #[must_use]
    pub fn type_of(&self, heap: &Heap) -> Type {
        match self {
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Str(_) => Type::String,
            Self::None => Type::None,
            Self::Ref(id) => heap.get(*id).type_of(),
        }
    }

    #[must_use]
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::None => false,
            Self::Ref(_) => true,
        }
    }

    pub fn to_int(&self, heap: &Heap) -> RunResult<i64> {
        match self {
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Int(i) => Ok(*i),
            Self::Float(f) => Ok(*f as i64),
            Self::Str(s) => s.trim().parse::<i64>().map_err(|_| {
                PoiseException::new(ExcType::InvalidCast, format!("Cannot parse '{s}' as Int"))
            }),
            _ => Err(PoiseException::new(
                ExcType::InvalidType,
                format!("Cannot convert {} to Int", self.type_of(heap)),
            )),
        }
    }

    pub fn to_float(&self, heap: &Heap) -> RunResult<f64> {
        match self {
            Self::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Ok(*i as f64),
            Self::Float(f) => Ok(*f),
            Self::Str(s) => s.trim().parse::<f64>().map_err(|_| {
                PoiseException::new(ExcType::InvalidCast, format!("Cannot parse '{s}' as Float"))
            }),
            _ => Err(PoiseException::new(
                ExcType::InvalidType,
                format!("Cannot convert {} to Float", self.type_of(heap)),
            )),
        }
    }

    /// Stable hash used by the open-addressed containers.
    ///
    /// Objects hash by identity, matching their identity-based equality.
    #[must_use]
    pub fn hash_value(&self) -> u64 {
        match self {
            Self::Bool(b) => intern::hash_of(&(1u8, u8::from(*b))),
            Self::Int(i) => intern::hash_of(i),
            Self::Float(f) => intern::hash_of(&f.to_bits()),
            Self::Str(s) => intern::hash_string(s),
            Self::None => intern::hash_of(&2u8),
            Self::Ref(id) => intern::hash_of(&id.index()),
        }
    }

    /// Structural display used by `print` and string conversion.
    ///
    /// `chain` carries the heap ids currently being rendered; revisiting one
    /// prints a literal `...` so self-referential containers terminate.
    pub fn write_display(&self, out: &mut String, heap: &Heap, chain: &mut Vec<HeapId>) {
        match self {
            Self::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => {
                let _ = write!(out, "{f}");
            }
            Self::Str(s) => out.push_str(s),
            Self::None => out.push_str("none"),
            Self::Ref(id) => {
                if chain.contains(id) {
                    out.push_str("...");
                    return;
                }
                chain.push(*id);
                heap.get(*id).write_display(*id, out, heap, chain);
                chain.pop();
            }
        }
    }

    #[must_use]
    pub fn to_display_string(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.write_display(&mut out, heap, &mut Vec::new());
        out
    }

    /// Equality: numeric values compare numerically across Int/Float/Bool,
    /// strings by content, objects by identity; mismatched categories are
    /// unequal, never an error.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Bool(a), Self::Int(b)) | (Self::Int(b), Self::Bool(a)) => i64::from(*a) == *b,
            (Self::Bool(a), Self::Float(b)) | (Self::Float(b), Self::Bool(a)) => {
                f64::from(u8::from(*a)) == *b
            }
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::None, Self::None) => true,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    fn numeric_pair(&self, other: &Self) -> Option<(f64, f64)> {
        if self.is_number() && other.is_number() {
            let a = match self {
                Self::Int(i) => *i as f64,
                Self::Float(f) => *f,
                _ => unreachable!(),
            };
            let b = match other {
                Self::Int(i) => *i as f64,
                Self::Float(f) => *f,
                _ => unreachable!(),
            };
            Some((a, b))
        } else {
            None
        }
    }

    pub fn less_than(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a < b),
            _ => match self.numeric_pair(other) {
                Some((a, b)) => Ok(a < b),
                None => Err(invalid_ordering("<", self, other, heap)),
            },
        }
    }

    pub fn less_equal(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a <= b),
            _ => match self.numeric_pair(other) {
                Some((a, b)) => Ok(a <= b),
                None => Err(invalid_ordering("<=", self, other, heap)),
            },
        }
    }

    pub fn greater_than(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a > b),
            _ => match self.numeric_pair(other) {
                Some((a, b)) => Ok(a > b),
                None => Err(invalid_ordering(">", self, other, heap)),
            },
        }
    }

    pub fn greater_equal(&self, other: &Self, heap: &Heap) -> RunResult<bool> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(a >= b),
            _ => match self.numeric_pair(other) {
                Some((a, b)) => Ok(a >= b),
                None => Err(invalid_ordering(">=", self, other, heap)),
            },
        }
    }

    pub fn add(&self, other: &Self, heap: &mut Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_add(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 + b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a + *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a + b)),
            (Self::Str(a), _) => {
                let mut out = a.clone();
                other.write_display(&mut out, heap, &mut Vec::new());
                Ok(Self::Str(out))
            }
            (Self::Ref(a), Self::Ref(b)) => concat_iterables(*a, *b, heap)
                .ok_or_else(|| invalid_operands("+", self, other, heap)),
            _ => Err(invalid_operands("+", self, other, heap)),
        }
    }

    pub fn sub(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_sub(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 - b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a - *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a - b)),
            _ => Err(invalid_operands("-", self, other, heap)),
        }
    }

    pub fn mul(&self, other: &Self, heap: &mut Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_mul(*b))),
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 * b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a * *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a * b)),
            (Self::Str(s), Self::Int(n)) => {
                if *n < 0 {
                    return Err(PoiseException::new(
                        ExcType::InvalidOperand,
                        "Factor to repeat String cannot be negative",
                    ));
                }
                Ok(Self::Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            (Self::Ref(id), Self::Int(n)) => repeat_iterable(*id, *n, heap)
                .transpose()
                .unwrap_or_else(|| Err(invalid_operands("*", self, other, heap))),
            _ => Err(invalid_operands("*", self, other, heap)),
        }
    }

    pub fn div(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(PoiseException::new(ExcType::DivisionByZero, "Division by zero"))
                } else {
                    Ok(Self::Int(a.wrapping_div(*b)))
                }
            }
            (Self::Int(a), Self::Float(b)) => Ok(Self::Float(*a as f64 / b)),
            (Self::Float(a), Self::Int(b)) => Ok(Self::Float(a / *b as f64)),
            (Self::Float(a), Self::Float(b)) => Ok(Self::Float(a / b)),
            _ => Err(invalid_operands("/", self, other, heap)),
        }
    }

    pub fn rem(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                if *b == 0 {
                    Err(PoiseException::new(ExcType::DivisionByZero, "Modulus by zero"))
                } else {
                    Ok(Self::Int(a.wrapping_rem(*b)))
                }
            }
            _ => Err(invalid_operands("%", self, other, heap)),
        }
    }

    pub fn bit_or(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a | b)),
            _ => Err(invalid_operands("|", self, other, heap)),
        }
    }

    pub fn bit_xor(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a ^ b)),
            _ => Err(invalid_operands("^", self, other, heap)),
        }
    }

    pub fn bit_and(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a & b)),
            _ => Err(invalid_operands("&", self, other, heap)),
        }
    }

    pub fn shift_left(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_shl(*b as u32))),
            _ => Err(invalid_operands("<<", self, other, heap)),
        }
    }

    pub fn shift_right(&self, other: &Self, heap: &Heap) -> RunResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(a.wrapping_shr(*b as u32))),
            _ => Err(invalid_operands(">>", self, other, heap)),
        }
    }

    #[must_use]
    pub fn logic_not(&self) -> Self {
        Self::Bool(!self.to_bool())
    }

    pub fn negate(&self, heap: &Heap) -> RunResult<Self> {
        match self {
            Self::Int(i) => Ok(Self::Int(i.wrapping_neg())),
            Self::Float(f) => Ok(Self::Float(-f)),
            _ => Err(invalid_unary("-", self, heap)),
        }
    }

    pub fn bitwise_not(&self, heap: &Heap) -> RunResult<Self> {
        match self {
            Self::Int(i) => Ok(Self::Int(!i)),
            _ => Err(invalid_unary("~", self, heap)),
        }
    }

    pub fn unary_plus(&self, heap: &Heap) -> RunResult<Self> {
        match self {
            Self::Int(i) => Ok(Self::Int(*i)),
            Self::Float(f) => Ok(Self::Float(*f)),
            _ => Err(invalid_unary("+", self, heap)),
        }
    }
}

fn invalid_operands(op: &str, a: &Value, b: &Value, heap: &Heap) -> PoiseException {
    PoiseException::new(
        ExcType::InvalidOperand,
        format!(
            "Invalid operand types for {op}: '{}' and '{}'",
            a.type_of(heap),
            b.type_of(heap)
        ),
    )
}

fn invalid_ordering(op: &str, a: &Value, b: &Value, heap: &Heap) -> PoiseException {
    PoiseException::new(
        ExcType::InvalidOperand,
        format!(
            "Invalid operand types for {op}: '{}' and '{}'",
            a.type_of(heap),
            b.type_of(heap)
        ),
    )
}

fn invalid_unary(op: &str, v: &Value, heap: &Heap) -> PoiseException {
    PoiseException::new(
        ExcType::InvalidOperand,
        format!("Invalid operand type for {op}: '{}'", v.type_of(heap)),
    )
}

/// List+List / Tuple+Tuple concatenation; `None` when the operand types do
/// not support it.
fn concat_iterables(a: HeapId, b: HeapId, heap: &mut Heap) -> Option<Value> {
    let built = {
        let h: &Heap = heap;
        match (h.get(a), h.get(b)) {
            (HeapData::List(left), HeapData::List(right)) => {
                let mut items = Vec::with_capacity(left.items().len() + right.items().len());
                for item in left.items().iter().chain(right.items()) {
                    items.push(item.clone_with_heap(h));
                }
                Some((true, items))
            }
            (HeapData::Tuple(left), HeapData::Tuple(right)) => {
                let mut items = Vec::with_capacity(left.items().len() + right.items().len());
                for item in left.items().iter().chain(right.items()) {
                    items.push(item.clone_with_heap(h));
                }
                Some((false, items))
            }
            _ => None,
        }
    };

    let (is_list, combined) = built?;
    let id = if is_list {
        heap.allocate(HeapData::List(List::new(combined)))
    } else {
        heap.allocate(HeapData::Tuple(Tuple::new(combined)))
    };
    Some(Value::Ref(id))
}

/// List*Int / Tuple*Int repetition; `None` when the left operand is neither.
fn repeat_iterable(id: HeapId, times: i64, heap: &mut Heap) -> RunResult<Option<Value>> {
    let built = {
        let h: &Heap = heap;
        let (is_list, source) = match h.get(id) {
            HeapData::List(list) => (true, list.items()),
            HeapData::Tuple(tuple) => (false, tuple.items()),
            _ => return Ok(None),
        };

        if times < 0 {
            return Err(PoiseException::new(
                ExcType::InvalidOperand,
                "Factor to repeat iterable cannot be negative",
            ));
        }

        let times = usize::try_from(times).unwrap_or(0);
        let mut repeated = Vec::with_capacity(source.len() * times);
        for _ in 0..times {
            for item in source {
                repeated.push(item.clone_with_heap(h));
            }
        }
        (is_list, repeated)
    };

    let (is_list, repeated) = built;
    let new_id = if is_list {
        heap.allocate(HeapData::List(List::new(repeated)))
    } else {
        heap.allocate(HeapData::Tuple(Tuple::new(repeated)))
    };
    Ok(Some(Value::Ref(new_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExcType;

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        let mut heap = Heap::new();
        let sum = Value::Int(1).add(&Value::Float(2.5), &mut heap).unwrap();
        assert!(matches!(sum, Value::Float(f) if f == 3.5));

        let product = Value::Float(2.0).mul(&Value::Int(3), &mut heap).unwrap();
        assert!(matches!(product, Value::Float(f) if f == 6.0));
    }

    #[test]
    fn integer_division_truncates_and_guards_zero() {
        let heap = Heap::new();
        let q = Value::Int(7).div(&Value::Int(2), &heap).unwrap();
        assert!(matches!(q, Value::Int(3)));

        let err = Value::Int(1).div(&Value::Int(0), &heap).unwrap_err();
        assert_eq!(err.kind(), ExcType::DivisionByZero);

        let inf = Value::Float(1.0).div(&Value::Int(0), &heap).unwrap();
        assert!(matches!(inf, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn modulus_is_integer_only() {
        let heap = Heap::new();
        let r = Value::Int(7).rem(&Value::Int(3), &heap).unwrap();
        assert!(matches!(r, Value::Int(1)));

        let err = Value::Float(7.0).rem(&Value::Float(3.0), &heap).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidOperand);
    }

    #[test]
    fn string_concat_stringifies_rhs() {
        let mut heap = Heap::new();
        let joined = Value::Str("n = ".into()).add(&Value::Int(4), &mut heap).unwrap();
        assert!(matches!(joined, Value::Str(s) if s == "n = 4"));
    }

    #[test]
    fn string_repeat_rejects_negative_factor() {
        let mut heap = Heap::new();
        let tripled = Value::Str("ab".into()).mul(&Value::Int(3), &mut heap).unwrap();
        assert!(matches!(tripled, Value::Str(s) if s == "ababab"));

        let err = Value::Str("ab".into()).mul(&Value::Int(-1), &mut heap).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidOperand);
    }

    #[test]
    fn equality_is_numeric_across_kinds_and_never_throws() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Bool(true).equals(&Value::Int(1)));
        assert!(!Value::Int(1).equals(&Value::Str("1".into())));
        assert!(!Value::None.equals(&Value::Int(0)));
        assert!(Value::Str("a".into()).equals(&Value::Str("a".into())));
    }

    #[test]
    fn ordering_requires_numbers() {
        let heap = Heap::new();
        assert!(Value::Int(1).less_than(&Value::Float(1.5), &heap).unwrap());
        let err = Value::Str("a".into())
            .less_than(&Value::Str("b".into()), &heap)
            .unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidOperand);
    }

    #[test]
    fn bitwise_requires_integers() {
        let heap = Heap::new();
        assert!(matches!(Value::Int(6).bit_and(&Value::Int(3), &heap).unwrap(), Value::Int(2)));
        let err = Value::Float(6.0).bit_or(&Value::Int(1), &heap).unwrap_err();
        assert_eq!(err.kind(), ExcType::InvalidOperand);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::None.to_bool());
        assert!(!Value::Int(0).to_bool());
        assert!(Value::Int(-1).to_bool());
        assert!(!Value::Str(String::new()).to_bool());
        assert!(Value::Str("x".into()).to_bool());
    }

    #[test]
    fn display_of_primitives() {
        let heap = Heap::new();
        assert_eq!(Value::Int(7).to_display_string(&heap), "7");
        assert_eq!(Value::Float(2.5).to_display_string(&heap), "2.5");
        assert_eq!(Value::Bool(true).to_display_string(&heap), "true");
        assert_eq!(Value::None.to_display_string(&heap), "none");
        assert_eq!(Value::Str("hi".into()).to_display_string(&heap), "hi");
    }
}
