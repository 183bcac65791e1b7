//! Compiled function objects.
//!
//! A function owns its parallel (ops, constants) arrays: each op that takes
//! operands pulls the next N entries from the constants array at execution
//! time, so the two are emitted in lock step by the compiler. Lambda
//! templates live in an enclosing function's constants; `MakeLambda` clones
//! the template at runtime and the clone then receives its captures.

use std::fmt::Write as _;

use crate::{
    bytecode::{Op, OpLine},
    heap::{Heap, HeapId},
    intern,
    object::HeapData,
    value::Value,
};

#[derive(Debug)]
pub struct Function {
    name: String,
    name_hash: u64,
    file_path: String,
    namespace_hash: u64,
    arity: u8,
    variadic: bool,
    exported: bool,
    ops: Vec<OpLine>,
    constants: Vec<Value>,
    captures: Vec<Value>,
    lambda_count: u32,
}

impl Function {
    #[must_use]
    pub fn new(
        name: String,
        file_path: String,
        namespace_hash: u64,
        arity: u8,
        exported: bool,
        variadic: bool,
    ) -> Self {
        let name_hash = intern::hash_string(&name);
        Self {
            name,
            name_hash,
            file_path,
            namespace_hash,
            arity,
            variadic,
            exported,
            ops: Vec::new(),
            constants: Vec::new(),
            captures: Vec::new(),
            lambda_count: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn name_hash(&self) -> u64 {
        self.name_hash
    }

    #[must_use]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    #[must_use]
    pub fn namespace_hash(&self) -> u64 {
        self.namespace_hash
    }

    #[must_use]
    pub fn arity(&self) -> u8 {
        self.arity
    }

    #[must_use]
    pub fn variadic(&self) -> bool {
        self.variadic
    }

    #[must_use]
    pub fn exported(&self) -> bool {
        self.exported
    }

    #[must_use]
    pub fn ops(&self) -> &[OpLine] {
        &self.ops
    }

    #[must_use]
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    #[must_use]
    pub fn num_constants(&self) -> usize {
        self.constants.len()
    }

    pub fn emit_op(&mut self, op: Op, line: usize) {
        self.ops.push(OpLine { op, line });
    }

    pub fn emit_constant(&mut self, value: Value) {
        self.constants.push(value);
    }

    /// Overwrites a constant in place (jump patching). The old value must be
    /// a placeholder primitive, so no heap release is needed.
    pub fn set_constant(&mut self, index: usize, value: Value) {
        self.constants[index] = value;
    }

    #[must_use]
    pub fn captures(&self) -> &[Value] {
        &self.captures
    }

    pub fn add_capture(&mut self, value: Value) {
        self.captures.push(value);
    }

    #[must_use]
    pub fn lambda_count(&self) -> u32 {
        self.lambda_count
    }

    pub fn lambda_added(&mut self) {
        self.lambda_count += 1;
    }

    /// Numbered op/constant listing, the debug aid for codegen work.
    #[must_use]
    pub fn dump_ops(&self, heap: &Heap) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<function '{}'>", self.name);
        let _ = writeln!(out, "ops:");
        for (index, op_line) in self.ops.iter().enumerate() {
            let _ = writeln!(out, "  {index}: {} at line {}", op_line.op, op_line.line);
        }
        let _ = writeln!(out, "constants:");
        for (index, constant) in self.constants.iter().enumerate() {
            let _ = writeln!(out, "  {index}: {}", constant.to_display_string(heap));
        }
        out
    }
}

/// Clones a lambda template into a fresh, capture-less function object.
///
/// Ops are copied verbatim; constants are cloned with refcounts so the clone
/// co-owns nested templates. Captures are appended afterwards by
/// `CaptureLocal` ops.
pub fn shallow_clone_on_heap(heap: &mut Heap, template_id: HeapId) -> HeapId {
    let clone = {
        let h: &Heap = heap;
        let template = h.get(template_id).as_function().expect("expected Function on heap");
        let mut clone = Function::new(
            template.name.clone(),
            template.file_path.clone(),
            template.namespace_hash,
            template.arity,
            template.exported,
            template.variadic,
        );
        clone.lambda_count = template.lambda_count;
        clone.ops = template.ops.clone();
        clone.constants = template.constants.iter().map(|c| c.clone_with_heap(h)).collect();
        clone
    };
    heap.allocate(HeapData::Function(clone))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_clone_copies_code_but_not_captures() {
        let mut heap = Heap::new();
        let mut template = Function::new("f_lambda0".into(), "test.poise".into(), 1, 0, false, false);
        template.emit_constant(Value::Int(2));
        template.emit_op(Op::LoadConstant, 1);
        template.emit_op(Op::Return, 1);
        let template_id = heap.allocate(HeapData::Function(template));

        let clone_id = shallow_clone_on_heap(&mut heap, template_id);
        {
            let clone = heap.get(clone_id).as_function().unwrap();
            assert_eq!(clone.num_ops(), 2);
            assert_eq!(clone.num_constants(), 1);
            assert!(clone.captures().is_empty());
        }

        // clones are independent objects
        heap.get_mut(clone_id)
            .as_function_mut()
            .unwrap()
            .add_capture(Value::Int(10));
        assert!(heap.get(template_id).as_function().unwrap().captures().is_empty());

        heap.dec_ref(clone_id);
        heap.dec_ref(template_id);
    }
}
