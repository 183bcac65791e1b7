//! The virtual machine.
//!
//! Execution walks the current frame's parallel (ops, constants) arrays.
//! One flat data stack, one flat locals vector (frames carry an offset into
//! it), a stack of live iterators, and a stack of try handlers recording the
//! depths to restore on unwind. The compiler emits into the VM through
//! [`Vm::emit_op`]/[`Vm::emit_constant`], routed to the function currently
//! being compiled or to the top-level bootstrap code.

mod natives;

use std::path::PathBuf;

use ahash::AHashMap;

use crate::{
    bytecode::{Op, OpLine},
    exception::{ExcType, PoiseException, RunResult},
    function,
    heap::{Heap, HeapId},
    intern::StringPool,
    io::PrintWriter,
    namespace::NamespaceManager,
    object::HeapData,
    types::{Tuple, Type, dict, iter, r#type},
    value::Value,
};

pub(crate) use natives::NativeFunction;

/// Result of executing a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    RuntimeError,
}

/// One call activation: the function being executed (None for the top-level
/// bootstrap code), cursors into its ops/constants, and where its locals
/// start in the flat locals vector.
#[derive(Debug)]
struct Frame {
    function: Option<Value>,
    op_idx: usize,
    const_idx: usize,
    locals_offset: usize,
    /// Iterator-stack depth when this frame was pushed; `Return` releases
    /// any iterators the frame left behind (a `return` inside a for-loop
    /// skips the loop's `PopIterator`).
    iter_offset: usize,
    /// Try-handler depth when this frame was pushed; `Return` discards
    /// handlers whose frame is gone.
    handler_offset: usize,
}

/// Depths to restore when an exception unwinds to this handler.
#[derive(Debug, Clone, Copy)]
struct TryHandler {
    frame_depth: usize,
    stack_depth: usize,
    locals_depth: usize,
    iter_depth: usize,
    const_idx: usize,
    op_idx: usize,
}

#[derive(Debug, Default)]
struct VmState {
    frames: Vec<Frame>,
    stack: Vec<Value>,
    locals: Vec<Value>,
    iterators: Vec<Value>,
    handlers: Vec<TryHandler>,
}

enum Control {
    Continue,
    Exit,
}

/// Internal error carrier: either a native exception or a value thrown by
/// user code (which must keep its identity through the unwind).
enum VmError {
    Exc(PoiseException),
    Thrown(Value),
}

impl From<PoiseException> for VmError {
    fn from(exc: PoiseException) -> Self {
        Self::Exc(exc)
    }
}

type StepResult = Result<Control, VmError>;

fn pop_value(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("stack underflow, there has been an error in codegen")
}

fn pop_two(stack: &mut Vec<Value>) -> (Value, Value) {
    let b = pop_value(stack);
    let a = pop_value(stack);
    (a, b)
}

/// Pops call arguments in push order. With `has_unpack` the unpacked tail's
/// count sentinel sits on top of its elements.
fn pop_call_args(stack: &mut Vec<Value>, nargs: usize, has_unpack: bool) -> Vec<Value> {
    if has_unpack {
        let count = pop_value(stack).as_index();
        let unpacked = stack.split_off(stack.len() - count);
        let mut args = stack.split_off(stack.len() - (nargs - 1));
        args.extend(unpacked);
        args
    } else {
        stack.split_off(stack.len() - nargs)
    }
}

/// The virtual machine: heap, interned names, namespaces, native registry,
/// type registry, and the top-level bootstrap code.
pub struct Vm {
    heap: Heap,
    pool: StringPool,
    namespaces: NamespaceManager,
    natives: AHashMap<u64, NativeFunction>,
    native_names: AHashMap<String, u64>,
    types: AHashMap<Type, HeapId>,
    global_ops: Vec<OpLine>,
    global_constants: Vec<Value>,
    current_function: Option<HeapId>,
    main_namespace_hash: u64,
    main_file_path: String,
    /// `POISE_STD_PATH`, read lazily and cached on first access.
    std_path: Option<Option<PathBuf>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut types = AHashMap::new();
        for tag in Type::ALL {
            let id = heap.allocate(HeapData::Type(r#type::TypeObject::new(tag)));
            types.insert(tag, id);
        }

        let mut natives = AHashMap::new();
        let mut native_names = AHashMap::new();
        natives::register_all(&mut natives, &mut native_names);

        Self {
            heap,
            pool: StringPool::new(),
            namespaces: NamespaceManager::new(),
            natives,
            native_names,
            types,
            global_ops: Vec::new(),
            global_constants: Vec::new(),
            current_function: None,
            main_namespace_hash: 0,
            main_file_path: String::new(),
            std_path: None,
        }
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub(crate) fn pool(&self) -> &StringPool {
        &self.pool
    }

    pub(crate) fn pool_mut(&mut self) -> &mut StringPool {
        &mut self.pool
    }

    pub(crate) fn namespaces(&self) -> &NamespaceManager {
        &self.namespaces
    }

    pub(crate) fn namespaces_mut(&mut self) -> &mut NamespaceManager {
        &mut self.namespaces
    }

    pub(crate) fn set_main_namespace(&mut self, hash: u64, file_path: String) {
        self.main_namespace_hash = hash;
        self.main_file_path = file_path;
    }

    /// Number of live heap objects, exposed for refcount auditing in tests.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Top-level bootstrap code, for disassembly and invariant checks.
    pub(crate) fn global_code(&self) -> (&[OpLine], &[Value]) {
        (&self.global_ops, &self.global_constants)
    }

    pub(crate) fn std_path(&mut self) -> Option<PathBuf> {
        if let Some(cached) = &self.std_path {
            return cached.clone();
        }
        let read = std::env::var_os("POISE_STD_PATH").map(PathBuf::from);
        self.std_path = Some(read.clone());
        read
    }

    pub(crate) fn native_hash(&self, name: &str) -> Option<u64> {
        self.native_names.get(name).copied()
    }

    pub(crate) fn native_arity(&self, hash: u64) -> u8 {
        self.natives[&hash].arity
    }

    pub(crate) fn add_extension_function(&mut self, tag: Type, function: Value) {
        let type_id = self.types[&tag];
        self.heap
            .get_mut(type_id)
            .as_type_mut()
            .expect("type registry holds Type objects")
            .add_extension(function);
    }

    // ---- emission (used by the compiler) ----

    pub(crate) fn current_function(&self) -> Option<HeapId> {
        self.current_function
    }

    pub(crate) fn set_current_function(&mut self, function: Option<HeapId>) {
        self.current_function = function;
    }

    pub(crate) fn emit_op(&mut self, op: Op, line: usize) {
        match self.current_function {
            Some(id) => self
                .heap
                .get_mut(id)
                .as_function_mut()
                .expect("current function is a Function")
                .emit_op(op, line),
            None => self.global_ops.push(OpLine { op, line }),
        }
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        match self.current_function {
            Some(id) => self
                .heap
                .get_mut(id)
                .as_function_mut()
                .expect("current function is a Function")
                .emit_constant(value),
            None => self.global_constants.push(value),
        }
    }

    pub(crate) fn set_constant(&mut self, index: usize, value: Value) {
        match self.current_function {
            Some(id) => self
                .heap
                .get_mut(id)
                .as_function_mut()
                .expect("current function is a Function")
                .set_constant(index, value),
            None => self.global_constants[index] = value,
        }
    }

    pub(crate) fn num_ops(&self) -> usize {
        match self.current_function {
            Some(id) => self.heap.get(id).as_function().expect("function").num_ops(),
            None => self.global_ops.len(),
        }
    }

    pub(crate) fn num_constants(&self) -> usize {
        match self.current_function {
            Some(id) => self.heap.get(id).as_function().expect("function").num_constants(),
            None => self.global_constants.len(),
        }
    }

    pub(crate) fn last_op(&self) -> Option<Op> {
        match self.current_function {
            Some(id) => self
                .heap
                .get(id)
                .as_function()
                .expect("function")
                .ops()
                .last()
                .map(|op_line| op_line.op),
            None => self.global_ops.last().map(|op_line| op_line.op),
        }
    }

    // ---- execution ----

    /// Runs the compiled program from the top-level bootstrap code.
    pub fn run(&mut self, writer: &mut dyn PrintWriter) -> RunOutcome {
        let mut state = VmState::default();
        state.frames.push(Frame {
            function: None,
            op_idx: 0,
            const_idx: 0,
            locals_offset: 0,
            iter_offset: 0,
            handler_offset: 0,
        });

        loop {
            match self.step(&mut state, writer) {
                Ok(Control::Continue) => {}
                Ok(Control::Exit) => {
                    self.cleanup(state);
                    return RunOutcome::Success;
                }
                Err(error) => {
                    let exc_value = self.materialize_exception(error);
                    match self.unwind(&mut state, exc_value) {
                        Ok(()) => {}
                        Err(unhandled) => {
                            self.report_unhandled(&state, &unhandled, writer);
                            unhandled.drop_with_heap(&mut self.heap);
                            self.cleanup(state);
                            return RunOutcome::RuntimeError;
                        }
                    }
                }
            }
        }
    }

    /// Converts an internal error into a heap exception value, wrapping bare
    /// thrown values into plain Exceptions.
    fn materialize_exception(&mut self, error: VmError) -> Value {
        match error {
            VmError::Exc(exc) => {
                let id = self.heap.allocate(HeapData::Exception(exc));
                Value::Ref(id)
            }
            VmError::Thrown(value) => {
                let already_exception = value
                    .ref_id()
                    .is_some_and(|id| self.heap.get(id).as_exception().is_some());
                if already_exception {
                    value
                } else {
                    let message = value.to_display_string(&self.heap);
                    value.drop_with_heap(&mut self.heap);
                    let id = self.heap.allocate(HeapData::Exception(PoiseException::plain(message)));
                    Value::Ref(id)
                }
            }
        }
    }

    /// Unwinds to the nearest try handler, restoring the recorded depths and
    /// pushing the exception value for the catch clause. Hands the value
    /// back when no handler exists.
    fn unwind(&mut self, state: &mut VmState, exc_value: Value) -> Result<(), Value> {
        let Some(handler) = state.handlers.pop() else {
            return Err(exc_value);
        };

        while state.frames.len() > handler.frame_depth {
            let frame = state.frames.pop().expect("frame depth checked");
            if let Some(function) = frame.function {
                function.drop_with_heap(&mut self.heap);
            }
        }
        while state.stack.len() > handler.stack_depth {
            pop_value(&mut state.stack).drop_with_heap(&mut self.heap);
        }
        while state.locals.len() > handler.locals_depth {
            state
                .locals
                .pop()
                .expect("locals depth checked")
                .drop_with_heap(&mut self.heap);
        }
        while state.iterators.len() > handler.iter_depth {
            state
                .iterators
                .pop()
                .expect("iterator depth checked")
                .drop_with_heap(&mut self.heap);
        }

        let frame = state.frames.last_mut().expect("handler frame survives unwind");
        frame.const_idx = handler.const_idx;
        frame.op_idx = handler.op_idx;
        state.stack.push(exc_value);
        Ok(())
    }

    fn report_unhandled(&self, state: &VmState, exc_value: &Value, writer: &mut dyn PrintWriter) {
        let rendered = exc_value.to_display_string(&self.heap);
        writer.write_err(&format!("Unhandled Exception: {rendered}\n"));

        for frame in state.frames.iter().rev() {
            let (name, path, ops): (&str, &str, &[OpLine]) = match &frame.function {
                Some(value) => {
                    let function = self
                        .heap
                        .get(value.ref_id().expect("frame function is a ref"))
                        .as_function()
                        .expect("frame function is a Function");
                    (function.name(), function.file_path(), function.ops())
                }
                None => ("<entry>", self.main_file_path.as_str(), &self.global_ops),
            };
            let line = frame
                .op_idx
                .checked_sub(1)
                .and_then(|idx| ops.get(idx))
                .map_or(0, |op_line| op_line.line);
            writer.write_err(&format!("  at {name} ({path}:{line})\n"));
        }
    }

    /// Drops every value still held by the machine state.
    fn cleanup(&mut self, state: VmState) {
        for value in state.stack {
            value.drop_with_heap(&mut self.heap);
        }
        for value in state.locals {
            value.drop_with_heap(&mut self.heap);
        }
        for value in state.iterators {
            value.drop_with_heap(&mut self.heap);
        }
        for frame in state.frames {
            if let Some(function) = frame.function {
                function.drop_with_heap(&mut self.heap);
            }
        }
    }

    fn fetch_op(&self, state: &mut VmState) -> OpLine {
        let frame = state.frames.last_mut().expect("frame stack is never empty while running");
        let idx = frame.op_idx;
        frame.op_idx += 1;
        match &frame.function {
            Some(value) => {
                let function = self
                    .heap
                    .get(value.ref_id().expect("frame function is a ref"))
                    .as_function()
                    .expect("frame function is a Function");
                *function.ops().get(idx).expect("ran past end of function ops")
            }
            None => *self.global_ops.get(idx).expect("ran past end of top-level ops"),
        }
    }

    fn constant_at(&self, frame: &Frame, idx: usize) -> &Value {
        match &frame.function {
            Some(value) => {
                let function = self
                    .heap
                    .get(value.ref_id().expect("frame function is a ref"))
                    .as_function()
                    .expect("frame function is a Function");
                &function.constants()[idx]
            }
            None => &self.global_constants[idx],
        }
    }

    fn next_constant(&self, state: &mut VmState) -> Value {
        let frame = state.frames.last_mut().expect("frame stack is never empty");
        let idx = frame.const_idx;
        frame.const_idx += 1;
        let frame = state.frames.last().expect("frame stack is never empty");
        self.constant_at(frame, idx).clone_with_heap(&self.heap)
    }

    fn next_index(&self, state: &mut VmState) -> usize {
        let frame = state.frames.last_mut().expect("frame stack is never empty");
        let idx = frame.const_idx;
        frame.const_idx += 1;
        self.constant_at(state.frames.last().expect("frame"), idx).as_index()
    }

    fn next_hash(&self, state: &mut VmState) -> u64 {
        let frame = state.frames.last_mut().expect("frame stack is never empty");
        let idx = frame.const_idx;
        frame.const_idx += 1;
        self.constant_at(state.frames.last().expect("frame"), idx).as_hash()
    }

    fn next_flag(&self, state: &mut VmState) -> bool {
        let frame = state.frames.last_mut().expect("frame stack is never empty");
        let idx = frame.const_idx;
        frame.const_idx += 1;
        self.constant_at(state.frames.last().expect("frame"), idx).as_flag()
    }

    fn current_namespace(&self, state: &VmState) -> u64 {
        state
            .frames
            .last()
            .and_then(|frame| frame.function.as_ref())
            .and_then(Value::ref_id)
            .and_then(|id| self.heap.get(id).as_function())
            .map_or(self.main_namespace_hash, crate::function::Function::namespace_hash)
    }

    #[expect(clippy::too_many_lines, reason = "one arm per opcode, like the switch it mirrors")]
    fn step(&mut self, state: &mut VmState, writer: &mut dyn PrintWriter) -> StepResult {
        let OpLine { op, line: _ } = self.fetch_op(state);

        match op {
            Op::LoadConstant => {
                let value = self.next_constant(state);
                state.stack.push(value);
            }
            Op::Pop => {
                pop_value(&mut state.stack).drop_with_heap(&mut self.heap);
            }
            Op::DeclareLocal => {
                let value = pop_value(&mut state.stack);
                state.locals.push(value);
            }
            Op::DeclareMultipleLocals => {
                let expected = self.next_index(state);
                let count = pop_value(&mut state.stack).as_index();
                if count != expected {
                    for value in state.stack.split_off(state.stack.len() - count) {
                        value.drop_with_heap(&mut self.heap);
                    }
                    return Err(PoiseException::new(
                        ExcType::InvalidArgument,
                        format!("Expected {expected} values to unpack but got {count}"),
                    )
                    .into());
                }
                let values = state.stack.split_off(state.stack.len() - count);
                state.locals.extend(values);
            }
            Op::LoadLocal => {
                let index = self.next_index(state);
                let offset = state.frames.last().expect("frame").locals_offset;
                let value = state.locals[offset + index].clone_with_heap(&self.heap);
                state.stack.push(value);
            }
            Op::AssignLocal => {
                let index = self.next_index(state);
                let offset = state.frames.last().expect("frame").locals_offset;
                let value = pop_value(&mut state.stack);
                let old = std::mem::replace(&mut state.locals[offset + index], value);
                old.drop_with_heap(&mut self.heap);
            }
            Op::PopLocals => {
                let scope_start = self.next_index(state);
                let offset = state.frames.last().expect("frame").locals_offset;
                while state.locals.len() > offset + scope_start {
                    state
                        .locals
                        .pop()
                        .expect("checked length")
                        .drop_with_heap(&mut self.heap);
                }
            }
            Op::LoadCapture => {
                let index = self.next_index(state);
                let value = {
                    let frame = state.frames.last().expect("frame");
                    let function = self
                        .heap
                        .get(frame.function.as_ref().and_then(Value::ref_id).expect("lambda frame"))
                        .as_function()
                        .expect("frame function is a Function");
                    function.captures()[index].clone_with_heap(&self.heap)
                };
                state.locals.push(value);
            }
            Op::CaptureLocal => {
                let index = self.next_index(state);
                let offset = state.frames.last().expect("frame").locals_offset;
                let capture = state.locals[offset + index].clone_with_heap(&self.heap);
                let lambda_id = state
                    .stack
                    .last()
                    .and_then(Value::ref_id)
                    .expect("CaptureLocal expects a lambda on top of the stack");
                self.heap
                    .get_mut(lambda_id)
                    .as_function_mut()
                    .expect("lambda is a Function")
                    .add_capture(capture);
            }
            Op::MakeLambda => {
                let template = self.next_constant(state);
                let template_id = template.ref_id().expect("lambda template is a ref");
                let clone_id = function::shallow_clone_on_heap(&mut self.heap, template_id);
                template.drop_with_heap(&mut self.heap);
                state.stack.push(Value::Ref(clone_id));
            }
            Op::LoadFunctionOrStruct => {
                let namespace_hash = self.next_hash(state);
                let name_hash = self.next_hash(state);
                self.load_function_or_struct(state, namespace_hash, name_hash)?;
            }
            Op::LoadMember => {
                let name_hash = self.next_hash(state);
                let is_dot_call = self.next_flag(state);
                self.load_member(state, name_hash, is_dot_call)?;
            }
            Op::LoadIndex => {
                let (target, index) = pop_two(&mut state.stack);
                let result = self.load_index(&target, &index);
                target.drop_with_heap(&mut self.heap);
                index.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
            Op::AssignIndex => {
                let value = pop_value(&mut state.stack);
                let (target, index) = pop_two(&mut state.stack);
                let result = self.assign_index(target, index, value);
                result?;
            }
            Op::LoadType => {
                let tag = Type::from_repr(self.next_index(state) as u8).expect("valid type tag constant");
                let type_id = self.types[&tag];
                self.heap.inc_ref(type_id);
                state.stack.push(Value::Ref(type_id));
            }
            Op::ConstructBuiltin => {
                let tag = Type::from_repr(self.next_index(state) as u8).expect("valid type tag constant");
                let nargs = self.next_index(state);
                let has_unpack = self.next_flag(state);
                let inclusive = if tag == Type::Range { self.next_flag(state) } else { false };
                let args = pop_call_args(&mut state.stack, nargs, has_unpack);
                let value = r#type::construct_builtin(&mut self.heap, tag, args, inclusive)?;
                state.stack.push(value);
            }
            Op::Call => {
                let nargs = self.next_index(state);
                let has_unpack = self.next_flag(state);
                let is_dot_call = self.next_flag(state);
                let mut args = pop_call_args(&mut state.stack, nargs, has_unpack);
                if is_dot_call {
                    let parent = pop_value(&mut state.stack);
                    args.insert(0, parent);
                }
                let callee = pop_value(&mut state.stack);
                self.call_value(state, callee, args)?;
            }
            Op::CallNative => {
                let hash = self.next_hash(state);
                let native = *self.natives.get(&hash).expect("native validated at compile time");
                let args = state.stack.split_off(state.stack.len() - usize::from(native.arity));
                let result = (native.func)(&mut self.heap, args)?;
                state.stack.push(result);
            }
            Op::Return => {
                let frame = state.frames.pop().expect("Return outside of a call frame");
                while state.iterators.len() > frame.iter_offset {
                    state
                        .iterators
                        .pop()
                        .expect("checked length")
                        .drop_with_heap(&mut self.heap);
                }
                state.handlers.truncate(frame.handler_offset);
                if let Some(function) = frame.function {
                    function.drop_with_heap(&mut self.heap);
                }
            }
            Op::Exit => {
                assert!(
                    state.stack.is_empty(),
                    "stack not empty at exit, there has been an error in codegen"
                );
                return Ok(Control::Exit);
            }
            Op::Jump => {
                let const_target = self.next_index(state);
                let op_target = self.next_index(state);
                let frame = state.frames.last_mut().expect("frame");
                frame.const_idx = const_target;
                frame.op_idx = op_target;
            }
            Op::JumpIfFalse | Op::JumpIfTrue => {
                let const_target = self.next_index(state);
                let op_target = self.next_index(state);
                let pop_condition = self.next_flag(state);
                let condition = if pop_condition {
                    let value = pop_value(&mut state.stack);
                    let truthy = value.to_bool();
                    value.drop_with_heap(&mut self.heap);
                    truthy
                } else {
                    state.stack.last().expect("condition on stack").to_bool()
                };
                let jump = if op == Op::JumpIfFalse { !condition } else { condition };
                if jump {
                    let frame = state.frames.last_mut().expect("frame");
                    frame.const_idx = const_target;
                    frame.op_idx = op_target;
                }
            }
            Op::EnterTry => {
                let const_idx = self.next_index(state);
                let op_idx = self.next_index(state);
                state.handlers.push(TryHandler {
                    frame_depth: state.frames.len(),
                    stack_depth: state.stack.len(),
                    locals_depth: state.locals.len(),
                    iter_depth: state.iterators.len(),
                    const_idx,
                    op_idx,
                });
            }
            Op::ExitTry => {
                state.handlers.pop().expect("ExitTry without EnterTry");
            }
            Op::Throw => {
                let value = pop_value(&mut state.stack);
                return Err(VmError::Thrown(value));
            }
            Op::InitIterator => {
                let first = self.next_index(state);
                let second = self.next_index(state);
                let iterable = pop_value(&mut state.stack);
                let iter_value = iter::init(&mut self.heap, iterable)?;
                let iter_id = iter_value.ref_id().expect("iterator is a ref");
                state.iterators.push(iter_value);
                let at_end = iter::is_at_end(&self.heap, iter_id)?;
                if !at_end {
                    self.assign_loop_vars(state, first, second, iter_id)?;
                }
                state.stack.push(Value::Bool(at_end));
            }
            Op::IncrementIterator => {
                let first = self.next_index(state);
                let second = self.next_index(state);
                let iter_id = state
                    .iterators
                    .last()
                    .and_then(Value::ref_id)
                    .expect("IncrementIterator without live iterator");
                iter::advance(&mut self.heap, iter_id)?;
                let at_end = iter::is_at_end(&self.heap, iter_id)?;
                if !at_end {
                    self.assign_loop_vars(state, first, second, iter_id)?;
                }
                state.stack.push(Value::Bool(at_end));
            }
            Op::PopIterator => {
                state
                    .iterators
                    .pop()
                    .expect("PopIterator without live iterator")
                    .drop_with_heap(&mut self.heap);
            }
            Op::Unpack => {
                let value = pop_value(&mut state.stack);
                self.unpack(state, value)?;
            }
            Op::Print => {
                let err_stream = self.next_flag(state);
                let newline = self.next_flag(state);
                let value = pop_value(&mut state.stack);
                let mut text = value.to_display_string(&self.heap);
                value.drop_with_heap(&mut self.heap);
                if newline {
                    text.push('\n');
                }
                if err_stream {
                    writer.write_err(&text);
                } else {
                    writer.write_out(&text);
                }
            }
            Op::TypeOf => {
                let value = pop_value(&mut state.stack);
                let tag = value.type_of(&self.heap);
                value.drop_with_heap(&mut self.heap);
                let type_id = self.types[&tag];
                self.heap.inc_ref(type_id);
                state.stack.push(Value::Ref(type_id));
            }
            Op::Assert => {
                let value = pop_value(&mut state.stack);
                let truthy = value.to_bool();
                value.drop_with_heap(&mut self.heap);
                if !truthy {
                    return Err(PoiseException::new(ExcType::AssertionFailed, "Assertion failed").into());
                }
            }
            Op::LogicOr => {
                let (a, b) = pop_two(&mut state.stack);
                let result = a.to_bool() || b.to_bool();
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(Value::Bool(result));
            }
            Op::LogicAnd => {
                let (a, b) = pop_two(&mut state.stack);
                let result = a.to_bool() && b.to_bool();
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(Value::Bool(result));
            }
            Op::Equal => {
                let (a, b) = pop_two(&mut state.stack);
                let result = a.equals(&b);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(Value::Bool(result));
            }
            Op::NotEqual => {
                let (a, b) = pop_two(&mut state.stack);
                let result = !a.equals(&b);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(Value::Bool(result));
            }
            Op::LessThan => self.comparison(state, Value::less_than)?,
            Op::LessEqual => self.comparison(state, Value::less_equal)?,
            Op::GreaterThan => self.comparison(state, Value::greater_than)?,
            Op::GreaterEqual => self.comparison(state, Value::greater_equal)?,
            Op::BitwiseOr => self.pure_binary(state, Value::bit_or)?,
            Op::BitwiseXor => self.pure_binary(state, Value::bit_xor)?,
            Op::BitwiseAnd => self.pure_binary(state, Value::bit_and)?,
            Op::LeftShift => self.pure_binary(state, Value::shift_left)?,
            Op::RightShift => self.pure_binary(state, Value::shift_right)?,
            Op::Subtraction => self.pure_binary(state, Value::sub)?,
            Op::Divide => self.pure_binary(state, Value::div)?,
            Op::Modulus => self.pure_binary(state, Value::rem)?,
            Op::Addition => {
                let (a, b) = pop_two(&mut state.stack);
                let result = a.add(&b, &mut self.heap);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
            Op::Multiply => {
                let (a, b) = pop_two(&mut state.stack);
                let result = a.mul(&b, &mut self.heap);
                a.drop_with_heap(&mut self.heap);
                b.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
            Op::LogicNot => {
                let value = pop_value(&mut state.stack);
                let result = value.logic_not();
                value.drop_with_heap(&mut self.heap);
                state.stack.push(result);
            }
            Op::Negate => {
                let value = pop_value(&mut state.stack);
                let result = value.negate(&self.heap);
                value.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
            Op::BitwiseNot => {
                let value = pop_value(&mut state.stack);
                let result = value.bitwise_not(&self.heap);
                value.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
            Op::Plus => {
                let value = pop_value(&mut state.stack);
                let result = value.unary_plus(&self.heap);
                value.drop_with_heap(&mut self.heap);
                state.stack.push(result?);
            }
        }

        Ok(Control::Continue)
    }

    fn comparison(
        &mut self,
        state: &mut VmState,
        op: fn(&Value, &Value, &Heap) -> RunResult<bool>,
    ) -> Result<(), VmError> {
        let (a, b) = pop_two(&mut state.stack);
        let result = op(&a, &b, &self.heap);
        a.drop_with_heap(&mut self.heap);
        b.drop_with_heap(&mut self.heap);
        state.stack.push(Value::Bool(result?));
        Ok(())
    }

    fn pure_binary(
        &mut self,
        state: &mut VmState,
        op: fn(&Value, &Value, &Heap) -> RunResult<Value>,
    ) -> Result<(), VmError> {
        let (a, b) = pop_two(&mut state.stack);
        let result = op(&a, &b, &self.heap);
        a.drop_with_heap(&mut self.heap);
        b.drop_with_heap(&mut self.heap);
        state.stack.push(result?);
        Ok(())
    }

    fn load_function_or_struct(
        &mut self,
        state: &mut VmState,
        namespace_hash: u64,
        name_hash: u64,
    ) -> Result<(), VmError> {
        let current = self.current_namespace(state);

        if let Some(function) = self.namespaces.get_function(&self.heap, namespace_hash, name_hash) {
            let exported = self
                .heap
                .get(function.ref_id().expect("function ref"))
                .as_function()
                .expect("Function")
                .exported();
            if namespace_hash != current && !exported {
                let name = self.pool.lookup_or_unknown(name_hash).to_owned();
                function.drop_with_heap(&mut self.heap);
                return Err(PoiseException::new(
                    ExcType::FunctionNotFound,
                    format!("Function '{name}' is not exported"),
                )
                .into());
            }
            state.stack.push(function);
            return Ok(());
        }

        if let Some(template) = self.namespaces.get_struct(&self.heap, namespace_hash, name_hash) {
            let exported = self
                .heap
                .get(template.ref_id().expect("struct ref"))
                .as_struct()
                .expect("Struct")
                .exported();
            if namespace_hash != current && !exported {
                let name = self.pool.lookup_or_unknown(name_hash).to_owned();
                template.drop_with_heap(&mut self.heap);
                return Err(PoiseException::new(
                    ExcType::TypeNotExported,
                    format!("Struct '{name}' is not exported"),
                )
                .into());
            }
            state.stack.push(template);
            return Ok(());
        }

        let name = self.pool.lookup_or_unknown(name_hash);
        Err(PoiseException::new(
            ExcType::FunctionNotFound,
            format!(
                "No function or struct named '{name}' in namespace '{}'",
                self.namespaces.display_name(namespace_hash)
            ),
        )
        .into())
    }

    fn load_member(&mut self, state: &mut VmState, name_hash: u64, is_dot_call: bool) -> Result<(), VmError> {
        let parent = pop_value(&mut state.stack);

        // struct members shadow extension functions
        let member = parent
            .ref_id()
            .and_then(|id| self.heap.get(id).as_struct())
            .and_then(|strukt| strukt.find_member(name_hash))
            .map(|member| member.clone_with_heap(&self.heap));
        if let Some(member) = member {
            state.stack.push(member);
            if is_dot_call {
                state.stack.push(parent);
            } else {
                parent.drop_with_heap(&mut self.heap);
            }
            return Ok(());
        }

        let tag = parent.type_of(&self.heap);
        let type_id = self.types[&tag];
        match r#type::find_extension(&self.heap, type_id, name_hash) {
            Ok(Some(function)) => {
                state.stack.push(function);
                if is_dot_call {
                    state.stack.push(parent);
                } else {
                    parent.drop_with_heap(&mut self.heap);
                }
                Ok(())
            }
            Ok(None) => {
                parent.drop_with_heap(&mut self.heap);
                let name = self.pool.lookup_or_unknown(name_hash);
                Err(PoiseException::new(
                    ExcType::FunctionNotFound,
                    format!("No member or extension function '{name}' for type {tag}"),
                )
                .into())
            }
            Err(exc) => {
                parent.drop_with_heap(&mut self.heap);
                Err(exc.into())
            }
        }
    }

    fn load_index(&self, target: &Value, index: &Value) -> RunResult<Value> {
        if let Value::Str(text) = target {
            let position = index_to_position(index, text.chars().count(), &self.heap)?;
            let character = text.chars().nth(position).expect("position checked");
            return Ok(Value::Str(character.to_string()));
        }

        let Some(id) = target.ref_id() else {
            return Err(PoiseException::new(
                ExcType::InvalidType,
                format!("{} cannot be indexed", target.type_of(&self.heap)),
            ));
        };

        match self.heap.get(id) {
            HeapData::List(list) => {
                let position = index_to_position(index, list.len(), &self.heap)?;
                Ok(list.at(position).expect("position checked").clone_with_heap(&self.heap))
            }
            HeapData::Tuple(tuple) => {
                let position = index_to_position(index, tuple.len(), &self.heap)?;
                Ok(tuple.at(position).expect("position checked").clone_with_heap(&self.heap))
            }
            HeapData::Dict(_) => dict::at(&self.heap, id, index),
            _ => Err(PoiseException::new(
                ExcType::InvalidType,
                format!("{} cannot be indexed", target.type_of(&self.heap)),
            )),
        }
    }

    fn assign_index(&mut self, target: Value, index: Value, value: Value) -> Result<(), VmError> {
        let Some(id) = target.ref_id() else {
            let kind = target.type_of(&self.heap);
            target.drop_with_heap(&mut self.heap);
            index.drop_with_heap(&mut self.heap);
            value.drop_with_heap(&mut self.heap);
            return Err(PoiseException::new(ExcType::InvalidType, format!("{kind} cannot be index-assigned")).into());
        };

        enum TargetKind {
            List(usize),
            Dict,
            Other(Type),
        }
        let kind = match self.heap.get(id) {
            HeapData::List(list) => TargetKind::List(list.len()),
            HeapData::Dict(_) => TargetKind::Dict,
            other => TargetKind::Other(other.type_of()),
        };

        let result: RunResult<()> = match kind {
            TargetKind::List(len) => match index_to_position(&index, len, &self.heap) {
                Ok(position) => {
                    let old = self
                        .heap
                        .get_mut(id)
                        .as_list_mut()
                        .expect("checked variant")
                        .set_at(position, value)
                        .expect("position checked");
                    old.drop_with_heap(&mut self.heap);
                    index.drop_with_heap(&mut self.heap);
                    Ok(())
                }
                Err(exc) => {
                    index.drop_with_heap(&mut self.heap);
                    value.drop_with_heap(&mut self.heap);
                    Err(exc)
                }
            },
            TargetKind::Dict => {
                dict::insert_or_update(&mut self.heap, id, index, value);
                Ok(())
            }
            TargetKind::Other(kind) => {
                index.drop_with_heap(&mut self.heap);
                value.drop_with_heap(&mut self.heap);
                Err(PoiseException::new(
                    ExcType::InvalidType,
                    format!("{kind} cannot be index-assigned"),
                ))
            }
        };

        target.drop_with_heap(&mut self.heap);
        result.map_err(Into::into)
    }

    fn call_value(&mut self, state: &mut VmState, callee: Value, mut args: Vec<Value>) -> Result<(), VmError> {
        let Some(id) = callee.ref_id() else {
            let rendered = callee.to_display_string(&self.heap);
            callee.drop_with_heap(&mut self.heap);
            for arg in args {
                arg.drop_with_heap(&mut self.heap);
            }
            return Err(PoiseException::new(ExcType::InvalidOperand, format!("{rendered} is not callable")).into());
        };

        match self.heap.get(id) {
            HeapData::Function(function) => {
                let arity = usize::from(function.arity());
                let variadic = function.variadic();
                let name = function.name().to_owned();

                if variadic {
                    let required = arity.saturating_sub(1);
                    if args.len() < required {
                        let given = args.len();
                        callee.drop_with_heap(&mut self.heap);
                        for arg in args {
                            arg.drop_with_heap(&mut self.heap);
                        }
                        return Err(PoiseException::new(
                            ExcType::IncorrectArgCount,
                            format!("Function '{name}' takes at least {required} args but was given {given}"),
                        )
                        .into());
                    }
                    let pack = args.split_off(required);
                    let pack_id = self.heap.allocate(HeapData::Tuple(Tuple::new(pack)));
                    args.push(Value::Ref(pack_id));
                } else if args.len() != arity {
                    let given = args.len();
                    callee.drop_with_heap(&mut self.heap);
                    for arg in args {
                        arg.drop_with_heap(&mut self.heap);
                    }
                    return Err(PoiseException::new(
                        ExcType::IncorrectArgCount,
                        format!("Function '{name}' takes {arity} args but was given {given}"),
                    )
                    .into());
                }

                let locals_offset = state.locals.len();
                state.locals.extend(args);
                state.frames.push(Frame {
                    function: Some(callee),
                    op_idx: 0,
                    const_idx: 0,
                    locals_offset,
                    iter_offset: state.iterators.len(),
                    handler_offset: state.handlers.len(),
                });
                Ok(())
            }
            HeapData::Type(type_object) => {
                let tag = type_object.tag();
                callee.drop_with_heap(&mut self.heap);
                let value = r#type::construct_builtin(&mut self.heap, tag, args, false)?;
                state.stack.push(value);
                Ok(())
            }
            HeapData::Struct(_) => {
                let value = crate::types::structs::construct(&mut self.heap, id, args);
                callee.drop_with_heap(&mut self.heap);
                state.stack.push(value?);
                Ok(())
            }
            _ => {
                let rendered = callee.to_display_string(&self.heap);
                callee.drop_with_heap(&mut self.heap);
                for arg in args {
                    arg.drop_with_heap(&mut self.heap);
                }
                Err(PoiseException::new(ExcType::InvalidOperand, format!("{rendered} is not callable")).into())
            }
        }
    }

    fn assign_loop_vars(
        &mut self,
        state: &mut VmState,
        first: usize,
        second: usize,
        iter_id: HeapId,
    ) -> Result<(), VmError> {
        let offset = state.frames.last().expect("frame").locals_offset;

        // slot 0 can never be a second loop variable, so 0 means "absent";
        // one-variable loops over a Dict bind the key-value tuple itself
        if second == 0 {
            let value = iter::current(&self.heap, iter_id)?;
            let old = std::mem::replace(&mut state.locals[offset + first], value);
            old.drop_with_heap(&mut self.heap);
        } else {
            let (first_value, second_value) = iter::current_pair(&mut self.heap, iter_id)?;
            let old = std::mem::replace(&mut state.locals[offset + first], first_value);
            old.drop_with_heap(&mut self.heap);
            let old = std::mem::replace(&mut state.locals[offset + second], second_value);
            old.drop_with_heap(&mut self.heap);
        }
        Ok(())
    }

    fn unpack(&mut self, state: &mut VmState, value: Value) -> Result<(), VmError> {
        let Some(id) = value.ref_id() else {
            let kind = value.type_of(&self.heap);
            value.drop_with_heap(&mut self.heap);
            return Err(PoiseException::new(ExcType::InvalidType, format!("{kind} cannot be unpacked")).into());
        };

        let elements: Option<Vec<Value>> = {
            let h: &Heap = &self.heap;
            match h.get(id) {
                HeapData::List(list) => Some(list.items().iter().map(|v| v.clone_with_heap(h)).collect()),
                HeapData::Tuple(tuple) => Some(tuple.items().iter().map(|v| v.clone_with_heap(h)).collect()),
                HeapData::Range(range) => Some(range.to_values().into_iter().map(Value::Int).collect()),
                HeapData::Dict(dict) => Some(dict.occupied().into_iter().map(|v| v.clone_with_heap(h)).collect()),
                HeapData::Set(set) => Some(set.occupied().into_iter().map(|v| v.clone_with_heap(h)).collect()),
                _ => None,
            }
        };

        match elements {
            Some(elements) => {
                value.drop_with_heap(&mut self.heap);
                let count = elements.len();
                state.stack.extend(elements);
                state.stack.push(Value::Int(i64::try_from(count).expect("unpack count fits i64")));
                Ok(())
            }
            None => {
                let kind = value.type_of(&self.heap);
                value.drop_with_heap(&mut self.heap);
                Err(PoiseException::new(ExcType::InvalidType, format!("{kind} cannot be unpacked")).into())
            }
        }
    }
}

fn index_to_position(index: &Value, len: usize, heap: &Heap) -> RunResult<usize> {
    let Value::Int(i) = index else {
        return Err(PoiseException::new(
            ExcType::InvalidType,
            format!("Index must be Int but got {}", index.type_of(heap)),
        ));
    };
    let position = usize::try_from(*i)
        .map_err(|_| PoiseException::new(ExcType::IndexOutOfBounds, format!("Index {i} is out of bounds")))?;
    if position >= len {
        return Err(PoiseException::new(
            ExcType::IndexOutOfBounds,
            format!("Index {i} is out of bounds for size {len}"),
        ));
    }
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    /// Runs hand-assembled top-level code.
    fn run_global(ops: &[(Op, Vec<Value>)]) -> (Vm, RunOutcome, String, String) {
        let mut vm = Vm::new();
        for (op, constants) in ops {
            for constant in constants {
                let cloned = constant.clone_with_heap(vm.heap());
                vm.emit_constant(cloned);
            }
            vm.emit_op(*op, 1);
        }
        let mut writer = CollectStringPrint::new();
        let outcome = vm.run(&mut writer);
        let err = writer.error_output().to_owned();
        let out = writer.into_output();
        (vm, outcome, out, err)
    }

    #[test]
    fn arithmetic_over_the_data_stack() {
        let (_, outcome, out, _) = run_global(&[
            (Op::LoadConstant, vec![Value::Int(2)]),
            (Op::LoadConstant, vec![Value::Int(3)]),
            (Op::Multiply, vec![]),
            (Op::LoadConstant, vec![Value::Int(1)]),
            (Op::Addition, vec![]),
            (Op::Print, vec![Value::Bool(false), Value::Bool(true)]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::Success);
        assert_eq!(out, "7\n");
    }

    #[test]
    fn assert_passes_on_truthy_values() {
        let (_, outcome, _, _) = run_global(&[
            (Op::LoadConstant, vec![Value::Int(1)]),
            (Op::Assert, vec![]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn assert_raises_on_falsy_values() {
        let (_, outcome, _, err) = run_global(&[
            (Op::LoadConstant, vec![Value::Bool(false)]),
            (Op::Assert, vec![]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::RuntimeError);
        assert!(err.contains("AssertionFailed"), "stderr was: {err}");
    }

    #[test]
    fn throw_without_a_handler_reports_and_fails() {
        let (_, outcome, _, err) = run_global(&[
            (Op::LoadConstant, vec![Value::Str("boom".into())]),
            (Op::Throw, vec![]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::RuntimeError);
        assert!(err.contains("Unhandled Exception: Exception: boom"), "stderr was: {err}");
    }

    #[test]
    fn jump_transfers_by_constant_and_op_index() {
        // jump over a Throw straight to the Exit
        let (_, outcome, _, _) = run_global(&[
            (Op::Jump, vec![Value::Int(3), Value::Int(3)]),
            (Op::LoadConstant, vec![Value::Str("skipped".into())]),
            (Op::Throw, vec![]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::Success);
    }

    #[test]
    fn type_registry_survives_runs_and_heap_stays_bounded() {
        let (vm, outcome, _, _) = run_global(&[
            (Op::LoadConstant, vec![Value::Int(5)]),
            (Op::TypeOf, vec![]),
            (Op::Pop, vec![]),
            (Op::Exit, vec![]),
        ]);
        assert_eq!(outcome, RunOutcome::Success);
        // only the registered Type objects remain live
        assert_eq!(vm.live_objects(), Type::ALL.len());
    }
}
