//! Single-pass recursive-descent compiler.
//!
//! The compiler scans and parses one source file, emitting ops and constants
//! through the VM into the function currently being compiled (or into the
//! top-level bootstrap code), and registering the results with the
//! namespace manager. Imports spawn sub-compilers; each file compiles at
//! most once per VM.
//!
//! Errors are reported with source context and never thrown: the compiler
//! sets its error flag and bails out at the next convenient statement
//! boundary.

mod constants;
mod declarations;
mod expressions;
mod statements;

use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::{
    bytecode::Op,
    intern::{hash_path, hash_string},
    scanner::{Scanner, Token, TokenKind},
    types::Type,
    value::Value,
    vm::Vm,
};

/// Result of compiling one file (and its imports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileResult {
    Success,
    CompileError,
    ParseError,
    FileError,
}

/// What kind of construct the compiler is currently inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Context {
    TopLevel,
    Function,
    Lambda,
    IfStatement,
    WhileLoop,
    ForLoop,
    TryCatch,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalVariable {
    pub name: String,
    pub is_final: bool,
}

/// Constant-slot indices of a jump's placeholder target, filled in by
/// [`Compiler::patch_jump`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpIndexes {
    pub constant_index: usize,
    pub op_index: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum JumpType {
    Jump,
    IfFalse,
    IfTrue,
}

/// Per-file compiler. Imports are compiled by nested `Compiler` instances
/// sharing the same VM.
pub struct Compiler<'vm> {
    pub(crate) vm: &'vm mut Vm,
    pub(crate) main_file: bool,
    pub(crate) std_file: bool,
    pub(crate) file_path: PathBuf,
    pub(crate) file_path_hash: u64,
    pub(crate) scanner: Scanner,
    pub(crate) previous: Option<Token>,
    pub(crate) current: Option<Token>,
    pub(crate) had_error: bool,
    pub(crate) parse_error: bool,
    pub(crate) passed_imports: bool,
    pub(crate) main_function_found: bool,
    pub(crate) context_stack: Vec<Context>,
    pub(crate) locals: Vec<LocalVariable>,
    pub(crate) break_jump_stack: Vec<Vec<JumpIndexes>>,
    pub(crate) import_aliases: AHashMap<String, PathBuf>,
}

impl<'vm> Compiler<'vm> {
    /// Prepares a compiler for a file. Returns `Err(FileError)` when the
    /// file is missing, unreadable, or not a `.poise` file.
    pub fn new(main_file: bool, std_file: bool, vm: &'vm mut Vm, file_path: PathBuf) -> Result<Self, CompileResult> {
        if !file_path.exists() || file_path.extension().is_none_or(|ext| ext != "poise") {
            return Err(CompileResult::FileError);
        }
        let scanner = Scanner::from_file(&file_path).map_err(|_| CompileResult::FileError)?;
        let file_path_hash = hash_path(&file_path);

        Ok(Self {
            vm,
            main_file,
            std_file,
            file_path,
            file_path_hash,
            scanner,
            previous: None,
            current: None,
            had_error: false,
            parse_error: false,
            passed_imports: false,
            main_function_found: false,
            context_stack: Vec::new(),
            locals: Vec::new(),
            break_jump_stack: Vec::new(),
            import_aliases: AHashMap::new(),
        })
    }

    /// Convenience entry point: compile `file_path` as the main file.
    pub fn compile_file(vm: &'vm mut Vm, file_path: &Path) -> CompileResult {
        match Self::new(true, false, vm, file_path.to_path_buf()) {
            Ok(mut compiler) => compiler.compile(),
            Err(result) => result,
        }
    }

    pub fn compile(&mut self) -> CompileResult {
        if self.main_file {
            let display = self.file_path.display().to_string();
            self.vm
                .namespaces_mut()
                .add_namespace(self.file_path_hash, "entry", None);
            self.vm.set_main_namespace(self.file_path_hash, display);
        }

        self.context_stack.push(Context::TopLevel);
        self.advance();

        loop {
            if self.had_error {
                break;
            }
            if self.check(TokenKind::EndOfFile) {
                break;
            }
            self.declaration();
        }

        if self.parse_error {
            return CompileResult::ParseError;
        }
        if self.had_error {
            return CompileResult::CompileError;
        }

        if self.main_file {
            if self.main_function_found {
                self.emit_main_call();
            } else {
                self.error_at_previous("No main function declared");
                return CompileResult::CompileError;
            }
        }

        CompileResult::Success
    }

    /// Emits the bootstrap sequence that looks up and calls `main`, then
    /// exits.
    fn emit_main_call(&mut self) {
        let last_line = self.scanner.num_lines();
        let main_hash = self.vm.pool_mut().intern("main");
        self.emit_constant(Value::from_hash(self.file_path_hash));
        self.emit_constant(Value::from_hash(main_hash));
        self.emit_op(Op::LoadFunctionOrStruct, last_line);
        self.emit_constant(Value::Int(0));
        self.emit_constant(Value::Bool(false));
        self.emit_constant(Value::Bool(false));
        self.emit_op(Op::Call, last_line);
        self.emit_op(Op::Pop, last_line);
        self.emit_op(Op::Exit, last_line);
    }

    // ---- token plumbing ----

    pub(crate) fn advance(&mut self) {
        self.previous = self.current;
        self.current = Some(self.scanner.scan_token());

        if self.current.is_some_and(|token| token.kind == TokenKind::Error) {
            self.parse_error = true;
            self.error_at_current("Invalid token");
        }
    }

    pub(crate) fn check(&self, expected: TokenKind) -> bool {
        self.current.is_some_and(|token| token.kind == expected)
    }

    pub(crate) fn matches(&mut self, expected: TokenKind) -> bool {
        if !self.check(expected) {
            return false;
        }
        self.advance();
        true
    }

    /// Matches `expected` or reports `message` at the current token.
    /// Returns whether the match succeeded.
    pub(crate) fn expect(&mut self, expected: TokenKind, message: &str) -> bool {
        if self.matches(expected) {
            true
        } else {
            self.error_at_current(message);
            false
        }
    }

    pub(crate) fn expect_semicolon(&mut self) -> bool {
        self.expect(TokenKind::Semicolon, "Expected ';'")
    }

    pub(crate) fn previous_lexeme(&self) -> &str {
        self.previous
            .as_ref()
            .map_or("", |token| self.scanner.lexeme(token))
    }

    pub(crate) fn previous_line(&self) -> usize {
        self.previous.as_ref().map_or(1, |token| token.line)
    }

    // ---- diagnostics ----

    pub(crate) fn error_at_current(&mut self, message: &str) {
        if let Some(token) = self.current {
            self.report_error(&token, message);
        }
    }

    pub(crate) fn error_at_previous(&mut self, message: &str) {
        if let Some(token) = self.previous {
            self.report_error(&token, message);
        }
    }

    fn report_error(&mut self, token: &Token, message: &str) {
        self.had_error = true;

        if token.kind == TokenKind::EndOfFile {
            eprintln!("Compiler Error at EOF: {message}");
        } else {
            eprintln!("Compiler Error at '{}': {message}", self.scanner.lexeme(token));
        }

        eprintln!("       --> {}:{}:{}", self.file_path.display(), token.line, token.column);
        eprintln!("        |");

        if token.line > 1 {
            eprintln!("{:>7} | {}", token.line - 1, self.scanner.code_at_line(token.line - 1));
        }
        eprintln!("{:>7} | {}", token.line, self.scanner.code_at_line(token.line));

        let mut caret_line = String::from("        | ");
        for _ in 1..token.column {
            caret_line.push(' ');
        }
        for _ in 0..token.length().max(1) {
            caret_line.push('^');
        }
        eprintln!("{caret_line}");

        if token.line < self.scanner.num_lines() {
            eprintln!("{:>7} | {}", token.line + 1, self.scanner.code_at_line(token.line + 1));
        }
        eprintln!("        |");
    }

    // ---- emission ----

    pub(crate) fn emit_op(&mut self, op: Op, line: usize) {
        self.vm.emit_op(op, line);
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        self.vm.emit_constant(value);
    }

    pub(crate) fn emit_jump(&mut self, jump_type: JumpType, emit_pop: bool) -> JumpIndexes {
        let line = self.previous_line();
        match jump_type {
            JumpType::Jump => self.emit_op(Op::Jump, line),
            JumpType::IfFalse => self.emit_op(Op::JumpIfFalse, line),
            JumpType::IfTrue => self.emit_op(Op::JumpIfTrue, line),
        }

        let constant_index = self.vm.num_constants();
        self.emit_constant(Value::Int(0));
        let op_index = self.vm.num_constants();
        self.emit_constant(Value::Int(0));

        if !matches!(jump_type, JumpType::Jump) {
            self.emit_constant(Value::Bool(emit_pop));
        }

        JumpIndexes { constant_index, op_index }
    }

    /// Points a previously emitted jump at the current end of code.
    pub(crate) fn patch_jump(&mut self, jump: JumpIndexes) {
        let num_ops = self.vm.num_ops();
        let num_constants = self.vm.num_constants();
        self.vm
            .set_constant(jump.constant_index, Value::Int(i64::try_from(num_constants).expect("constant count")));
        self.vm
            .set_constant(jump.op_index, Value::Int(i64::try_from(num_ops).expect("op count")));
    }

    pub(crate) fn check_last_op(&self, op: Op) -> bool {
        self.vm.last_op() == Some(op)
    }

    pub(crate) fn last_op_was_assignment(&self) -> bool {
        self.check_last_op(Op::AssignLocal) || self.check_last_op(Op::AssignIndex)
    }

    // ---- locals ----

    pub(crate) fn has_local(&self, name: &str) -> bool {
        self.locals.iter().any(|local| local.name == name)
    }

    pub(crate) fn index_of_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|local| local.name == name)
    }

    /// Checks a new top-level name against everything already declared in
    /// this namespace.
    pub(crate) fn check_name_collisions(&mut self, name: &str) -> bool {
        let name_hash = hash_string(name);
        let collides = self
            .vm
            .namespaces()
            .has_function_named(self.vm.heap(), self.file_path_hash, name_hash)
            || self
                .vm
                .namespaces()
                .has_struct_named(self.vm.heap(), self.file_path_hash, name_hash)
            || self.vm.namespaces().has_constant(self.file_path_hash, name);
        if collides {
            self.error_at_previous(&format!("'{name}' has already been declared in this namespace"));
            return false;
        }
        true
    }

    // ---- shared parse helpers ----

    /// Parses comma-separated call arguments up to `sentinel`.
    ///
    /// Returns (argument count, whether the final argument was an unpack).
    pub(crate) fn parse_call_args(&mut self, sentinel: TokenKind) -> Option<(u8, bool)> {
        let mut num_args: u8 = 0;
        let mut has_unpack = false;

        while !self.matches(sentinel) {
            if num_args == u8::MAX {
                self.error_at_current("Maximum function arguments of 255 exceeded");
                return None;
            }
            if has_unpack {
                self.error_at_current("Unpacking must be the last argument");
                return None;
            }

            self.expression(false, true);
            if self.had_error {
                return None;
            }
            num_args += 1;

            if self.check_last_op(Op::Unpack) {
                has_unpack = true;
            }

            // trailing commas are allowed but arguments must be comma separated
            if !self.check(sentinel) && !self.check(TokenKind::Comma) {
                self.error_at_current("Expected ',' or closing delimiter");
                return None;
            }
            if self.check(TokenKind::Comma) {
                self.advance();
            }
        }

        Some((num_args, has_unpack))
    }

    /// Parses a function parameter list after the opening paren.
    ///
    /// Returns (parameter count, variadic flag, extension target types).
    pub(crate) fn parse_function_params(&mut self, is_lambda: bool) -> Option<(u8, bool, Vec<Type>)> {
        let mut has_this = false;
        let mut variadic = false;
        let mut num_params: u8 = 0;
        let mut extension_types = Vec::new();

        while !self.matches(TokenKind::CloseParen) {
            if num_params == u8::MAX {
                self.error_at_current("Maximum function parameters of 255 exceeded");
                return None;
            }
            if variadic {
                self.error_at_current("Variadic parameter must be the last function parameter");
                return None;
            }

            if self.matches(TokenKind::This) {
                if num_params > 0 {
                    self.error_at_previous("'this' only allowed on first parameter");
                    return None;
                }
                if is_lambda {
                    self.error_at_previous("Lambdas cannot be extension functions");
                    return None;
                }
                has_this = true;
            }

            let is_final = self.matches(TokenKind::Final);

            if has_this {
                loop {
                    if !self.current.is_some_and(|token| token.kind.is_type_ident()) {
                        self.error_at_current("Expected type for extension function");
                        return None;
                    }
                    self.advance();
                    let kind = self.previous.expect("just advanced").kind;
                    extension_types.push(type_ident_tag(kind).expect("checked type ident"));

                    if self.check(TokenKind::Identifier) {
                        break;
                    }
                    if !self.expect(TokenKind::Pipe, "Expected '|' or parameter name") {
                        return None;
                    }
                }
                has_this = false;
            }

            if !self.matches(TokenKind::Identifier) {
                self.error_at_current("Expected identifier");
                return None;
            }

            let param_name = self.previous_lexeme().to_owned();
            if self.has_local(&param_name) {
                self.error_at_previous("Function parameter with the same name already declared");
                return None;
            }
            self.locals.push(LocalVariable {
                name: param_name,
                is_final,
            });
            num_params += 1;

            if self.matches(TokenKind::DotDotDot) {
                variadic = true;
            }
            if self.matches(TokenKind::Colon) {
                self.parse_type_annotation();
            }

            if !self.check(TokenKind::CloseParen) && !self.check(TokenKind::Comma) {
                self.error_at_current("Expected ',' or ')'");
                return None;
            }
            if self.check(TokenKind::Comma) {
                self.advance();
            }
        }

        Some((num_params, variadic, extension_types))
    }

    /// Parses a type annotation (after `:`). Annotations carry no semantics.
    pub(crate) fn parse_type_annotation(&mut self) {
        if !self.current.is_some_and(|token| token.kind.is_type_ident()) {
            self.error_at_current("Expected type");
            return;
        }
        self.advance();

        let kind = self.previous.expect("just advanced").kind;
        let generic_count = generic_type_count(kind);

        if self.matches(TokenKind::OpenSquareBracket) {
            match generic_count {
                GenericCount::None => {
                    self.error_at_previous("Type is not generic");
                }
                GenericCount::One => {
                    self.parse_type_annotation();
                    self.expect(TokenKind::CloseSquareBracket, "Expected ']' after 1 generic type");
                }
                GenericCount::Two => {
                    self.parse_type_annotation();
                    self.expect(TokenKind::Comma, "Expected ',' between 2 generic types");
                    self.parse_type_annotation();
                    self.expect(TokenKind::CloseSquareBracket, "Expected ']' after 2 generic types");
                }
                GenericCount::Any => {
                    self.parse_type_annotation();
                    while !self.matches(TokenKind::CloseSquareBracket) {
                        if !self.expect(TokenKind::Comma, "Expected ','") {
                            return;
                        }
                        self.parse_type_annotation();
                    }
                }
            }
        }

        // union annotations
        if self.matches(TokenKind::Pipe) {
            self.parse_type_annotation();
        }
    }
}

/// Maps a type-identifier token to its runtime type tag.
pub(crate) fn type_ident_tag(kind: TokenKind) -> Option<Type> {
    let tag = match kind {
        TokenKind::BoolIdent => Type::Bool,
        TokenKind::FloatIdent => Type::Float,
        TokenKind::IntIdent => Type::Int,
        TokenKind::NoneIdent => Type::None,
        TokenKind::StringIdent => Type::String,
        TokenKind::ExceptionIdent => Type::Exception,
        TokenKind::FunctionIdent => Type::Function,
        TokenKind::ListIdent => Type::List,
        TokenKind::RangeIdent => Type::Range,
        TokenKind::TupleIdent => Type::Tuple,
        TokenKind::DictIdent => Type::Dict,
        TokenKind::SetIdent => Type::Set,
        _ => return None,
    };
    Some(tag)
}

enum GenericCount {
    None,
    One,
    Two,
    Any,
}

fn generic_type_count(kind: TokenKind) -> GenericCount {
    match kind {
        TokenKind::ListIdent | TokenKind::SetIdent => GenericCount::One,
        TokenKind::DictIdent => GenericCount::Two,
        TokenKind::TupleIdent | TokenKind::FunctionIdent => GenericCount::Any,
        _ => GenericCount::None,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };

    use super::*;
    use crate::{
        bytecode::OpLine,
        heap::Heap,
        vm::Vm,
    };

    fn write_temp_program(source: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "poise-compiler-tests-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, AtomicOrdering::SeqCst)
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("main.poise");
        fs::write(&path, source).expect("write temp program");
        path
    }

    /// Walks ops in emission order, consuming each op's constants, and
    /// returns the total consumed.
    fn consumed_constants(ops: &[OpLine], constants: &[Value]) -> usize {
        let mut consumed = 0;
        for op_line in ops {
            let mut n = op_line.op.base_constants();
            if op_line.op == Op::ConstructBuiltin {
                let tag = constants[consumed].as_index();
                if Type::from_repr(u8::try_from(tag).expect("tag fits u8")) == Some(Type::Range) {
                    n += 1;
                }
            }
            consumed += n;
        }
        consumed
    }

    fn check_function_parity(heap: &Heap, value: &Value) {
        let function = heap
            .get(value.ref_id().expect("function value"))
            .as_function()
            .expect("function value");
        assert_eq!(
            consumed_constants(function.ops(), function.constants()),
            function.num_constants(),
            "ops and constants out of step in '{}':\n{}",
            function.name(),
            function.dump_ops(heap)
        );

        // lambda templates live in the constants; they must hold too
        for constant in function.constants() {
            if constant
                .ref_id()
                .is_some_and(|id| heap.get(id).as_function().is_some())
            {
                check_function_parity(heap, constant);
            }
        }
    }

    #[test]
    fn every_op_consumes_exactly_its_constants() {
        let source = concat!(
            "const LIMIT = 4 * 25;\n",
            "struct Pair {\n",
            "    first = 1;\n",
            "    second;\n",
            "}\n",
            "func helper(a, b) => a + b;\n",
            "func spread(values...) {\n",
            "    var total = 0;\n",
            "    for v in values {\n",
            "        total = total + v;\n",
            "    }\n",
            "    return total;\n",
            "}\n",
            "func main() {\n",
            "    var list = [1, 2, 3];\n",
            "    var d = {(\"a\", 1)};\n",
            "    var t = (1, 2);\n",
            "    var doubler = |list|(n) => n * 2;\n",
            "    var s = 0;\n",
            "    for i in 0..=5 {\n",
            "        s = s + i;\n",
            "    }\n",
            "    while s > 0 {\n",
            "        s = s - 1;\n",
            "        if s == 2 {\n",
            "            break;\n",
            "        }\n",
            "    }\n",
            "    try {\n",
            "        throw \"x\";\n",
            "    } catch e {\n",
            "        eprintln(e);\n",
            "    }\n",
            "    var a, b = ...t;\n",
            "    println(helper(a, b));\n",
            "    println(spread(...list));\n",
            "    println(doubler(LIMIT));\n",
            "    println(typeof(d));\n",
            "    println(Pair(9).first);\n",
            "    println(list[0]);\n",
            "    list[0] = 7;\n",
            "    println(!false and ~1 < -2 or 1 << 2 >= 8 % 3);\n",
            "}\n",
        );

        let path = write_temp_program(source);
        let mut vm = Vm::new();
        let result = Compiler::compile_file(&mut vm, &path);
        assert_eq!(result, CompileResult::Success);

        let functions: Vec<_> = vm
            .namespaces()
            .all_functions()
            .map(|value| value.clone_with_heap(vm.heap()))
            .collect();
        assert!(!functions.is_empty());
        for value in &functions {
            check_function_parity(vm.heap(), value);
        }
        for value in functions {
            value.drop_with_heap(vm.heap_mut());
        }

        let (global_ops, global_constants) = vm.global_code();
        assert_eq!(consumed_constants(global_ops, global_constants), global_constants.len());
    }

    #[test]
    fn main_file_bootstraps_a_call_to_main() {
        let path = write_temp_program("func main() {\n    println(1);\n}\n");
        let mut vm = Vm::new();
        assert_eq!(Compiler::compile_file(&mut vm, &path), CompileResult::Success);

        let (global_ops, _) = vm.global_code();
        let ops: Vec<Op> = global_ops.iter().map(|op_line| op_line.op).collect();
        assert_eq!(ops, vec![Op::LoadFunctionOrStruct, Op::Call, Op::Pop, Op::Exit]);
    }

    #[test]
    fn recompiling_the_same_path_does_not_duplicate_functions() {
        let dir = std::env::temp_dir().join(format!("poise-compiler-dedup-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        fs::write(dir.join("shared.poise"), "export func f() => 1;\n").expect("write shared");
        fs::write(dir.join("a.poise"), "import shared;\nexport func a() => shared::f();\n").expect("write a");
        fs::write(dir.join("b.poise"), "import shared;\nexport func b() => shared::f();\n").expect("write b");
        fs::write(
            dir.join("main.poise"),
            "import a;\nimport b;\nfunc main() {\n    println(a::a() + b::b());\n}\n",
        )
        .expect("write main");

        let mut vm = Vm::new();
        assert_eq!(Compiler::compile_file(&mut vm, &dir.join("main.poise")), CompileResult::Success);

        let shared_hash = hash_path(&dir.join("shared.poise"));
        assert_eq!(vm.namespaces().function_count(shared_hash), 1);
    }
}
