//! Top-level declarations: imports, functions, variables, constants,
//! structs, and their `export` variants.

use std::path::PathBuf;

use crate::{
    bytecode::Op,
    compiler::{Compiler, CompileResult, Context, LocalVariable},
    function::Function,
    heap::HeapId,
    intern::{hash_path, hash_string},
    object::HeapData,
    scanner::TokenKind,
    types::{Struct, StructMember},
    value::Value,
};

impl Compiler<'_> {
    pub(crate) fn declaration(&mut self) {
        if self.matches(TokenKind::Import) {
            self.import_declaration();
            return;
        }

        if self.matches(TokenKind::Func) {
            self.func_declaration(false);
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenKind::Final) {
            self.var_declaration(true);
        } else if self.matches(TokenKind::Const) {
            self.const_declaration(false);
        } else if self.matches(TokenKind::Struct) {
            self.struct_declaration(false);
        } else if self.matches(TokenKind::Export) {
            if self.matches(TokenKind::Func) {
                self.func_declaration(true);
            } else if self.matches(TokenKind::Const) {
                self.const_declaration(true);
            } else if self.matches(TokenKind::Struct) {
                self.struct_declaration(true);
            } else {
                self.error_at_current("Expected function, const or struct after 'export'");
            }
        } else {
            self.statement(true);
        }

        self.passed_imports = true;
    }

    fn import_declaration(&mut self) {
        if *self.context_stack.last().expect("context stack is never empty") != Context::TopLevel {
            self.error_at_previous("Import only allowed at top level");
            return;
        }
        if self.passed_imports {
            self.error_at_previous("Imports must only appear before any other top level declarations");
            return;
        }

        if !self.matches(TokenKind::Identifier) {
            self.error_at_current("Expected namespace");
            return;
        }

        let Some((path, display_name, is_std)) = self.parse_namespace_import() else {
            return;
        };

        if !path.exists() {
            self.error_at_previous(&format!("Cannot open file {}", path.display()));
            return;
        }

        let child_hash = hash_path(&path);
        let is_new = self
            .vm
            .namespaces_mut()
            .add_namespace(child_hash, &display_name, Some(self.file_path_hash));

        if is_new {
            let sub_result = match Compiler::new(false, is_std, self.vm, path) {
                Ok(mut sub_compiler) => sub_compiler.compile(),
                Err(result) => result,
            };
            if sub_result != CompileResult::Success {
                // the sub-compiler already reported; just stop compiling
                self.had_error = true;
            }
        }
    }

    /// Parses `a::b::c (as NAME);` after the first identifier has been
    /// consumed, resolving the file path and display name.
    fn parse_namespace_import(&mut self) -> Option<(PathBuf, String, bool)> {
        let first = self.previous_lexeme().to_owned();
        let mut display_name = first.clone();
        let mut is_std = false;

        let mut path = if first == "std" {
            match self.vm.std_path() {
                Some(std_root) => {
                    is_std = true;
                    std_root
                }
                None => {
                    self.error_at_previous(
                        "The environment variable `POISE_STD_PATH` has not been set, cannot open std file",
                    );
                    return None;
                }
            }
        } else {
            self.file_path
                .parent()
                .map(|parent| parent.join(&first))
                .unwrap_or_else(|| PathBuf::from(&first))
        };

        if self.matches(TokenKind::Semicolon) {
            path.set_extension("poise");
            return Some((path, display_name, is_std));
        }

        loop {
            if !self.expect(TokenKind::ColonColon, "Expected '::' or ';'") {
                return None;
            }
            display_name.push_str("::");

            if !self.matches(TokenKind::Identifier) {
                self.error_at_current("Expected namespace");
                return None;
            }
            let segment = self.previous_lexeme().to_owned();
            display_name.push_str(&segment);

            if self.matches(TokenKind::Semicolon) {
                path.push(format!("{segment}.poise"));
                return Some((path, display_name, is_std));
            }

            if self.matches(TokenKind::As) {
                path.push(format!("{segment}.poise"));

                if !self.matches(TokenKind::Identifier) {
                    self.error_at_current("Expected alias for namespace");
                    return None;
                }
                let alias = self.previous_lexeme().to_owned();
                if self.import_aliases.contains_key(&alias) {
                    self.error_at_previous(&format!("Namespace alias '{alias}' already used"));
                    return None;
                }
                self.import_aliases.insert(alias, path.clone());

                if !self.expect_semicolon() {
                    return None;
                }
                return Some((path, display_name, is_std));
            }

            path.push(&segment);
        }
    }

    pub(crate) fn func_declaration(&mut self, is_exported: bool) {
        if *self.context_stack.last().expect("context stack is never empty") != Context::TopLevel {
            self.error_at_previous("Function declaration only allowed at top level");
            return;
        }

        self.context_stack.push(Context::Function);

        if !self.expect(TokenKind::Identifier, "Expected function name") {
            return;
        }
        let function_name = self.previous_lexeme().to_owned();

        if !self.check_name_collisions(&function_name) {
            return;
        }
        if function_name.starts_with("__") {
            self.error_at_previous("Function names may not start with '__' as this is reserved for the standard library");
            return;
        }

        if !self.expect(TokenKind::OpenParen, "Expected '(' after function name") {
            return;
        }
        let Some((num_params, variadic, extension_types)) = self.parse_function_params(false) else {
            return;
        };

        if self.matches(TokenKind::Colon) {
            self.parse_type_annotation();
        }

        let is_main_function = self.main_file && function_name == "main";

        self.vm.pool_mut().intern(function_name.clone());
        let function = Function::new(
            function_name,
            self.file_path.display().to_string(),
            self.file_path_hash,
            num_params,
            is_exported || is_main_function,
            variadic,
        );
        let function_id = self.vm.heap_mut().allocate(HeapData::Function(function));
        self.vm.set_current_function(Some(function_id));

        self.compile_function_body(function_id);

        self.vm.set_current_function(None);

        if self.had_error {
            // release the half-built function
            self.vm.heap_mut().dec_ref(function_id);
            return;
        }

        if is_main_function {
            self.main_function_found = true;
        }

        for tag in extension_types {
            self.vm.heap().inc_ref(function_id);
            self.vm.add_extension_function(tag, Value::Ref(function_id));
        }

        self.vm
            .namespaces_mut()
            .add_function(self.file_path_hash, Value::Ref(function_id));

        self.locals.clear();
        self.context_stack.pop();
    }

    /// Parses a `{ ... }` or `=> expr;` function body, ensuring the terminal
    /// `PopLocals(0); LoadConstant(none); Return` sequence.
    fn compile_function_body(&mut self, _function_id: HeapId) {
        if self.matches(TokenKind::OpenBrace) {
            if !self.parse_block("function") {
                return;
            }
        } else if self.matches(TokenKind::Arrow) {
            if self.current.is_some_and(|token| token.kind.is_valid_expression_start()) {
                self.expression(false, false);
                let line = self.previous_line();
                if self.last_op_was_assignment() {
                    self.emit_constant(Value::None);
                    self.emit_op(Op::LoadConstant, line);
                }
                self.emit_constant(Value::Int(0));
                self.emit_op(Op::PopLocals, line);
                self.emit_op(Op::Return, line);
                self.expect_semicolon();
            } else {
                self.statement(true);
            }
        } else {
            self.error_at_current("Expected '{' or '=>'");
            return;
        }

        if !self.check_last_op(Op::Return) {
            // fell off the end: pop locals and implicitly return none
            let line = self.previous_line();
            self.emit_constant(Value::Int(0));
            self.emit_op(Op::PopLocals, line);
            self.emit_constant(Value::None);
            self.emit_op(Op::LoadConstant, line);
            self.emit_op(Op::Return, line);
        }
    }

    pub(crate) fn var_declaration(&mut self, is_final: bool) {
        if *self.context_stack.last().expect("context stack is never empty") == Context::TopLevel {
            self.error_at_previous("Variable declaration not allowed at top level");
            return;
        }

        if !self.expect(TokenKind::Identifier, "Expected identifier") {
            return;
        }

        let first_name = self.previous_lexeme().to_owned();
        if !self.verify_var_name(&first_name) {
            return;
        }
        self.locals.push(LocalVariable {
            name: first_name,
            is_final,
        });
        let mut num_declarations = 1usize;

        if self.matches(TokenKind::Colon) {
            self.parse_type_annotation();
        }

        while self.matches(TokenKind::Comma) {
            if !self.expect(TokenKind::Identifier, "Expected identifier") {
                return;
            }
            let name = self.previous_lexeme().to_owned();
            if !self.verify_var_name(&name) {
                return;
            }
            self.locals.push(LocalVariable { name, is_final });
            num_declarations += 1;

            if self.matches(TokenKind::Colon) {
                self.parse_type_annotation();
            }
        }

        if self.matches(TokenKind::Equal) {
            if self.matches(TokenKind::DotDotDot) {
                self.unpack_expression();
                let line = self.previous_line();
                self.emit_constant(Value::Int(i64::try_from(num_declarations).expect("declaration count")));
                self.emit_op(Op::DeclareMultipleLocals, line);
            } else {
                for index in 0..num_declarations {
                    self.expression(false, false);
                    self.emit_op(Op::DeclareLocal, self.previous_line());

                    if index < num_declarations - 1 && !self.matches(TokenKind::Comma) {
                        self.error_at_current("Expected ','");
                        return;
                    }
                }
            }
        } else {
            if is_final {
                self.error_at_current("Expected assignment after 'final'");
                return;
            }
            for _ in 0..num_declarations {
                let line = self.previous_line();
                self.emit_constant(Value::None);
                self.emit_op(Op::LoadConstant, line);
                self.emit_op(Op::DeclareLocal, line);
            }
        }

        self.expect_semicolon();
    }

    fn verify_var_name(&mut self, name: &str) -> bool {
        if name.starts_with("__") {
            self.error_at_previous("Variable names may not start with '__' as this is reserved for the standard library");
            return false;
        }
        if self.has_local(name) {
            self.error_at_previous("Local variable with the same name already declared");
            return false;
        }
        if self.vm.namespaces().has_constant(self.file_path_hash, name) {
            self.error_at_previous("Constant with the same name already declared in this namespace");
            return false;
        }
        true
    }

    pub(crate) fn const_declaration(&mut self, is_exported: bool) {
        if !self.expect(TokenKind::Identifier, "Expected identifier") {
            return;
        }
        let constant_name = self.previous_lexeme().to_owned();

        if !self.check_name_collisions(&constant_name) {
            return;
        }

        if self.matches(TokenKind::Colon) {
            self.parse_type_annotation();
        }

        if !self.expect(TokenKind::Equal, "Expected assignment to 'const'") {
            return;
        }

        if let Some(value) = self.constant_expression() {
            self.vm
                .namespaces_mut()
                .add_constant(self.file_path_hash, value, constant_name, is_exported);
        }

        self.expect_semicolon();
    }

    pub(crate) fn struct_declaration(&mut self, is_exported: bool) {
        if !self.expect(TokenKind::Identifier, "Expected identifier") {
            return;
        }
        let struct_name = self.previous_lexeme().to_owned();

        if !self.check_name_collisions(&struct_name) {
            return;
        }

        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }

        let mut members: Vec<StructMember> = Vec::new();

        while !self.matches(TokenKind::CloseBrace) {
            if !self.expect(TokenKind::Identifier, "Expected member variable") {
                return;
            }
            let member_name = self.previous_lexeme().to_owned();
            let member_hash = hash_string(&member_name);
            self.vm.pool_mut().intern(member_name.clone());

            if members.iter().any(|member| member.name_hash == member_hash) {
                self.error_at_previous("Struct member with the same name already declared");
                return;
            }

            if self.matches(TokenKind::Colon) {
                self.parse_type_annotation();
            }

            let value = if self.matches(TokenKind::Equal) {
                match self.constant_expression() {
                    Some(value) => value,
                    None => return,
                }
            } else {
                Value::None
            };

            members.push(StructMember {
                name: member_name,
                name_hash: member_hash,
                value,
            });

            if !self.expect_semicolon() {
                return;
            }
        }

        self.vm.pool_mut().intern(struct_name.clone());
        let template = Struct::new(struct_name, is_exported, members);
        let template_id = self.vm.heap_mut().allocate(HeapData::Struct(template));
        self.vm
            .namespaces_mut()
            .add_struct(self.file_path_hash, Value::Ref(template_id));
    }

    pub(crate) fn parse_block(&mut self, scope_type: &str) -> bool {
        while !self.matches(TokenKind::CloseBrace) {
            if self.check(TokenKind::EndOfFile) {
                self.error_at_current(&format!("Unterminated {scope_type}"));
                return false;
            }
            if self.had_error {
                return false;
            }
            self.declaration();
        }
        true
    }
}
