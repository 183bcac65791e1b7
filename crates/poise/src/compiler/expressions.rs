//! Expressions: the precedence ladder, calls, primaries, lambdas, literals.

use std::path::PathBuf;

use crate::{
    bytecode::Op,
    compiler::{Compiler, Context, JumpIndexes, JumpType, LocalVariable, type_ident_tag},
    function::Function,
    intern::hash_path,
    object::HeapData,
    scanner::TokenKind,
    types::Type,
    value::Value,
};

impl Compiler<'_> {
    /// Parses one expression. An optional `try` prefix wraps the expression
    /// in a try-block whose catch target is just past it, so a failing
    /// expression evaluates to the thrown exception.
    pub(crate) fn expression(&mut self, can_assign: bool, can_unpack: bool) {
        let mut try_slots = None;
        if self.matches(TokenKind::Try) {
            let catch_constant_slot = self.vm.num_constants();
            self.emit_constant(Value::Int(0));
            let catch_op_slot = self.vm.num_constants();
            self.emit_constant(Value::Int(0));
            self.emit_op(Op::EnterTry, self.previous_line());
            try_slots = Some((catch_constant_slot, catch_op_slot));
        }

        if self.current.is_some_and(|token| token.kind.is_valid_expression_start()) {
            self.range_expression(can_assign);
        } else if self.matches(TokenKind::DotDotDot) {
            if !can_unpack {
                self.error_at_previous("Unpacking is not allowed here");
                return;
            }
            self.unpack_expression();
        } else {
            self.error_at_current("Expected expression");
        }

        if let Some((catch_constant_slot, catch_op_slot)) = try_slots {
            self.emit_op(Op::ExitTry, self.previous_line());
            let num_constants = self.vm.num_constants();
            let num_ops = self.vm.num_ops();
            self.vm
                .set_constant(catch_constant_slot, Value::Int(i64::try_from(num_constants).expect("constant count")));
            self.vm
                .set_constant(catch_op_slot, Value::Int(i64::try_from(num_ops).expect("op count")));
        }
    }

    pub(crate) fn unpack_expression(&mut self) {
        self.expression(false, false);
        self.emit_op(Op::Unpack, self.previous_line());
    }

    /// `a..b`, `a..=b`, optionally `by step`; otherwise just the operand.
    fn range_expression(&mut self, can_assign: bool) {
        self.logic_or(can_assign);

        if self.matches(TokenKind::DotDot) || self.matches(TokenKind::DotDotEqual) {
            let inclusive = self.previous.expect("just matched").kind == TokenKind::DotDotEqual;
            self.logic_or(can_assign);

            if self.matches(TokenKind::By) {
                self.expression(false, false);
            } else {
                let line = self.previous_line();
                self.emit_constant(Value::Int(1));
                self.emit_op(Op::LoadConstant, line);
            }

            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::from(Type::Range as u8)));
            self.emit_constant(Value::Int(3));
            self.emit_constant(Value::Bool(false));
            self.emit_constant(Value::Bool(inclusive));
            self.emit_op(Op::ConstructBuiltin, line);
        }
    }

    fn logic_or(&mut self, can_assign: bool) {
        self.logic_and(can_assign);

        let mut short_circuit: Option<JumpIndexes> = None;
        if self.check(TokenKind::Or) {
            short_circuit = Some(self.emit_jump(JumpType::IfTrue, false));
        }

        while self.matches(TokenKind::Or) {
            self.logic_and(can_assign);
            self.emit_op(Op::LogicOr, self.previous_line());
        }

        if let Some(jump) = short_circuit {
            self.patch_jump(jump);
        }
    }

    fn logic_and(&mut self, can_assign: bool) {
        self.bitwise_or(can_assign);

        let mut short_circuit: Option<JumpIndexes> = None;
        if self.check(TokenKind::And) {
            short_circuit = Some(self.emit_jump(JumpType::IfFalse, false));
        }

        while self.matches(TokenKind::And) {
            self.bitwise_or(can_assign);
            self.emit_op(Op::LogicAnd, self.previous_line());
        }

        if let Some(jump) = short_circuit {
            self.patch_jump(jump);
        }
    }

    fn bitwise_or(&mut self, can_assign: bool) {
        self.bitwise_xor(can_assign);
        while self.matches(TokenKind::Pipe) {
            self.bitwise_xor(can_assign);
            self.emit_op(Op::BitwiseOr, self.previous_line());
        }
    }

    fn bitwise_xor(&mut self, can_assign: bool) {
        self.bitwise_and(can_assign);
        while self.matches(TokenKind::Caret) {
            self.bitwise_and(can_assign);
            self.emit_op(Op::BitwiseXor, self.previous_line());
        }
    }

    fn bitwise_and(&mut self, can_assign: bool) {
        self.equality(can_assign);
        while self.matches(TokenKind::Ampersand) {
            self.equality(can_assign);
            self.emit_op(Op::BitwiseAnd, self.previous_line());
        }
    }

    fn equality(&mut self, can_assign: bool) {
        self.comparison(can_assign);

        if self.matches(TokenKind::EqualEqual) {
            self.comparison(can_assign);
            self.emit_op(Op::Equal, self.previous_line());
        } else if self.matches(TokenKind::NotEqual) {
            self.comparison(can_assign);
            self.emit_op(Op::NotEqual, self.previous_line());
        }
    }

    fn comparison(&mut self, can_assign: bool) {
        self.shift(can_assign);

        if self.matches(TokenKind::Less) {
            self.shift(can_assign);
            self.emit_op(Op::LessThan, self.previous_line());
        } else if self.matches(TokenKind::LessEqual) {
            self.shift(can_assign);
            self.emit_op(Op::LessEqual, self.previous_line());
        } else if self.matches(TokenKind::Greater) {
            self.shift(can_assign);
            self.emit_op(Op::GreaterThan, self.previous_line());
        } else if self.matches(TokenKind::GreaterEqual) {
            self.shift(can_assign);
            self.emit_op(Op::GreaterEqual, self.previous_line());
        }
    }

    fn shift(&mut self, can_assign: bool) {
        self.term(can_assign);
        loop {
            if self.matches(TokenKind::ShiftLeft) {
                self.term(can_assign);
                self.emit_op(Op::LeftShift, self.previous_line());
            } else if self.matches(TokenKind::ShiftRight) {
                self.term(can_assign);
                self.emit_op(Op::RightShift, self.previous_line());
            } else {
                break;
            }
        }
    }

    fn term(&mut self, can_assign: bool) {
        self.factor(can_assign);
        loop {
            if self.matches(TokenKind::Plus) {
                self.factor(can_assign);
                self.emit_op(Op::Addition, self.previous_line());
            } else if self.matches(TokenKind::Minus) {
                self.factor(can_assign);
                self.emit_op(Op::Subtraction, self.previous_line());
            } else {
                break;
            }
        }
    }

    fn factor(&mut self, can_assign: bool) {
        self.unary(can_assign);
        loop {
            if self.matches(TokenKind::Star) {
                self.unary(can_assign);
                self.emit_op(Op::Multiply, self.previous_line());
            } else if self.matches(TokenKind::Slash) {
                self.unary(can_assign);
                self.emit_op(Op::Divide, self.previous_line());
            } else if self.matches(TokenKind::Modulus) {
                self.unary(can_assign);
                self.emit_op(Op::Modulus, self.previous_line());
            } else {
                break;
            }
        }
    }

    fn unary(&mut self, can_assign: bool) {
        if self.matches(TokenKind::Minus) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::Negate, line);
        } else if self.matches(TokenKind::Tilde) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::BitwiseNot, line);
        } else if self.matches(TokenKind::Exclamation) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::LogicNot, line);
        } else if self.matches(TokenKind::Plus) {
            let line = self.previous_line();
            self.unary(can_assign);
            self.emit_op(Op::Plus, line);
        } else {
            self.call_expression(can_assign);
        }
    }

    /// Postfix chains: calls, member access/dot-calls, indexing.
    pub(crate) fn call_expression(&mut self, can_assign: bool) {
        self.primary(can_assign);

        loop {
            if self.matches(TokenKind::OpenParen) {
                let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseParen) else {
                    return;
                };
                let line = self.previous_line();
                self.emit_constant(Value::Int(i64::from(num_args)));
                self.emit_constant(Value::Bool(has_unpack));
                self.emit_constant(Value::Bool(false));
                self.emit_op(Op::Call, line);
            } else if self.matches(TokenKind::Dot) {
                if !self.expect(TokenKind::Identifier, "Expected identifier") {
                    return;
                }
                let member_name = self.previous_lexeme().to_owned();
                let member_hash = self.vm.pool_mut().intern(member_name);
                let line = self.previous_line();
                self.emit_constant(Value::from_hash(member_hash));
                self.emit_op(Op::LoadMember, line);

                if self.matches(TokenKind::OpenParen) {
                    // dot call: bind the parent back as `this`
                    self.emit_constant(Value::Bool(true));
                    let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseParen) else {
                        return;
                    };
                    let line = self.previous_line();
                    self.emit_constant(Value::Int(i64::from(num_args)));
                    self.emit_constant(Value::Bool(has_unpack));
                    self.emit_constant(Value::Bool(true));
                    self.emit_op(Op::Call, line);
                } else {
                    self.emit_constant(Value::Bool(false));
                }
            } else if self.matches(TokenKind::OpenSquareBracket) {
                self.expression(false, false);
                if !self.expect(TokenKind::CloseSquareBracket, "Expected ']'") {
                    return;
                }

                if self.matches(TokenKind::Equal) {
                    if !can_assign {
                        self.error_at_previous("Assignment is not allowed here");
                        return;
                    }
                    self.expression(false, false);
                    self.emit_op(Op::AssignIndex, self.previous_line());
                } else {
                    self.emit_op(Op::LoadIndex, self.previous_line());
                }
            } else {
                break;
            }
        }
    }

    fn primary(&mut self, can_assign: bool) {
        if self.matches(TokenKind::False) {
            let line = self.previous_line();
            self.emit_constant(Value::Bool(false));
            self.emit_op(Op::LoadConstant, line);
        } else if self.matches(TokenKind::True) {
            let line = self.previous_line();
            self.emit_constant(Value::Bool(true));
            self.emit_op(Op::LoadConstant, line);
        } else if self.matches(TokenKind::Float) {
            if let Some(f) = self.parse_float() {
                let line = self.previous_line();
                self.emit_constant(Value::Float(f));
                self.emit_op(Op::LoadConstant, line);
            }
        } else if self.matches(TokenKind::Int) {
            if let Some(i) = self.parse_int() {
                let line = self.previous_line();
                self.emit_constant(Value::Int(i));
                self.emit_op(Op::LoadConstant, line);
            }
        } else if self.matches(TokenKind::None) {
            let line = self.previous_line();
            self.emit_constant(Value::None);
            self.emit_op(Op::LoadConstant, line);
        } else if self.matches(TokenKind::String) {
            if let Some(s) = self.parse_string() {
                let line = self.previous_line();
                self.emit_constant(Value::Str(s));
                self.emit_op(Op::LoadConstant, line);
            }
        } else if self.matches(TokenKind::OpenParen) {
            self.tuple_or_grouping();
        } else if self.matches(TokenKind::Identifier) {
            self.identifier(can_assign);
        } else if self.current.is_some_and(|token| token.kind.is_type_ident()) {
            self.advance();
            self.type_ident();
        } else if self.matches(TokenKind::TypeOf) {
            self.type_of_expression();
        } else if self.matches(TokenKind::Pipe) {
            self.lambda();
        } else if self.matches(TokenKind::OpenSquareBracket) {
            self.list_literal();
        } else if self.matches(TokenKind::OpenBrace) {
            self.dict_literal();
        } else {
            self.error_at_current("Invalid token at start of expression");
        }

        if self.check(TokenKind::Equal) {
            // any allowed assignment was consumed above
            self.error_at_current("Assignment is not allowed here");
        }
    }

    fn identifier(&mut self, can_assign: bool) {
        let name = self.previous_lexeme().to_owned();

        if let Some(local_index) = self.index_of_local(&name) {
            if self.matches(TokenKind::Equal) {
                if !can_assign {
                    self.error_at_previous("Assignment not allowed here");
                    return;
                }
                if self.locals[local_index].is_final {
                    self.error_at_previous(&format!("'{name}' is marked final"));
                    return;
                }
                self.expression(false, false);
                let line = self.previous_line();
                self.emit_constant(Value::Int(i64::try_from(local_index).expect("local index")));
                self.emit_op(Op::AssignLocal, line);
            } else {
                let line = self.previous_line();
                self.emit_constant(Value::Int(i64::try_from(local_index).expect("local index")));
                self.emit_op(Op::LoadLocal, line);
            }
            return;
        }

        if let Some(constant) = self.vm.namespaces().get_constant(self.file_path_hash, &name) {
            let value = constant.value.clone_with_heap(self.vm.heap());
            let line = self.previous_line();
            self.emit_constant(value);
            self.emit_op(Op::LoadConstant, line);
            return;
        }

        if name.starts_with("__") {
            self.native_call();
        } else if self.check(TokenKind::ColonColon) {
            self.namespace_qualified_reference();
        } else {
            // same-namespace function or struct, resolved at runtime
            let name_hash = self.vm.pool_mut().intern(name);
            let line = self.previous_line();
            self.emit_constant(Value::from_hash(self.file_path_hash));
            self.emit_constant(Value::from_hash(name_hash));
            self.emit_op(Op::LoadFunctionOrStruct, line);
        }
    }

    fn native_call(&mut self) {
        let name = self.previous_lexeme().to_owned();

        let Some(hash) = self.vm.native_hash(&name) else {
            self.error_at_previous(&format!("Unrecognised native function '{name}'"));
            return;
        };

        if !self.std_file {
            self.error_at_previous("Calling native functions is only allowed in standard library files");
            return;
        }

        if !self.matches(TokenKind::OpenParen) {
            self.error_at_current("Expected call for native function");
            return;
        }

        let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseParen) else {
            return;
        };

        if has_unpack {
            self.error_at_previous("Unpacking not allowed in native function calls");
            return;
        }

        let arity = self.vm.native_arity(hash);
        if num_args != arity {
            self.error_at_previous(&format!(
                "Expected {arity} arguments to native function {name} but got {num_args}"
            ));
            return;
        }

        let line = self.previous_line();
        self.emit_constant(Value::from_hash(hash));
        self.emit_op(Op::CallNative, line);
    }

    /// `ns::member` after the first segment identifier: resolve the
    /// namespace path, then load the exported constant or emit a
    /// function-or-struct lookup.
    fn namespace_qualified_reference(&mut self) {
        let Some((namespace_text, namespace_hash)) = self.parse_namespace_qualification() else {
            return;
        };

        if !self
            .vm
            .namespaces()
            .has_imported_namespace(self.file_path_hash, namespace_hash)
        {
            self.error_at_previous(&format!("Namespace '{namespace_text}' not imported"));
            return;
        }

        let member_name = self.previous_lexeme().to_owned();

        if let Some(constant) = self.vm.namespaces().get_constant(namespace_hash, &member_name) {
            if !constant.exported {
                self.error_at_previous(&format!(
                    "Constant '{member_name}' in namespace '{namespace_text}' is not exported"
                ));
                return;
            }
            let value = constant.value.clone_with_heap(self.vm.heap());
            let line = self.previous_line();
            self.emit_constant(value);
            self.emit_op(Op::LoadConstant, line);
            return;
        }

        let name_hash = self.vm.pool_mut().intern(member_name);
        let line = self.previous_line();
        self.emit_constant(Value::from_hash(namespace_hash));
        self.emit_constant(Value::from_hash(name_hash));
        self.emit_op(Op::LoadFunctionOrStruct, line);
    }

    /// Collects `a::b::` path segments, stopping with the member identifier
    /// in `previous`. Returns the namespace display text and path hash.
    fn parse_namespace_qualification(&mut self) -> Option<(String, u64)> {
        let first = self.previous_lexeme().to_owned();
        let mut display = first.clone();
        let mut segments: Vec<String> = Vec::new();

        loop {
            if !self.expect(TokenKind::ColonColon, "Expected '::'") {
                return None;
            }
            if !self.matches(TokenKind::Identifier) {
                self.error_at_current("Expected identifier after '::'");
                return None;
            }
            if !self.check(TokenKind::ColonColon) {
                // previous is now the member name
                break;
            }
            let segment = self.previous_lexeme().to_owned();
            display.push_str("::");
            display.push_str(&segment);
            segments.push(segment);
        }

        let mut path = if let Some(aliased) = self.import_aliases.get(&first).cloned() {
            if !segments.is_empty() {
                self.error_at_previous("Namespace aliases cannot be further qualified");
                return None;
            }
            return Some((display, hash_path(&aliased)));
        } else if first == "std" {
            match self.vm.std_path() {
                Some(std_root) => std_root,
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

        match segments.split_last() {
            Some((last, init)) => {
                for segment in init {
                    path.push(segment);
                }
                path.push(format!("{last}.poise"));
            }
            None => {
                path.set_extension("poise");
            }
        }

        Some((display, hash_path(&path)))
    }

    /// A type identifier: a constructor call or the type value itself.
    fn type_ident(&mut self) {
        let kind = self.previous.expect("just advanced").kind;
        let tag = type_ident_tag(kind).expect("checked type ident");

        if self.matches(TokenKind::OpenParen) {
            let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseParen) else {
                return;
            };

            if !has_unpack && !self.check_constructor_arg_count(tag, num_args) {
                return;
            }

            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::from(tag as u8)));
            self.emit_constant(Value::Int(i64::from(num_args)));
            self.emit_constant(Value::Bool(has_unpack));
            if tag == Type::Range {
                self.emit_constant(Value::Bool(false));
            }
            self.emit_op(Op::ConstructBuiltin, line);
        } else {
            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::from(tag as u8)));
            self.emit_op(Op::LoadType, line);
        }
    }

    fn check_constructor_arg_count(&mut self, tag: Type, num_args: u8) -> bool {
        let ok = match tag {
            Type::Bool | Type::Float | Type::Int | Type::String | Type::None => num_args <= 1,
            Type::Exception | Type::Function => num_args == 1,
            Type::Range => num_args == 3,
            _ => true,
        };
        if !ok {
            self.error_at_previous(&format!("Invalid argument count for '{tag}' constructor"));
        }
        ok
    }

    fn type_of_expression(&mut self) {
        if !self.expect(TokenKind::OpenParen, "Expected '('") {
            return;
        }
        self.expression(false, false);
        self.emit_op(Op::TypeOf, self.previous_line());
        self.expect(TokenKind::CloseParen, "Expected ')'");
    }

    /// `|captures|(params) => body` or `|captures|(params) { block }`.
    ///
    /// Captures name enclosing locals, each at most once; the template is
    /// stored as a constant and cloned by `MakeLambda` at runtime, with one
    /// `CaptureLocal` per capture appending an independent snapshot.
    fn lambda(&mut self) {
        let mut capture_names: Vec<LocalVariable> = Vec::new();
        let mut capture_indexes: Vec<usize> = Vec::new();

        while !self.matches(TokenKind::Pipe) {
            if self.matches(TokenKind::Identifier) {
                if capture_names.len() == usize::from(u8::MAX) {
                    self.error_at_current("Maximum amount of captures exceeded");
                    return;
                }

                let name = self.previous_lexeme().to_owned();
                let Some(local_index) = self.index_of_local(&name) else {
                    self.error_at_previous(&format!("No local variable named '{name}' to capture"));
                    return;
                };

                if capture_names.iter().any(|capture| capture.name == name) {
                    self.error_at_previous(&format!("Local variable '{name}' has already been captured"));
                    return;
                }

                capture_names.push(self.locals[local_index].clone());
                capture_indexes.push(local_index);

                if !self.check(TokenKind::Pipe) && !self.check(TokenKind::Comma) {
                    self.error_at_current("Expected ',' or '|'");
                    return;
                }
                if self.check(TokenKind::Comma) {
                    self.advance();
                }
            } else {
                self.error_at_current("Expected identifier for capture");
                return;
            }
        }

        let enclosing_locals = std::mem::take(&mut self.locals);

        let (arity, variadic) = if self.matches(TokenKind::OpenParen) {
            match self.parse_function_params(true) {
                Some((arity, variadic, _)) => (arity, variadic),
                None => return,
            }
        } else {
            (0, false)
        };

        if self.matches(TokenKind::Colon) {
            self.parse_type_annotation();
        }

        // captures live after the parameters in the lambda's locals
        for capture in &capture_names {
            if self.has_local(&capture.name) {
                self.error_at_previous("Lambda parameter shadows a captured variable");
                return;
            }
            self.locals.push(capture.clone());
        }

        self.context_stack.push(Context::Lambda);

        let enclosing_function = self.vm.current_function().expect("lambdas only appear inside functions");
        let lambda_name = {
            let function = self
                .vm
                .heap()
                .get(enclosing_function)
                .as_function()
                .expect("current function is a Function");
            format!("{}_lambda{}", function.name(), function.lambda_count())
        };

        // the template lives in the enclosing function's constants; runtime
        // clones are created by MakeLambda
        let template = Function::new(
            lambda_name,
            self.file_path.display().to_string(),
            self.file_path_hash,
            arity,
            false,
            variadic,
        );
        let template_id = self.vm.heap_mut().allocate(HeapData::Function(template));
        self.vm.set_current_function(Some(template_id));

        for index in 0..capture_names.len() {
            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::try_from(index).expect("capture index")));
            self.emit_op(Op::LoadCapture, line);
        }

        if self.matches(TokenKind::OpenBrace) {
            if !self.parse_block("lambda") {
                self.vm.set_current_function(Some(enclosing_function));
                return;
            }
        } else if self.matches(TokenKind::Arrow) {
            if self.current.is_some_and(|token| token.kind.is_valid_expression_start()) {
                self.expression(true, false);
                let line = self.previous_line();
                if self.last_op_was_assignment() {
                    self.emit_constant(Value::None);
                    self.emit_op(Op::LoadConstant, line);
                }
                self.emit_constant(Value::Int(0));
                self.emit_op(Op::PopLocals, line);
                self.emit_op(Op::Return, line);
            } else {
                self.statement(false);
            }
        } else {
            self.vm.set_current_function(Some(enclosing_function));
            self.error_at_current("Expected '{' or '=>'");
            return;
        }

        if !self.check_last_op(Op::Return) {
            let line = self.previous_line();
            self.emit_constant(Value::Int(0));
            self.emit_op(Op::PopLocals, line);
            self.emit_constant(Value::None);
            self.emit_op(Op::LoadConstant, line);
            self.emit_op(Op::Return, line);
        }

        self.locals = enclosing_locals;
        self.context_stack.pop();

        self.vm.set_current_function(Some(enclosing_function));
        self.vm
            .heap_mut()
            .get_mut(enclosing_function)
            .as_function_mut()
            .expect("current function is a Function")
            .lambda_added();

        let line = self.previous_line();
        self.emit_constant(Value::Ref(template_id));
        self.emit_op(Op::MakeLambda, line);
        for index in capture_indexes {
            self.emit_constant(Value::Int(i64::try_from(index).expect("capture index")));
            self.emit_op(Op::CaptureLocal, line);
        }
    }

    fn list_literal(&mut self) {
        let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseSquareBracket) else {
            return;
        };

        let line = self.previous_line();
        self.emit_constant(Value::Int(i64::from(Type::List as u8)));
        self.emit_constant(Value::Int(i64::from(num_args)));
        self.emit_constant(Value::Bool(has_unpack));
        self.emit_op(Op::ConstructBuiltin, line);
    }

    /// `(expr)` is a grouping; a trailing comma makes a Tuple; `(...expr)`
    /// spreads an iterable into a Tuple.
    fn tuple_or_grouping(&mut self) {
        if self.matches(TokenKind::DotDotDot) {
            self.unpack_expression();
            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::from(Type::Tuple as u8)));
            self.emit_constant(Value::Int(1));
            self.emit_constant(Value::Bool(true));
            self.emit_op(Op::ConstructBuiltin, line);
            self.expect(TokenKind::CloseParen, "Expected ')'");
            return;
        }

        self.expression(false, false);

        if self.matches(TokenKind::Comma) {
            let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseParen) else {
                return;
            };
            let line = self.previous_line();
            self.emit_constant(Value::Int(i64::from(Type::Tuple as u8)));
            self.emit_constant(Value::Int(i64::from(num_args) + 1));
            self.emit_constant(Value::Bool(has_unpack));
            self.emit_op(Op::ConstructBuiltin, line);
        } else {
            self.expect(TokenKind::CloseParen, "Expected ')'");
        }
    }

    fn dict_literal(&mut self) {
        let Some((num_args, has_unpack)) = self.parse_call_args(TokenKind::CloseBrace) else {
            return;
        };

        let line = self.previous_line();
        self.emit_constant(Value::Int(i64::from(Type::Dict as u8)));
        self.emit_constant(Value::Int(i64::from(num_args)));
        self.emit_constant(Value::Bool(has_unpack));
        self.emit_op(Op::ConstructBuiltin, line);
    }

    // ---- literal parsing ----

    pub(crate) fn parse_string(&mut self) -> Option<String> {
        let lexeme = self.previous_lexeme().to_owned();
        let inner = &lexeme[1..lexeme.len().saturating_sub(1)];

        let mut result = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                result.push(c);
                continue;
            }
            let Some(escaped) = chars.next() else {
                self.error_at_previous("Expected escape character but string terminated");
                return None;
            };
            match escaped {
                't' => result.push('\t'),
                'n' => result.push('\n'),
                'r' => result.push('\r'),
                '"' => result.push('"'),
                '\\' => result.push('\\'),
                other => {
                    self.error_at_previous(&format!("Unrecognised escape character '{other}'"));
                    return None;
                }
            }
        }

        Some(result)
    }

    pub(crate) fn parse_int(&mut self) -> Option<i64> {
        let text = self.previous_lexeme().to_owned();
        let bytes = text.as_bytes();

        let is_binary = bytes.len() >= 2 && (bytes[1] == b'b' || bytes[1] == b'B');
        let is_hex = bytes.len() >= 2 && (bytes[1] == b'x' || bytes[1] == b'X');

        let parsed = if is_binary {
            if bytes[0] != b'0' {
                self.error_at_previous("Binary literals must start with '0'");
                return None;
            }
            let cleaned: String = text[2..].chars().filter(|&c| c != '_').collect();
            if cleaned.is_empty() || !cleaned.bytes().all(|b| b == b'0' || b == b'1') {
                self.error_at_previous("Binary literals must only contain '1' and '0'");
                return None;
            }
            i64::from_str_radix(&cleaned, 2)
        } else if is_hex {
            if bytes[0] != b'0' {
                self.error_at_previous("Hex literals must start with '0'");
                return None;
            }
            let cleaned: String = text[2..].chars().filter(|&c| c != '_').collect();
            if cleaned.is_empty() || !cleaned.bytes().all(|b| b.is_ascii_hexdigit()) {
                self.error_at_previous("Hex literals must only contain digits or characters in the range 'A' to 'F'");
                return None;
            }
            i64::from_str_radix(&cleaned, 16)
        } else {
            let cleaned: String = text.chars().filter(|&c| c != '_').collect();
            cleaned.parse::<i64>()
        };

        match parsed {
            Ok(value) => Some(value),
            Err(_) => {
                self.error_at_previous(&format!("Unable to parse Int '{text}'"));
                None
            }
        }
    }

    pub(crate) fn parse_float(&mut self) -> Option<f64> {
        let text = self.previous_lexeme().to_owned();
        let cleaned: String = text.chars().filter(|&c| c != '_').collect();
        match cleaned.parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.error_at_previous(&format!("Unable to parse Float '{text}'"));
                None
            }
        }
    }
}
