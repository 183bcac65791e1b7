//! Statements: print family, return, throw, try/catch, if/else, while,
//! for-in, break, and expression statements.

use crate::{
    bytecode::Op,
    compiler::{Compiler, Context, JumpType, LocalVariable},
    scanner::TokenKind,
    value::Value,
};

impl Compiler<'_> {
    pub(crate) fn statement(&mut self, consume_semicolon: bool) {
        if *self.context_stack.last().expect("context stack is never empty") == Context::TopLevel {
            self.error_at_current("Statements not allowed at top level");
            return;
        }

        if self.matches(TokenKind::Print)
            || self.matches(TokenKind::PrintLn)
            || self.matches(TokenKind::EPrint)
            || self.matches(TokenKind::EPrintLn)
        {
            let kind = self.previous.expect("just matched").kind;
            let err_stream = matches!(kind, TokenKind::EPrint | TokenKind::EPrintLn);
            let newline = matches!(kind, TokenKind::PrintLn | TokenKind::EPrintLn);
            self.print_statement(err_stream, newline, consume_semicolon);
        } else if self.matches(TokenKind::Return) {
            self.return_statement(consume_semicolon);
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement(consume_semicolon);
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else {
            self.expression_statement(consume_semicolon);
        }
    }

    /// A bare expression as a statement: calls and assignments. The unused
    /// result of a call is popped; assignments leave nothing behind.
    fn expression_statement(&mut self, consume_semicolon: bool) {
        self.call_expression(true);

        if !self.last_op_was_assignment() {
            self.emit_op(Op::Pop, self.previous_line());
        }

        if consume_semicolon {
            self.expect_semicolon();
        }
    }

    fn print_statement(&mut self, err_stream: bool, newline: bool, consume_semicolon: bool) {
        if !self.expect(TokenKind::OpenParen, "Expected '(' after print statement") {
            return;
        }

        self.expression(false, false);
        let line = self.previous_line();
        self.emit_constant(Value::Bool(err_stream));
        self.emit_constant(Value::Bool(newline));
        self.emit_op(Op::Print, line);

        if !self.expect(TokenKind::CloseParen, "Expected ')' after print statement") {
            return;
        }
        if consume_semicolon {
            self.expect_semicolon();
        }
    }

    fn return_statement(&mut self, consume_semicolon: bool) {
        if self.matches(TokenKind::Semicolon) {
            // no explicit value: return none
            let line = self.previous_line();
            self.emit_constant(Value::None);
            self.emit_op(Op::LoadConstant, line);
            self.emit_constant(Value::Int(0));
            self.emit_op(Op::PopLocals, line);
            self.emit_op(Op::Return, line);
            return;
        }

        self.expression(false, false);
        let line = self.previous_line();
        self.emit_constant(Value::Int(0));
        self.emit_op(Op::PopLocals, line);
        // the expression result stays on the stack through the frame pop
        self.emit_op(Op::Return, line);

        if consume_semicolon {
            self.expect_semicolon();
        }
    }

    fn throw_statement(&mut self, consume_semicolon: bool) {
        self.expression(false, false);
        self.emit_op(Op::Throw, self.previous_line());

        if consume_semicolon {
            self.expect_semicolon();
        }
    }

    fn try_statement(&mut self) {
        self.context_stack.push(Context::TryCatch);

        let num_locals_start = self.locals.len();

        let catch_constant_slot = self.vm.num_constants();
        self.emit_constant(Value::Int(0));
        let catch_op_slot = self.vm.num_constants();
        self.emit_constant(Value::Int(0));
        self.emit_op(Op::EnterTry, self.previous_line());

        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }
        if !self.parse_block("try block") {
            return;
        }

        // normal exit: pop the block's locals, leave the try, skip the catch
        let line = self.previous_line();
        self.emit_scope_pop(num_locals_start, line);
        self.emit_op(Op::ExitTry, line);
        let after_catch = self.emit_jump(JumpType::Jump, false);

        // exception entry lands here, before the catch-path locals pop
        let num_constants = self.vm.num_constants();
        let num_ops = self.vm.num_ops();
        self.vm
            .set_constant(catch_constant_slot, Value::Int(i64::try_from(num_constants).expect("constant count")));
        self.vm
            .set_constant(catch_op_slot, Value::Int(i64::try_from(num_ops).expect("op count")));

        self.emit_scope_pop(num_locals_start, line);
        self.locals.truncate(num_locals_start);

        if !self.expect(TokenKind::Catch, "Expected 'catch' after 'try' block") {
            return;
        }
        self.catch_statement();

        self.patch_jump(after_catch);
    }

    fn catch_statement(&mut self) {
        let num_locals_start = self.locals.len();

        if self.matches(TokenKind::Identifier) {
            // bind the thrown value as a local
            let name = self.previous_lexeme().to_owned();
            if self.has_local(&name) {
                self.error_at_previous("Local variable with the same name already declared");
                return;
            }
            self.locals.push(LocalVariable { name, is_final: false });
            self.emit_op(Op::DeclareLocal, self.previous_line());
        } else {
            self.emit_op(Op::Pop, self.previous_line());
        }

        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }
        if !self.parse_block("catch block") {
            return;
        }

        let line = self.previous_line();
        self.emit_scope_pop(num_locals_start, line);
        self.locals.truncate(num_locals_start);

        self.context_stack.pop();
    }

    fn if_statement(&mut self) {
        self.context_stack.push(Context::IfStatement);

        self.expression(false, false);
        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }

        let num_locals_start = self.locals.len();

        // skip the then-branch when the condition fails, popping it either way
        let false_jump = self.emit_jump(JumpType::IfFalse, true);

        if !self.parse_block("if statement") {
            return;
        }

        let line = self.previous_line();
        self.emit_scope_pop(num_locals_start, line);
        self.locals.truncate(num_locals_start);

        if self.matches(TokenKind::Else) {
            // condition held and the then-branch ran: skip the else branch
            let true_jump = self.emit_jump(JumpType::Jump, false);
            self.patch_jump(false_jump);

            if self.matches(TokenKind::OpenBrace) {
                if !self.parse_block("else block") {
                    return;
                }
                let line = self.previous_line();
                self.emit_scope_pop(num_locals_start, line);
                self.locals.truncate(num_locals_start);
            } else if self.matches(TokenKind::If) {
                self.if_statement();
            } else {
                self.error_at_previous("Expected '{' or 'if'");
                return;
            }

            self.patch_jump(true_jump);
        } else {
            self.patch_jump(false_jump);
        }

        self.context_stack.pop();
    }

    fn while_statement(&mut self) {
        self.context_stack.push(Context::WhileLoop);
        self.break_jump_stack.push(Vec::new());

        // the condition is re-evaluated here after every iteration
        let condition_constant_index = self.vm.num_constants();
        let condition_op_index = self.vm.num_ops();

        self.expression(false, false);
        let exit_jump = self.emit_jump(JumpType::IfFalse, true);

        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }

        let num_locals_start = self.locals.len();

        if !self.parse_block("while loop") {
            return;
        }

        let line = self.previous_line();
        self.emit_scope_pop(num_locals_start, line);
        self.locals.truncate(num_locals_start);

        self.emit_constant(Value::Int(i64::try_from(condition_constant_index).expect("constant count")));
        self.emit_constant(Value::Int(i64::try_from(condition_op_index).expect("op count")));
        self.emit_op(Op::Jump, line);

        let break_jumps = self.break_jump_stack.pop().expect("pushed above");
        for jump in break_jumps {
            self.patch_jump(jump);
        }

        // pop block locals when a break skipped the per-iteration pop
        self.emit_scope_pop(num_locals_start, line);

        self.patch_jump(exit_jump);

        self.context_stack.pop();
    }

    fn for_statement(&mut self) {
        self.context_stack.push(Context::ForLoop);
        self.break_jump_stack.push(Vec::new());

        if !self.expect(TokenKind::Identifier, "Expected identifier") {
            return;
        }

        let first_name = self.previous_lexeme().to_owned();
        if self.has_local(&first_name) {
            self.error_at_previous("Local variable with the same name already declared");
            return;
        }

        let line = self.previous_line();
        let first_local_index = self.locals.len();
        self.emit_constant(Value::None);
        self.emit_op(Op::LoadConstant, line);
        self.emit_op(Op::DeclareLocal, line);
        self.locals.push(LocalVariable {
            name: first_name,
            is_final: false,
        });

        let mut second_local_index = None;
        if self.matches(TokenKind::Comma) {
            if !self.expect(TokenKind::Identifier, "Expected identifier") {
                return;
            }
            let second_name = self.previous_lexeme().to_owned();
            if self.has_local(&second_name) {
                self.error_at_previous("Local variable with the same name already declared");
                return;
            }
            let line = self.previous_line();
            second_local_index = Some(self.locals.len());
            self.emit_constant(Value::None);
            self.emit_op(Op::LoadConstant, line);
            self.emit_op(Op::DeclareLocal, line);
            self.locals.push(LocalVariable {
                name: second_name,
                is_final: false,
            });
        }

        // includes the iteration variables
        let num_locals_start = self.locals.len();
        let num_iteration_vars = if second_local_index.is_some() { 2 } else { 1 };

        if !self.expect(TokenKind::In, "Expected 'in'") {
            return;
        }

        self.expression(false, false);
        let line = self.previous_line();
        self.emit_constant(Value::Int(i64::try_from(first_local_index).expect("local index")));
        self.emit_constant(Value::Int(
            i64::try_from(second_local_index.unwrap_or(0)).expect("local index"),
        ));
        self.emit_op(Op::InitIterator, line);

        // each iteration jumps back here, just after Init/IncrementIterator
        let loop_constant_index = self.vm.num_constants();
        let loop_op_index = self.vm.num_ops();

        // InitIterator and IncrementIterator leave is-at-end on the stack
        let exit_jump = self.emit_jump(JumpType::IfTrue, true);

        if !self.expect(TokenKind::OpenBrace, "Expected '{'") {
            return;
        }
        if !self.parse_block("for loop") {
            return;
        }

        let line = self.previous_line();
        self.emit_constant(Value::Int(i64::try_from(first_local_index).expect("local index")));
        self.emit_constant(Value::Int(
            i64::try_from(second_local_index.unwrap_or(0)).expect("local index"),
        ));
        self.emit_op(Op::IncrementIterator, line);

        self.emit_scope_pop(num_locals_start, line);
        self.locals.truncate(num_locals_start);

        self.emit_constant(Value::Int(i64::try_from(loop_constant_index).expect("constant count")));
        self.emit_constant(Value::Int(i64::try_from(loop_op_index).expect("op count")));
        self.emit_op(Op::Jump, line);

        // breaks and the exhausted-iterator jump both land on PopIterator
        let break_jumps = self.break_jump_stack.pop().expect("pushed above");
        for jump in break_jumps {
            self.patch_jump(jump);
        }
        self.patch_jump(exit_jump);

        self.emit_op(Op::PopIterator, line);

        // finally pop the iteration variables themselves
        self.emit_scope_pop(num_locals_start - num_iteration_vars, line);
        self.locals.truncate(num_locals_start - num_iteration_vars);

        self.context_stack.pop();
    }

    fn break_statement(&mut self) {
        let loop_position = self
            .context_stack
            .iter()
            .rposition(|context| matches!(context, Context::ForLoop | Context::WhileLoop));

        let Some(loop_position) = loop_position else {
            self.error_at_previous("'break' only allowed inside of loops");
            return;
        };

        // a lambda between the loop and the break makes the break invalid
        if self
            .context_stack
            .iter()
            .rposition(|context| *context == Context::Lambda)
            .is_some_and(|lambda_position| lambda_position > loop_position)
        {
            self.error_at_previous("'break' only allowed inside of loops");
            return;
        }

        let jump = self.emit_jump(JumpType::Jump, false);
        self.break_jump_stack
            .last_mut()
            .expect("break recorded inside a loop")
            .push(jump);

        self.expect_semicolon();
    }

    /// Emits `PopLocals(scope_start)` at `line`.
    pub(crate) fn emit_scope_pop(&mut self, scope_start: usize, line: usize) {
        self.emit_constant(Value::Int(i64::try_from(scope_start).expect("scope start")));
        self.emit_op(Op::PopLocals, line);
    }
}
