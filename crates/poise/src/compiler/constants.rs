//! Compile-time constant expression evaluation.
//!
//! A second parser path reached from `const` declarations and struct member
//! defaults. It applies the same operator implementations the runtime Value
//! exposes; identifier references are not resolved here and evaluate to
//! `none`. Exceptions raised by the operators become compile errors.

use crate::{
    exception::RunResult,
    scanner::TokenKind,
    value::Value,
};

use super::Compiler;

impl Compiler<'_> {
    pub(crate) fn constant_expression(&mut self) -> Option<Value> {
        self.constant_logic_or()
    }

    /// Reports an operator failure as a compile error.
    fn checked(&mut self, result: RunResult<Value>) -> Option<Value> {
        match result {
            Ok(value) => Some(value),
            Err(exception) => {
                self.error_at_previous(&format!("Error evaluating constant expression: {}", exception.message()));
                None
            }
        }
    }

    fn constant_logic_or(&mut self) -> Option<Value> {
        let mut lhs = self.constant_logic_and()?;
        while self.matches(TokenKind::Or) {
            let rhs = self.constant_logic_and()?;
            lhs = Value::Bool(lhs.to_bool() || rhs.to_bool());
            rhs.drop_with_heap(self.vm.heap_mut());
        }
        Some(lhs)
    }

    fn constant_logic_and(&mut self) -> Option<Value> {
        let mut lhs = self.constant_bitwise_or()?;
        while self.matches(TokenKind::And) {
            let rhs = self.constant_bitwise_or()?;
            lhs = Value::Bool(lhs.to_bool() && rhs.to_bool());
            rhs.drop_with_heap(self.vm.heap_mut());
        }
        Some(lhs)
    }

    fn constant_bitwise_or(&mut self) -> Option<Value> {
        let mut lhs = self.constant_bitwise_xor()?;
        while self.matches(TokenKind::Pipe) {
            let rhs = self.constant_bitwise_xor()?;
            let result = lhs.bit_or(&rhs, self.vm.heap());
            lhs = self.checked(result)?;
        }
        Some(lhs)
    }

    fn constant_bitwise_xor(&mut self) -> Option<Value> {
        let mut lhs = self.constant_bitwise_and()?;
        while self.matches(TokenKind::Caret) {
            let rhs = self.constant_bitwise_and()?;
            let result = lhs.bit_xor(&rhs, self.vm.heap());
            lhs = self.checked(result)?;
        }
        Some(lhs)
    }

    fn constant_bitwise_and(&mut self) -> Option<Value> {
        let mut lhs = self.constant_equality()?;
        while self.matches(TokenKind::Ampersand) {
            let rhs = self.constant_equality()?;
            let result = lhs.bit_and(&rhs, self.vm.heap());
            lhs = self.checked(result)?;
        }
        Some(lhs)
    }

    fn constant_equality(&mut self) -> Option<Value> {
        let mut lhs = self.constant_comparison()?;
        if self.matches(TokenKind::EqualEqual) {
            let rhs = self.constant_comparison()?;
            lhs = Value::Bool(lhs.equals(&rhs));
            rhs.drop_with_heap(self.vm.heap_mut());
        } else if self.matches(TokenKind::NotEqual) {
            let rhs = self.constant_comparison()?;
            lhs = Value::Bool(!lhs.equals(&rhs));
            rhs.drop_with_heap(self.vm.heap_mut());
        }
        Some(lhs)
    }

    fn constant_comparison(&mut self) -> Option<Value> {
        let mut lhs = self.constant_shift()?;
        if self.matches(TokenKind::Less) {
            let rhs = self.constant_shift()?;
            let result = lhs.less_than(&rhs, self.vm.heap()).map(Value::Bool);
            lhs = self.checked(result)?;
        } else if self.matches(TokenKind::LessEqual) {
            let rhs = self.constant_shift()?;
            let result = lhs.less_equal(&rhs, self.vm.heap()).map(Value::Bool);
            lhs = self.checked(result)?;
        } else if self.matches(TokenKind::Greater) {
            let rhs = self.constant_shift()?;
            let result = lhs.greater_than(&rhs, self.vm.heap()).map(Value::Bool);
            lhs = self.checked(result)?;
        } else if self.matches(TokenKind::GreaterEqual) {
            let rhs = self.constant_shift()?;
            let result = lhs.greater_equal(&rhs, self.vm.heap()).map(Value::Bool);
            lhs = self.checked(result)?;
        }
        Some(lhs)
    }

    fn constant_shift(&mut self) -> Option<Value> {
        let mut lhs = self.constant_term()?;
        loop {
            if self.matches(TokenKind::ShiftLeft) {
                let rhs = self.constant_term()?;
                let result = lhs.shift_left(&rhs, self.vm.heap());
                lhs = self.checked(result)?;
            } else if self.matches(TokenKind::ShiftRight) {
                let rhs = self.constant_term()?;
                let result = lhs.shift_right(&rhs, self.vm.heap());
                lhs = self.checked(result)?;
            } else {
                break;
            }
        }
        Some(lhs)
    }

    fn constant_term(&mut self) -> Option<Value> {
        let mut lhs = self.constant_factor()?;
        loop {
            if self.matches(TokenKind::Plus) {
                let rhs = self.constant_factor()?;
                let result = lhs.add(&rhs, self.vm.heap_mut());
                lhs = self.checked(result)?;
            } else if self.matches(TokenKind::Minus) {
                let rhs = self.constant_factor()?;
                let result = lhs.sub(&rhs, self.vm.heap());
                lhs = self.checked(result)?;
            } else {
                break;
            }
        }
        Some(lhs)
    }

    fn constant_factor(&mut self) -> Option<Value> {
        let mut lhs = self.constant_unary()?;
        loop {
            if self.matches(TokenKind::Star) {
                let rhs = self.constant_unary()?;
                let result = lhs.mul(&rhs, self.vm.heap_mut());
                lhs = self.checked(result)?;
            } else if self.matches(TokenKind::Slash) {
                let rhs = self.constant_unary()?;
                let result = lhs.div(&rhs, self.vm.heap());
                lhs = self.checked(result)?;
            } else if self.matches(TokenKind::Modulus) {
                let rhs = self.constant_unary()?;
                let result = lhs.rem(&rhs, self.vm.heap());
                lhs = self.checked(result)?;
            } else {
                break;
            }
        }
        Some(lhs)
    }

    fn constant_unary(&mut self) -> Option<Value> {
        if self.matches(TokenKind::Minus) {
            let rhs = self.constant_unary()?;
            let result = rhs.negate(self.vm.heap());
            self.checked(result)
        } else if self.matches(TokenKind::Tilde) {
            let rhs = self.constant_unary()?;
            let result = rhs.bitwise_not(self.vm.heap());
            self.checked(result)
        } else if self.matches(TokenKind::Exclamation) {
            let rhs = self.constant_unary()?;
            Some(rhs.logic_not())
        } else if self.matches(TokenKind::Plus) {
            let rhs = self.constant_unary()?;
            let result = rhs.unary_plus(self.vm.heap());
            self.checked(result)
        } else {
            self.constant_primary()
        }
    }

    fn constant_primary(&mut self) -> Option<Value> {
        if self.matches(TokenKind::False) {
            Some(Value::Bool(false))
        } else if self.matches(TokenKind::True) {
            Some(Value::Bool(true))
        } else if self.matches(TokenKind::Float) {
            self.parse_float().map(Value::Float)
        } else if self.matches(TokenKind::Int) {
            self.parse_int().map(Value::Int)
        } else if self.matches(TokenKind::None) {
            Some(Value::None)
        } else if self.matches(TokenKind::String) {
            self.parse_string().map(Value::Str)
        } else if self.matches(TokenKind::OpenParen) {
            let value = self.constant_expression();
            if !self.expect(TokenKind::CloseParen, "Expected ')'") {
                return None;
            }
            value
        } else if self.matches(TokenKind::Identifier) {
            // identifiers are not resolved at compile time
            Some(Value::None)
        } else {
            self.error_at_current("Invalid token in constant expression");
            None
        }
    }
}
