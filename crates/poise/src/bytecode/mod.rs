//! Bytecode representation.
//!
//! Code is a pair of parallel arrays: ops (each tagged with its source line
//! for diagnostics) and constants. An op that takes operands consumes the
//! next N entries of the constants array when it executes; the compiler and
//! VM agree on N per opcode, and [`Op::base_constants`] records it for the
//! disassembler and the parity checks in the test suite.

use strum::Display;

/// The instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum Op {
    Assert,
    AssignIndex,
    AssignLocal,
    Addition,
    BitwiseAnd,
    BitwiseNot,
    BitwiseOr,
    BitwiseXor,
    Call,
    CallNative,
    CaptureLocal,
    ConstructBuiltin,
    DeclareLocal,
    DeclareMultipleLocals,
    Divide,
    EnterTry,
    Equal,
    Exit,
    ExitTry,
    GreaterEqual,
    GreaterThan,
    IncrementIterator,
    InitIterator,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    LeftShift,
    LessEqual,
    LessThan,
    LoadCapture,
    LoadConstant,
    LoadFunctionOrStruct,
    LoadIndex,
    LoadLocal,
    LoadMember,
    LoadType,
    LogicAnd,
    LogicNot,
    LogicOr,
    MakeLambda,
    Modulus,
    Multiply,
    Negate,
    NotEqual,
    Plus,
    Pop,
    PopIterator,
    PopLocals,
    Print,
    Return,
    RightShift,
    Subtraction,
    Throw,
    TypeOf,
    Unpack,
}

impl Op {
    /// Constants this op consumes at execution time.
    ///
    /// `ConstructBuiltin` consumes one more than this when its tag constant
    /// is Range (the inclusive flag); callers walking code linearly must
    /// read the tag to account for it.
    #[must_use]
    pub fn base_constants(self) -> usize {
        match self {
            Self::LoadConstant
            | Self::LoadLocal
            | Self::AssignLocal
            | Self::DeclareMultipleLocals
            | Self::PopLocals
            | Self::CallNative
            | Self::MakeLambda
            | Self::CaptureLocal
            | Self::LoadCapture
            | Self::LoadType => 1,
            Self::LoadFunctionOrStruct
            | Self::LoadMember
            | Self::InitIterator
            | Self::IncrementIterator
            | Self::EnterTry
            | Self::Jump
            | Self::Print => 2,
            Self::Call | Self::JumpIfFalse | Self::JumpIfTrue | Self::ConstructBuiltin => 3,
            _ => 0,
        }
    }
}

/// One emitted instruction with the source line it came from.
#[derive(Debug, Clone, Copy)]
pub struct OpLine {
    pub op: Op,
    pub line: usize,
}
