use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can raise a runtime exception.
pub(crate) type RunResult<T> = Result<T, PoiseException>;

/// The fixed set of runtime exception kinds.
///
/// The string representation matches the variant name exactly, which is what
/// unhandled-exception reports and `Exception::to_string` print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ExcType {
    Exception,
    AmbiguousCall,
    ArgumentOutOfRange,
    AssertionFailed,
    DivisionByZero,
    FunctionNotFound,
    IncorrectArgCount,
    IndexOutOfBounds,
    InvalidArgument,
    InvalidCast,
    InvalidIterator,
    InvalidOperand,
    InvalidType,
    IteratorOutOfBounds,
    KeyNotFound,
    TypeNotExported,
    TypeNotFound,
}

/// A runtime exception: a kind plus a message.
///
/// This single type serves both as the `Err` arm of [`RunResult`] while an
/// exception propagates through native Rust code, and as the payload of a
/// heap `Exception` object once a `throw` or a `catch` materializes it as a
/// language value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoiseException {
    kind: ExcType,
    message: String,
}

impl PoiseException {
    pub fn new(kind: ExcType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a plain `Exception` with the given message, the kind used when
    /// user code throws a non-exception value.
    pub fn plain(message: impl Into<String>) -> Self {
        Self::new(ExcType::Exception, message)
    }

    #[must_use]
    pub fn kind(&self) -> ExcType {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PoiseException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_kind_colon_message() {
        let exc = PoiseException::plain("oops");
        assert_eq!(exc.to_string(), "Exception: oops");

        let exc = PoiseException::new(ExcType::DivisionByZero, "Division by zero");
        assert_eq!(exc.to_string(), "DivisionByZero: Division by zero");
    }

    #[test]
    fn kind_names_match_variants() {
        let name: &'static str = ExcType::IteratorOutOfBounds.into();
        assert_eq!(name, "IteratorOutOfBounds");
        assert_eq!(ExcType::KeyNotFound.to_string(), "KeyNotFound");
    }
}
