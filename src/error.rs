//! Error types for the orchestra compiler.

use std::fmt;

/// An error that aborted a compilation.
///
/// Carries the source position where the fault was detected (line 0 when
/// no position applies, e.g. end-of-input faults).
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub kind: ErrorKind,
}

/// The mutually exclusive compilation outcome kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Preprocessing fault, e.g. an unmatched conditional directive.
    Preprocess,
    /// Unrecoverable malformed input in the token stream.
    InvalidInput,
    /// Allocation failure while building the tree.
    OutOfMemory,
    /// One or more grammar violations, reported together after parsing.
    Syntax { count: usize },
    /// Unresolved symbol, type mismatch, arity mismatch.
    Semantic,
    /// A post-verification invariant broke during lowering.
    Internal,
}

impl CompileError {
    pub fn preprocess(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col: 0,
            kind: ErrorKind::Preprocess,
        }
    }

    pub fn invalid_input(message: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col,
            kind: ErrorKind::InvalidInput,
        }
    }

    pub fn out_of_memory(line: usize) -> Self {
        Self {
            message: "memory exhausted while building the tree".to_string(),
            line,
            col: 0,
            kind: ErrorKind::OutOfMemory,
        }
    }

    pub fn syntax(count: usize) -> Self {
        Self {
            message: format!("{count} syntax error{}", if count == 1 { "" } else { "s" }),
            line: 0,
            col: 0,
            kind: ErrorKind::Syntax { count },
        }
    }

    pub fn semantic(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col: 0,
            kind: ErrorKind::Semantic,
        }
    }

    pub fn internal(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
            col: 0,
            kind: ErrorKind::Internal,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Syntax { .. } => write!(f, "{}", self.message),
            _ => write!(
                f,
                "[{}:{}] {:?}: {}",
                self.line, self.col, self.kind, self.message
            ),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_carries_count() {
        let err = CompileError::syntax(3);
        assert_eq!(err.kind, ErrorKind::Syntax { count: 3 });
        assert_eq!(err.to_string(), "3 syntax errors");
    }

    #[test]
    fn singular_syntax_message() {
        let err = CompileError::syntax(1);
        assert_eq!(err.to_string(), "1 syntax error");
    }

    #[test]
    fn kinds_are_distinct() {
        assert_ne!(
            CompileError::preprocess("x", 1).kind,
            CompileError::invalid_input("x", 1, 1).kind
        );
        assert_ne!(
            CompileError::out_of_memory(0).kind,
            CompileError::syntax(1).kind
        );
    }
}
