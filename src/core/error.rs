// This module defines error types for the bpfgen translator using the thiserror crate
// for idiomatic Rust error handling. TranslateError is the main error enum covering the
// failure classes of code generation: constructs a target variant cannot express,
// unresolved or recursive script-function calls, break/continue outside a loop, format
// string arity mismatches, oversized strings/keys/argument lists, malformed embedded
// assembly, and object-file construction failures surfaced from the object crate. User
// facing variants carry a SourceLoc so the driver can report the failing statement of
// the probe that produced it. The module also provides TranslateResult<T> as a
// convenience type alias for Result<T, TranslateError>.

//! Error types for the bpfgen translator.
//!
//! Using thiserror for more idiomatic error handling.

use std::fmt;

use thiserror::Error;

/// Source position of the token that triggered a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "<synthesized>")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

/// Main error type for script translation.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("{loc}: {construct} not supported by this target")]
    Unsupported { construct: String, loc: SourceLoc },

    #[error("{loc}: {construct} used outside a loop")]
    OutsideLoop {
        construct: &'static str,
        loc: SourceLoc,
    },

    #[error("{loc}: call to unresolved function {name} ({candidates} candidates)")]
    UnresolvedCall {
        name: String,
        candidates: usize,
        loc: SourceLoc,
    },

    #[error("{loc}: unknown function {name}")]
    UnknownFunction { name: String, loc: SourceLoc },

    #[error("{loc}: unknown variable {name}")]
    UnknownVariable { name: String, loc: SourceLoc },

    #[error("{loc}: {reason}")]
    Semantic { reason: String, loc: SourceLoc },

    #[error("{loc}: recursive call to function {name}")]
    Recursion { name: String, loc: SourceLoc },

    #[error("{loc}: format string expects {expected} arguments, got {found}")]
    FormatArity {
        expected: usize,
        found: usize,
        loc: SourceLoc,
    },

    #[error("{loc}: {what} exceeds limit ({actual} > {limit})")]
    Oversize {
        what: &'static str,
        limit: usize,
        actual: usize,
        loc: SourceLoc,
    },

    #[error("{loc}: embedded assembly error: {reason}")]
    AsmSyntax { reason: String, loc: SourceLoc },

    #[error("{loc}: invalid operand {token}")]
    InvalidOperand { token: String, loc: SourceLoc },

    #[error("code generation failed: {reason}")]
    CodeGen { reason: String },

    #[error("object file construction failed: {0}")]
    Object(#[from] object::write::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranslateError {
    /// Source location attached to the error, if the failure came from a
    /// specific script token.
    pub fn loc(&self) -> Option<&SourceLoc> {
        match self {
            TranslateError::Unsupported { loc, .. }
            | TranslateError::OutsideLoop { loc, .. }
            | TranslateError::UnresolvedCall { loc, .. }
            | TranslateError::UnknownFunction { loc, .. }
            | TranslateError::UnknownVariable { loc, .. }
            | TranslateError::Semantic { loc, .. }
            | TranslateError::Recursion { loc, .. }
            | TranslateError::FormatArity { loc, .. }
            | TranslateError::Oversize { loc, .. }
            | TranslateError::AsmSyntax { loc, .. }
            | TranslateError::InvalidOperand { loc, .. } => Some(loc),
            TranslateError::CodeGen { .. }
            | TranslateError::Object(_)
            | TranslateError::Io(_) => None,
        }
    }
}

/// Result type alias for translation operations.
pub type TranslateResult<T> = Result<T, TranslateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loc_display() {
        let loc = SourceLoc::new("probe.stp", 12, 3);
        assert_eq!(loc.to_string(), "probe.stp:12:3");
        assert_eq!(SourceLoc::default().to_string(), "<synthesized>");
    }

    #[test]
    fn test_error_carries_loc() {
        let err = TranslateError::OutsideLoop {
            construct: "break",
            loc: SourceLoc::new("t.stp", 4, 1),
        };
        assert_eq!(err.loc().map(|l| l.line), Some(4));
        assert!(err.to_string().contains("break"));
    }
}
