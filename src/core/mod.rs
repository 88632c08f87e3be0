// This module serves as the central hub for bpfgen's shared infrastructure, providing
// the building blocks used by every stage of the translation pass: session management
// (arena-based allocation of interned strings, pass configuration, and translation
// statistics) and the error taxonomy (location-tagged user-script failures, resource
// failures from object-file construction, and the TranslateResult alias threaded
// through the translator, assembler, and emitter). Everything downstream of the AST
// depends on this module; it depends on nothing else in the crate.

//! Core bpfgen Infrastructure
//!
//! Shared building blocks for the translation pass:
//!
//! - [`session`]: arena allocation, string interning, pass configuration
//! - [`error`]: the translation error taxonomy and result alias

pub mod error;
pub mod session;

pub use error::{SourceLoc, TranslateError, TranslateResult};
pub use session::{SessionConfig, SessionStats, TranslationSession, DEFAULT_MAX_ERRORS};
