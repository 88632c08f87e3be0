//! bpfgen - BPF code generation for tracing scripts.
//!
//! bpfgen is the code-generation backend of a dynamic tracing toolchain. It
//! lowers a type-checked tracing-script AST into an extended BPF-style
//! virtual instruction set organized as a control-flow graph, plans map
//! backed storage for script globals (scalars, arrays, statistics
//! aggregates), and serializes everything into a relocatable ELF object
//! consumable by a kernel loader or the companion userspace interpreter.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bpfgen::core::TranslationSession;
//! use bpfgen::translate_script;
//! use bumpalo::Bump;
//!
//! // Create a translation session with arena allocation
//! let arena = Bump::new();
//! let session = TranslationSession::new(&arena);
//!
//! // Translate a checked script into object bytes
//! let bytes = translate_script(&session, &script)?;
//! ```
//!
//! # Architecture
//!
//! - [`ast`] - The checked statement/expression tree consumed from the front-end
//! - [`core`] - Shared infrastructure (session, errors)
//! - [`ir`] - Virtual instruction set, CFG model, and the Program builder
//! - [`globals`] - Storage-layout planning for script globals
//! - [`lower`] - AST-to-CFG lowering
//! - [`asm`] - The embedded assembler for raw instruction-level probe code
//! - [`emit`] - Relocatable ELF object construction
//! - [`driver`] - Whole-script translation

pub mod asm;
pub mod ast;
pub mod core;
pub mod driver;
pub mod emit;
pub mod globals;
pub mod ir;
pub mod lower;

// Re-export the common entry points
pub use crate::core::{
    SessionConfig, SessionStats, SourceLoc, TranslateError, TranslateResult, TranslationSession,
};
pub use driver::translate_script;
pub use emit::{ObjectEmitter, R_BPF_MAP_FD};
pub use globals::Globals;
pub use ir::{Program, Target};
