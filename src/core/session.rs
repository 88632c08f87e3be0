// This module provides arena-based translation session management using the bumpalo crate
// to simplify lifetime management in bpfgen. TranslationSession is the central hub that
// owns the arena allocator and tracks state shared by every program translated from one
// script: interned source strings (content-pooled, so equal text yields the identical
// &'arena str and pointer equality doubles as content equality), the pass configuration
// (script name, soft-error ceiling, kernel version code), and translation statistics.
// All interned objects are allocated in the arena and share the session lifetime, so the
// Program and Globals tables can hold &'arena str without lifetime plumbing of their
// own. SessionStats tracks translation metrics like probe and block counts, instruction
// totals, and interned string counts for the driver's summary log line.

//! Arena-based translation session management.
//!
//! All per-pass objects are tied to the session lifetime, eliminating
//! complex lifetime propagation through the translator.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use hashbrown::HashMap;

/// Soft-error ceiling applied when the caller does not override it.
pub const DEFAULT_MAX_ERRORS: u64 = 0;

/// Pass-wide configuration supplied by the driver's caller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Script basename embedded in the output object.
    pub script_name: String,
    /// Soft errors tolerated before the program hard-exits.
    pub max_errors: u64,
    /// LINUX_VERSION_CODE recorded in the version section.
    pub kernel_version: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            script_name: "stap_script".to_string(),
            max_errors: DEFAULT_MAX_ERRORS,
            kernel_version: 0,
        }
    }
}

/// Arena-based translation session.
///
/// Owns the arena and the string-interning pool shared by all programs
/// translated from one script.
pub struct TranslationSession<'arena> {
    /// Arena allocator for translation objects.
    arena: &'arena Bump,

    /// Pass configuration.
    config: SessionConfig,

    /// String interning pool. Equal content maps to the identical arena slice.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Session statistics for debugging and the driver summary.
    stats: RefCell<SessionStats>,
}

impl<'arena> TranslationSession<'arena> {
    /// Create a new session with the given arena and default configuration.
    pub fn new(arena: &'arena Bump) -> Self {
        Self::with_config(arena, SessionConfig::default())
    }

    /// Create a new session with explicit configuration.
    pub fn with_config(arena: &'arena Bump, config: SessionConfig) -> Self {
        Self {
            arena,
            config,
            interned_strings: RefCell::new(HashMap::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Pass configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Intern a string in the arena, pooling by content.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        self.stats.borrow_mut().strings_interned += 1;
        interned
    }

    /// Record a translated program and its block/instruction totals.
    pub fn record_program(&self, name: &str, blocks: usize, insns: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.programs_translated += 1;
        stats.blocks_created += blocks;
        stats.insns_created += insns;
        log::info!("translated {name}: {blocks} blocks, {insns} instructions");
    }

    /// Get translation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Translation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of probe programs translated.
    pub programs_translated: usize,

    /// Total basic blocks created.
    pub blocks_created: usize,

    /// Total virtual instructions created.
    pub insns_created: usize,

    /// Distinct strings interned in the arena.
    pub strings_interned: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} programs, {} blocks, {} insns, {} interned strings",
            self.programs_translated, self.blocks_created, self.insns_created,
            self.strings_interned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning_pools_by_content() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
        assert_eq!(session.stats().strings_interned, 2);
    }

    #[test]
    fn test_stats_accumulate() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        session.record_program("stap_begin", 4, 12);
        session.record_program("kprobe/do_sys_open", 7, 40);

        let stats = session.stats();
        assert_eq!(stats.programs_translated, 2);
        assert_eq!(stats.blocks_created, 11);
        assert_eq!(stats.insns_created, 52);
        assert!(stats.to_string().contains("2 programs"));
    }
}
