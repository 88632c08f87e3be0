// Helper-function id space shared with the execution environments. Positive ids are
// kernel helper numbers passed through unchanged in the call instruction's immediate;
// negative ids select pseudo helpers implemented only by the companion userspace
// interpreter (iteration, formatting, statistics extraction, procfs plumbing). The
// name table serves the embedded assembler's call directive and diagnostics.

//! Helper function ids and the name lookup table.

use super::Target;

pub type HelperId = i64;

// Kernel helpers (ids from the kernel's helper numbering).
pub const BPF_FUNC_MAP_LOOKUP_ELEM: HelperId = 1;
pub const BPF_FUNC_MAP_UPDATE_ELEM: HelperId = 2;
pub const BPF_FUNC_MAP_DELETE_ELEM: HelperId = 3;
pub const BPF_FUNC_PROBE_READ: HelperId = 4;
pub const BPF_FUNC_KTIME_GET_NS: HelperId = 5;
pub const BPF_FUNC_TRACE_PRINTK: HelperId = 6;
pub const BPF_FUNC_GET_PRANDOM_U32: HelperId = 7;
pub const BPF_FUNC_GET_SMP_PROCESSOR_ID: HelperId = 8;
pub const BPF_FUNC_GET_CURRENT_PID_TGID: HelperId = 14;
pub const BPF_FUNC_GET_CURRENT_UID_GID: HelperId = 15;
pub const BPF_FUNC_GET_CURRENT_COMM: HelperId = 16;
pub const BPF_FUNC_PERF_EVENT_OUTPUT: HelperId = 25;
pub const BPF_FUNC_PROBE_READ_STR: HelperId = 45;

// Pseudo helpers provided by the userspace interpreter. Negative so they can
// never collide with kernel helper numbers.
pub const BPF_FUNC_MAP_GET_NEXT_KEY: HelperId = -1;
pub const BPF_FUNC_SPRINTF: HelperId = -2;
pub const BPF_FUNC_STAPBPF_STAT_GET: HelperId = -3;
pub const BPF_FUNC_GETTIMEOFDAY_NS: HelperId = -4;
pub const BPF_FUNC_GET_TARGET: HelperId = -5;
pub const BPF_FUNC_SET_PROCFS_VALUE: HelperId = -6;
pub const BPF_FUNC_APPEND_PROCFS_VALUE: HelperId = -7;
pub const BPF_FUNC_GET_PROCFS_VALUE: HelperId = -8;
pub const BPF_FUNC_STR_CONCAT: HelperId = -9;
pub const BPF_FUNC_TEXT_STR: HelperId = -10;
pub const BPF_FUNC_STRING_QUOTED: HelperId = -11;

/// Helpers callable by name from embedded assembly.
const HELPER_NAMES: &[(&str, HelperId)] = &[
    ("map_lookup_elem", BPF_FUNC_MAP_LOOKUP_ELEM),
    ("map_update_elem", BPF_FUNC_MAP_UPDATE_ELEM),
    ("map_delete_elem", BPF_FUNC_MAP_DELETE_ELEM),
    ("probe_read", BPF_FUNC_PROBE_READ),
    ("ktime_get_ns", BPF_FUNC_KTIME_GET_NS),
    ("trace_printk", BPF_FUNC_TRACE_PRINTK),
    ("get_prandom_u32", BPF_FUNC_GET_PRANDOM_U32),
    ("get_smp_processor_id", BPF_FUNC_GET_SMP_PROCESSOR_ID),
    ("get_current_pid_tgid", BPF_FUNC_GET_CURRENT_PID_TGID),
    ("get_current_uid_gid", BPF_FUNC_GET_CURRENT_UID_GID),
    ("get_current_comm", BPF_FUNC_GET_CURRENT_COMM),
    ("perf_event_output", BPF_FUNC_PERF_EVENT_OUTPUT),
    ("probe_read_str", BPF_FUNC_PROBE_READ_STR),
    ("map_get_next_key", BPF_FUNC_MAP_GET_NEXT_KEY),
    ("sprintf", BPF_FUNC_SPRINTF),
    ("stapbpf_stat_get", BPF_FUNC_STAPBPF_STAT_GET),
    ("gettimeofday_ns", BPF_FUNC_GETTIMEOFDAY_NS),
    ("get_target", BPF_FUNC_GET_TARGET),
    ("set_procfs_value", BPF_FUNC_SET_PROCFS_VALUE),
    ("append_procfs_value", BPF_FUNC_APPEND_PROCFS_VALUE),
    ("get_procfs_value", BPF_FUNC_GET_PROCFS_VALUE),
    ("str_concat", BPF_FUNC_STR_CONCAT),
    ("text_str", BPF_FUNC_TEXT_STR),
    ("string_quoted", BPF_FUNC_STRING_QUOTED),
];

/// Look up a helper id by its source-level name.
pub fn helper_by_name(name: &str) -> Option<HelperId> {
    HELPER_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, id)| id)
}

/// Whether the helper is legal for the given target variant.
///
/// Pseudo helpers exist only in the userspace interpreter, except for
/// map_get_next_key which the interpreter also back-fills for kernel
/// programs via the loader.
pub fn helper_allowed(id: HelperId, target: Target) -> bool {
    if id >= 0 {
        return true;
    }
    match target {
        Target::UserBpfInterp => true,
        Target::KernelBpf => id == BPF_FUNC_MAP_GET_NEXT_KEY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_by_name() {
        assert_eq!(helper_by_name("map_lookup_elem"), Some(1));
        assert_eq!(helper_by_name("sprintf"), Some(BPF_FUNC_SPRINTF));
        assert_eq!(helper_by_name("no_such_helper"), None);
    }

    #[test]
    fn test_pseudo_helpers_gated_by_target() {
        assert!(helper_allowed(BPF_FUNC_SPRINTF, Target::UserBpfInterp));
        assert!(!helper_allowed(BPF_FUNC_SPRINTF, Target::KernelBpf));
        assert!(helper_allowed(BPF_FUNC_MAP_GET_NEXT_KEY, Target::KernelBpf));
        assert!(helper_allowed(BPF_FUNC_PERF_EVENT_OUTPUT, Target::KernelBpf));
    }
}
