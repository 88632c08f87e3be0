// This module defines bpfgen's virtual instruction set and CFG model: the extended
// BPF-style opcode encoding (class/size/mode/source bits and the ALU/JMP operation
// tables), the two target variants with their stack budgets, the resource ceilings
// enforced at generation time (string/format/key lengths, printf argument counts,
// default map capacity), and the helper-function id space shared with the kernel and
// with the companion userspace interpreter (negative ids select interpreter-only
// pseudo helpers). Submodules hold the value pool, the instruction and block arenas,
// and the Program builder that every lowering routine emits into. Blocks, edges,
// instructions, and values are addressed by dense u32 handles into vectors owned by
// the Program, so graph surgery is index rewriting instead of pointer juggling.

//! Virtual instruction set and control-flow graph model.
//!
//! - [`value`]: pooled operand values (immediates, strings, registers)
//! - [`insn`]: instructions and condition kinds
//! - [`block`]: basic blocks and edges
//! - [`program`]: the Program builder and emission cursors

pub mod block;
pub mod helpers;
pub mod insn;
pub mod program;
pub mod value;

pub use block::{Block, BlockId, Edge, EdgeId};
pub use insn::{Condition, Insn, InsnId};
pub use program::{Cursor, Program};
pub use value::{ValueData, ValueId};

// Instruction classes.
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_ALU64: u16 = 0x07;

// Size modifiers for loads and stores.
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;
pub const BPF_DW: u16 = 0x18;

// Mode modifiers.
pub const BPF_IMM: u16 = 0x00;
pub const BPF_MEM: u16 = 0x60;

// Source operand selector.
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// ALU operations.
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;
pub const BPF_MOV: u16 = 0xb0;
pub const BPF_ARSH: u16 = 0xc0;

// JMP operations.
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_JNE: u16 = 0x50;
pub const BPF_JSGT: u16 = 0x60;
pub const BPF_JSGE: u16 = 0x70;
pub const BPF_CALL: u16 = 0x80;
pub const BPF_EXIT: u16 = 0x90;
pub const BPF_JLT: u16 = 0xa0;
pub const BPF_JLE: u16 = 0xb0;
pub const BPF_JSLT: u16 = 0xc0;
pub const BPF_JSLE: u16 = 0xd0;

/// Pseudo source register marking a wide immediate as a map reference.
pub const BPF_PSEUDO_MAP_FD: u16 = 1;

/// Wide load of a map reference; the emitter turns this into a relocation.
pub const BPF_LD_MAP: u16 = BPF_LD | BPF_IMM | BPF_DW | (BPF_PSEUDO_MAP_FD << 8);

#[inline]
pub fn bpf_class(code: u16) -> u16 {
    code & 0x07
}

#[inline]
pub fn bpf_size(code: u16) -> u16 {
    code & 0x18
}

#[inline]
pub fn bpf_op(code: u16) -> u16 {
    code & 0xf0
}

#[inline]
pub fn bpf_src(code: u16) -> u16 {
    code & 0x08
}

#[inline]
pub fn bpf_mode(code: u16) -> u16 {
    code & 0xe0
}

/// Number of ABI-fixed registers (R0 through R10).
pub const MAX_BPF_REG: u32 = 11;

/// Frame pointer register.
pub const BPF_REG_10: u8 = 10;
pub const BPF_REG_9: u8 = 9;
pub const BPF_REG_8: u8 = 8;
pub const BPF_REG_7: u8 = 7;
pub const BPF_REG_6: u8 = 6;
pub const BPF_REG_5: u8 = 5;
pub const BPF_REG_4: u8 = 4;
pub const BPF_REG_3: u8 = 3;
pub const BPF_REG_2: u8 = 2;
pub const BPF_REG_1: u8 = 1;
pub const BPF_REG_0: u8 = 0;

/// Width of one BPF register in bytes.
pub const BPF_REG_SIZE: u32 = 8;

// Generation-time resource ceilings. All are compile-time-checked hard
// errors, never runtime-recoverable.
pub const BPF_MAXSTRINGLEN: u32 = 64;
pub const BPF_MAXSTRINGLEN_PLUS: u32 = BPF_MAXSTRINGLEN + 1;
pub const BPF_MAXFORMATLEN: usize = 256;
pub const BPF_MAXPRINTFARGS: usize = 32;
pub const BPF_MAXSPRINTFARGS: usize = 3;
pub const BPF_MAXKEYLEN: u32 = 512;
pub const BPF_MAXMAPENTRIES: u32 = 2048;

/// Flag value selecting the current CPU for perf_event_output.
pub const BPF_F_CURRENT_CPU: i64 = 0xffffffff;

/// Which execution environment a generated program targets.
///
/// The kernel target runs under the in-kernel verifier and forbids loop
/// constructs and interpreter-only helpers; the userspace target runs under
/// the companion bytecode interpreter with a much larger stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    KernelBpf,
    UserBpfInterp,
}

impl Target {
    /// Stack budget in bytes for temporary (by-reference) data.
    pub fn max_stack(self) -> u32 {
        match self {
            Target::KernelBpf => 512,
            Target::UserBpfInterp => 65536,
        }
    }

    /// Whether bounded source-level loops may be lowered for this target.
    pub fn allows_loops(self) -> bool {
        matches!(self, Target::UserBpfInterp)
    }
}
