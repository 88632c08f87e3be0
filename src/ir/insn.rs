// Instructions are fixed records in the Program's instruction arena, doubly linked by
// handle within their owning block. An instruction carries its opcode, a linear id
// assigned by the emitter pass for branch-offset math, a 16-bit signed memory/branch
// offset, and up to three operands: dest, src0 (the pre-allocation source a
// two-address destination was copied from) and src1 (the register-or-immediate
// operand). Condition enumerates the eleven comparison kinds of conditional jumps,
// including the bit-test kind that maps to JSET without a materialized ALU result.

//! Instructions and condition kinds.

use super::{
    bpf_class, bpf_op, BlockId, ValueId, BPF_CALL, BPF_DW, BPF_EXIT, BPF_IMM, BPF_JA, BPF_JEQ,
    BPF_JGE, BPF_JGT, BPF_JLE, BPF_JLT, BPF_JMP, BPF_JNE, BPF_JSET, BPF_JSGE, BPF_JSGT, BPF_JSLE,
    BPF_JSLT, BPF_LD, BPF_LD_MAP,
};

/// Handle of an instruction within its Program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnId(pub(crate) u32);

impl InsnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The eleven conditional-jump comparison kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Ltu,
    Leu,
    Gtu,
    Geu,
    /// Bit test: branch taken if (s0 & s1) != 0. Maps to JSET directly,
    /// with no ALU instruction materializing the mask result.
    Test,
}

impl Condition {
    /// JMP-class operation bits for this condition.
    pub fn jmp_op(self) -> u16 {
        match self {
            Condition::Eq => BPF_JEQ,
            Condition::Ne => BPF_JNE,
            Condition::Lt => BPF_JSLT,
            Condition::Le => BPF_JSLE,
            Condition::Gt => BPF_JSGT,
            Condition::Ge => BPF_JSGE,
            Condition::Ltu => BPF_JLT,
            Condition::Leu => BPF_JLE,
            Condition::Gtu => BPF_JGT,
            Condition::Geu => BPF_JGE,
            Condition::Test => BPF_JSET,
        }
    }

    /// The condition testing the opposite outcome on the same operands.
    pub fn negate(self) -> Self {
        match self {
            Condition::Eq => Condition::Ne,
            Condition::Ne => Condition::Eq,
            Condition::Lt => Condition::Ge,
            Condition::Le => Condition::Gt,
            Condition::Gt => Condition::Le,
            Condition::Ge => Condition::Lt,
            Condition::Ltu => Condition::Geu,
            Condition::Leu => Condition::Gtu,
            Condition::Gtu => Condition::Leu,
            Condition::Geu => Condition::Ltu,
            // JSET has no single-instruction negation; callers swap targets.
            Condition::Test => Condition::Test,
        }
    }
}

/// One virtual instruction.
#[derive(Debug, Clone)]
pub struct Insn {
    /// Opcode, including the pseudo-source byte for map loads.
    pub code: u16,
    /// Linear instruction index, assigned by the emitter's counting pass.
    pub id: u32,
    /// Signed memory or branch offset.
    pub off: i16,
    /// Destination operand.
    pub dest: Option<ValueId>,
    /// Pre-allocation source (the value dest was copied from).
    pub src0: Option<ValueId>,
    /// Register-or-immediate source operand.
    pub src1: Option<ValueId>,
    /// Declared argument count for call instructions.
    pub nargs: u8,
    /// Owning block.
    pub block: BlockId,
    /// Previous instruction in the block.
    pub prev: Option<InsnId>,
    /// Next instruction in the block.
    pub next: Option<InsnId>,
}

impl Insn {
    /// True for unconditional and conditional jumps (not calls or exits).
    pub fn is_jmp(&self) -> bool {
        if bpf_class(self.code) != BPF_JMP {
            return false;
        }
        let op = bpf_op(self.code);
        op != BPF_CALL && op != BPF_EXIT
    }

    /// True for conditional jumps only.
    pub fn is_jcond(&self) -> bool {
        self.is_jmp() && bpf_op(self.code) != BPF_JA
    }

    pub fn is_call(&self) -> bool {
        bpf_class(self.code) == BPF_JMP && bpf_op(self.code) == BPF_CALL
    }

    pub fn is_exit(&self) -> bool {
        bpf_class(self.code) == BPF_JMP && bpf_op(self.code) == BPF_EXIT
    }

    /// Wide instructions occupy two physical slots.
    pub fn is_wide(&self) -> bool {
        (self.code & 0xff) == (BPF_LD | BPF_IMM | BPF_DW)
    }

    /// Map-reference load; becomes a relocation in the emitted object.
    pub fn is_map_load(&self) -> bool {
        self.code == BPF_LD_MAP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BPF_ALU64, BPF_MOV, BPF_X};

    fn insn(code: u16) -> Insn {
        Insn {
            code,
            id: 0,
            off: 0,
            dest: None,
            src0: None,
            src1: None,
            nargs: 0,
            block: BlockId(0),
            prev: None,
            next: None,
        }
    }

    #[test]
    fn test_predicates() {
        assert!(insn(BPF_JMP | BPF_JA).is_jmp());
        assert!(insn(BPF_JMP | BPF_JEQ | BPF_X).is_jcond());
        assert!(!insn(BPF_JMP | BPF_CALL).is_jmp());
        assert!(insn(BPF_JMP | BPF_CALL).is_call());
        assert!(insn(BPF_JMP | BPF_EXIT).is_exit());
        assert!(!insn(BPF_ALU64 | BPF_MOV | BPF_X).is_jmp());
        assert!(insn(BPF_LD_MAP).is_wide());
        assert!(insn(BPF_LD_MAP).is_map_load());
        assert!(insn(BPF_LD | BPF_IMM | BPF_DW).is_wide());
        assert!(!insn(BPF_LD | BPF_IMM | BPF_DW).is_map_load());
    }

    #[test]
    fn test_condition_negation() {
        assert_eq!(Condition::Lt.negate(), Condition::Ge);
        assert_eq!(Condition::Geu.negate(), Condition::Ltu);
        assert_eq!(Condition::Eq.negate(), Condition::Ne);
    }

    #[test]
    fn test_condition_opcodes() {
        assert_eq!(Condition::Test.jmp_op(), BPF_JSET);
        assert_eq!(Condition::Ltu.jmp_op(), BPF_JLT);
        assert_eq!(Condition::Lt.jmp_op(), BPF_JSLT);
    }
}
