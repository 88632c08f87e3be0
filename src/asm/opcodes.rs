// Mnemonic and operand-shape tables for the embedded assembler. Each opcode maps
// to one operand category that selects how the argument list is parsed; numeric
// opcodes get their category computed from the encoding bits, so hand-written hex
// and mnemonics accept the same argument forms. Register-or-immediate mnemonics
// resolve to the register variant; the parser downgrades to the immediate variant
// when the operand turns out to be a constant.

//! Opcode mnemonics and operand categories.

use crate::ir::{
    bpf_class, bpf_op, BPF_ADD, BPF_ALU, BPF_ALU64, BPF_AND, BPF_ARSH, BPF_B, BPF_CALL, BPF_DIV,
    BPF_DW, BPF_EXIT, BPF_H, BPF_IMM, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JLE, BPF_JLT,
    BPF_JMP, BPF_JNE, BPF_JSET, BPF_JSGE, BPF_JSGT, BPF_JSLE, BPF_JSLT, BPF_LD, BPF_LDX,
    BPF_LD_MAP, BPF_LSH, BPF_MEM, BPF_MOD, BPF_MOV, BPF_MUL, BPF_NEG, BPF_OR, BPF_RSH, BPF_ST,
    BPF_STX, BPF_SUB, BPF_W, BPF_X, BPF_XOR,
};

/// Operand shape of an opcode, driving argument-list parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    /// op dest, [src+off] / op dest, src, off
    MemSrcOff,
    /// op [dest+off], imm / op dest, off, imm
    MemDstOffImm,
    /// op [dest+off], src / op dest, off, src
    MemDstOff,
    /// op dest, imm (wide loads)
    MemImm,
    /// op dest, src / op dest, imm
    Alu,
    /// op dest
    AluUnary,
    /// op dest, src_or_imm, jmp_target
    Branch,
    /// op jmp_target
    Jump,
    /// op imm
    Call,
    /// op
    Exit,
    Unknown,
}

impl OpCategory {
    /// Human-readable operand expectation for diagnostics.
    pub fn expected_args(self) -> &'static str {
        match self {
            OpCategory::MemSrcOff => "dest, [src+off]",
            OpCategory::MemDstOffImm => "[dest+off], imm",
            OpCategory::MemDstOff => "[dest+off], src",
            OpCategory::MemImm => "dest, imm",
            OpCategory::Alu => "dest, src|imm",
            OpCategory::AluUnary => "dest",
            OpCategory::Branch => "dest, src|imm, label",
            OpCategory::Jump => "label",
            OpCategory::Call => "imm",
            OpCategory::Exit => "no",
            OpCategory::Unknown => "unknown",
        }
    }
}

/// Mnemonic table. Register-or-immediate forms carry the X bit; see
/// [`variant_imm`].
const MNEMONICS: &[(&str, u16)] = &[
    ("add", BPF_ALU64 | BPF_ADD | BPF_X),
    ("sub", BPF_ALU64 | BPF_SUB | BPF_X),
    ("mul", BPF_ALU64 | BPF_MUL | BPF_X),
    ("div", BPF_ALU64 | BPF_DIV | BPF_X),
    ("or", BPF_ALU64 | BPF_OR | BPF_X),
    ("and", BPF_ALU64 | BPF_AND | BPF_X),
    ("lsh", BPF_ALU64 | BPF_LSH | BPF_X),
    ("rsh", BPF_ALU64 | BPF_RSH | BPF_X),
    ("mod", BPF_ALU64 | BPF_MOD | BPF_X),
    ("xor", BPF_ALU64 | BPF_XOR | BPF_X),
    ("mov", BPF_ALU64 | BPF_MOV | BPF_X),
    ("arsh", BPF_ALU64 | BPF_ARSH | BPF_X),
    ("neg", BPF_ALU64 | BPF_NEG),
    ("add32", BPF_ALU | BPF_ADD | BPF_X),
    ("sub32", BPF_ALU | BPF_SUB | BPF_X),
    ("mov32", BPF_ALU | BPF_MOV | BPF_X),
    ("ldxb", BPF_LDX | BPF_B | BPF_MEM),
    ("ldxh", BPF_LDX | BPF_H | BPF_MEM),
    ("ldxw", BPF_LDX | BPF_W | BPF_MEM),
    ("ldxdw", BPF_LDX | BPF_DW | BPF_MEM),
    ("stb", BPF_ST | BPF_B | BPF_MEM),
    ("sth", BPF_ST | BPF_H | BPF_MEM),
    ("stw", BPF_ST | BPF_W | BPF_MEM),
    ("stdw", BPF_ST | BPF_DW | BPF_MEM),
    ("stxb", BPF_STX | BPF_B | BPF_MEM),
    ("stxh", BPF_STX | BPF_H | BPF_MEM),
    ("stxw", BPF_STX | BPF_W | BPF_MEM),
    ("stxdw", BPF_STX | BPF_DW | BPF_MEM),
    ("lddw", BPF_LD | BPF_IMM | BPF_DW),
    ("ld_map", BPF_LD_MAP),
    ("ja", BPF_JMP | BPF_JA),
    ("jeq", BPF_JMP | BPF_JEQ | BPF_X),
    ("jne", BPF_JMP | BPF_JNE | BPF_X),
    ("jgt", BPF_JMP | BPF_JGT | BPF_X),
    ("jge", BPF_JMP | BPF_JGE | BPF_X),
    ("jlt", BPF_JMP | BPF_JLT | BPF_X),
    ("jle", BPF_JMP | BPF_JLE | BPF_X),
    ("jsgt", BPF_JMP | BPF_JSGT | BPF_X),
    ("jsge", BPF_JMP | BPF_JSGE | BPF_X),
    ("jslt", BPF_JMP | BPF_JSLT | BPF_X),
    ("jsle", BPF_JMP | BPF_JSLE | BPF_X),
    ("jset", BPF_JMP | BPF_JSET | BPF_X),
    ("call", BPF_JMP | BPF_CALL),
    ("exit", BPF_JMP | BPF_EXIT),
];

/// Look up an opcode by mnemonic.
pub fn opcode_by_name(name: &str) -> Option<u16> {
    MNEMONICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, code)| code)
}

/// The immediate-operand variant of a register-or-immediate opcode.
pub fn variant_imm(code: u16) -> u16 {
    match bpf_class(code) {
        BPF_ALU | BPF_ALU64 | BPF_JMP => code & !BPF_X,
        _ => code,
    }
}

/// Operand category of an opcode, mnemonic-sourced or numeric.
pub fn opcode_category(code: u16) -> OpCategory {
    match bpf_class(code) {
        BPF_LDX => OpCategory::MemSrcOff,
        BPF_ST => OpCategory::MemDstOffImm,
        BPF_STX => OpCategory::MemDstOff,
        BPF_ALU | BPF_ALU64 => match bpf_op(code) {
            BPF_NEG => OpCategory::AluUnary,
            _ => OpCategory::Alu,
        },
        BPF_JMP => match bpf_op(code) {
            BPF_JA => OpCategory::Jump,
            BPF_CALL => OpCategory::Call,
            BPF_EXIT => OpCategory::Exit,
            _ => OpCategory::Branch,
        },
        _ if code == BPF_LD_MAP || code == (BPF_LD | BPF_IMM | BPF_DW) => OpCategory::MemImm,
        _ => OpCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_lookup() {
        assert_eq!(opcode_by_name("mov"), Some(BPF_ALU64 | BPF_MOV | BPF_X));
        assert_eq!(opcode_by_name("ldxdw"), Some(BPF_LDX | BPF_DW | BPF_MEM));
        assert_eq!(opcode_by_name("frobnicate"), None);
    }

    #[test]
    fn test_variant_imm_strips_source_bit() {
        let mov_x = opcode_by_name("mov").unwrap();
        assert_eq!(variant_imm(mov_x), BPF_ALU64 | BPF_MOV);
        let jeq_x = opcode_by_name("jeq").unwrap();
        assert_eq!(variant_imm(jeq_x), BPF_JMP | BPF_JEQ);
        // Memory opcodes have no immediate variant to downgrade to.
        let stx = opcode_by_name("stxdw").unwrap();
        assert_eq!(variant_imm(stx), stx);
    }

    #[test]
    fn test_categories_from_encoding() {
        assert_eq!(opcode_category(0x85), OpCategory::Call);
        assert_eq!(opcode_category(0x95), OpCategory::Exit);
        assert_eq!(opcode_category(0x05), OpCategory::Jump);
        assert_eq!(
            opcode_category(opcode_by_name("jne").unwrap()),
            OpCategory::Branch
        );
        assert_eq!(
            opcode_category(opcode_by_name("stw").unwrap()),
            OpCategory::MemDstOffImm
        );
        assert_eq!(opcode_category(BPF_LD_MAP), OpCategory::MemImm);
    }
}
