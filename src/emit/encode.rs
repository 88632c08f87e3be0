// Instruction encoding runs in two passes over a finished CFG. Pass one lays the
// blocks out in creation order, assigns each instruction its linear slot index (wide
// loads take two slots) and decides where unconditional jumps must be synthesized:
// lowering records plain jumps as fallthrough edges without a JA instruction, so any
// block whose resolved fallthrough target is not the linearly next block gets a
// trailing JA slot. Pass two resolves branch offsets against the assigned ids,
// chasing empty forwarder blocks, and fills the fixed 8-byte records. Map-reference
// loads are emitted with a zero immediate and reported back as relocation requests;
// the loader patches in the file descriptor. Register operands that are still
// temporaries are folded deterministically into the callee-saved range, which keeps
// the encoding structurally valid until the external register allocator has renamed
// them.

//! Instruction layout, branch resolution, and byte encoding.

use hashbrown::HashMap;

use crate::core::{TranslateError, TranslateResult};
use crate::globals::Globals;
use crate::ir::{
    bpf_class, bpf_op, BlockId, Insn, InsnId, Program, ValueData, ValueId, BPF_ALU64, BPF_DW,
    BPF_IMM, BPF_LD, BPF_MOV, MAX_BPF_REG,
};
use crate::ir::{BPF_JA, BPF_JMP};

/// Size in bytes of one encoded instruction slot.
pub const BPF_INSN_SIZE: usize = 8;

/// A relocation request recorded against a map-reference load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapReloc {
    /// Slot index of the first half of the wide load.
    pub slot: u32,
    /// Map id the loader resolves to a file descriptor.
    pub map_id: usize,
}

/// One encoded program body plus its relocation requests.
#[derive(Debug, Default)]
pub struct EncodedProgram {
    pub bytes: Vec<u8>,
    pub relocs: Vec<MapReloc>,
}

fn malformed(reason: impl Into<String>) -> TranslateError {
    TranslateError::CodeGen {
        reason: reason.into(),
    }
}

/// Encoded register number of an operand.
///
/// Temporaries reach this point whenever the external register allocator has
/// not rewritten the CFG; they are folded into the callee-saved range so the
/// pre-allocation object stays well formed and deterministic.
fn reg_field(prog: &Program<'_, '_>, v: ValueId) -> TranslateResult<u8> {
    match prog.value(v) {
        ValueData::HardReg(r) => Ok(*r),
        ValueData::TmpReg(n) => Ok((6 + (n - MAX_BPF_REG) % 4) as u8),
        other => Err(malformed(format!("operand {other} in register position"))),
    }
}

fn imm_operand(prog: &Program<'_, '_>, v: ValueId) -> TranslateResult<i64> {
    match prog.value(v) {
        ValueData::Imm(i) => Ok(*i),
        other => Err(malformed(format!("operand {other} in immediate position"))),
    }
}

/// A register move whose source is a pooled string constant. Encoded as a
/// wide load of the string's interned-table index; the userspace interpreter
/// dereferences the index at run time.
fn is_str_mov(prog: &Program<'_, '_>, insn: &Insn) -> bool {
    if bpf_class(insn.code) != BPF_ALU64 || bpf_op(insn.code) != BPF_MOV {
        return false;
    }
    matches!(
        insn.src1.map(|s| prog.value(s)),
        Some(ValueData::Str { .. })
    )
}

fn insn_slots(prog: &Program<'_, '_>, i: InsnId) -> u32 {
    let insn = prog.insn(i);
    if insn.is_wide() || is_str_mov(prog, insn) {
        2
    } else {
        1
    }
}

struct Layout {
    /// Non-empty blocks in emission order.
    order: Vec<BlockId>,
    /// Slot of the jump synthesized after a block whose fallthrough target is
    /// not linearly next.
    trailing_ja: HashMap<BlockId, u32>,
    nslots: u32,
}

/// Pass one: assign linear slot ids and place synthesized jumps.
fn assign_ids(prog: &mut Program<'_, '_>) -> TranslateResult<Layout> {
    let order: Vec<BlockId> = prog
        .block_ids()
        .filter(|&b| !prog.block(b).is_empty())
        .collect();

    let mut trailing_ja = HashMap::new();
    let mut n: u32 = 0;
    for (pos, &b) in order.iter().enumerate() {
        let insns: Vec<InsnId> = prog.block_insns(b).collect();
        for &i in &insns {
            let slots = insn_slots(prog, i);
            prog.insn_mut(i).id = n;
            n += slots;
        }

        let last = match prog.block(b).last {
            Some(l) => l,
            None => continue,
        };
        let li = prog.insn(last);
        if li.is_exit() || (li.is_jmp() && !li.is_jcond()) {
            continue;
        }
        match prog.fallthru_target(b) {
            Some(t) => {
                let t = prog.resolve_forwarder(t);
                if order.get(pos + 1) != Some(&t) {
                    trailing_ja.insert(b, n);
                    n += 1;
                }
            }
            None => {
                if pos + 1 != order.len() {
                    return Err(malformed("block falls through without a successor"));
                }
            }
        }
    }
    Ok(Layout {
        order,
        trailing_ja,
        nslots: n,
    })
}

/// Branch displacement from the slot at `from_slot` to the first instruction
/// of `target`, chasing empty forwarder blocks.
fn branch_off(prog: &Program<'_, '_>, target: BlockId, from_slot: u32) -> TranslateResult<i16> {
    let t = prog.resolve_forwarder(target);
    let first = prog
        .block(t)
        .first
        .ok_or_else(|| malformed("branch to a block with no instructions"))?;
    let delta = i64::from(prog.insn(first).id) - (i64::from(from_slot) + 1);
    i16::try_from(delta).map_err(|_| malformed(format!("branch offset {delta} out of range")))
}

fn push_slot(out: &mut Vec<u8>, code: u8, dst: u8, src: u8, off: i16, imm: i32) {
    out.push(code);
    out.push((dst & 0x0f) | (src << 4));
    out.extend_from_slice(&off.to_le_bytes());
    out.extend_from_slice(&imm.to_le_bytes());
}

/// Encode one program into 8-byte instruction records.
///
/// Mutates the program only to record the assigned linear ids; interns any
/// string constants still flowing as move operands.
pub fn encode_program(
    prog: &mut Program<'_, '_>,
    glob: &mut Globals,
) -> TranslateResult<EncodedProgram> {
    let layout = assign_ids(prog)?;
    let mut out = Vec::with_capacity(layout.nslots as usize * BPF_INSN_SIZE);
    let mut relocs = Vec::new();

    for &b in &layout.order {
        let insns: Vec<InsnId> = prog.block_insns(b).collect();
        for i in insns {
            let insn = prog.insn(i).clone();
            let code = (insn.code & 0xff) as u8;

            if insn.is_map_load() {
                let src1 = insn.src1.ok_or_else(|| malformed("map load without map id"))?;
                let map_id = imm_operand(prog, src1)?;
                let dest = insn.dest.ok_or_else(|| malformed("map load without dest"))?;
                relocs.push(MapReloc {
                    slot: insn.id,
                    map_id: map_id as usize,
                });
                // The immediate is left zero for the loader to patch.
                push_slot(&mut out, code, reg_field(prog, dest)?, (insn.code >> 8) as u8, 0, 0);
                push_slot(&mut out, 0, 0, 0, 0, 0);
                continue;
            }
            if insn.is_wide() {
                let src1 = insn.src1.ok_or_else(|| malformed("wide load without operand"))?;
                let dest = insn.dest.ok_or_else(|| malformed("wide load without dest"))?;
                let imm = imm_operand(prog, src1)?;
                push_slot(&mut out, code, reg_field(prog, dest)?, 0, 0, imm as i32);
                push_slot(&mut out, 0, 0, 0, 0, (imm >> 32) as i32);
                continue;
            }
            if is_str_mov(prog, &insn) {
                let src1 = insn.src1.ok_or_else(|| malformed("move without operand"))?;
                let dest = insn.dest.ok_or_else(|| malformed("move without dest"))?;
                let data = prog.value(src1).str_data();
                let idx = glob.intern_string(data) as i32;
                push_slot(
                    &mut out,
                    (BPF_LD | BPF_IMM | BPF_DW) as u8,
                    reg_field(prog, dest)?,
                    0,
                    0,
                    idx,
                );
                push_slot(&mut out, 0, 0, 0, 0, 0);
                continue;
            }
            if insn.is_call() {
                let src1 = insn.src1.ok_or_else(|| malformed("call without helper id"))?;
                let id = imm_operand(prog, src1)?;
                push_slot(&mut out, code, 0, 0, 0, id as i32);
                continue;
            }
            if insn.is_exit() {
                push_slot(&mut out, code, 0, 0, 0, 0);
                continue;
            }
            if insn.is_jmp() && !insn.is_jcond() {
                let target = prog
                    .taken_target(insn.block)
                    .ok_or_else(|| malformed("jump without a target"))?;
                let off = branch_off(prog, target, insn.id)?;
                push_slot(&mut out, code, 0, 0, off, 0);
                continue;
            }
            if insn.is_jcond() {
                let s0 = insn.src0.ok_or_else(|| malformed("branch without operand"))?;
                let s1 = insn.src1.ok_or_else(|| malformed("branch without operand"))?;
                let target = prog
                    .taken_target(insn.block)
                    .ok_or_else(|| malformed("branch without a taken target"))?;
                let off = branch_off(prog, target, insn.id)?;
                let dst = reg_field(prog, s0)?;
                match prog.value(s1) {
                    ValueData::Imm(imm) => push_slot(&mut out, code, dst, 0, off, *imm as i32),
                    _ => push_slot(&mut out, code, dst, reg_field(prog, s1)?, off, 0),
                }
                continue;
            }

            // Memory and ALU forms: destination register from dest, or from
            // src0 when the factory recorded no separate destination.
            let dst_v = insn
                .dest
                .or(insn.src0)
                .ok_or_else(|| malformed("instruction without a register operand"))?;
            let dst = reg_field(prog, dst_v)?;
            match insn.src1 {
                None => push_slot(&mut out, code, dst, 0, insn.off, 0),
                Some(s1) => match prog.value(s1) {
                    ValueData::Imm(imm) => push_slot(&mut out, code, dst, 0, insn.off, *imm as i32),
                    _ => push_slot(&mut out, code, dst, reg_field(prog, s1)?, insn.off, 0),
                },
            }
        }

        if let Some(&slot) = layout.trailing_ja.get(&b) {
            let target = prog
                .fallthru_target(b)
                .ok_or_else(|| malformed("synthesized jump without a target"))?;
            let off = branch_off(prog, target, slot)?;
            push_slot(&mut out, (BPF_JMP | BPF_JA) as u8, 0, 0, off, 0);
        }
    }

    debug_assert_eq!(out.len(), layout.nslots as usize * BPF_INSN_SIZE);
    Ok(EncodedProgram { bytes: out, relocs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TranslationSession;
    use crate::ir::{helpers, Condition, Cursor, Target, BPF_ADD, BPF_LD_MAP, BPF_REG_1};
    use bumpalo::Bump;

    fn decode(bytes: &[u8]) -> Vec<(u8, u8, u8, i16, i32)> {
        bytes
            .chunks(BPF_INSN_SIZE)
            .map(|c| {
                (
                    c[0],
                    c[1] & 0x0f,
                    c[1] >> 4,
                    i16::from_le_bytes([c[2], c[3]]),
                    i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect()
    }

    #[test]
    fn test_linear_ids_count_wide_slots() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::UserBpfInterp);
        let mut glob = Globals::new();
        let b = p.new_block();
        let r1 = p.lookup_reg(BPF_REG_1);

        let small = p.new_imm(7);
        let big = p.new_imm(1 << 40);
        p.mk_mov(Cursor::AppendTo(b), r1, small);
        p.mk_mov(Cursor::AppendTo(b), r1, big);
        p.mk_mov(Cursor::AppendTo(b), r1, small);
        p.mk_exit(Cursor::AppendTo(b));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        assert_eq!(enc.bytes.len(), 5 * BPF_INSN_SIZE);

        let ids: Vec<u32> = p.block_insns(b).map(|i| p.insn(i).id).collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);

        // The wide load carries the high half in its second slot.
        let slots = decode(&enc.bytes);
        assert_eq!(slots[1].4, 0);
        assert_eq!(slots[2].4, 1 << (40 - 32));
    }

    #[test]
    fn test_branch_offsets_chase_forwarders() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::UserBpfInterp);
        let mut glob = Globals::new();

        let entry = p.new_block();
        let cont = p.new_block();
        let fwd = p.new_block();
        let real = p.new_block();

        let r1 = p.lookup_reg(BPF_REG_1);
        let zero = p.new_imm(0);
        // entry: if r1 == 0 goto fwd -> real; else cont.
        p.mk_jcond(Cursor::AppendTo(entry), Condition::Eq, r1, zero, fwd, cont);
        p.set_taken(fwd, real);

        let one = p.new_imm(1);
        p.mk_mov(Cursor::AppendTo(cont), r1, one);
        p.set_fallthru(cont, real);
        p.mk_mov(Cursor::AppendTo(real), r1, zero);
        p.mk_exit(Cursor::AppendTo(real));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        let slots = decode(&enc.bytes);
        // Slot 0 is the branch; the forwarder resolves to `real` at slot 2.
        assert_eq!(slots[0].3, 1);
        assert_eq!(enc.bytes.len(), 4 * BPF_INSN_SIZE);
    }

    #[test]
    fn test_trailing_jump_synthesized_for_nonlinear_fallthrough() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::UserBpfInterp);
        let mut glob = Globals::new();

        let a = p.new_block();
        let skipped = p.new_block();
        let tail = p.new_block();

        let r1 = p.lookup_reg(BPF_REG_1);
        let zero = p.new_imm(0);
        let one = p.new_imm(1);
        let two = p.new_imm(2);

        p.mk_mov(Cursor::AppendTo(a), r1, zero);
        p.set_fallthru(a, tail);
        // `skipped` sits between a and its target, so a needs a real jump.
        p.mk_mov(Cursor::AppendTo(skipped), r1, one);
        p.set_fallthru(skipped, tail);
        p.mk_mov(Cursor::AppendTo(tail), r1, two);
        p.mk_exit(Cursor::AppendTo(tail));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        let slots = decode(&enc.bytes);
        assert_eq!(enc.bytes.len(), 5 * BPF_INSN_SIZE);
        // Slot 1 is the synthesized JA over `skipped`.
        assert_eq!(slots[1].0, (BPF_JMP | BPF_JA) as u8);
        assert_eq!(slots[1].3, 1);
        // `skipped` falls through to the linearly next block; no extra jump.
        assert_eq!(slots[3].0, (BPF_ALU64 | BPF_MOV) as u8);
    }

    #[test]
    fn test_map_load_becomes_relocation() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::KernelBpf);
        let mut glob = Globals::new();
        let b = p.new_block();

        let r1 = p.lookup_reg(BPF_REG_1);
        p.load_map(Cursor::AppendTo(b), r1, 1);
        p.mk_call(Cursor::AppendTo(b), helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);
        p.mk_exit(Cursor::AppendTo(b));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        assert_eq!(enc.relocs, vec![MapReloc { slot: 0, map_id: 1 }]);

        let slots = decode(&enc.bytes);
        assert_eq!(slots[0].0, (BPF_LD_MAP & 0xff) as u8);
        assert_eq!(slots[0].1, 1); // dst r1
        assert_eq!(slots[0].2, 1); // pseudo map-fd source
        assert_eq!(slots[0].4, 0); // fd patched by the loader
        assert_eq!(slots[2].0, 0x85);
        assert_eq!(slots[2].4, helpers::BPF_FUNC_MAP_LOOKUP_ELEM as i32);
    }

    #[test]
    fn test_string_move_encodes_interned_index() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::UserBpfInterp);
        let mut glob = Globals::new();
        let b = p.new_block();

        let r1 = p.lookup_reg(BPF_REG_1);
        let s = p.new_format_str("%ld\n");
        p.mk_mov(Cursor::AppendTo(b), r1, s);
        p.mk_exit(Cursor::AppendTo(b));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        let slots = decode(&enc.bytes);
        assert_eq!(enc.bytes.len(), 3 * BPF_INSN_SIZE);
        assert_eq!(slots[0].0, (BPF_LD | BPF_IMM | BPF_DW) as u8);
        assert_eq!(slots[0].4, 0);
        assert_eq!(glob.interned_strings, vec!["%ld\n".to_string()]);
    }

    #[test]
    fn test_alu_and_memory_operands() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::UserBpfInterp);
        let mut glob = Globals::new();
        let b = p.new_block();

        let r1 = p.lookup_reg(BPF_REG_1);
        let r2 = p.lookup_reg(2);
        let four = p.new_imm(4);
        p.mk_binary(Cursor::AppendTo(b), BPF_ADD, r1, r1, four);
        p.mk_binary(Cursor::AppendTo(b), BPF_ADD, r1, r1, r2);
        p.mk_ld(Cursor::AppendTo(b), BPF_DW, r1, r2, -8);
        p.mk_st(Cursor::AppendTo(b), BPF_DW, r2, -16, r1);
        p.mk_exit(Cursor::AppendTo(b));

        let enc = encode_program(&mut p, &mut glob).unwrap();
        let slots = decode(&enc.bytes);
        assert_eq!(slots[0], (0x07, 1, 0, 0, 4));
        assert_eq!(slots[1], (0x0f, 1, 2, 0, 0));
        assert_eq!(slots[2], (0x79, 1, 2, -8, 0));
        assert_eq!(slots[3], (0x7b, 2, 1, -16, 0));
    }
}
