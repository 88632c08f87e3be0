// The Program builder owns every arena of the CFG: blocks, edges, instructions, and
// the pooled value table, all addressed by u32 handles. Higher layers emit through an
// explicit Cursor (append to a block's end, or insert before a fixed instruction) so
// no ambient "current position" state exists; the cursor is a small Copy value passed
// into each mk_* helper. Edge surgery is centralized here so the incoming-edge
// invariant holds at every return: a block's prevs vector contains exactly the edges
// whose target it is. The builder also tracks the running maximum of temporary stack
// bytes handed out to by-reference helper calls; exceeding the target variant's stack
// budget is an unrecoverable programming error and fails fast.

//! Program builder: CFG arenas, value pooling, and instruction factories.

use hashbrown::HashMap;

use crate::core::TranslationSession;

use super::helpers::HelperId;
use super::{
    Block, BlockId, Condition, Edge, EdgeId, Insn, InsnId, Target, ValueData, ValueId, BPF_ALU64,
    BPF_DW, BPF_EXIT, BPF_IMM, BPF_JA, BPF_JMP, BPF_K, BPF_LD, BPF_LDX, BPF_LD_MAP, BPF_MEM,
    BPF_MOV, BPF_ST, BPF_STX, BPF_X, MAX_BPF_REG,
};

/// Emission position: either appending at a block's end or repeatedly
/// inserting just before a fixed instruction (so consecutive inserts keep
/// their order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Before(InsnId),
    AppendTo(BlockId),
}

impl Cursor {
    /// The block this cursor emits into.
    pub fn block(self, prog: &Program) -> BlockId {
        match self {
            Cursor::Before(i) => prog.insn(i).block,
            Cursor::AppendTo(b) => b,
        }
    }
}

/// One translation unit's worth of CFG under construction.
///
/// The session borrow `'s` is independent of the arena lifetime `'a`, so a
/// Program can be built and dropped while the session lives on the stack.
pub struct Program<'s, 'a> {
    session: &'s TranslationSession<'a>,
    target: Target,

    blocks: Vec<Block>,
    edges: Vec<Edge>,
    insns: Vec<Insn>,
    values: Vec<ValueData<'a>>,

    hardregs: [ValueId; MAX_BPF_REG as usize],
    uninit: ValueId,
    imm_map: HashMap<i64, ValueId>,
    str_map: HashMap<(&'a str, bool), ValueId>,
    next_tmpreg: u32,

    /// The BPF local stack is [0, -budget] indexed off R10. The translator
    /// has dibs on the low bytes, [0, -max_tmp_space], for data passed by
    /// reference to helper calls; the register allocator may use the rest
    /// for spills.
    max_tmp_space: u32,
}

impl<'s, 'a> Program<'s, 'a> {
    pub fn new(session: &'s TranslationSession<'a>, target: Target) -> Self {
        let mut values = Vec::new();
        let mut hardregs = [ValueId(0); MAX_BPF_REG as usize];
        for (r, slot) in hardregs.iter_mut().enumerate() {
            *slot = ValueId(values.len() as u32);
            values.push(ValueData::HardReg(r as u8));
        }
        let uninit = ValueId(values.len() as u32);
        values.push(ValueData::Uninit);

        Self {
            session,
            target,
            blocks: Vec::new(),
            edges: Vec::new(),
            insns: Vec::new(),
            values,
            hardregs,
            uninit,
            imm_map: HashMap::new(),
            str_map: HashMap::new(),
            next_tmpreg: MAX_BPF_REG,
            max_tmp_space: 0,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn session(&self) -> &'s TranslationSession<'a> {
        self.session
    }

    // ---- arena accessors ----

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn insn(&self, id: InsnId) -> &Insn {
        &self.insns[id.index()]
    }

    pub fn insn_mut(&mut self, id: InsnId) -> &mut Insn {
        &mut self.insns[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &ValueData<'a> {
        &self.values[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_insns(&self) -> usize {
        self.insns.len()
    }

    /// Block handles in emission order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Instructions of one block, front to back.
    pub fn block_insns(&self, b: BlockId) -> BlockInsns<'_, 's, 'a> {
        BlockInsns {
            prog: self,
            cur: self.block(b).first,
        }
    }

    // ---- value pooling ----

    pub fn lookup_reg(&self, r: u8) -> ValueId {
        self.hardregs[r as usize]
    }

    pub fn new_uninit(&self) -> ValueId {
        self.uninit
    }

    pub fn new_reg(&mut self) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::TmpReg(self.next_tmpreg));
        self.next_tmpreg += 1;
        id
    }

    pub fn new_imm(&mut self, imm: i64) -> ValueId {
        if let Some(&id) = self.imm_map.get(&imm) {
            return id;
        }
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::Imm(imm));
        self.imm_map.insert(imm, id);
        id
    }

    pub fn new_str(&mut self, s: &str) -> ValueId {
        self.new_str_common(s, false)
    }

    pub fn new_format_str(&mut self, s: &str) -> ValueId {
        self.new_str_common(s, true)
    }

    fn new_str_common(&mut self, s: &str, format_str: bool) -> ValueId {
        let data = self.session.intern_str(s);
        if let Some(&id) = self.str_map.get(&(data, format_str)) {
            return id;
        }
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::Str { data, format_str });
        self.str_map.insert((data, format_str), id);
        id
    }

    // ---- stack accounting ----

    pub fn max_tmp_space(&self) -> u32 {
        self.max_tmp_space
    }

    /// Reserve at least `bytes` of temporary stack. The budget is a hard
    /// resource ceiling; blowing it is a translator bug, not a user error.
    pub fn use_tmp_space(&mut self, bytes: u32) {
        if self.max_tmp_space < bytes {
            self.max_tmp_space = bytes;
        }
        assert!(
            self.max_tmp_space <= self.target.max_stack(),
            "temporary stack overflow: {} > {}",
            self.max_tmp_space,
            self.target.max_stack()
        );
    }

    // ---- blocks and edges ----

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id.index()));
        id
    }

    fn add_edge(&mut self, from: BlockId, to: BlockId) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge { from, to });
        self.block_mut(to).prevs.push(id);
        id
    }

    /// Retarget an existing edge, keeping both incoming sets consistent.
    pub fn redirect_edge(&mut self, e: EdgeId, new_to: BlockId) {
        let old_to = self.edges[e.index()].to;
        self.block_mut(old_to).prevs.retain(|&p| p != e);
        self.edges[e.index()].to = new_to;
        self.block_mut(new_to).prevs.push(e);
    }

    /// Install or retarget the branch-taken successor of `b`.
    pub fn set_taken(&mut self, b: BlockId, target: BlockId) {
        match self.block(b).taken {
            Some(e) => self.redirect_edge(e, target),
            None => {
                let e = self.add_edge(b, target);
                self.block_mut(b).taken = Some(e);
            }
        }
    }

    /// Install or retarget the fallthrough successor of `b`.
    pub fn set_fallthru(&mut self, b: BlockId, target: BlockId) {
        match self.block(b).fallthru {
            Some(e) => self.redirect_edge(e, target),
            None => {
                let e = self.add_edge(b, target);
                self.block_mut(b).fallthru = Some(e);
            }
        }
    }

    pub fn taken_target(&self, b: BlockId) -> Option<BlockId> {
        self.block(b).taken.map(|e| self.edge(e).to)
    }

    pub fn fallthru_target(&self, b: BlockId) -> Option<BlockId> {
        self.block(b).fallthru.map(|e| self.edge(e).to)
    }

    /// Follow successor edges through empty forwarder blocks until a block
    /// with instructions is reached. An empty block forwards through its
    /// taken edge if it has one, or through its fallthrough edge (plain
    /// jumps are recorded as fallthrough edges, not JA instructions).
    pub fn resolve_forwarder(&self, mut b: BlockId) -> BlockId {
        while self.block(b).is_empty() {
            match self.taken_target(b).or_else(|| self.fallthru_target(b)) {
                Some(next) => b = next,
                None => break,
            }
        }
        b
    }

    // ---- instruction insertion ----

    fn insert(
        &mut self,
        ins: Cursor,
        code: u16,
        off: i16,
        dest: Option<ValueId>,
        src0: Option<ValueId>,
        src1: Option<ValueId>,
        nargs: u8,
    ) -> InsnId {
        let id = InsnId(self.insns.len() as u32);
        let block = ins.block(self);
        self.insns.push(Insn {
            code,
            id: 0,
            off,
            dest,
            src0,
            src1,
            nargs,
            block,
            prev: None,
            next: None,
        });

        match ins {
            Cursor::AppendTo(b) => {
                let last = self.block(b).last;
                self.insns[id.index()].prev = last;
                match last {
                    Some(l) => self.insns[l.index()].next = Some(id),
                    None => self.block_mut(b).first = Some(id),
                }
                self.block_mut(b).last = Some(id);
            }
            Cursor::Before(next) => {
                let prev = self.insn(next).prev;
                self.insns[id.index()].next = Some(next);
                self.insns[id.index()].prev = prev;
                self.insns[next.index()].prev = Some(id);
                match prev {
                    Some(p) => self.insns[p.index()].next = Some(id),
                    None => self.block_mut(block).first = Some(id),
                }
            }
        }
        id
    }

    /// Load `sz` bytes from [base + off] into dest.
    pub fn mk_ld(&mut self, ins: Cursor, sz: u16, dest: ValueId, base: ValueId, off: i16) {
        self.insert(
            ins,
            BPF_LDX | sz | BPF_MEM,
            off,
            Some(dest),
            None,
            Some(base),
            0,
        );
    }

    /// Store `sz` bytes of src (register or immediate) to [base + off].
    pub fn mk_st(&mut self, ins: Cursor, sz: u16, base: ValueId, off: i16, src: ValueId) {
        let code = if self.value(src).is_imm() {
            BPF_ST | sz | BPF_MEM
        } else {
            BPF_STX | sz | BPF_MEM
        };
        self.insert(ins, code, off, Some(base), None, Some(src), 0);
    }

    /// Unary ALU operation: dest = op src.
    pub fn mk_unary(&mut self, ins: Cursor, op: u16, dest: ValueId, src: ValueId) {
        self.insert(
            ins,
            BPF_ALU64 | op | BPF_K,
            0,
            Some(dest),
            Some(src),
            None,
            0,
        );
    }

    /// Binary ALU operation: d = s0 op s1. The tie between d and s0 is
    /// recorded in src0 for the external register allocator.
    pub fn mk_binary(&mut self, ins: Cursor, op: u16, d: ValueId, s0: ValueId, s1: ValueId) {
        let src_bit = if self.value(s1).is_imm() { BPF_K } else { BPF_X };
        self.insert(
            ins,
            BPF_ALU64 | op | src_bit,
            0,
            Some(d),
            Some(s0),
            Some(s1),
            0,
        );
    }

    /// Register move or constant load. Constants outside the 32-bit signed
    /// range need the wide two-slot load form.
    pub fn mk_mov(&mut self, ins: Cursor, dest: ValueId, src: ValueId) {
        let code = match self.value(src) {
            ValueData::Imm(i) if i32::try_from(*i).is_err() => BPF_LD | BPF_IMM | BPF_DW,
            v if v.is_imm() => BPF_ALU64 | BPF_MOV | BPF_K,
            _ => BPF_ALU64 | BPF_MOV | BPF_X,
        };
        self.insert(ins, code, 0, Some(dest), None, Some(src), 0);
    }

    /// Helper call. Arguments are in R1..R5 by convention; nargs records how
    /// many are live for the register allocator.
    pub fn mk_call(&mut self, ins: Cursor, id: HelperId, nargs: u8) {
        let imm = self.new_imm(id);
        self.insert(ins, BPF_JMP | crate::ir::BPF_CALL, 0, None, None, Some(imm), nargs);
    }

    pub fn mk_exit(&mut self, ins: Cursor) {
        self.insert(ins, BPF_JMP | BPF_EXIT, 0, None, None, None, 0);
    }

    /// Unconditional jump; terminates the cursor's block.
    pub fn mk_jmp(&mut self, ins: Cursor, dest: BlockId) {
        let b = ins.block(self);
        self.insert(ins, BPF_JMP | BPF_JA, 0, None, None, None, 0);
        self.set_taken(b, dest);
    }

    /// Conditional jump comparing s0 against s1; taken to `t`, else `f`.
    pub fn mk_jcond(
        &mut self,
        ins: Cursor,
        c: Condition,
        s0: ValueId,
        s1: ValueId,
        t: BlockId,
        f: BlockId,
    ) {
        let b = ins.block(self);
        let src_bit = if self.value(s1).is_imm() { BPF_K } else { BPF_X };
        self.insert(
            ins,
            BPF_JMP | c.jmp_op() | src_bit,
            0,
            None,
            Some(s0),
            Some(s1),
            0,
        );
        self.set_taken(b, t);
        self.set_fallthru(b, f);
    }

    /// Load a map reference into dest; the emitter resolves it to a file
    /// descriptor via relocation against the map's symbol.
    pub fn load_map(&mut self, ins: Cursor, dest: ValueId, map_id: i64) {
        let imm = self.new_imm(map_id);
        self.insert(ins, BPF_LD_MAP, 0, Some(dest), None, Some(imm), 0);
    }

    /// Insert an instruction with a caller-supplied opcode and operand set.
    /// Used by the embedded assembler, which works below the factory
    /// methods' encoding decisions.
    pub fn mk_raw(
        &mut self,
        ins: Cursor,
        code: u16,
        off: i16,
        dest: Option<ValueId>,
        src0: Option<ValueId>,
        src1: Option<ValueId>,
    ) {
        self.insert(ins, code, off, dest, src0, src1, 0);
    }
}

/// Iterator over one block's instruction list.
pub struct BlockInsns<'p, 's, 'a> {
    prog: &'p Program<'s, 'a>,
    cur: Option<InsnId>,
}

impl Iterator for BlockInsns<'_, '_, '_> {
    type Item = InsnId;

    fn next(&mut self) -> Option<InsnId> {
        let id = self.cur?;
        self.cur = self.prog.insn(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn prog<'s, 'a>(session: &'s TranslationSession<'a>) -> Program<'s, 'a> {
        Program::new(session, Target::UserBpfInterp)
    }

    #[test]
    fn test_interning_identity() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);

        assert_eq!(p.new_imm(42), p.new_imm(42));
        assert_ne!(p.new_imm(42), p.new_imm(43));
        assert_eq!(p.new_str("x"), p.new_str("x"));
        // Format strings pool separately from plain strings.
        assert_ne!(p.new_str("x"), p.new_format_str("x"));
        assert_eq!(p.new_format_str("x"), p.new_format_str("x"));
    }

    #[test]
    fn test_program_borrow_ends_with_program() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);

        // A program's borrow of the session must not be pinned to the arena
        // lifetime; once it is dropped the session is free again.
        let interned = {
            let mut p = prog(&session);
            p.new_str("short-lived")
        };
        let _ = interned;

        let again = session.intern_str("short-lived");
        assert_eq!(again, "short-lived");
        let mut p2 = prog(&session);
        assert_eq!(p2.new_imm(1), p2.new_imm(1));
    }

    #[test]
    fn test_use_tmp_space_monotone_max() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);

        p.use_tmp_space(64);
        p.use_tmp_space(32);
        assert_eq!(p.max_tmp_space(), 64);
        p.use_tmp_space(128);
        assert_eq!(p.max_tmp_space(), 128);
    }

    #[test]
    #[should_panic(expected = "temporary stack overflow")]
    fn test_use_tmp_space_ceiling() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = Program::new(&session, Target::KernelBpf);
        p.use_tmp_space(513);
    }

    #[test]
    fn test_append_and_insert_before() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);
        let b = p.new_block();
        let r = p.new_reg();

        let one = p.new_imm(1);
        let two = p.new_imm(2);
        let three = p.new_imm(3);
        p.mk_mov(Cursor::AppendTo(b), r, one);
        p.mk_mov(Cursor::AppendTo(b), r, three);
        // Insert before the trailing mov; order must be 1, 2, 3.
        let last = p.block(b).last.unwrap();
        p.mk_mov(Cursor::Before(last), r, two);

        let imms: Vec<i64> = p
            .block_insns(b)
            .map(|i| p.value(p.insn(i).src1.unwrap()).imm())
            .collect();
        assert_eq!(imms, vec![1, 2, 3]);
        // All instructions claim the same owning block.
        assert!(p.block_insns(b).all(|i| p.insn(i).block == b));
    }

    #[test]
    fn test_edge_invariants_on_redirect() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);
        let a = p.new_block();
        let b = p.new_block();
        let c = p.new_block();

        p.mk_jmp(Cursor::AppendTo(a), b);
        assert_eq!(p.taken_target(a), Some(b));
        assert_eq!(p.block(b).prevs.len(), 1);

        // Retargeting a's taken edge moves the incoming registration.
        p.set_taken(a, c);
        assert_eq!(p.taken_target(a), Some(c));
        assert!(p.block(b).prevs.is_empty());
        assert_eq!(p.block(c).prevs.len(), 1);
        let e = p.block(a).taken.unwrap();
        assert_eq!(p.edge(e).from, a);
        assert_eq!(p.edge(e).to, c);
    }

    #[test]
    fn test_forwarder_resolution() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);
        let a = p.new_block();
        let fwd1 = p.new_block();
        let fwd2 = p.new_block();
        let real = p.new_block();

        let r = p.new_reg();
        let zero = p.new_imm(0);
        p.mk_mov(Cursor::AppendTo(real), r, zero);
        p.set_taken(a, fwd1);
        p.set_taken(fwd1, fwd2);
        p.set_taken(fwd2, real);

        assert_eq!(p.resolve_forwarder(fwd1), real);
        assert_eq!(p.resolve_forwarder(real), real);

        // Empty blocks left by plain jumps forward through fallthrough edges.
        let fwd3 = p.new_block();
        p.set_fallthru(fwd3, fwd1);
        assert_eq!(p.resolve_forwarder(fwd3), real);
    }

    #[test]
    fn test_wide_mov_selection() {
        let arena = Bump::new();
        let session = TranslationSession::new(&arena);
        let mut p = prog(&session);
        let b = p.new_block();
        let r = p.new_reg();

        let small = p.new_imm(7);
        let big = p.new_imm(1 << 40);
        p.mk_mov(Cursor::AppendTo(b), r, small);
        p.mk_mov(Cursor::AppendTo(b), r, big);

        let codes: Vec<u16> = p.block_insns(b).map(|i| p.insn(i).code).collect();
        assert_eq!(codes[0], BPF_ALU64 | BPF_MOV | BPF_K);
        assert_eq!(codes[1], BPF_LD | BPF_IMM | BPF_DW);
        assert!(p.insn(p.block(b).last.unwrap()).is_wide());
    }
}
