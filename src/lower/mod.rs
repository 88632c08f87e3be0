// The lowering engine walks the type-checked statement tree and emits CFG code
// through an explicit cursor. One Lowerer exists per generated program; it carries
// the emission cursor (None between a terminated block and the next set_block), the
// lazily created shared exit and return-zero blocks, and the stack-disciplined
// context for loops (break/continue targets), try/catch (catch-target and pending
// message stacks), and inlined function calls (return block, return-value register,
// active-callee chain for recursion detection). Plain jumps are recorded as
// fallthrough edges without a JA instruction; the emitter later materializes jumps
// for edges that are not linearly adjacent. Every generated program is wrapped in a
// prologue that honors the global exit flag and soft-error ceiling, and an epilogue
// that reports and counts per-invocation errors.

//! AST-to-CFG lowering.

use hashbrown::HashMap;

use crate::ast::{ScriptFunction, Stmt};
use crate::core::TranslateResult;
use crate::globals::{Globals, ERRORS_SLOT, EXIT_SLOT, INTERNAL_MAP_IDX};
use crate::ir::helpers::{self, HelperId};
use crate::ir::{
    BlockId, Condition, Cursor, Program, ValueId, BPF_ADD, BPF_DW, BPF_REG_0, BPF_REG_1,
    BPF_REG_10, BPF_REG_2, BPF_REG_3, BPF_REG_4, BPF_REG_6, BPF_W,
};

mod expr;
mod printf;
mod stats;
mod stmt;
mod strings;

pub use printf::TransportMsg;
pub use strings::translate_escapes;

/// Per-program lowering state.
pub struct Lowerer<'l, 's, 'a> {
    pub(crate) prog: &'l mut Program<'s, 'a>,
    pub(crate) glob: &'l mut Globals,
    pub(crate) functions: &'l HashMap<String, ScriptFunction>,

    /// Current emission position; None after a block has been terminated.
    pub(crate) cursor: Option<Cursor>,

    /// Saved program context argument, when the probe has one.
    pub(crate) in_arg0: Option<ValueId>,
    /// Per-invocation error flag consulted by the epilogue.
    pub(crate) error_status: ValueId,

    exit_block: Option<BlockId>,
    ret0_block: Option<BlockId>,

    /// Innermost local-variable scope is the last entry.
    pub(crate) locals: Vec<HashMap<String, ValueId>>,

    pub(crate) loop_break: Vec<BlockId>,
    pub(crate) loop_cont: Vec<BlockId>,

    /// Catch targets of lexically enclosing try blocks.
    pub(crate) catch_jump: Vec<BlockId>,
    /// Messages raised toward the innermost catch target, popped by the
    /// handler that binds them.
    pub(crate) catch_msg: Vec<ValueId>,

    /// Return targets and return-value registers of active inlined calls.
    pub(crate) func_return: Vec<BlockId>,
    pub(crate) func_return_val: Vec<ValueId>,
    /// Names of callees currently being inlined; a repeat is recursion.
    pub(crate) func_calls: Vec<String>,
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    pub fn new(
        prog: &'l mut Program<'s, 'a>,
        glob: &'l mut Globals,
        functions: &'l HashMap<String, ScriptFunction>,
    ) -> Self {
        let error_status = prog.new_reg();
        Self {
            prog,
            glob,
            functions,
            cursor: None,
            in_arg0: None,
            error_status,
            exit_block: None,
            ret0_block: None,
            locals: vec![HashMap::new()],
            loop_break: Vec::new(),
            loop_cont: Vec::new(),
            catch_jump: Vec::new(),
            catch_msg: Vec::new(),
            func_return: Vec::new(),
            func_return_val: Vec::new(),
            func_calls: Vec::new(),
        }
    }

    // ---- cursor management ----

    pub(crate) fn set_block(&mut self, b: BlockId) {
        self.cursor = Some(Cursor::AppendTo(b));
    }

    pub(crate) fn clear_block(&mut self) {
        self.cursor = None;
    }

    pub(crate) fn in_block(&self) -> bool {
        self.cursor.is_some()
    }

    /// The active cursor. Emitting with no open block is a lowering bug.
    pub(crate) fn ins(&self) -> Cursor {
        match self.cursor {
            Some(c) => c,
            None => panic!("instruction emitted outside a basic block"),
        }
    }

    fn cur_block(&self) -> BlockId {
        self.ins().block(self.prog)
    }

    // ---- emission shorthands ----

    pub(crate) fn reg(&self, r: u8) -> ValueId {
        self.prog.lookup_reg(r)
    }

    pub(crate) fn imm(&mut self, v: i64) -> ValueId {
        self.prog.new_imm(v)
    }

    pub(crate) fn emit_mov(&mut self, d: ValueId, s: ValueId) {
        let ins = self.ins();
        self.prog.mk_mov(ins, d, s);
    }

    pub(crate) fn ld(&mut self, sz: u16, dest: ValueId, base: ValueId, off: i16) {
        let ins = self.ins();
        self.prog.mk_ld(ins, sz, dest, base, off);
    }

    pub(crate) fn st(&mut self, sz: u16, base: ValueId, off: i16, src: ValueId) {
        let ins = self.ins();
        self.prog.mk_st(ins, sz, base, off, src);
    }

    pub(crate) fn unary(&mut self, op: u16, dest: ValueId, src: ValueId) {
        let ins = self.ins();
        self.prog.mk_unary(ins, op, dest, src);
    }

    pub(crate) fn binary(&mut self, op: u16, d: ValueId, s0: ValueId, s1: ValueId) {
        let ins = self.ins();
        self.prog.mk_binary(ins, op, d, s0, s1);
    }

    pub(crate) fn call(&mut self, id: HelperId, nargs: u8) {
        let ins = self.ins();
        self.prog.mk_call(ins, id, nargs);
    }

    pub(crate) fn jcond(&mut self, c: Condition, s0: ValueId, s1: ValueId, t: BlockId, f: BlockId) {
        let ins = self.ins();
        self.prog.mk_jcond(ins, c, s0, s1, t, f);
    }

    pub(crate) fn load_map(&mut self, dest: ValueId, map_id: i64) {
        let ins = self.ins();
        self.prog.load_map(ins, dest, map_id);
    }

    /// Point the frame-relative address `frame + ofs` into `dest`.
    pub(crate) fn frame_addr(&mut self, dest: ValueId, ofs: i64) {
        let frame = self.reg(BPF_REG_10);
        let off = self.imm(ofs);
        self.binary(BPF_ADD, dest, frame, off);
    }

    // ---- control flow ----

    /// Fall through to `b` and terminate the current block. No jump
    /// instruction is emitted; the emitter synthesizes one if the target is
    /// not linearly next.
    pub(crate) fn emit_jmp(&mut self, b: BlockId) {
        let cur = self.cur_block();
        self.prog.set_fallthru(cur, b);
        self.clear_block();
    }

    /// The program's shared exit path: epilogue followed by a single exit
    /// instruction. Created on first use.
    pub(crate) fn get_exit_block(&mut self) -> TranslateResult<BlockId> {
        if let Some(b) = self.exit_block {
            return Ok(b);
        }

        let saved = self.cursor;
        let exit = self.prog.new_block();

        self.set_block(exit);
        self.add_epilogue()?;
        let ins = self.ins();
        self.prog.mk_exit(ins);

        self.cursor = saved;
        self.exit_block = Some(exit);
        Ok(exit)
    }

    /// Shared "return 0" block feeding the exit path. Created on first use.
    pub(crate) fn get_ret0_block(&mut self) -> TranslateResult<BlockId> {
        if let Some(b) = self.ret0_block {
            return Ok(b);
        }

        let b = self.prog.new_block();
        let r0 = self.reg(BPF_REG_0);
        let zero = self.imm(0);
        self.prog.mk_mov(Cursor::AppendTo(b), r0, zero);
        let exit = self.get_exit_block()?;
        self.prog.set_fallthru(b, exit);

        self.ret0_block = Some(b);
        Ok(b)
    }

    // ---- prologue / epilogue ----

    /// Check the global exit flag and soft-error counter before running the
    /// probe body; either being tripped routes to the exit path.
    pub(crate) fn add_prologue(&mut self) -> TranslateResult<()> {
        let zero = self.imm(0);
        self.emit_mov(self.error_status, zero);

        let exit_block = self.get_exit_block()?;
        let frame = self.reg(BPF_REG_10);
        let limit_val = self.prog.session().config().max_errors as i64;
        let limit = self.imm(limit_val);

        // Look up the exit flag.
        let key = self.imm(EXIT_SLOT);
        self.st(BPF_W, frame, -4, key);
        self.prog.use_tmp_space(4);
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, INTERNAL_MAP_IDX as i64);
        let r2 = self.reg(BPF_REG_2);
        self.frame_addr(r2, -4);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let r0 = self.reg(BPF_REG_0);
        let cont = self.prog.new_block();
        self.jcond(Condition::Eq, r0, zero, exit_block, cont);
        self.set_block(cont);

        let exit_status = self.prog.new_reg();
        self.ld(BPF_DW, exit_status, r0, 0);

        let one = self.imm(1);
        let cont = self.prog.new_block();
        self.jcond(Condition::Eq, exit_status, one, exit_block, cont);
        self.set_block(cont);

        // Look up the soft-error count.
        let key = self.imm(ERRORS_SLOT);
        self.st(BPF_W, frame, -4, key);
        self.prog.use_tmp_space(4);
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, INTERNAL_MAP_IDX as i64);
        let r2 = self.reg(BPF_REG_2);
        self.frame_addr(r2, -4);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let cont = self.prog.new_block();
        self.jcond(Condition::Eq, r0, zero, exit_block, cont);
        self.set_block(cont);

        let error_count = self.prog.new_reg();
        self.ld(BPF_DW, error_count, r0, 0);

        let cont = self.prog.new_block();
        self.jcond(Condition::Gt, error_count, limit, exit_block, cont);
        self.set_block(cont);
        Ok(())
    }

    /// Report and count a raised error, escalating to a hard error once the
    /// soft-error ceiling is exceeded.
    fn add_epilogue(&mut self) -> TranslateResult<()> {
        let zero = self.imm(0);
        let frame = self.reg(BPF_REG_10);
        let limit_val = self.prog.session().config().max_errors as i64;
        let limit = self.imm(limit_val);

        let error_block = self.prog.new_block();
        let done_block = self.prog.new_block();

        self.jcond(Condition::Eq, self.error_status, zero, done_block, error_block);
        self.set_block(error_block);

        self.emit_transport_msg(TransportMsg::PrintErrorMsg, None)?;

        // Look up the error count.
        let key = self.imm(ERRORS_SLOT);
        self.st(BPF_W, frame, -4, key);
        self.prog.use_tmp_space(4);
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, INTERNAL_MAP_IDX as i64);
        let r2 = self.reg(BPF_REG_2);
        self.frame_addr(r2, -4);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let r0 = self.reg(BPF_REG_0);
        let increment_block = self.prog.new_block();
        self.jcond(Condition::Eq, r0, zero, done_block, increment_block);
        self.set_block(increment_block);

        let error_count = self.prog.new_reg();
        self.ld(BPF_DW, error_count, r0, 0);
        let one = self.imm(1);
        self.binary(BPF_ADD, error_count, error_count, one);

        // Write the incremented count back.
        self.st(BPF_DW, frame, -8, error_count);
        self.prog.use_tmp_space(8);
        let key = self.imm(ERRORS_SLOT);
        self.st(BPF_W, frame, -12, key);
        self.prog.use_tmp_space(12);
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, INTERNAL_MAP_IDX as i64);
        let r2 = self.reg(BPF_REG_2);
        self.frame_addr(r2, -12);
        let r3 = self.reg(BPF_REG_3);
        self.frame_addr(r3, -8);
        let r4 = self.reg(BPF_REG_4);
        self.emit_mov(r4, zero);
        self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);

        let exceeded_block = self.prog.new_block();
        self.jcond(Condition::Le, error_count, limit, done_block, exceeded_block);
        self.set_block(exceeded_block);

        self.emit_transport_msg(TransportMsg::Error, None)?;
        self.emit_jmp(done_block);

        self.set_block(done_block);
        Ok(())
    }

    /// The `exit()` builtin: raise the global exit flag, notify the
    /// transport, and leave the program through the exit path.
    pub(crate) fn emit_exit_call(&mut self) -> TranslateResult<()> {
        let frame = self.reg(BPF_REG_10);
        let one = self.imm(1);
        let zero = self.imm(0);

        self.st(BPF_DW, frame, -8, one);
        self.prog.use_tmp_space(8);
        let key = self.imm(EXIT_SLOT);
        self.st(BPF_W, frame, -12, key);
        self.prog.use_tmp_space(12);
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, INTERNAL_MAP_IDX as i64);
        let r2 = self.reg(BPF_REG_2);
        self.frame_addr(r2, -12);
        let r3 = self.reg(BPF_REG_3);
        self.frame_addr(r3, -8);
        let r4 = self.reg(BPF_REG_4);
        self.emit_mov(r4, zero);
        self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);

        self.emit_transport_msg(TransportMsg::Exit, None)?;

        let exit_block = self.get_exit_block()?;
        let cont = self.prog.new_block();
        self.emit_jmp(exit_block);
        self.set_block(cont);
        Ok(())
    }
}

/// Lower one kernel-target probe body into `prog`, wrapped in the standard
/// prologue and routed to the shared return path.
pub fn lower_kernel_probe(
    prog: &mut Program<'_, '_>,
    glob: &mut Globals,
    functions: &HashMap<String, ScriptFunction>,
    body: &Stmt,
) -> TranslateResult<()> {
    let mut lw = Lowerer::new(prog, glob, functions);

    let entry = lw.prog.new_block();
    lw.set_block(entry);

    // Save the context argument early; probe context reads need it and the
    // transport path passes it back to perf_event_output.
    let in_arg0 = lw.reg(BPF_REG_6);
    let r1 = lw.reg(BPF_REG_1);
    lw.emit_mov(in_arg0, r1);
    lw.in_arg0 = Some(in_arg0);

    lw.add_prologue()?;
    lw.emit_stmt(body)?;

    if lw.in_block() {
        let ret0 = lw.get_ret0_block()?;
        lw.emit_jmp(ret0);
    }

    log::debug!(
        "lowered kernel probe: {} blocks, {} insns",
        lw.prog.num_blocks(),
        lw.prog.num_insns()
    );
    Ok(())
}

/// Lower a group of userspace-target probe bodies into one program, with
/// optional initialization statements run before the first body.
pub fn lower_user_group(
    prog: &mut Program<'_, '_>,
    glob: &mut Globals,
    functions: &HashMap<String, ScriptFunction>,
    init: &[Stmt],
    bodies: &[&Stmt],
) -> TranslateResult<()> {
    let mut lw = Lowerer::new(prog, glob, functions);

    let entry = lw.prog.new_block();
    lw.set_block(entry);
    let zero = lw.imm(0);
    lw.emit_mov(lw.error_status, zero);

    for s in init {
        lw.emit_stmt(s)?;
    }

    let n = bodies.len();
    if n == 0 {
        let ret0 = lw.get_ret0_block()?;
        if lw.in_block() {
            lw.emit_jmp(ret0);
        }
    }
    for (i, body) in bodies.iter().enumerate() {
        // Probe bodies do not share local variables.
        lw.locals = vec![HashMap::new()];
        lw.emit_stmt(body)?;

        let next = if i == n - 1 {
            lw.get_ret0_block()?
        } else {
            lw.prog.new_block()
        };
        if lw.in_block() {
            lw.emit_jmp(next);
        }
        if i != n - 1 {
            lw.set_block(next);
        }
    }

    log::debug!(
        "lowered user-group program: {} bodies, {} blocks, {} insns",
        n,
        lw.prog.num_blocks(),
        lw.prog.num_insns()
    );
    Ok(())
}
