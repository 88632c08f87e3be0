// Expression lowering. Longs live in registers; strings are represented by an
// address (map value, stack buffer) or by an interned literal value that consumers
// materialize lazily. Global reads and writes go through the planned map slots with
// keys and values staged on the frame; a failed lookup of a scalar's array-map slot
// can only mean the environment is tearing down, so it routes to the exit path.
// Conditions lower structurally: short-circuit operators become CFG edges without
// materializing intermediate booleans, and `cond ? a : b` avoids a diamond when one
// arm is effect-free.

//! Expression lowering.

use hashbrown::HashMap;

use crate::ast::{
    AssignOp, BinaryOp, CompareOp, CrementOp, Expr, ExprKind, ScriptFunction, UnaryOp, ValueType,
};
use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::ir::helpers;
use crate::ir::{
    BlockId, Condition, Target, ValueId, BPF_ADD, BPF_AND, BPF_ARSH, BPF_B, BPF_DIV, BPF_DW,
    BPF_H, BPF_LSH, BPF_MAXSTRINGLEN, BPF_MOD, BPF_MUL, BPF_NEG, BPF_OR, BPF_REG_0, BPF_REG_1,
    BPF_REG_10, BPF_REG_2, BPF_REG_3, BPF_REG_4, BPF_SUB, BPF_W, BPF_XOR,
};

use super::strings::translate_escapes;
use super::Lowerer;

fn alu_code(op: BinaryOp) -> u16 {
    match op {
        BinaryOp::Add => BPF_ADD,
        BinaryOp::Sub => BPF_SUB,
        BinaryOp::Mul => BPF_MUL,
        BinaryOp::Div => BPF_DIV,
        BinaryOp::Mod => BPF_MOD,
        BinaryOp::Shl => BPF_LSH,
        // Script longs are signed; >> is an arithmetic shift.
        BinaryOp::Shr => BPF_ARSH,
        BinaryOp::BitAnd => BPF_AND,
        BinaryOp::BitOr => BPF_OR,
        BinaryOp::BitXor => BPF_XOR,
    }
}

fn assign_code(op: AssignOp) -> u16 {
    match op {
        AssignOp::Add => BPF_ADD,
        AssignOp::Sub => BPF_SUB,
        AssignOp::Mul => BPF_MUL,
        AssignOp::Div => BPF_DIV,
        AssignOp::Mod => BPF_MOD,
        AssignOp::Shl => BPF_LSH,
        AssignOp::Shr => BPF_ARSH,
        AssignOp::BitAnd => BPF_AND,
        AssignOp::BitOr => BPF_OR,
        AssignOp::BitXor => BPF_XOR,
        AssignOp::Assign | AssignOp::Concat | AssignOp::Aggregate => {
            panic!("assign_code on non-arithmetic assignment")
        }
    }
}

fn compare_cond(op: CompareOp) -> Condition {
    match op {
        CompareOp::Eq => Condition::Eq,
        CompareOp::Ne => Condition::Ne,
        CompareOp::Lt => Condition::Lt,
        CompareOp::Le => Condition::Le,
        CompareOp::Gt => Condition::Gt,
        CompareOp::Ge => Condition::Ge,
    }
}

/// Whether evaluating the expression can change observable state.
pub(crate) fn has_side_effects(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Number(_)
        | ExprKind::Str(_)
        | ExprKind::Symbol(_)
        | ExprKind::ContextField { .. } => false,
        ExprKind::Assign { .. }
        | ExprKind::Crement { .. }
        | ExprKind::FunctionCall { .. }
        | ExprKind::Print(_) => true,
        ExprKind::ArrayIndex { indexes, .. } | ExprKind::ArrayIn { indexes, .. } => {
            indexes.iter().any(has_side_effects)
        }
        ExprKind::Binary { left, right, .. }
        | ExprKind::LogicalAnd { left, right }
        | ExprKind::LogicalOr { left, right }
        | ExprKind::Comparison { left, right, .. }
        | ExprKind::Concat { left, right } => has_side_effects(left) || has_side_effects(right),
        ExprKind::Unary { operand, .. } => has_side_effects(operand),
        ExprKind::LogicalNot(x) => has_side_effects(x),
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => has_side_effects(cond) || has_side_effects(then_expr) || has_side_effects(else_expr),
        ExprKind::StatOp { stat, .. } => has_side_effects(stat),
    }
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    pub(crate) fn emit_expr(&mut self, e: &Expr) -> TranslateResult<ValueId> {
        match &e.kind {
            ExprKind::Number(n) => Ok(self.imm(*n)),
            ExprKind::Str(s) => {
                let s = translate_escapes(s, &e.loc)?;
                Ok(self.prog.new_str(&s))
            }
            ExprKind::Symbol(name) => self.emit_symbol_read(name, e.ty, &e.loc),
            ExprKind::ContextField {
                offset,
                size,
                signed,
            } => self.emit_context_var(*offset, *size, *signed, &e.loc),
            ExprKind::ArrayIndex { array, indexes } => {
                self.emit_array_read(array, indexes, e.ty, &e.loc)
            }
            ExprKind::Binary { op, left, right } => {
                // Copy the left operand; evaluating the right one may mutate
                // it (x + x++).
                let s0 = self.prog.new_reg();
                let l = self.emit_expr(left)?;
                self.emit_mov(s0, l);
                let s1 = self.emit_expr(right)?;
                let d = self.prog.new_reg();
                self.binary(alu_code(*op), d, s0, s1);
                Ok(d)
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => {
                    // Negative literals arrive as a negation over a positive
                    // literal.
                    if let ExprKind::Number(v) = operand.kind {
                        return Ok(self.imm(v.wrapping_neg()));
                    }
                    let s = self.emit_expr(operand)?;
                    let d = self.prog.new_reg();
                    self.unary(BPF_NEG, d, s);
                    Ok(d)
                }
                UnaryOp::BitNot => {
                    let s1 = self.imm(-1);
                    let s0 = self.emit_expr(operand)?;
                    let d = self.prog.new_reg();
                    self.binary(BPF_XOR, d, s0, s1);
                    Ok(d)
                }
            },
            ExprKind::LogicalAnd { .. }
            | ExprKind::LogicalOr { .. }
            | ExprKind::LogicalNot(_)
            | ExprKind::Comparison { .. } => self.emit_bool(e),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => self.emit_ternary(cond, then_expr, else_expr),
            ExprKind::Assign {
                op,
                lvalue,
                rvalue,
            } => {
                let mut r = self.emit_expr(rvalue)?;
                match op {
                    // <<< accumulates; emit_store recognizes the aggregate
                    // lvalue.
                    AssignOp::Assign | AssignOp::Aggregate => {}
                    AssignOp::Concat => {
                        let l = self.emit_expr(lvalue)?;
                        let pl = self.prog.new_reg();
                        self.emit_mov(pl, l);
                        let pr = self.prog.new_reg();
                        self.emit_mov(pr, r);
                        r = self.emit_str_concat(pl, pr, &e.loc)?;
                    }
                    _ => {
                        let l = self.emit_expr(lvalue)?;
                        self.binary(assign_code(*op), l, l, r);
                        r = l;
                    }
                }
                self.emit_store(lvalue, r)?;
                Ok(r)
            }
            ExprKind::Crement { op, lvalue } => {
                let dir = match op {
                    CrementOp::PreInc | CrementOp::PostInc => 1,
                    CrementOp::PreDec | CrementOp::PostDec => -1,
                };
                let c = self.imm(dir);
                match op {
                    CrementOp::PreInc | CrementOp::PreDec => {
                        let v = self.emit_expr(lvalue)?;
                        self.binary(BPF_ADD, v, v, c);
                        self.emit_store(lvalue, v)?;
                        Ok(v)
                    }
                    CrementOp::PostInc | CrementOp::PostDec => {
                        let r = self.prog.new_reg();
                        let v = self.emit_expr(lvalue)?;
                        self.emit_mov(r, v);
                        self.binary(BPF_ADD, v, v, c);
                        self.emit_store(lvalue, v)?;
                        Ok(r)
                    }
                }
            }
            ExprKind::ArrayIn { array, indexes } => self.emit_array_in(array, indexes, &e.loc),
            ExprKind::Concat { left, right } => {
                if self.prog.target() == Target::KernelBpf {
                    return Err(TranslateError::Unsupported {
                        construct: "string concatenation".to_string(),
                        loc: e.loc.clone(),
                    });
                }
                // Intermediate strings can come from calls that clobber the
                // registers holding earlier results, so park both operands in
                // fresh temporaries.
                let l = self.emit_expr(left)?;
                let pl = self.prog.new_reg();
                self.emit_mov(pl, l);
                let r = self.emit_expr(right)?;
                let pr = self.prog.new_reg();
                self.emit_mov(pr, r);
                self.emit_str_concat(pl, pr, &e.loc)
            }
            ExprKind::FunctionCall { name, args } => self.emit_function_call(name, args, &e.loc),
            ExprKind::Print(spec) => {
                let r = self.emit_print(spec, &e.loc)?;
                Ok(match r {
                    Some(v) => v,
                    None => self.imm(0),
                })
            }
            ExprKind::StatOp { func, stat } => self.emit_stat_op(*func, stat, &e.loc),
        }
    }

    // ---- variables ----

    pub(crate) fn lookup_local(&self, name: &str) -> Option<ValueId> {
        self.locals.last().and_then(|m| m.get(name).copied())
    }

    pub(crate) fn local_for_store(&mut self, name: &str) -> ValueId {
        if let Some(v) = self.lookup_local(name) {
            return v;
        }
        let v = self.prog.new_reg();
        if let Some(scope) = self.locals.last_mut() {
            scope.insert(name.to_string(), v);
        }
        v
    }

    fn emit_symbol_read(
        &mut self,
        name: &str,
        ty: ValueType,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        if let Some(slot) = self.glob.slot(name) {
            if slot.is_stat() {
                return Err(TranslateError::Semantic {
                    reason: "unhandled statistics variable".to_string(),
                    loc: loc.clone(),
                });
            }

            let frame = self.reg(BPF_REG_10);
            let idx = self.imm(slot.idx);
            self.st(BPF_W, frame, -4, idx);
            self.prog.use_tmp_space(4);
            let r1 = self.reg(BPF_REG_1);
            self.load_map(r1, slot.map_id);
            let r2 = self.reg(BPF_REG_2);
            self.frame_addr(r2, -4);
            self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

            // Scalars are preallocated array elements, so the lookup can only
            // fail during teardown; the verifier still requires the check.
            let r0 = self.reg(BPF_REG_0);
            let zero = self.imm(0);
            let exit_block = self.get_exit_block()?;
            let cont = self.prog.new_block();
            self.jcond(Condition::Eq, r0, zero, exit_block, cont);
            self.set_block(cont);

            let result = self.prog.new_reg();
            match ty {
                ValueType::Str => self.emit_mov(result, r0),
                _ => self.ld(BPF_DW, result, r0, 0),
            }
            return Ok(result);
        }

        self.lookup_local(name)
            .ok_or_else(|| TranslateError::UnknownVariable {
                name: name.to_string(),
                loc: loc.clone(),
            })
    }

    /// Stage a composite key on the frame, lowest dimension at the lowest
    /// address, leaving R2 pointing at it. Returns the negative key size.
    pub(crate) fn emit_array_key(&mut self, indexes: &[Expr]) -> TranslateResult<i64> {
        let r2 = self.reg(BPF_REG_2);
        let mut key_ofs: i64 = 0;
        for e in indexes.iter().rev() {
            let v = self.emit_expr(e)?;
            match e.ty {
                ValueType::Str => {
                    key_ofs -= i64::from(BPF_MAXSTRINGLEN);
                    self.emit_str_arg(r2, key_ofs, v, &e.loc)?;
                }
                _ => {
                    key_ofs -= 8;
                    self.emit_long_arg(r2, key_ofs, v);
                }
            }
        }
        self.prog.use_tmp_space((-key_ofs) as u32);
        Ok(key_ofs)
    }

    fn emit_array_read(
        &mut self,
        array: &str,
        indexes: &[Expr],
        ty: ValueType,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let slot = self
            .glob
            .slot(array)
            .ok_or_else(|| TranslateError::UnknownVariable {
                name: array.to_string(),
                loc: loc.clone(),
            })?;
        if slot.is_stat() {
            return Err(TranslateError::Semantic {
                reason: "unhandled statistics variable".to_string(),
                loc: loc.clone(),
            });
        }

        self.emit_array_key(indexes)?;
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, slot.map_id);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let r0 = self.reg(BPF_REG_0);
        let zero = self.imm(0);
        let miss = self.prog.new_block();
        let hit = self.prog.new_block();
        let join = self.prog.new_block();
        let result = self.prog.new_reg();
        self.jcond(Condition::Eq, r0, zero, miss, hit);

        // Absent keys read as 0 / the empty string.
        self.set_block(miss);
        self.emit_mov(result, zero);
        self.emit_jmp(join);

        self.set_block(hit);
        match ty {
            ValueType::Str => self.emit_mov(result, r0),
            _ => self.ld(BPF_DW, result, r0, 0),
        }
        self.emit_jmp(join);

        self.set_block(join);
        Ok(result)
    }

    fn emit_array_in(
        &mut self,
        array: &str,
        indexes: &[Expr],
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let slot = self
            .glob
            .slot(array)
            .ok_or_else(|| TranslateError::UnknownVariable {
                name: array.to_string(),
                loc: loc.clone(),
            })?;
        if slot.is_stat() {
            return Err(TranslateError::Semantic {
                reason: "unsupported array-in operation on statistics aggregate".to_string(),
                loc: loc.clone(),
            });
        }

        self.emit_array_key(indexes)?;
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, slot.map_id);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let r0 = self.reg(BPF_REG_0);
        let zero = self.imm(0);
        let absent = self.prog.new_block();
        let present = self.prog.new_block();
        let join = self.prog.new_block();
        let d = self.prog.new_reg();
        self.jcond(Condition::Eq, r0, zero, absent, present);

        self.set_block(absent);
        self.emit_mov(d, zero);
        self.emit_jmp(join);

        self.set_block(present);
        let one = self.imm(1);
        self.emit_mov(d, one);
        self.emit_jmp(join);

        self.set_block(join);
        Ok(d)
    }

    /// Read a probe-context field through probe_read into a register,
    /// sign-extending narrow signed fields. Oversized fields yield a pointer
    /// into the context record instead.
    fn emit_context_var(
        &mut self,
        offset: i64,
        size: u32,
        signed: bool,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let Some(ctx) = self.in_arg0 else {
            return Err(TranslateError::Unsupported {
                construct: "probe context access".to_string(),
                loc: loc.clone(),
            });
        };
        let d = self.prog.new_reg();
        let off = self.imm(offset);

        if size > 8 {
            self.binary(BPF_ADD, d, ctx, off);
            return Ok(d);
        }

        let frame = self.reg(BPF_REG_10);
        let r3 = self.reg(BPF_REG_3);
        self.binary(BPF_ADD, r3, ctx, off);
        let r2 = self.reg(BPF_REG_2);
        let sz = self.imm(i64::from(size));
        self.emit_mov(r2, sz);
        let r1 = self.reg(BPF_REG_1);
        self.frame_addr(r1, -i64::from(size));
        self.prog.use_tmp_space(size);
        self.call(helpers::BPF_FUNC_PROBE_READ, 3);

        let opc = match size {
            1 => BPF_B,
            2 => BPF_H,
            4 => BPF_W,
            8 => BPF_DW,
            _ => {
                return Err(TranslateError::Semantic {
                    reason: format!("unhandled context field size {size}"),
                    loc: loc.clone(),
                })
            }
        };
        self.ld(opc, d, frame, -(size as i16));

        if signed && size < 8 {
            let sh = self.imm(i64::from((8 - size) * 8));
            self.binary(BPF_LSH, d, d, sh);
            self.binary(BPF_ARSH, d, d, sh);
        }
        Ok(d)
    }

    // ---- conditions ----

    /// Lower `e` as a branch to `t_dest` when true, `f_dest` otherwise.
    /// Terminates the current block.
    pub(crate) fn emit_cond(
        &mut self,
        e: &Expr,
        t_dest: BlockId,
        f_dest: BlockId,
    ) -> TranslateResult<()> {
        match &e.kind {
            ExprKind::LogicalOr { left, right } => {
                let cont = self.prog.new_block();
                self.emit_cond(left, t_dest, cont)?;
                self.set_block(cont);
                return self.emit_cond(right, t_dest, f_dest);
            }
            ExprKind::LogicalAnd { left, right } => {
                let cont = self.prog.new_block();
                self.emit_cond(left, cont, f_dest)?;
                self.set_block(cont);
                return self.emit_cond(right, t_dest, f_dest);
            }
            ExprKind::LogicalNot(x) => return self.emit_cond(x, f_dest, t_dest),
            _ => {}
        }

        let (cond, s0, s1) = match &e.kind {
            ExprKind::Comparison { op, left, right } => {
                let s0 = self.emit_expr(left)?;
                let s1 = self.emit_expr(right)?;
                (compare_cond(*op), s0, s1)
            }
            ExprKind::Binary {
                op: BinaryOp::BitAnd,
                left,
                right,
            } => {
                let s0 = self.emit_expr(left)?;
                let s1 = self.emit_expr(right)?;
                (Condition::Test, s0, s1)
            }
            _ => {
                // Fall back to e != 0.
                let s0 = self.emit_expr(e)?;
                let s1 = self.imm(0);
                (Condition::Ne, s0, s1)
            }
        };

        self.jcond(cond, s0, s1, t_dest, f_dest);
        self.clear_block();
        Ok(())
    }

    /// Materialize a condition as 0/1.
    pub(crate) fn emit_bool(&mut self, e: &Expr) -> TranslateResult<ValueId> {
        let else_block = self.prog.new_block();
        let join_block = self.prog.new_block();
        let r = self.prog.new_reg();

        let one = self.imm(1);
        self.emit_mov(r, one);
        self.emit_cond(e, join_block, else_block)?;

        self.set_block(else_block);
        let zero = self.imm(0);
        self.emit_mov(r, zero);
        self.emit_jmp(join_block);

        self.set_block(join_block);
        Ok(r)
    }

    fn emit_ternary(
        &mut self,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
    ) -> TranslateResult<ValueId> {
        let join_block = self.prog.new_block();
        let r = self.prog.new_reg();

        if !has_side_effects(then_expr) {
            let else_block = self.prog.new_block();
            let v = self.emit_expr(then_expr)?;
            self.emit_mov(r, v);
            self.emit_cond(cond, join_block, else_block)?;

            self.set_block(else_block);
            let v = self.emit_expr(else_expr)?;
            self.emit_mov(r, v);
            self.emit_jmp(join_block);
        } else if !has_side_effects(else_expr) {
            let then_block = self.prog.new_block();
            let v = self.emit_expr(else_expr)?;
            self.emit_mov(r, v);
            self.emit_cond(cond, then_block, join_block)?;

            self.set_block(then_block);
            let v = self.emit_expr(then_expr)?;
            self.emit_mov(r, v);
            self.emit_jmp(join_block);
        } else {
            let then_block = self.prog.new_block();
            let else_block = self.prog.new_block();
            self.emit_cond(cond, then_block, else_block)?;

            self.set_block(then_block);
            let v = self.emit_expr(then_expr)?;
            self.emit_mov(r, v);
            self.emit_jmp(join_block);

            self.set_block(else_block);
            let v = self.emit_expr(else_expr)?;
            self.emit_mov(r, v);
            self.emit_jmp(join_block);
        }

        self.set_block(join_block);
        Ok(r)
    }

    // ---- stores ----

    /// Store `val` into an lvalue: a local register, a scalar global's map
    /// slot, or an array element. Aggregate lvalues accumulate instead.
    pub(crate) fn emit_store(&mut self, lvalue: &Expr, val: ValueId) -> TranslateResult<()> {
        match &lvalue.kind {
            ExprKind::Symbol(name) => {
                if let Some(slot) = self.glob.slot(name) {
                    if slot.is_stat() {
                        let fields = self.glob.scalar_stats.clone();
                        return self.emit_aggregation(&fields, slot, val, None);
                    }

                    let frame = self.reg(BPF_REG_10);
                    let r3 = self.reg(BPF_REG_3);
                    let val_ofs: i64 = match lvalue.ty {
                        ValueType::Str => {
                            let ofs = -i64::from(BPF_MAXSTRINGLEN);
                            self.emit_str_arg(r3, ofs, val, &lvalue.loc)?;
                            self.prog.use_tmp_space(BPF_MAXSTRINGLEN);
                            ofs
                        }
                        _ => {
                            self.emit_long_arg(r3, -8, val);
                            -8
                        }
                    };

                    let key_ofs = val_ofs - 4;
                    let idx = self.imm(slot.idx);
                    self.st(BPF_W, frame, key_ofs as i16, idx);
                    self.prog.use_tmp_space((-key_ofs) as u32);

                    let r1 = self.reg(BPF_REG_1);
                    self.load_map(r1, slot.map_id);
                    let r2 = self.reg(BPF_REG_2);
                    self.frame_addr(r2, key_ofs);
                    let r4 = self.reg(BPF_REG_4);
                    let zero = self.imm(0);
                    self.emit_mov(r4, zero);
                    self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);
                    Ok(())
                } else {
                    let reg = self.local_for_store(name);
                    self.emit_mov(reg, val);
                    Ok(())
                }
            }
            ExprKind::ArrayIndex { array, indexes } => {
                let slot =
                    self.glob
                        .slot(array)
                        .ok_or_else(|| TranslateError::UnknownVariable {
                            name: array.to_string(),
                            loc: lvalue.loc.clone(),
                        })?;

                let key_ofs = self.emit_array_key(indexes)?;

                if slot.is_stat() {
                    let idx = self.prog.new_reg();
                    let frame = self.reg(BPF_REG_10);
                    let ofs = self.imm(key_ofs);
                    self.binary(BPF_ADD, idx, frame, ofs);
                    let fields = self
                        .glob
                        .array_stats_of(array)
                        .cloned()
                        .ok_or_else(|| TranslateError::UnknownVariable {
                            name: array.to_string(),
                            loc: lvalue.loc.clone(),
                        })?;
                    return self.emit_aggregation(&fields, slot, val, Some((idx, key_ofs)));
                }

                let r3 = self.reg(BPF_REG_3);
                let val_ofs = match lvalue.ty {
                    ValueType::Str => {
                        let ofs = key_ofs - i64::from(BPF_MAXSTRINGLEN);
                        self.emit_str_arg(r3, ofs, val, &lvalue.loc)?;
                        ofs
                    }
                    _ => {
                        let ofs = key_ofs - 8;
                        self.emit_long_arg(r3, ofs, val);
                        ofs
                    }
                };
                self.prog.use_tmp_space((-val_ofs) as u32);

                // R2 still points at the staged key.
                let r1 = self.reg(BPF_REG_1);
                self.load_map(r1, slot.map_id);
                let r4 = self.reg(BPF_REG_4);
                let zero = self.imm(0);
                self.emit_mov(r4, zero);
                self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);
                Ok(())
            }
            _ => Err(TranslateError::Semantic {
                reason: "cannot assign to this expression".to_string(),
                loc: lvalue.loc.clone(),
            }),
        }
    }

    // ---- calls ----

    fn emit_str_concat(
        &mut self,
        pl: ValueId,
        pr: ValueId,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        if self.prog.target() == Target::KernelBpf {
            return Err(TranslateError::Unsupported {
                construct: "string concatenation".to_string(),
                loc: loc.clone(),
            });
        }
        let r1 = self.reg(BPF_REG_1);
        self.emit_mov(r1, pl);
        let r2 = self.reg(BPF_REG_2);
        self.emit_mov(r2, pr);
        self.call(helpers::BPF_FUNC_STR_CONCAT, 2);

        let result = self.prog.new_reg();
        let r0 = self.reg(BPF_REG_0);
        self.emit_mov(result, r0);
        Ok(result)
    }

    /// Lower a script-function call expression: resolve the callee, evaluate
    /// the actuals in caller scope, then inline.
    pub(crate) fn emit_function_call(
        &mut self,
        name: &str,
        args: &[Expr],
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let functions = self.functions;
        let Some(func) = functions.get(name) else {
            if name == "exit" && args.is_empty() {
                self.emit_exit_call()?;
                return Ok(self.imm(0));
            }
            return Err(TranslateError::UnknownFunction {
                name: name.to_string(),
                loc: loc.clone(),
            });
        };

        let mut actuals = Vec::with_capacity(args.len());
        for a in args {
            actuals.push(self.emit_expr(a)?);
        }
        self.emit_inline_call(func, &actuals, loc)
    }

    /// Inline a resolved callee with already-evaluated actuals. Formals bind
    /// to fresh registers in a new scope; return statements jump to the
    /// shared join block. Also the dispatch target of the embedded
    /// assembler's call directive.
    pub(crate) fn emit_inline_call(
        &mut self,
        func: &ScriptFunction,
        actuals: &[ValueId],
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        if self.func_calls.iter().any(|c| c == &func.name) {
            return Err(TranslateError::Recursion {
                name: func.name.clone(),
                loc: loc.clone(),
            });
        }
        if actuals.len() != func.formal_args.len() {
            return Err(TranslateError::Semantic {
                reason: format!(
                    "function {} expects {} arguments, got {}",
                    func.name,
                    func.formal_args.len(),
                    actuals.len()
                ),
                loc: loc.clone(),
            });
        }

        let mut scope = HashMap::new();
        for (formal, &v) in func.formal_args.iter().zip(actuals) {
            let tmp = self.prog.new_reg();
            self.emit_mov(tmp, v);
            scope.insert(formal.clone(), tmp);
        }

        let join = self.prog.new_block();
        let retval = self.prog.new_reg();
        self.func_calls.push(func.name.clone());
        self.func_return.push(join);
        self.func_return_val.push(retval);
        self.locals.push(scope);

        let body = self.emit_stmt(&func.body);

        self.locals.pop();
        self.func_return_val.pop();
        self.func_return.pop();
        self.func_calls.pop();
        body?;

        if self.in_block() {
            self.emit_jmp(join);
        }
        self.set_block(join);
        Ok(retval)
    }
}
