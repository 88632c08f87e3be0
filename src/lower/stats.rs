// Statistics aggregates are decomposed into one ordinary hash map per component
// field (count, sum), all sharing the aggregate's key layout. Accumulating a sample
// is a read-modify-write across those field maps with a first-sample special case;
// extraction is not expressible in map operations from inside BPF and is delegated
// to the userspace interpreter through the stapbpf_stat_get pseudo-helper, which
// receives the aggregate id, the key address, and the requested component.

//! Statistics aggregation and extraction.

use crate::ast::{Expr, ExprKind, StatFunc, ValueType};
use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::globals::{MapSlot, StatsMap, STAT_FIELDS};
use crate::ir::helpers;
use crate::ir::{
    Condition, Target, ValueId, BPF_ADD, BPF_DW, BPF_MAXSTRINGLEN, BPF_REG_0, BPF_REG_1,
    BPF_REG_10, BPF_REG_2, BPF_REG_3, BPF_REG_4, BPF_W,
};

use super::Lowerer;

/// Component selector passed to stapbpf_stat_get, matching the interpreter's
/// extractor table.
fn stat_component(func: StatFunc) -> i64 {
    match func {
        StatFunc::Avg => 0,
        StatFunc::Count => 1,
        StatFunc::Sum => 2,
    }
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    /// dest = field map value at `idx`, or 0 when the key is absent.
    fn emit_statmap_lookup(&mut self, dest: ValueId, map_id: i64, idx: ValueId) {
        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, map_id);
        let r2 = self.reg(BPF_REG_2);
        self.emit_mov(r2, idx);
        self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);

        let zero = self.imm(0);
        self.emit_mov(dest, zero);
        let r0 = self.reg(BPF_REG_0);
        let hit = self.prog.new_block();
        let join = self.prog.new_block();
        self.jcond(Condition::Eq, r0, zero, join, hit);
        self.set_block(hit);
        self.ld(BPF_DW, dest, r0, 0);
        self.emit_jmp(join);
        self.set_block(join);
    }

    /// Write `val` to the field map at `idx`, staging the value just below
    /// the key bytes at `idx_ofs`.
    fn emit_statmap_update(&mut self, map_id: i64, idx: ValueId, idx_ofs: i64, val: ValueId) {
        let val_ofs = (idx_ofs - 8) & !7;
        self.prog.use_tmp_space((-val_ofs) as u32);

        let r1 = self.reg(BPF_REG_1);
        self.load_map(r1, map_id);
        let r2 = self.reg(BPF_REG_2);
        self.emit_mov(r2, idx);
        let r3 = self.reg(BPF_REG_3);
        self.emit_long_arg(r3, val_ofs, val);
        let r4 = self.reg(BPF_REG_4);
        let zero = self.imm(0);
        self.emit_mov(r4, zero);
        self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);
    }

    /// Accumulate one sample into an aggregate. `idx` is the key address and
    /// its stack offset for array aggregates; None selects the scalar slot.
    pub(crate) fn emit_aggregation(
        &mut self,
        fields: &StatsMap,
        slot: MapSlot,
        val: ValueId,
        idx: Option<(ValueId, i64)>,
    ) -> TranslateResult<()> {
        let (idx, idx_ofs) = match idx {
            Some(pair) => pair,
            None => {
                let frame = self.reg(BPF_REG_10);
                let key = self.imm(slot.idx);
                self.st(BPF_W, frame, -4, key);
                self.prog.use_tmp_space(4);
                let addr = self.prog.new_reg();
                let m4 = self.imm(-4);
                self.binary(BPF_ADD, addr, frame, m4);
                (addr, -4)
            }
        };

        let count_map = fields[STAT_FIELDS[0]] as i64;
        let sum_map = fields[STAT_FIELDS[1]] as i64;

        let count = self.prog.new_reg();
        self.emit_statmap_lookup(count, count_map, idx);

        let zero = self.imm(0);
        let first = self.prog.new_block();
        let accum = self.prog.new_block();
        let join = self.prog.new_block();
        self.jcond(Condition::Eq, count, zero, first, accum);

        // First sample for this key.
        self.set_block(first);
        let one = self.imm(1);
        self.emit_statmap_update(count_map, idx, idx_ofs, one);
        self.emit_statmap_update(sum_map, idx, idx_ofs, val);
        self.emit_jmp(join);

        self.set_block(accum);
        self.binary(BPF_ADD, count, count, one);
        self.emit_statmap_update(count_map, idx, idx_ofs, count);
        let sum = self.prog.new_reg();
        self.emit_statmap_lookup(sum, sum_map, idx);
        self.binary(BPF_ADD, sum, sum, val);
        self.emit_statmap_update(sum_map, idx, idx_ofs, sum);
        self.emit_jmp(join);

        self.set_block(join);
        Ok(())
    }

    /// Lower a statistics extraction like @count(x) or @avg(a[i]).
    pub(crate) fn emit_stat_op(
        &mut self,
        func: StatFunc,
        stat: &Expr,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        if self.prog.target() == Target::KernelBpf {
            return Err(TranslateError::Unsupported {
                construct: "statistics extraction function".to_string(),
                loc: loc.clone(),
            });
        }

        let r2 = self.reg(BPF_REG_2);
        let agg: i64;
        match &stat.kind {
            ExprKind::Symbol(name) => {
                let slot = self.glob.slot(name).ok_or_else(|| {
                    TranslateError::UnknownVariable {
                        name: name.clone(),
                        loc: loc.clone(),
                    }
                })?;
                agg = 0;
                let key = self.imm(slot.idx);
                self.emit_long_arg(r2, -8, key);
                self.prog.use_tmp_space(8);
            }
            ExprKind::ArrayIndex { array, indexes } => {
                agg = self.glob.aggregate_id(array).ok_or_else(|| {
                    TranslateError::UnknownVariable {
                        name: array.clone(),
                        loc: loc.clone(),
                    }
                })? as i64;

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
            }
            _ => {
                return Err(TranslateError::Semantic {
                    reason: "expected statistics variable".to_string(),
                    loc: loc.clone(),
                })
            }
        }

        let r1 = self.reg(BPF_REG_1);
        let agg = self.imm(agg);
        self.emit_mov(r1, agg);
        let r3 = self.reg(BPF_REG_3);
        let comp = self.imm(stat_component(func));
        self.emit_mov(r3, comp);
        self.call(helpers::BPF_FUNC_STAPBPF_STAT_GET, 3);

        let result = self.prog.new_reg();
        let r0 = self.reg(BPF_REG_0);
        self.emit_mov(result, r0);
        Ok(result)
    }
}
