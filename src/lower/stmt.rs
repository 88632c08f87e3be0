// Statement lowering. Control statements build their diamond or loop shape out of
// explicit blocks and leave the cursor on the join; a statement that ends the block
// (next, break, an exit call) clears the cursor, and the rest of the enclosing
// statement list is unreachable and skipped. Loop context is stack-discipline:
// break and continue resolve against the innermost pushed pair, try/catch against
// the innermost catch target. foreach drives the map_get_next_key pseudo-helper,
// which hands back one key per call through a stack slot and applies the loop's
// registered sort descriptor in userspace.

//! Statement lowering.

use crate::ast::{DeleteTarget, Expr, IndexType, Stmt, ValueType};
use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::globals::{ForeachInfo, STAT_FIELDS, STAT_ITER_FIELD};
use crate::ir::helpers;
use crate::ir::{
    Condition, Target, ValueId, BPF_ADD, BPF_DW, BPF_MAXSTRINGLEN, BPF_REG_0, BPF_REG_1,
    BPF_REG_10, BPF_REG_2, BPF_REG_3, BPF_REG_4, BPF_REG_5, BPF_W,
};

use super::Lowerer;

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    pub(crate) fn emit_stmt(&mut self, s: &Stmt) -> TranslateResult<()> {
        match s {
            Stmt::Block(stmts) => {
                for s in stmts {
                    // A next/break/exit ends the block; the rest of the list
                    // is unreachable.
                    if !self.in_block() {
                        break;
                    }
                    self.emit_stmt(s)?;
                }
                Ok(())
            }
            Stmt::Expr(e) => {
                self.emit_expr(e)?;
                Ok(())
            }
            Stmt::Null => Ok(()),
            Stmt::If {
                cond,
                then_stmt,
                else_stmt,
                ..
            } => self.emit_if(cond, then_stmt, else_stmt.as_deref()),
            Stmt::For {
                init,
                cond,
                update,
                body,
                loc,
            } => self.emit_for(init.as_ref(), cond.as_ref(), update.as_ref(), body, loc),
            Stmt::Foreach {
                indexes,
                array,
                value,
                sort_direction,
                sort_column,
                limit,
                body,
                loc,
            } => self.emit_foreach(
                indexes,
                array,
                value.as_deref(),
                *sort_direction,
                *sort_column,
                limit.as_ref(),
                body,
                loc,
            ),
            Stmt::Break(loc) => match self.loop_break.last().copied() {
                Some(b) => {
                    self.emit_jmp(b);
                    Ok(())
                }
                None => Err(TranslateError::OutsideLoop {
                    construct: "break",
                    loc: loc.clone(),
                }),
            },
            Stmt::Continue(loc) => match self.loop_cont.last().copied() {
                Some(b) => {
                    self.emit_jmp(b);
                    Ok(())
                }
                None => Err(TranslateError::OutsideLoop {
                    construct: "continue",
                    loc: loc.clone(),
                }),
            },
            Stmt::Next(loc) => {
                if !self.func_return.is_empty() {
                    return Err(TranslateError::Semantic {
                        reason: "cannot 'next' within a function".to_string(),
                        loc: loc.clone(),
                    });
                }
                let exit = self.get_exit_block()?;
                self.emit_jmp(exit);
                Ok(())
            }
            Stmt::Return { value, loc } => {
                let Some(&ret_block) = self.func_return.last() else {
                    return Err(TranslateError::Semantic {
                        reason: "cannot 'return' outside a function".to_string(),
                        loc: loc.clone(),
                    });
                };
                if let Some(e) = value {
                    let retval = *self
                        .func_return_val
                        .last()
                        .unwrap_or(&self.error_status);
                    let v = self.emit_expr(e)?;
                    self.emit_mov(retval, v);
                }
                self.emit_jmp(ret_block);
                Ok(())
            }
            Stmt::Delete { target, loc } => self.emit_delete(target, loc),
            Stmt::TryCatch {
                body,
                catch_var,
                handler,
                ..
            } => self.emit_try_catch(body, catch_var.as_deref(), handler),
            Stmt::Embedded { code, loc } => self.emit_embedded_code(code, loc),
        }
    }

    fn emit_if(
        &mut self,
        cond: &Expr,
        then_stmt: &Stmt,
        else_stmt: Option<&Stmt>,
    ) -> TranslateResult<()> {
        let then_block = self.prog.new_block();
        let join_block = self.prog.new_block();

        let else_block = match else_stmt {
            Some(_) => {
                let b = self.prog.new_block();
                self.emit_cond(cond, then_block, b)?;
                Some(b)
            }
            None => {
                self.emit_cond(cond, then_block, join_block)?;
                None
            }
        };

        self.set_block(then_block);
        self.emit_stmt(then_stmt)?;
        if self.in_block() {
            self.emit_jmp(join_block);
        }

        if let (Some(b), Some(s)) = (else_block, else_stmt) {
            self.set_block(b);
            self.emit_stmt(s)?;
            if self.in_block() {
                self.emit_jmp(join_block);
            }
        }

        self.set_block(join_block);
        Ok(())
    }

    fn emit_for(
        &mut self,
        init: Option<&Expr>,
        cond: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        loc: &SourceLoc,
    ) -> TranslateResult<()> {
        if !self.prog.target().allows_loops() {
            return Err(TranslateError::Unsupported {
                construct: "loop".to_string(),
                loc: loc.clone(),
            });
        }

        if let Some(e) = init {
            self.emit_expr(e)?;
        }

        let test_block = self.prog.new_block();
        let body_block = self.prog.new_block();
        let iter_block = self.prog.new_block();
        let join_block = self.prog.new_block();

        self.emit_jmp(test_block);

        self.set_block(body_block);
        self.loop_break.push(join_block);
        self.loop_cont.push(iter_block);
        self.emit_stmt(body)?;
        self.loop_cont.pop();
        self.loop_break.pop();
        if self.in_block() {
            self.emit_jmp(iter_block);
        }

        self.set_block(iter_block);
        if let Some(e) = update {
            self.emit_expr(e)?;
        }
        self.emit_jmp(test_block);

        self.set_block(test_block);
        match cond {
            Some(e) => self.emit_cond(e, body_block, join_block)?,
            None => self.emit_jmp(body_block),
        }

        self.set_block(join_block);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_foreach(
        &mut self,
        indexes: &[String],
        array: &str,
        value: Option<&str>,
        sort_direction: i64,
        sort_column: u64,
        limit: Option<&Expr>,
        body: &Stmt,
        loc: &SourceLoc,
    ) -> TranslateResult<()> {
        if !self.prog.target().allows_loops() {
            return Err(TranslateError::Unsupported {
                construct: "loop".to_string(),
                loc: loc.clone(),
            });
        }

        let slot = self
            .glob
            .slot(array)
            .ok_or_else(|| TranslateError::UnknownVariable {
                name: array.to_string(),
                loc: loc.clone(),
            })?;
        let (index_types, value_type) = {
            let (it, vt) =
                self.glob
                    .array_layout(array)
                    .ok_or_else(|| TranslateError::UnknownVariable {
                        name: array.to_string(),
                        loc: loc.clone(),
                    })?;
            (it.to_vec(), vt)
        };
        if indexes.len() != index_types.len() {
            return Err(TranslateError::Semantic {
                reason: format!(
                    "foreach over {} expects {} index variables, got {}",
                    array,
                    index_types.len(),
                    indexes.len()
                ),
                loc: loc.clone(),
            });
        }

        let composite_key = indexes.len() != 1;
        let keys: Vec<ValueId> = indexes.iter().map(|n| self.local_for_store(n)).collect();

        // Static layout of the composite key, recorded for the runtime's
        // sorted iteration.
        let mut info = ForeachInfo {
            sort_direction,
            sort_column,
            ..ForeachInfo::default()
        };
        let mut key_offsets = Vec::with_capacity(index_types.len());
        for (k, it) in index_types.iter().enumerate() {
            let column_size = match it {
                IndexType::Long => 8,
                IndexType::Str => u64::from(BPF_MAXSTRINGLEN),
            };
            if info.sort_column == (k + 1) as u64 {
                info.sort_column_size = column_size;
                info.sort_column_ofs = info.keysize as i64;
            }
            key_offsets.push(info.keysize as i64);
            info.keysize += column_size;
        }
        if !composite_key {
            // Signals the runtime to treat the key as a single value.
            info.sort_column_ofs = -1;
        }
        let foreach_id = self.glob.intern_foreach_info(info) as i64;

        let mut map_id = slot.map_id;
        if slot.is_stat() {
            // Keys can be iterated from any one of the aggregate's field
            // maps.
            let fields =
                self.glob
                    .array_stats_of(array)
                    .ok_or_else(|| TranslateError::UnknownVariable {
                        name: array.to_string(),
                        loc: loc.clone(),
                    })?;
            map_id = fields[STAT_ITER_FIELD] as i64;
            if sort_direction != 0 && sort_column == 0 {
                return Err(TranslateError::Semantic {
                    reason: "unsupported sorted iteration on stat aggregate".to_string(),
                    loc: loc.clone(),
                });
            }
        }

        // The stack holds the current and next key reference.
        let keyref_size: i64 = 8;
        let key_ofs = -keyref_size;
        let newkey_ofs = -2 * keyref_size;
        self.prog.use_tmp_space((2 * keyref_size) as u32);

        let limit_val = match limit {
            Some(e) => {
                let l = self.prog.new_reg();
                let v = self.emit_expr(e)?;
                self.emit_mov(l, v);
                l
            }
            None => self.imm(-1),
        };
        let keyref = if composite_key {
            self.prog.new_reg()
        } else {
            keys[0]
        };

        let zero = self.imm(0);
        let id = self.imm(foreach_id);
        let frame = self.reg(BPF_REG_10);
        let body_block = self.prog.new_block();
        let load_block = self.prog.new_block();
        let iter_block = self.prog.new_block();
        let join_block = self.prog.new_block();

        // Fetch the first key.
        let r0 = self.reg(BPF_REG_0);
        let r1 = self.reg(BPF_REG_1);
        let r2 = self.reg(BPF_REG_2);
        let r3 = self.reg(BPF_REG_3);
        let r4 = self.reg(BPF_REG_4);
        let r5 = self.reg(BPF_REG_5);
        self.load_map(r1, map_id);
        self.emit_mov(r2, zero);
        self.frame_addr(r3, newkey_ofs);
        self.emit_mov(r4, id);
        self.emit_mov(r5, limit_val);
        self.call(helpers::BPF_FUNC_MAP_GET_NEXT_KEY, 5);
        self.jcond(Condition::Ne, r0, zero, join_block, load_block);

        self.set_block(body_block);
        self.loop_break.push(join_block);
        self.loop_cont.push(iter_block);
        self.emit_stmt(body)?;
        self.loop_cont.pop();
        self.loop_break.pop();
        if self.in_block() {
            self.emit_jmp(iter_block);
        }

        // Fetch the next key after the current one.
        self.set_block(iter_block);
        self.st(BPF_DW, frame, key_ofs as i16, keyref);
        self.load_map(r1, map_id);
        self.frame_addr(r2, key_ofs);
        self.frame_addr(r3, newkey_ofs);
        self.emit_mov(r4, id);
        self.emit_mov(r5, limit_val);
        self.call(helpers::BPF_FUNC_MAP_GET_NEXT_KEY, 5);
        self.jcond(Condition::Ne, r0, zero, join_block, load_block);

        // Unpack the delivered key. For single-key arrays the slot already
        // holds the value (a long, or a pointer to the string bytes).
        self.set_block(load_block);
        self.ld(BPF_DW, keyref, frame, newkey_ofs as i16);
        if composite_key {
            for (k, it) in index_types.iter().enumerate() {
                match it {
                    IndexType::Long => {
                        self.ld(BPF_DW, keys[k], keyref, key_offsets[k] as i16)
                    }
                    IndexType::Str => {
                        let off = self.imm(key_offsets[k]);
                        self.binary(BPF_ADD, keys[k], keyref, off);
                    }
                }
            }
        }

        if let Some(value_name) = value {
            if slot.is_stat() {
                return Err(TranslateError::Semantic {
                    reason: "unsupported value iteration on stat aggregate".to_string(),
                    loc: loc.clone(),
                });
            }
            let val = self.local_for_store(value_name);
            let load_value = self.prog.new_block();

            self.load_map(r1, map_id);
            if !composite_key && index_types[0] == IndexType::Long {
                // The not-yet-clobbered next-key slot doubles as the key
                // address.
                self.frame_addr(r2, newkey_ofs);
            } else {
                self.emit_mov(r2, keyref);
            }
            self.call(helpers::BPF_FUNC_MAP_LOOKUP_ELEM, 2);
            self.jcond(Condition::Eq, r0, zero, join_block, load_value);

            self.set_block(load_value);
            match value_type {
                ValueType::Str => self.emit_mov(val, r0),
                _ => self.ld(BPF_DW, val, r0, 0),
            }
        }

        if limit.is_some() {
            let m1 = self.imm(-1);
            self.binary(BPF_ADD, limit_val, limit_val, m1);
        }
        self.emit_jmp(body_block);

        self.set_block(join_block);
        Ok(())
    }

    fn emit_try_catch(
        &mut self,
        body: &Stmt,
        catch_var: Option<&str>,
        handler: &Stmt,
    ) -> TranslateResult<()> {
        let catch_block = self.prog.new_block();
        let join_block = self.prog.new_block();

        // Error raises inside the body divert to the catch block, pushing
        // their message for the handler.
        self.catch_jump.push(catch_block);
        self.emit_stmt(body)?;
        self.catch_jump.pop();
        if self.in_block() {
            self.emit_jmp(join_block);
        }

        self.set_block(catch_block);
        if let Some(name) = catch_var {
            let local = self.local_for_store(name);
            match self.catch_msg.pop() {
                Some(msg) => self.emit_mov(local, msg),
                None => {
                    // No raise in the body; the handler is unreachable but
                    // its variable still needs a binding.
                    let empty = self.prog.new_str("");
                    self.emit_mov(local, empty);
                }
            }
        }
        self.emit_stmt(handler)?;
        if self.in_block() {
            self.emit_jmp(join_block);
        }

        self.set_block(join_block);
        Ok(())
    }

    fn emit_delete(&mut self, target: &DeleteTarget, loc: &SourceLoc) -> TranslateResult<()> {
        match target {
            DeleteTarget::Symbol(name) => {
                if let Some(slot) = self.glob.slot(name) {
                    if slot.is_stat() {
                        return Err(TranslateError::Semantic {
                            reason: "unsupported delete operation on statistics aggregate"
                                .to_string(),
                            loc: loc.clone(),
                        });
                    }
                    // Scalars are preallocated; deletion overwrites the
                    // element with a zeroed value, 0 for longs and the empty
                    // string for string slots.
                    let vsize = i64::from(self.glob.maps[slot.map_id as usize].value_size);
                    let frame = self.reg(BPF_REG_10);
                    let zero = self.imm(0);
                    let val_ofs = -vsize;
                    for i in 0..vsize / 8 {
                        self.st(BPF_DW, frame, (val_ofs + i * 8) as i16, zero);
                    }
                    let r3 = self.reg(BPF_REG_3);
                    self.frame_addr(r3, val_ofs);

                    let key_ofs = val_ofs - 4;
                    let idx = self.imm(slot.idx);
                    self.st(BPF_W, frame, key_ofs as i16, idx);
                    self.prog.use_tmp_space((-key_ofs) as u32);

                    let r1 = self.reg(BPF_REG_1);
                    self.load_map(r1, slot.map_id);
                    let r2 = self.reg(BPF_REG_2);
                    self.frame_addr(r2, key_ofs);
                    let r4 = self.reg(BPF_REG_4);
                    self.emit_mov(r4, zero);
                    self.call(helpers::BPF_FUNC_MAP_UPDATE_ELEM, 4);
                    Ok(())
                } else if let Some(local) = self.lookup_local(name) {
                    let zero = self.imm(0);
                    self.emit_mov(local, zero);
                    Ok(())
                } else {
                    Err(TranslateError::UnknownVariable {
                        name: name.clone(),
                        loc: loc.clone(),
                    })
                }
            }
            DeleteTarget::ArrayElement { array, indexes } => {
                let slot =
                    self.glob
                        .slot(array)
                        .ok_or_else(|| TranslateError::UnknownVariable {
                            name: array.to_string(),
                            loc: loc.clone(),
                        })?;
                if slot.is_stat() {
                    return Err(TranslateError::Semantic {
                        reason: "unsupported delete operation on statistics aggregate".to_string(),
                        loc: loc.clone(),
                    });
                }

                self.emit_array_key(indexes)?;
                let r1 = self.reg(BPF_REG_1);
                self.load_map(r1, slot.map_id);
                self.call(helpers::BPF_FUNC_MAP_DELETE_ELEM, 2);
                Ok(())
            }
            DeleteTarget::Array(array) => self.emit_delete_whole_array(array, loc),
        }
    }

    /// Drain every key of an array by repeatedly fetching the first key and
    /// deleting it. Aggregates drain each of their field maps.
    fn emit_delete_whole_array(&mut self, array: &str, loc: &SourceLoc) -> TranslateResult<()> {
        if self.prog.target() == Target::KernelBpf {
            return Err(TranslateError::Unsupported {
                construct: "whole-array delete".to_string(),
                loc: loc.clone(),
            });
        }

        let slot = self
            .glob
            .slot(array)
            .ok_or_else(|| TranslateError::UnknownVariable {
                name: array.to_string(),
                loc: loc.clone(),
            })?;
        let index_types: Vec<IndexType> = {
            let (it, _) =
                self.glob
                    .array_layout(array)
                    .ok_or_else(|| TranslateError::UnknownVariable {
                        name: array.to_string(),
                        loc: loc.clone(),
                    })?;
            it.to_vec()
        };

        let keysize: u64 = index_types
            .iter()
            .map(|it| match it {
                IndexType::Long => 8,
                IndexType::Str => u64::from(BPF_MAXSTRINGLEN),
            })
            .sum();
        let single = index_types.len() == 1;
        let info = ForeachInfo {
            keysize,
            sort_column_ofs: if single { -1 } else { 0 },
            ..ForeachInfo::default()
        };
        let foreach_id = self.glob.intern_foreach_info(info) as i64;

        let map_ids: Vec<i64> = if slot.is_stat() {
            let fields =
                self.glob
                    .array_stats_of(array)
                    .ok_or_else(|| TranslateError::UnknownVariable {
                        name: array.to_string(),
                        loc: loc.clone(),
                    })?;
            STAT_FIELDS.iter().map(|f| fields[f] as i64).collect()
        } else {
            vec![slot.map_id]
        };

        let key_ofs: i64 = -8;
        self.prog.use_tmp_space(8);
        let zero = self.imm(0);
        let id = self.imm(foreach_id);
        let neg1 = self.imm(-1);
        let frame = self.reg(BPF_REG_10);

        for map_id in map_ids {
            let head = self.prog.new_block();
            let del = self.prog.new_block();
            let done = self.prog.new_block();
            self.emit_jmp(head);

            // Fetch the current first key; an error return means empty.
            self.set_block(head);
            let r0 = self.reg(BPF_REG_0);
            let r1 = self.reg(BPF_REG_1);
            let r2 = self.reg(BPF_REG_2);
            let r3 = self.reg(BPF_REG_3);
            let r4 = self.reg(BPF_REG_4);
            let r5 = self.reg(BPF_REG_5);
            self.load_map(r1, map_id);
            self.emit_mov(r2, zero);
            self.frame_addr(r3, key_ofs);
            self.emit_mov(r4, id);
            self.emit_mov(r5, neg1);
            self.call(helpers::BPF_FUNC_MAP_GET_NEXT_KEY, 5);
            self.jcond(Condition::Ne, r0, zero, done, del);

            self.set_block(del);
            if single && index_types[0] == IndexType::Long {
                self.frame_addr(r2, key_ofs);
            } else {
                let keyref = self.prog.new_reg();
                self.ld(BPF_DW, keyref, frame, key_ofs as i16);
                self.emit_mov(r2, keyref);
            }
            self.load_map(r1, map_id);
            self.call(helpers::BPF_FUNC_MAP_DELETE_ELEM, 2);
            self.emit_jmp(head);

            self.set_block(done);
        }
        Ok(())
    }
}
