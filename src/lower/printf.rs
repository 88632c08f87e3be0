// Userspace-visible output leaves a program as perf events: an 8-byte message tag
// on the stack, optionally preceded (at higher addresses) by one payload slot, sent
// with perf_event_output through the perf-event map. Formatted printing decomposes
// into a START/FORMAT/args/END message sequence the runtime reassembles in order;
// format strings travel as interned-table indices rather than inline bytes. sprintf
// has no transport half: it is a single pseudo-helper call the userspace interpreter
// services directly, and is rejected for kernel-target programs.

//! Transport messages and formatted printing.

use crate::ast::{PrintSpec, ValueType};
use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::globals::PERF_EVENT_MAP_IDX;
use crate::ir::helpers;
use crate::ir::{
    Target, ValueId, BPF_DW, BPF_F_CURRENT_CPU, BPF_MAXFORMATLEN, BPF_MAXPRINTFARGS,
    BPF_MAXSPRINTFARGS, BPF_MAXSTRINGLEN, BPF_REG_0, BPF_REG_1, BPF_REG_10, BPF_REG_2, BPF_REG_3,
    BPF_REG_4, BPF_REG_5,
};

use super::Lowerer;

/// Message tags understood by the userspace transport reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMsg {
    Exit = 0,
    Error = 1,
    StoreErrorMsg = 2,
    PrintErrorMsg = 3,
    PrintfStart = 4,
    PrintfEnd = 5,
    PrintfFormat = 6,
    PrintfArgLong = 7,
    PrintfArgStr = 8,
}

/// Number of conversion specifications in a format string.
fn count_conversions(fmt: &str) -> usize {
    let mut n = 0;
    let mut it = fmt.chars();
    while let Some(c) = it.next() {
        if c == '%' {
            match it.next() {
                Some('%') | None => {}
                Some(_) => n += 1,
            }
        }
    }
    n
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    /// Send one transport message, with an optional payload slot above the
    /// tag. Format-string payloads are sent as interned-table indices; plain
    /// string payloads are copied inline into the message.
    pub(crate) fn emit_transport_msg(
        &mut self,
        msg: TransportMsg,
        arg: Option<(ValueId, ValueType)>,
    ) -> TranslateResult<()> {
        let loc = SourceLoc::default();
        let frame = self.reg(BPF_REG_10);

        let mut arg_size: i64 = 0;
        if let Some((v, ty)) = arg {
            arg_size = match ty {
                ValueType::Long => 8,
                ValueType::Str if self.prog.value(v).is_format() => 8,
                ValueType::Str => {
                    // Stacked below every live temporary allocation.
                    i64::from(BPF_MAXSTRINGLEN) + i64::from(self.prog.max_tmp_space())
                }
                ValueType::Stats => panic!("stats value in transport message"),
            };
        }
        arg_size = (arg_size + 7) & !7;
        let arg_ofs = -arg_size;
        let msg_ofs = arg_ofs - 8;
        self.prog.use_tmp_space((-msg_ofs) as u32);

        if let Some((v, ty)) = arg {
            match ty {
                ValueType::Long => self.st(BPF_DW, frame, arg_ofs as i16, v),
                ValueType::Str if self.prog.value(v).is_format() => {
                    let data = self.prog.value(v).str_data();
                    let idx = self.glob.intern_string(data) as i64;
                    let idx = self.imm(idx);
                    self.st(BPF_DW, frame, arg_ofs as i16, idx);
                }
                ValueType::Str => {
                    self.emit_string_copy(frame, arg_ofs, v, true, &loc)?;
                }
                ValueType::Stats => unreachable!(),
            }
        }

        let tag = self.imm(msg as i64);
        self.st(BPF_DW, frame, msg_ofs as i16, tag);

        let r1 = self.reg(BPF_REG_1);
        match self.in_arg0 {
            Some(ctx) => self.emit_mov(r1, ctx),
            None => {
                let zero = self.imm(0);
                self.emit_mov(r1, zero);
            }
        }
        let r2 = self.reg(BPF_REG_2);
        self.load_map(r2, PERF_EVENT_MAP_IDX as i64);
        let r3 = self.reg(BPF_REG_3);
        let cpu = self.imm(BPF_F_CURRENT_CPU);
        self.emit_mov(r3, cpu);
        let r4 = self.reg(BPF_REG_4);
        self.frame_addr(r4, msg_ofs);
        let r5 = self.reg(BPF_REG_5);
        let size = self.imm(-msg_ofs);
        self.emit_mov(r5, size);
        self.call(helpers::BPF_FUNC_PERF_EVENT_OUTPUT, 5);
        Ok(())
    }

    /// Formatted output with already-evaluated arguments. Returns the result
    /// string for the sprintf family, None for the stream family.
    pub(crate) fn emit_print_format(
        &mut self,
        format: &str,
        actuals: &[(ValueId, ValueType)],
        to_stream: bool,
        loc: &SourceLoc,
    ) -> TranslateResult<Option<ValueId>> {
        let format_bytes = format.len() + 1;
        if format_bytes > BPF_MAXFORMATLEN {
            return Err(TranslateError::Oversize {
                what: "format string",
                limit: BPF_MAXFORMATLEN,
                actual: format_bytes,
                loc: loc.clone(),
            });
        }

        if !to_stream {
            if self.prog.target() == Target::KernelBpf {
                return Err(TranslateError::Unsupported {
                    construct: "sprintf".to_string(),
                    loc: loc.clone(),
                });
            }
            if actuals.len() > BPF_MAXSPRINTFARGS {
                return Err(TranslateError::Oversize {
                    what: "sprintf argument list",
                    limit: BPF_MAXSPRINTFARGS,
                    actual: actuals.len(),
                    loc: loc.clone(),
                });
            }

            let fmt = self.prog.new_format_str(format);
            let r1 = self.reg(BPF_REG_1);
            self.emit_mov(r1, fmt);
            let r2 = self.reg(BPF_REG_2);
            let len = self.imm(format_bytes as i64);
            self.emit_mov(r2, len);
            for (i, &(v, _)) in actuals.iter().enumerate() {
                let arg = self.reg(BPF_REG_3 + i as u8);
                self.emit_mov(arg, v);
            }
            self.call(helpers::BPF_FUNC_SPRINTF, actuals.len() as u8 + 2);

            let result = self.prog.new_reg();
            let r0 = self.reg(BPF_REG_0);
            self.emit_mov(result, r0);
            return Ok(Some(result));
        }

        let expected = count_conversions(format);
        if expected != actuals.len() {
            return Err(TranslateError::FormatArity {
                expected,
                found: actuals.len(),
                loc: loc.clone(),
            });
        }

        let nargs = self.imm(actuals.len() as i64);
        self.emit_transport_msg(TransportMsg::PrintfStart, Some((nargs, ValueType::Long)))?;
        let fmt = self.prog.new_format_str(format);
        self.emit_transport_msg(TransportMsg::PrintfFormat, Some((fmt, ValueType::Str)))?;
        for &(v, ty) in actuals {
            let tag = match ty {
                ValueType::Long => TransportMsg::PrintfArgLong,
                ValueType::Str => TransportMsg::PrintfArgStr,
                ValueType::Stats => {
                    return Err(TranslateError::Semantic {
                        reason: "cannot print a raw stats object".to_string(),
                        loc: loc.clone(),
                    })
                }
            };
            self.emit_transport_msg(tag, Some((v, ty)))?;
        }
        self.emit_transport_msg(TransportMsg::PrintfEnd, None)?;
        Ok(None)
    }

    /// Lower a print-family expression. Returns the sprintf result value, or
    /// None for stream output.
    pub(crate) fn emit_print(
        &mut self,
        spec: &PrintSpec,
        loc: &SourceLoc,
    ) -> TranslateResult<Option<ValueId>> {
        if spec.args.len() > BPF_MAXPRINTFARGS {
            return Err(TranslateError::Oversize {
                what: "print argument list",
                limit: BPF_MAXPRINTFARGS,
                actual: spec.args.len(),
                loc: loc.clone(),
            });
        }

        let mut actuals = Vec::with_capacity(spec.args.len());
        for a in &spec.args {
            if a.ty == ValueType::Stats {
                return Err(TranslateError::Semantic {
                    reason: "cannot print a raw stats object".to_string(),
                    loc: loc.clone(),
                });
            }
            let v = self.emit_expr(a)?;
            actuals.push((v, a.ty));
        }

        let format = match &spec.format {
            Some(f) => f.clone(),
            None => {
                // Unformatted print: synthesize one default conversion per
                // argument.
                let mut f = String::new();
                for (_, ty) in &actuals {
                    f.push_str(match ty {
                        ValueType::Long => "%ld",
                        _ => "%s",
                    });
                }
                f
            }
        };

        self.emit_print_format(&format, &actuals, spec.to_stream, loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_conversions() {
        assert_eq!(count_conversions("no args"), 0);
        assert_eq!(count_conversions("%d and %s"), 2);
        assert_eq!(count_conversions("100%% done: %ld"), 1);
        assert_eq!(count_conversions("dangling %"), 0);
    }
}
