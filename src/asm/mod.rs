// The embedded assembler gives tapset-style library code direct access to the
// instruction set, plus a handful of directives that tie into the surrounding
// translation: alloc reserves stack, jump_to_catch and register_error hook into the
// try/catch and soft-error machinery, terminate routes to the shared exit path, and
// call dispatches to helpers, the formatted-print lowering, or the exit builtin.
// Assembly is parsed in one tokenizer pass, then a block-table pass resolves labels
// and assigns every branch a landing block (synthesizing one where a conditional
// falls through into unlabeled code), and a final pass emits into the CFG. The
// tokenizer is deliberately tolerant: whitespace inside operands is dropped,
// statements end at ';' or at a newline not preceded by a comma, and C-style
// comments are skipped anywhere.

//! Embedded assembly parsing and emission.

pub mod opcodes;

use hashbrown::HashMap;

use crate::ast::ValueType;
use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::ir::helpers;
use crate::ir::{
    bpf_class, bpf_op, BlockId, Condition, Target, ValueId, BPF_ADD, BPF_ALU, BPF_ALU64,
    BPF_CALL, BPF_DW, BPF_EXIT, BPF_F_CURRENT_CPU, BPF_IMM, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT,
    BPF_JLE, BPF_JLT, BPF_JMP, BPF_JNE, BPF_JSET, BPF_JSGE, BPF_JSGT, BPF_JSLE, BPF_JSLT, BPF_LD,
    BPF_LDX, BPF_LD_MAP, BPF_MAXFORMATLEN, BPF_MAXSTRINGLEN, BPF_MOV, BPF_NEG, BPF_REG_0,
    BPF_REG_1, BPF_REG_10, BPF_ST, BPF_STX, BPF_X,
};
use crate::lower::{Lowerer, TransportMsg};

use opcodes::{opcode_by_name, opcode_category, variant_imm, OpCategory};

/// One parsed assembly statement.
#[derive(Debug, Clone)]
struct AsmStmt {
    kind: AsmKind,
    loc: SourceLoc,
}

#[derive(Debug, Clone)]
enum AsmKind {
    Label(String),
    Alloc { dest: String, size: i64, align: bool },
    JumpToCatch { msg: String },
    RegisterError { msg: String },
    Terminate,
    Call { dest: String, params: Vec<String> },
    Opcode(OpStmt),
}

/// A plain instruction, with branch metadata filled in by the block-table
/// pass.
#[derive(Debug, Clone)]
struct OpStmt {
    code: u16,
    dest: String,
    src1: String,
    off: i64,
    imm: i64,
    jmp_target: String,
    has_jmp_target: bool,
    has_fallthrough: bool,
    fallthrough: String,
}

fn asm_err(reason: impl Into<String>, loc: &SourceLoc) -> TranslateError {
    TranslateError::AsmSyntax {
        reason: reason.into(),
        loc: loc.clone(),
    }
}

/// Parse a signed integer with the usual C radix prefixes.
fn parse_i64(s: &str) -> Option<i64> {
    let (neg, t) = match s.strip_prefix('-') {
        Some(t) => (true, t),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let v = if let Some(h) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(h, 16).ok()?
    } else if t.len() > 1 && t.starts_with('0') {
        i64::from_str_radix(&t[1..], 8).ok()?
    } else {
        t.parse::<i64>().ok()?
    };
    Some(if neg { v.wrapping_neg() } else { v })
}

fn is_numeric(s: &str) -> bool {
    parse_i64(s).is_some()
}

/// Immediate operand, accepting the named constants and "-" for zero.
fn parse_imm_optional(s: &str) -> Option<i64> {
    match s {
        "BPF_MAXSTRINGLEN" => Some(i64::from(BPF_MAXSTRINGLEN)),
        "BPF_F_CURRENT_CPU" => Some(BPF_F_CURRENT_CPU),
        "-" => Some(0),
        _ => parse_i64(s),
    }
}

fn parse_imm(s: &str, loc: &SourceLoc) -> TranslateResult<i64> {
    parse_imm_optional(s).ok_or_else(|| TranslateError::InvalidOperand {
        token: s.to_string(),
        loc: loc.clone(),
    })
}

/// Split an operand of the form [reg+off] or [reg-off].
fn parse_reg_offset(s: &str, loc: &SourceLoc) -> TranslateResult<(String, i64)> {
    let inner = s
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| asm_err(format!("expected [reg+off] or [reg-off], found '{s}'"), loc))?;
    let sep = inner
        .find(['+', '-'])
        .ok_or_else(|| asm_err(format!("expected [reg+off] or [reg-off], found '{s}'"), loc))?;
    let reg = inner[..sep].to_string();
    let mut off = parse_imm(&inner[sep + 1..], loc)?;
    if inner.as_bytes()[sep] == b'-' {
        off = -off;
    }
    Ok((reg, off))
}

/// Advance a source location over `text`.
fn advance_loc(base: &SourceLoc, text: &[char]) -> SourceLoc {
    let mut loc = base.clone();
    for &c in text {
        if c == '\n' {
            loc.line += 1;
            loc.column = 1;
        } else {
            loc.column += 1;
        }
    }
    loc
}

/// Pull the next statement's argument list out of the character stream.
/// Returns the arguments, whether the statement was a "name:" label, the
/// offset of its first argument, and the resume position. None at end of
/// input.
fn tokenize_stmt(code: &[char], mut start: usize) -> (Vec<String>, bool, usize, usize) {
    let n = code.len();
    loop {
        let mut args: Vec<String> = Vec::new();
        let mut arg = String::new();
        let mut in_comment = false;
        let mut in_string = false;
        let mut in_starting_keyword = true;
        let mut trailing_comma = false;
        let mut is_label = false;
        let mut save_start = start;

        let mut pos = start;
        while pos < n {
            let c = code[pos];
            let c2 = if pos + 1 < n { code[pos + 1] } else { '\0' };
            if in_comment {
                if c == '*' && c2 == '/' {
                    pos += 1;
                    in_comment = false;
                }
            } else if in_string {
                if c == '"' {
                    arg.push(c);
                    in_string = false;
                } else if c == '\\' && c2 == '"' {
                    pos += 1;
                    arg.push(c);
                    arg.push(c2);
                } else {
                    arg.push(c);
                }
            } else if c == ';' || (c == '\n' && !trailing_comma) {
                if !arg.is_empty() {
                    args.push(std::mem::take(&mut arg));
                }
                pos += 1;
                break;
            } else if c == ':' {
                is_label = true;
                pos += 1;
                break;
            } else if c == ',' || (c.is_whitespace() && in_starting_keyword && !arg.is_empty()) {
                if !arg.is_empty() {
                    args.push(std::mem::take(&mut arg));
                }
                in_starting_keyword = false;
                trailing_comma = c == ',';
            } else if c.is_whitespace() {
                // skip
            } else if c == '/' && c2 == '*' {
                pos += 1;
                in_comment = true;
            } else if c == '"' {
                if arg.is_empty() && args.is_empty() {
                    save_start = pos;
                }
                arg.push(c);
                in_string = true;
                in_starting_keyword = false;
                trailing_comma = false;
            } else {
                if arg.is_empty() && args.is_empty() {
                    save_start = pos;
                }
                arg.push(c);
                trailing_comma = false;
            }
            pos += 1;
        }
        if !arg.is_empty() {
            args.push(arg);
        }

        if args.is_empty() && pos >= n {
            return (args, false, save_start, pos);
        }
        if args.is_empty() {
            // Empty statement; keep scanning.
            start = pos;
            continue;
        }
        return (args, is_label, save_start, pos);
    }
}

/// Parse a plain instruction from its argument list.
fn parse_asm_opcode(args: &[String], loc: &SourceLoc) -> TranslateResult<OpStmt> {
    let (code, numeric_opcode) = match parse_i64(&args[0]) {
        Some(v) => {
            let code = u16::try_from(v)
                .map_err(|_| asm_err(format!("opcode '{}' out of range", args[0]), loc))?;
            (code, true)
        }
        None => match opcode_by_name(&args[0]) {
            Some(code) => (code, false),
            None => return Err(asm_err(format!("invalid opcode '{}'", args[0]), loc)),
        },
    };
    let tentative_code = code;

    let has_jmp_target = bpf_class(code) == BPF_JMP
        && bpf_op(code) != BPF_EXIT
        && bpf_op(code) != BPF_CALL;
    let has_fallthrough = has_jmp_target && bpf_op(code) != BPF_JA;

    let mut stmt = OpStmt {
        code,
        dest: "-".to_string(),
        src1: "-".to_string(),
        off: 0,
        imm: 0,
        jmp_target: "-".to_string(),
        has_jmp_target,
        has_fallthrough,
        fallthrough: String::new(),
    };

    let cat = opcode_category(code);
    if args.len() == 5 {
        // Fully spelled out: op dest, src, off/target, imm.
        stmt.dest = args[1].clone();
        stmt.src1 = args[2].clone();
        if stmt.has_jmp_target {
            stmt.jmp_target = args[3].clone();
        } else {
            stmt.off = parse_imm(&args[3], loc)?;
        }
        stmt.imm = parse_imm(&args[4], loc)?;
    } else if cat == OpCategory::Branch && args.len() == 4 && stmt.has_jmp_target {
        stmt.dest = args[1].clone();
        // The second operand may be a register or an immediate; an
        // immediate selects the K-variant opcode.
        if let Some(v) = parse_imm_optional(&args[2]) {
            stmt.imm = v;
            stmt.code = variant_imm(stmt.code);
            stmt.jmp_target = args[3].clone();
        } else if let Some(v) = parse_imm_optional(&args[3]) {
            stmt.imm = v;
            stmt.code = variant_imm(stmt.code);
            stmt.jmp_target = args[2].clone();
        } else {
            stmt.src1 = args[2].clone();
            stmt.jmp_target = args[3].clone();
        }
        if numeric_opcode && stmt.code != tentative_code {
            return Err(asm_err(
                format!(
                    "numeric opcode '{tentative_code:#x}' given argument types for '{:#x}'",
                    stmt.code
                ),
                loc,
            ));
        }
    } else if cat == OpCategory::MemSrcOff && args.len() == 4 {
        stmt.dest = args[1].clone();
        stmt.src1 = args[2].clone();
        stmt.off = parse_imm(&args[3], loc)?;
    } else if cat == OpCategory::MemSrcOff && args.len() == 3 {
        stmt.dest = args[1].clone();
        let (src, off) = parse_reg_offset(&args[2], loc)?;
        stmt.src1 = src;
        stmt.off = off;
    } else if cat == OpCategory::MemDstOffImm && args.len() == 4 {
        stmt.dest = args[1].clone();
        stmt.off = parse_imm(&args[2], loc)?;
        stmt.imm = parse_imm(&args[3], loc)?;
    } else if cat == OpCategory::MemDstOffImm && args.len() == 3 {
        let (dest, off) = parse_reg_offset(&args[1], loc)?;
        stmt.dest = dest;
        stmt.off = off;
        stmt.imm = parse_imm(&args[2], loc)?;
    } else if cat == OpCategory::MemDstOff && args.len() == 4 {
        stmt.dest = args[1].clone();
        // Accept off/src in either order.
        if let Some(v) = parse_imm_optional(&args[2]) {
            stmt.off = v;
            stmt.src1 = args[3].clone();
        } else {
            stmt.src1 = args[2].clone();
            stmt.off = parse_imm(&args[3], loc)?;
        }
    } else if cat == OpCategory::MemDstOff && args.len() == 3 {
        let (dest, off) = parse_reg_offset(&args[1], loc)?;
        stmt.dest = dest;
        stmt.off = off;
        stmt.src1 = args[2].clone();
    } else if cat == OpCategory::Alu && args.len() == 3 {
        stmt.dest = args[1].clone();
        if let Some(v) = parse_imm_optional(&args[2]) {
            stmt.imm = v;
            stmt.code = variant_imm(stmt.code);
        } else {
            stmt.src1 = args[2].clone();
        }
        if numeric_opcode && stmt.code != tentative_code {
            return Err(asm_err(
                format!(
                    "numeric opcode '{tentative_code:#x}' given argument types for '{:#x}'",
                    stmt.code
                ),
                loc,
            ));
        }
    } else if cat == OpCategory::MemImm && args.len() == 3 {
        stmt.dest = args[1].clone();
        stmt.imm = parse_imm(&args[2], loc)?;
    } else if cat == OpCategory::AluUnary && args.len() == 2 {
        stmt.dest = args[1].clone();
    } else if cat == OpCategory::Jump && args.len() == 2 {
        stmt.jmp_target = args[1].clone();
    } else if cat == OpCategory::Call && args.len() == 2 {
        stmt.imm = parse_imm(&args[1], loc)?;
    } else if cat == OpCategory::Exit && args.len() == 1 {
        // no operands
    } else {
        return Err(asm_err(
            format!(
                "opcode '{}' expects {} args, found {}",
                args[0],
                cat.expected_args(),
                args.len() - 1
            ),
            loc,
        ));
    }
    Ok(stmt)
}

/// Parse one statement from its argument list.
fn parse_asm_stmt(args: Vec<String>, is_label: bool, loc: SourceLoc) -> TranslateResult<AsmStmt> {
    let arity_err = |directive: &str, expects: &str, found: usize| {
        asm_err(
            format!("{directive} expects {expects} args, found {found}"),
            &loc,
        )
    };

    let kind = if is_label {
        AsmKind::Label(args[0].clone())
    } else {
        match args[0].as_str() {
            "label" => {
                if args.len() != 2 {
                    return Err(arity_err("label", "1", args.len() - 1));
                }
                AsmKind::Label(args[1].clone())
            }
            "alloc" => {
                if args.len() != 3 && args.len() != 4 {
                    return Err(arity_err("alloc", "2 or 3", args.len() - 1));
                }
                let align = match args.get(3).map(String::as_str) {
                    Some("align") => true,
                    Some("noalign") | None => false,
                    Some(other) => {
                        return Err(asm_err(
                            format!("alloc expects 'align' or 'noalign' as 3rd arg, found '{other}'"),
                            &loc,
                        ))
                    }
                };
                AsmKind::Alloc {
                    dest: args[1].clone(),
                    size: parse_imm(&args[2], &loc)?,
                    align,
                }
            }
            "jump_to_catch" => {
                if args.len() != 2 {
                    return Err(arity_err("jump_to_catch", "1", args.len() - 1));
                }
                AsmKind::JumpToCatch {
                    msg: args[1].clone(),
                }
            }
            "register_error" => {
                if args.len() != 2 {
                    return Err(arity_err("register_error", "1", args.len() - 1));
                }
                AsmKind::RegisterError {
                    msg: args[1].clone(),
                }
            }
            "terminate" => {
                if args.len() != 1 {
                    return Err(arity_err("terminate", "no", args.len() - 1));
                }
                AsmKind::Terminate
            }
            "call" => {
                if args.len() < 3 {
                    return Err(arity_err("call", "at least 2", args.len() - 1));
                }
                AsmKind::Call {
                    dest: args[1].clone(),
                    params: args[2..].to_vec(),
                }
            }
            op if is_numeric(op) || opcode_by_name(op).is_some() => {
                AsmKind::Opcode(parse_asm_opcode(&args, &loc)?)
            }
            other => return Err(asm_err(format!("unknown operator '{other}'"), &loc)),
        }
    };
    Ok(AsmStmt { kind, loc })
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    /// Operand evaluation. `allow_imm` admits constants; `allow_emit` admits
    /// operands that emit code, such as string literals staged on the stack.
    fn emit_asm_arg(
        &mut self,
        arg: &str,
        allow_imm: bool,
        allow_emit: bool,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let invalid = || TranslateError::InvalidOperand {
            token: arg.to_string(),
            loc: loc.clone(),
        };

        if arg == "$$" {
            return self
                .func_return_val
                .last()
                .copied()
                .ok_or_else(|| asm_err("no return value outside function", loc));
        }
        if arg == "$ctx" {
            return Ok(match self.in_arg0 {
                Some(ctx) => ctx,
                None => self.imm(0),
            });
        }
        if let Some(var) = arg.strip_prefix('$') {
            // Named script variable; unknown names get a fresh temporary.
            return Ok(self.local_for_store(var));
        }
        if is_numeric(arg) && allow_imm {
            let v = parse_i64(arg).ok_or_else(invalid)?;
            return Ok(self.imm(v));
        }
        if is_numeric(arg) || arg.starts_with('r') {
            let digits = arg.strip_prefix('r').unwrap_or(arg);
            let num = parse_i64(digits).ok_or_else(invalid)?;
            if !(0..=10).contains(&num) {
                return Err(invalid());
            }
            return Ok(self.reg(num as u8));
        }
        if let Some(stripped) = arg.strip_prefix('"') {
            if !allow_emit {
                return Err(asm_err(
                    format!("string literal not allowed here: {arg}"),
                    loc,
                ));
            }
            let body = stripped.strip_suffix('"').ok_or_else(invalid)?;
            let s = crate::lower::translate_escapes(body, loc)?;
            return self.emit_literal_string(&s, loc);
        }
        if allow_imm {
            if let Some(v) = parse_imm_optional(arg) {
                return Ok(self.imm(v));
            }
        }
        Err(invalid())
    }

    /// Register-or-string operand.
    fn emit_asm_reg(&mut self, arg: &str, loc: &SourceLoc) -> TranslateResult<ValueId> {
        self.emit_asm_arg(arg, false, true, loc)
    }

    /// Plain register operand; nothing that emits code, so usable as an
    /// lvalue.
    fn get_asm_reg(&mut self, arg: &str, loc: &SourceLoc) -> TranslateResult<ValueId> {
        self.emit_asm_arg(arg, false, false, loc)
    }

    fn emit_asm_opcode(
        &mut self,
        stmt: &OpStmt,
        label_map: &HashMap<String, BlockId>,
        loc: &SourceLoc,
    ) -> TranslateResult<()> {
        if stmt.code > 0xff && stmt.code != BPF_LD_MAP {
            return Err(asm_err(format!("invalid opcode {:#x}", stmt.code), loc));
        }

        let mut r_dest = false;
        let mut r_src0 = false;
        let mut r_src1 = false;
        let mut i_src1 = false;
        let mut op_jmp = false;
        let mut op_jcond = false;
        let mut cond = Condition::Eq;
        match bpf_class(stmt.code) {
            BPF_LDX => {
                r_dest = true;
                r_src1 = true;
            }
            BPF_STX => {
                r_src0 = true;
                r_src1 = true;
            }
            BPF_ST => {
                r_src0 = true;
                i_src1 = true;
            }
            BPF_ALU | BPF_ALU64 => {
                r_dest = true;
                if stmt.code & BPF_X != 0 {
                    r_src1 = true;
                } else {
                    i_src1 = true;
                }
                match bpf_op(stmt.code) {
                    BPF_NEG | BPF_MOV => {}
                    _ => r_src0 = true,
                }
            }
            BPF_JMP => {
                match bpf_op(stmt.code) {
                    BPF_EXIT => {}
                    BPF_CALL => i_src1 = true,
                    BPF_JA => op_jmp = true,
                    op => {
                        op_jcond = true;
                        r_src0 = true;
                        if stmt.code & BPF_X != 0 {
                            r_src1 = true;
                        } else {
                            i_src1 = true;
                        }
                        cond = match op {
                            BPF_JEQ => Condition::Eq,
                            BPF_JNE => Condition::Ne,
                            BPF_JGT => Condition::Gtu,
                            BPF_JGE => Condition::Geu,
                            BPF_JLT => Condition::Ltu,
                            BPF_JLE => Condition::Leu,
                            BPF_JSGT => Condition::Gt,
                            BPF_JSGE => Condition::Ge,
                            BPF_JSLT => Condition::Lt,
                            BPF_JSLE => Condition::Le,
                            BPF_JSET => Condition::Test,
                            _ => return Err(asm_err("invalid branch opcode", loc)),
                        };
                    }
                }
            }
            _ if stmt.code == BPF_LD_MAP || stmt.code == (BPF_LD | BPF_IMM | BPF_DW) => {
                r_dest = true;
                i_src1 = true;
            }
            _ => {
                return Err(asm_err(format!("unknown opcode {:#x}", stmt.code), loc));
            }
        }

        let mut v_dest = None;
        if r_dest || r_src0 {
            v_dest = Some(self.get_asm_reg(&stmt.dest, loc)?);
        } else if stmt.dest != "0" && stmt.dest != "-" {
            return Err(TranslateError::InvalidOperand {
                token: stmt.dest.clone(),
                loc: loc.clone(),
            });
        }

        let mut v_src1 = None;
        if r_src1 {
            v_src1 = Some(self.emit_asm_reg(&stmt.src1, loc)?);
        } else {
            if stmt.src1 != "0" && stmt.src1 != "-" {
                return Err(TranslateError::InvalidOperand {
                    token: stmt.src1.clone(),
                    loc: loc.clone(),
                });
            }
            if i_src1 {
                v_src1 = Some(self.imm(stmt.imm));
            } else if stmt.imm != 0 {
                return Err(asm_err("immediate field not allowed here", loc));
            }
        }

        if i16::try_from(stmt.off).is_err() {
            return Err(asm_err(
                format!("offset field '{}' out of range", stmt.off),
                loc,
            ));
        }

        let lookup = |name: &str| -> TranslateResult<BlockId> {
            label_map
                .get(name)
                .copied()
                .ok_or_else(|| asm_err(format!("undefined jump target '{name}'"), loc))
        };
        if op_jmp {
            let target = lookup(&stmt.jmp_target)?;
            let ins = self.ins();
            self.prog.mk_jmp(ins, target);
        } else if op_jcond {
            let target = lookup(&stmt.jmp_target)?;
            let fallthrough = lookup(&stmt.fallthrough)?;
            let s0 = v_dest.ok_or_else(|| asm_err("branch needs a register operand", loc))?;
            let s1 = v_src1.ok_or_else(|| asm_err("branch needs a second operand", loc))?;
            let ins = self.ins();
            self.prog.mk_jcond(ins, cond, s0, s1, target, fallthrough);
        } else {
            let ins = self.ins();
            self.prog.mk_raw(
                ins,
                stmt.code,
                stmt.off as i16,
                if r_dest { v_dest } else { None },
                if r_src0 { v_dest } else { None },
                v_src1,
            );
        }
        Ok(())
    }

    /// The `call` directive: a kernel helper by name, the formatted-print
    /// lowering, the exit builtin, or a script function inlined at the call
    /// site.
    fn emit_asm_call(
        &mut self,
        dest: &str,
        params: &[String],
        loc: &SourceLoc,
    ) -> TranslateResult<()> {
        let func_name = params[0].as_str();
        if let Some(hid) = helpers::helper_by_name(func_name) {
            let mut nargs = 0u8;
            for (k, p) in params[1..].iter().enumerate() {
                let from = self.emit_asm_arg(p, true, true, loc)?;
                let to = self.reg(BPF_REG_1 + k as u8);
                self.emit_mov(to, from);
                nargs += 1;
            }
            self.call(hid, nargs);
            if dest != "-" {
                let d = self.get_asm_reg(dest, loc)?;
                let r0 = self.reg(BPF_REG_0);
                self.emit_mov(d, r0);
            }
            return Ok(());
        }

        if func_name == "printf" || func_name == "sprintf" {
            let raw = params
                .get(1)
                .ok_or_else(|| asm_err(format!("{func_name} expects a format string"), loc))?;
            let body = raw
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .ok_or_else(|| {
                    asm_err(
                        format!("{func_name} expects a string literal format, found '{raw}'"),
                        loc,
                    )
                })?;
            let format = crate::lower::translate_escapes(body, loc)?;
            if format.len() + 1 > BPF_MAXFORMATLEN {
                return Err(TranslateError::Oversize {
                    what: "format string",
                    limit: BPF_MAXFORMATLEN,
                    actual: format.len() + 1,
                    loc: loc.clone(),
                });
            }

            let mut actuals = Vec::new();
            for p in &params[2..] {
                let v = self.emit_asm_arg(p, true, true, loc)?;
                let ty = if self.prog.value(v).is_str() {
                    ValueType::Str
                } else {
                    ValueType::Long
                };
                actuals.push((v, ty));
            }
            let ret = self.emit_print_format(&format, &actuals, func_name == "printf", loc)?;
            if let Some(rv) = ret {
                if dest != "-" {
                    let d = self.get_asm_reg(dest, loc)?;
                    self.emit_mov(d, rv);
                }
            }
            return Ok(());
        }

        if func_name == "exit" && params.len() == 1 {
            return self.emit_exit_call();
        }

        let functions = self.functions;
        if let Some(func) = functions.get(func_name) {
            let mut actuals = Vec::with_capacity(params.len() - 1);
            for p in &params[1..] {
                actuals.push(self.emit_asm_arg(p, true, true, loc)?);
            }
            let ret = self.emit_inline_call(func, &actuals, loc)?;
            if dest != "-" {
                let d = self.get_asm_reg(dest, loc)?;
                self.emit_mov(d, ret);
            }
            return Ok(());
        }

        Err(asm_err(
            format!("'call {func_name}' names neither a helper nor a script function"),
            loc,
        ))
    }

    /// Parse and emit one embedded-code block at the current cursor.
    pub(crate) fn emit_embedded_code(&mut self, code: &str, loc: &SourceLoc) -> TranslateResult<()> {
        if code.contains("/* userspace */") && self.prog.target() == Target::KernelBpf {
            return Err(TranslateError::Semantic {
                reason: "userspace-only embedded code in a kernel probe".to_string(),
                loc: loc.clone(),
            });
        }

        let chars: Vec<char> = code.chars().collect();
        let mut stmts: Vec<AsmStmt> = Vec::new();
        let mut pos = 0;
        loop {
            let (args, is_label, stmt_start, next) = tokenize_stmt(&chars, pos);
            if args.is_empty() {
                break;
            }
            let stmt_loc = advance_loc(loc, &chars[..stmt_start]);
            stmts.push(parse_asm_stmt(args, is_label, stmt_loc)?);
            pos = next;
        }

        // Resolve labels to blocks, and give every branching statement a
        // landing block for its not-taken path; a synthesized label is
        // invented when the next statement is unlabeled.
        let mut label_map: HashMap<String, BlockId> = HashMap::new();
        let entry_block = self.ins().block(self.prog);
        label_map.insert(";;entry".to_string(), entry_block);

        let mut after_label = true;
        let mut after_jump: Option<usize> = None;
        let mut fallthrough_count = 0usize;
        for i in 0..stmts.len() {
            let label_name = match &stmts[i].kind {
                AsmKind::Label(n) => Some(n.clone()),
                _ => None,
            };
            if let Some(j) = after_jump {
                let fallthrough = match &label_name {
                    Some(name) => name.clone(),
                    None => {
                        let b = self.prog.new_block();
                        let synthesized = format!("fallthrough;;{fallthrough_count}");
                        fallthrough_count += 1;
                        label_map.insert(synthesized.clone(), b);
                        self.set_block(b);
                        synthesized
                    }
                };
                if let AsmKind::Opcode(op) = &mut stmts[j].kind {
                    op.has_fallthrough = true;
                    op.fallthrough = fallthrough;
                }
            }

            match &stmts[i].kind {
                AsmKind::Label(name) => {
                    if after_label {
                        // Consecutive labels share one block.
                        let b = self.ins().block(self.prog);
                        label_map.insert(name.clone(), b);
                    } else {
                        let b = self.prog.new_block();
                        label_map.insert(name.clone(), b);
                        self.set_block(b);
                    }
                    after_label = true;
                    after_jump = None;
                }
                AsmKind::Opcode(op)
                    if op.has_fallthrough
                        || (bpf_class(op.code) == BPF_JMP && bpf_op(op.code) != BPF_CALL) =>
                {
                    after_label = false;
                    after_jump = Some(i);
                }
                _ => {
                    after_label = false;
                    after_jump = None;
                }
            }
        }
        if after_jump.is_some() {
            return Err(asm_err(
                "embedded code ends in a branch with no landing label",
                loc,
            ));
        }

        // Emit, starting back at the entry block.
        let mut jumped_already = false;
        self.set_block(entry_block);
        for stmt in &stmts {
            let stmt = stmt.clone();
            match &stmt.kind {
                AsmKind::Label(name) => {
                    let b = label_map[name];
                    if !jumped_already {
                        self.emit_jmp(b);
                    }
                    self.set_block(b);
                }
                AsmKind::Alloc { dest, size, align } => {
                    let mut ofs = -(self.prog.max_tmp_space() as i64) - size;
                    if *align && (-ofs) % 8 != 0 {
                        ofs -= 8 - (-ofs) % 8;
                    }
                    self.prog.use_tmp_space((-ofs) as u32);
                    let d = self.get_asm_reg(dest, &stmt.loc)?;
                    let frame = self.reg(BPF_REG_10);
                    let off = self.imm(ofs);
                    self.binary(BPF_ADD, d, frame, off);
                }
                AsmKind::JumpToCatch { msg } => {
                    // Whether a catch target encloses this code is known
                    // here, so the jump goes straight to the right place.
                    let msg_val = self.emit_asm_arg(msg, true, true, &stmt.loc)?;
                    self.catch_msg.push(msg_val);
                    let error_block = self.prog.new_block();
                    match self.catch_jump.last().copied() {
                        Some(catch) => self.emit_jmp(catch),
                        None => self.emit_jmp(error_block),
                    }
                    self.set_block(error_block);
                }
                AsmKind::RegisterError { msg } => {
                    let one = self.imm(1);
                    self.emit_mov(self.error_status, one);
                    // The message leaves through the transport now; holding
                    // it in a stack buffer until the epilogue would pin too
                    // much of the stack budget.
                    let msg_val = self.emit_asm_arg(msg, true, true, &stmt.loc)?;
                    self.emit_transport_msg(
                        TransportMsg::StoreErrorMsg,
                        Some((msg_val, ValueType::Str)),
                    )?;
                }
                AsmKind::Terminate => {
                    let join_block = self.prog.new_block();
                    let exit_block = self.get_exit_block()?;
                    self.emit_jmp(exit_block);
                    self.set_block(join_block);
                }
                AsmKind::Call { dest, params } => {
                    self.emit_asm_call(dest, params, &stmt.loc)?;
                }
                AsmKind::Opcode(op) => {
                    self.emit_asm_opcode(op, &label_map, &stmt.loc)?;
                }
            }

            if let AsmKind::Opcode(op) = &stmt.kind {
                if op.has_fallthrough {
                    jumped_already = true;
                    self.set_block(label_map[&op.fallthrough]);
                    continue;
                }
            }
            jumped_already = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(code: &str) -> Vec<Vec<String>> {
        let chars: Vec<char> = code.chars().collect();
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let (args, is_label, _, next) = tokenize_stmt(&chars, pos);
            if args.is_empty() {
                break;
            }
            let mut args = args;
            if is_label {
                args.insert(0, "label".to_string());
            }
            out.push(args);
            pos = next;
        }
        out
    }

    #[test]
    fn test_tokenizer_statement_forms() {
        let stmts = toks("mov r1, 5; loop: jne r1, 0, done\nadd r1, -1; ja loop; done: exit");
        assert_eq!(stmts[0], vec!["mov", "r1", "5"]);
        assert_eq!(stmts[1], vec!["label", "loop"]);
        assert_eq!(stmts[2], vec!["jne", "r1", "0", "done"]);
        assert_eq!(stmts[3], vec!["add", "r1", "-1"]);
        assert_eq!(stmts[4], vec!["ja", "loop"]);
        assert_eq!(stmts[5], vec!["label", "done"]);
        assert_eq!(stmts[6], vec!["exit"]);
    }

    #[test]
    fn test_tokenizer_comments_and_strings() {
        let stmts = toks("call -, printf, \"hi; there\\\"\" /* trailing ; comment */");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0][2], "printf");
        assert_eq!(stmts[0][3], "\"hi; there\\\"\"");
    }

    #[test]
    fn test_tokenizer_comma_continues_line() {
        let stmts = toks("call $$,\n  sprintf,\n  \"%d\", $x");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0], vec!["call", "$$", "sprintf", "\"%d\"", "$x"]);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_i64("0x10"), Some(16));
        assert_eq!(parse_i64("-8"), Some(-8));
        assert_eq!(parse_i64("010"), Some(8));
        assert_eq!(parse_i64("10"), Some(10));
        assert_eq!(parse_i64("r1"), None);
        assert_eq!(parse_imm_optional("BPF_MAXSTRINGLEN"), Some(64));
        assert_eq!(parse_imm_optional("-"), Some(0));
    }

    #[test]
    fn test_parse_reg_offset() {
        let loc = SourceLoc::default();
        assert_eq!(
            parse_reg_offset("[r10-8]", &loc).unwrap(),
            ("r10".to_string(), -8)
        );
        assert_eq!(
            parse_reg_offset("[r1+0x10]", &loc).unwrap(),
            ("r1".to_string(), 16)
        );
        assert!(parse_reg_offset("r1+8", &loc).is_err());
    }

    #[test]
    fn test_branch_operand_disambiguation() {
        let loc = SourceLoc::default();
        let args: Vec<String> = ["jne", "r1", "0", "done"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let op = parse_asm_opcode(&args, &loc).unwrap();
        // Immediate comparison selects the K-variant encoding.
        assert_eq!(op.code & BPF_X, 0);
        assert_eq!(op.imm, 0);
        assert_eq!(op.jmp_target, "done");
        assert!(op.has_fallthrough);

        let args: Vec<String> = ["jne", "r1", "r2", "done"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let op = parse_asm_opcode(&args, &loc).unwrap();
        assert_ne!(op.code & BPF_X, 0);
        assert_eq!(op.src1, "r2");
    }

    #[test]
    fn test_alloc_parse() {
        let loc = SourceLoc::default();
        let args: Vec<String> = ["alloc", "$buf", "64", "align"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let stmt = parse_asm_stmt(args, false, loc).unwrap();
        match stmt.kind {
            AsmKind::Alloc { dest, size, align } => {
                assert_eq!(dest, "$buf");
                assert_eq!(size, 64);
                assert!(align);
            }
            other => panic!("expected alloc, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let loc = SourceLoc::default();
        let args = vec!["frobnicate".to_string(), "r1".to_string()];
        assert!(parse_asm_stmt(args, false, loc).is_err());
    }
}
