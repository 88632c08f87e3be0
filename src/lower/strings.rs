// String values live in BPF map memory or on the local stack as fixed-capacity
// NUL-terminated buffers copied four bytes at a time. A literal is unrolled into
// word stores; a runtime string is copied word by word with an unrolled NUL scan
// deciding when to stop. Copies that feed map keys are zero padded to the full
// buffer so trailing garbage never distinguishes equal keys. All copies run with
// the source possibly NULL (a map lookup miss), writing an empty string instead
// of dereferencing.

//! String materialization on the BPF stack.

use crate::core::{SourceLoc, TranslateError, TranslateResult};
use crate::ir::{
    Condition, ValueId, BPF_AND, BPF_DW, BPF_MAXSTRINGLEN, BPF_NEG, BPF_OR, BPF_REG_10, BPF_RSH,
    BPF_W,
};

use super::Lowerer;

/// Decode backslash escapes the front-end leaves verbatim in embedded-code
/// string operands. NUL escapes are dropped; a string cannot carry one.
pub fn translate_escapes(s: &str, loc: &SourceLoc) -> TranslateResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut it = s.chars().peekable();

    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(&e) = it.peek() else { break };
        match e {
            'f' => {
                out.push('\x0c');
                it.next();
            }
            'n' => {
                out.push('\n');
                it.next();
            }
            'r' => {
                out.push('\r');
                it.next();
            }
            't' => {
                out.push('\t');
                it.next();
            }
            'v' => {
                out.push('\x0b');
                it.next();
            }
            '0'..='7' => {
                let mut val: u32 = 0;
                let mut digits = 0;
                while digits < 3 {
                    match it.peek() {
                        Some(&d @ '0'..='7') => {
                            val = val * 8 + d.to_digit(8).unwrap_or(0);
                            digits += 1;
                            it.next();
                        }
                        _ => break,
                    }
                }
                if val > 0xff {
                    return Err(TranslateError::Semantic {
                        reason: "octal escape sequence out of range".to_string(),
                        loc: loc.clone(),
                    });
                }
                if val != 0 {
                    out.push(val as u8 as char);
                }
            }
            'x' => {
                it.next();
                let mut val: u32 = 0;
                while let Some(d) = it.peek().and_then(|c| c.to_digit(16)) {
                    val = val.saturating_mul(16).saturating_add(d);
                    it.next();
                }
                if val > 0xff {
                    return Err(TranslateError::Semantic {
                        reason: "hex escape sequence out of range".to_string(),
                        loc: loc.clone(),
                    });
                }
                if val != 0 {
                    out.push(val as u8 as char);
                }
            }
            _ => {
                out.push(e);
                it.next();
            }
        }
    }
    Ok(out)
}

impl<'l, 's, 'a> Lowerer<'l, 's, 'a> {
    /// Unroll a literal into word stores at [dest + ofs]. Returns the buffer
    /// address. With `zero_pad` the remainder of the full string capacity is
    /// cleared as well.
    pub(crate) fn emit_simple_literal_str(
        &mut self,
        dest: ValueId,
        ofs: i64,
        src: &str,
        zero_pad: bool,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let bytes = src.as_bytes();
        let str_bytes = bytes.len() + 1;
        if str_bytes > BPF_MAXSTRINGLEN as usize {
            return Err(TranslateError::Oversize {
                what: "string literal",
                limit: BPF_MAXSTRINGLEN as usize,
                actual: str_bytes,
                loc: loc.clone(),
            });
        }

        let str_words = (str_bytes + 3) / 4;
        for i in 0..str_words {
            let mut word: u32 = 0;
            for j in 0..4 {
                let k = i * 4 + j;
                if k < bytes.len() {
                    word |= u32::from(bytes[k]) << (j * 8);
                }
            }
            let w = self.imm(word as i32 as i64);
            self.st(BPF_W, dest, (ofs + (i as i64) * 4) as i16, w);
        }
        if zero_pad {
            let zero = self.imm(0);
            for i in str_words..(BPF_MAXSTRINGLEN / 4) as usize {
                self.st(BPF_W, dest, (ofs + (i as i64) * 4) as i16, zero);
            }
        }

        let out = self.prog.new_reg();
        self.frame_into(out, dest, ofs);
        Ok(out)
    }

    /// Copy the string at `src` into [dest + ofs], stopping at the NUL
    /// terminator. A NULL source produces the empty string. Returns the
    /// destination buffer address.
    pub(crate) fn emit_string_copy(
        &mut self,
        dest: ValueId,
        ofs: i64,
        src: ValueId,
        zero_pad: bool,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let literal = {
            let v = self.prog.value(src);
            if v.is_str() {
                Some(v.str_data())
            } else {
                None
            }
        };
        if let Some(data) = literal {
            return self.emit_simple_literal_str(dest, ofs, data, zero_pad, loc);
        }

        let words = (BPF_MAXSTRINGLEN / 4) as usize;
        let zero = self.imm(0);
        let return_block = self.prog.new_block();

        // Zero-pad chain: pad[i] clears words i.. then returns. A NUL found
        // in word i routes to pad[i + 1]; pad[words] is the return block.
        let mut pad = Vec::new();
        if zero_pad {
            for _ in 1..words {
                pad.push(self.prog.new_block());
            }
            pad.push(return_block);
        }

        // Guard against a NULL source.
        let null_block = self.prog.new_block();
        let copy_block = self.prog.new_block();
        self.jcond(Condition::Eq, src, zero, null_block, copy_block);

        self.set_block(null_block);
        self.emit_simple_literal_str(dest, ofs, "", zero_pad, loc)?;
        self.emit_jmp(return_block);

        self.set_block(copy_block);
        for i in 0..words {
            let word = self.prog.new_reg();
            self.ld(BPF_W, word, src, (i as i64 * 4) as i16);
            self.st(BPF_W, dest, (ofs + i as i64 * 4) as i16, word);

            // all_nz accumulates (-b | b) per byte; it is zero exactly when
            // some byte of the word is zero.
            let all_nz = self.emit_byte_nonzero(word, 0);
            for j in 1..4 {
                let nz = self.emit_byte_nonzero(word, j);
                self.binary(BPF_AND, all_nz, all_nz, nz);
            }

            let found = if zero_pad { pad[i] } else { return_block };
            let next = if i + 1 < words {
                self.prog.new_block()
            } else {
                return_block
            };
            self.jcond(Condition::Eq, all_nz, zero, found, next);
            self.set_block(next);
        }

        if zero_pad {
            // pad[i] clears word i + 1 onward.
            for i in 0..words - 1 {
                self.set_block(pad[i]);
                self.st(BPF_W, dest, (ofs + (i as i64 + 1) * 4) as i16, zero);
                self.emit_jmp(pad[i + 1]);
            }
        }

        self.set_block(return_block);
        let out = self.prog.new_reg();
        self.frame_into(out, dest, ofs);
        Ok(out)
    }

    /// Materialize a literal in fresh temporary stack and return its address.
    pub(crate) fn emit_literal_string(
        &mut self,
        s: &str,
        loc: &SourceLoc,
    ) -> TranslateResult<ValueId> {
        let str_bytes = (s.len() + 1) as i64;
        let mut ofs = -(self.prog.max_tmp_space() as i64) - str_bytes;
        ofs &= !3;
        self.prog.use_tmp_space((-ofs) as u32);
        let frame = self.reg(BPF_REG_10);
        self.emit_simple_literal_str(frame, ofs, s, false, loc)
    }

    /// Stage a long argument: spill `val` to frame[ofs] and point `arg` at it.
    pub(crate) fn emit_long_arg(&mut self, arg: ValueId, ofs: i64, val: ValueId) {
        let frame = self.reg(BPF_REG_10);
        self.st(BPF_DW, frame, ofs as i16, val);
        self.frame_addr(arg, ofs);
    }

    /// Stage a string argument: copy it zero-padded to frame[ofs] and point
    /// `arg` at the buffer.
    pub(crate) fn emit_str_arg(
        &mut self,
        arg: ValueId,
        ofs: i64,
        val: ValueId,
        loc: &SourceLoc,
    ) -> TranslateResult<()> {
        let frame = self.reg(BPF_REG_10);
        let out = self.emit_string_copy(frame, ofs, val, true, loc)?;
        self.emit_mov(arg, out);
        Ok(())
    }

    /// out = base + ofs.
    fn frame_into(&mut self, out: ValueId, base: ValueId, ofs: i64) {
        let off = self.imm(ofs);
        self.binary(crate::ir::BPF_ADD, out, base, off);
    }

    /// (-b | b) for byte `j` of `word`: zero iff the byte is zero.
    fn emit_byte_nonzero(&mut self, word: ValueId, j: i64) -> ValueId {
        let b = self.prog.new_reg();
        if j == 0 {
            self.emit_mov(b, word);
        } else {
            let sh = self.imm(8 * j);
            self.binary(BPF_RSH, b, word, sh);
        }
        let mask = self.imm(0xff);
        self.binary(BPF_AND, b, b, mask);

        let nz = self.prog.new_reg();
        self.unary(BPF_NEG, nz, b);
        self.binary(BPF_OR, nz, nz, b);
        nz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_escapes_basic() {
        let loc = SourceLoc::default();
        assert_eq!(translate_escapes("a\\tb\\n", &loc).unwrap(), "a\tb\n");
        assert_eq!(translate_escapes("\\\"x\\\"", &loc).unwrap(), "\"x\"");
        assert_eq!(translate_escapes("\\101", &loc).unwrap(), "A");
        assert_eq!(translate_escapes("\\x41", &loc).unwrap(), "A");
    }

    #[test]
    fn test_translate_escapes_drops_nul() {
        let loc = SourceLoc::default();
        assert_eq!(translate_escapes("a\\0b", &loc).unwrap(), "ab");
        assert_eq!(translate_escapes("a\\x0b", &loc).unwrap(), "a\x0b");
    }

    #[test]
    fn test_translate_escapes_range_errors() {
        let loc = SourceLoc::default();
        assert!(translate_escapes("\\777", &loc).is_err());
        assert!(translate_escapes("\\x100", &loc).is_err());
    }
}
