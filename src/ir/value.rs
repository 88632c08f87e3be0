// Pooled operand values. A Program owns a dense table of ValueData and hands out
// ValueId handles; immediates and string constants are interned so equal content maps
// to the identical handle, which makes ValueId equality double as content equality in
// the lowering code (shared zero constants, shared format strings). Registers are
// dense numbers: hard registers 0..=10 are the ABI-fixed set, temporaries continue
// from 11 upward and stay virtual until the external register allocator renames them.

//! Operand values for the virtual instruction set.

use std::fmt;

use super::MAX_BPF_REG;

/// Handle of a pooled value within its Program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A typed operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueData<'a> {
    /// Placeholder for values never assigned (e.g. unread locals).
    Uninit,
    /// Immediate integer constant.
    Imm(i64),
    /// String constant; format strings are pooled separately from plain
    /// strings of the same content.
    Str { data: &'a str, format_str: bool },
    /// ABI-fixed register (0..=10).
    HardReg(u8),
    /// Virtual temporary register, numbered from 11 upward.
    TmpReg(u32),
}

impl<'a> ValueData<'a> {
    pub fn is_reg(&self) -> bool {
        matches!(self, ValueData::HardReg(_) | ValueData::TmpReg(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, ValueData::Imm(_))
    }

    pub fn is_str(&self) -> bool {
        matches!(self, ValueData::Str { .. })
    }

    pub fn is_format(&self) -> bool {
        matches!(self, ValueData::Str { format_str: true, .. })
    }

    /// Immediate payload. Panics on non-immediates; callers check first.
    pub fn imm(&self) -> i64 {
        match self {
            ValueData::Imm(i) => *i,
            _ => panic!("imm() on non-immediate value"),
        }
    }

    /// String payload. Panics on non-strings; callers check first.
    pub fn str_data(&self) -> &'a str {
        match self {
            ValueData::Str { data, .. } => data,
            _ => panic!("str_data() on non-string value"),
        }
    }

    /// Register number for hard and temporary registers.
    pub fn reg(&self) -> u32 {
        match self {
            ValueData::HardReg(r) => *r as u32,
            ValueData::TmpReg(n) => *n,
            _ => panic!("reg() on non-register value"),
        }
    }

    /// True for temporaries not yet renamed to a hard register.
    pub fn is_virtual(&self) -> bool {
        matches!(self, ValueData::TmpReg(n) if *n >= MAX_BPF_REG)
    }
}

impl fmt::Display for ValueData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::Uninit => write!(f, "#uninit"),
            ValueData::Imm(i) => write!(f, "#{i}"),
            ValueData::Str {
                data,
                format_str: false,
            } => write!(f, "{data:?}"),
            ValueData::Str {
                data,
                format_str: true,
            } => write!(f, "fmt{data:?}"),
            ValueData::HardReg(r) => write!(f, "r{r}"),
            ValueData::TmpReg(n) => write!(f, "t{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_predicates() {
        let imm = ValueData::Imm(42);
        assert!(imm.is_imm());
        assert_eq!(imm.imm(), 42);

        let hard = ValueData::HardReg(3);
        assert!(hard.is_reg());
        assert!(!hard.is_virtual());
        assert_eq!(hard.reg(), 3);

        let tmp = ValueData::TmpReg(11);
        assert!(tmp.is_reg());
        assert!(tmp.is_virtual());
    }

    #[test]
    fn test_display() {
        assert_eq!(ValueData::Imm(-1).to_string(), "#-1");
        assert_eq!(ValueData::HardReg(10).to_string(), "r10");
        assert_eq!(
            ValueData::Str {
                data: "x",
                format_str: false
            }
            .to_string(),
            "\"x\""
        );
    }
}
