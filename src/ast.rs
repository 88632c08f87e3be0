// The type-checked input tree handed over by the front-end. Everything here is a
// closed sum type matched exhaustively by the translator, so an unhandled construct
// is a compile error in this crate rather than a runtime surprise. Every expression
// node carries its resolved value type and source location; function calls carry only
// the callee name, and the translator requires exactly one in-scope candidate (the
// front-end has already resolved overloads, so more than one match is an input
// defect it reports rather than guesses about). Probe kinds determine both the
// target variant a program is lowered for and the section name it is emitted under.

//! The statement/expression tree consumed from the front-end.

pub use crate::core::SourceLoc;
use crate::ir::Target;

/// Resolved type of a value-producing expression or variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Long,
    Str,
    Stats,
}

/// Key-column type of one array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Long,
    Str,
}

/// Literal initializer for a scalar global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Number(i64),
    Str(String),
}

/// One declared script global.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub value_type: ValueType,
    /// Empty for scalars; one entry per array dimension otherwise.
    pub index_types: Vec<IndexType>,
    /// Declared capacity for arrays; 0 selects the default ceiling.
    pub maxsize: u32,
    /// Literal default lowered into the begin program.
    pub init: Option<Literal>,
    pub loc: SourceLoc,
}

/// A user-defined script function, always inlined at call sites.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub name: String,
    pub formal_args: Vec<String>,
    pub body: Stmt,
    pub loc: SourceLoc,
}

/// Where a probe attaches; decides target variant and section name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    Begin,
    End,
    Error,
    Kprobe { symbol: String },
    Kretprobe { symbol: String },
    Tracepoint { category: String, name: String },
    Timer { interval_ns: u64 },
    Perf { counter: String, interval: u64 },
    Uprobe { path: String, offset: u64 },
}

impl ProbeKind {
    /// Which execution environment programs for this probe run in.
    pub fn target(&self) -> Target {
        match self {
            ProbeKind::Begin | ProbeKind::End | ProbeKind::Error => Target::UserBpfInterp,
            _ => Target::KernelBpf,
        }
    }

    /// Section name of the emitted program.
    pub fn section_name(&self) -> String {
        match self {
            ProbeKind::Begin => "stap_begin".to_string(),
            ProbeKind::End => "stap_end".to_string(),
            ProbeKind::Error => "stap_error".to_string(),
            ProbeKind::Kprobe { symbol } => format!("kprobe/{symbol}"),
            ProbeKind::Kretprobe { symbol } => format!("kretprobe/{symbol}"),
            ProbeKind::Tracepoint { category, name } => format!("trace/{category}/{name}"),
            ProbeKind::Timer { interval_ns } => format!("timer/ns/{interval_ns}"),
            ProbeKind::Perf { counter, interval } => format!("perf/{counter}/{interval}"),
            ProbeKind::Uprobe { path, offset } => format!("uprobe/{path}/{offset:#x}"),
        }
    }
}

/// One probe: attachment point plus handler body.
#[derive(Debug, Clone)]
pub struct Probe {
    pub kind: ProbeKind,
    pub body: Stmt,
    pub loc: SourceLoc,
}

/// A whole script after parsing and type checking.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<ScriptFunction>,
    pub probes: Vec<Probe>,
}

/// Arithmetic and bitwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    BitNot,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Assignment operators, including the aggregate accumulate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Concat,
    /// `<<<`: feed a sample into a statistics aggregate.
    Aggregate,
}

/// Pre/post increment and decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrementOp {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

/// Statistics extraction functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFunc {
    Count,
    Sum,
    Avg,
}

/// Formatted-output request: printf-family when `to_stream`, sprintf-family
/// otherwise. A missing format means per-argument defaults are synthesized.
#[derive(Debug, Clone)]
pub struct PrintSpec {
    pub to_stream: bool,
    pub format: Option<String>,
    pub args: Vec<Expr>,
}

/// An expression with its resolved type and source position.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: ValueType,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Number(i64),
    Str(String),
    /// Scalar global or function-local variable.
    Symbol(String),
    /// Probe-context field, resolved by the front-end to an offset and
    /// width within the context record. Fields wider than a register
    /// evaluate to a pointer into the record.
    ContextField {
        offset: i64,
        size: u32,
        signed: bool,
    },
    ArrayIndex {
        array: String,
        indexes: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    LogicalAnd {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    LogicalOr {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    LogicalNot(Box<Expr>),
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        lvalue: Box<Expr>,
        rvalue: Box<Expr>,
    },
    Crement {
        op: CrementOp,
        lvalue: Box<Expr>,
    },
    /// Membership test: `[idx...] in array`.
    ArrayIn {
        array: String,
        indexes: Vec<Expr>,
    },
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    Print(PrintSpec),
    StatOp {
        func: StatFunc,
        stat: Box<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, ty: ValueType, loc: SourceLoc) -> Self {
        Self { kind, ty, loc }
    }

    pub fn number(v: i64) -> Self {
        Self::new(ExprKind::Number(v), ValueType::Long, SourceLoc::default())
    }

    pub fn str_lit(s: impl Into<String>) -> Self {
        Self::new(
            ExprKind::Str(s.into()),
            ValueType::Str,
            SourceLoc::default(),
        )
    }

    pub fn symbol(name: impl Into<String>, ty: ValueType) -> Self {
        Self::new(ExprKind::Symbol(name.into()), ty, SourceLoc::default())
    }
}

/// What a delete statement removes.
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// Reset a scalar to zero / the empty string.
    Symbol(String),
    /// Remove one array element.
    ArrayElement { array: String, indexes: Vec<Expr> },
    /// Remove every element of an array.
    Array(String),
}

/// A statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Block(Vec<Stmt>),
    Expr(Expr),
    If {
        cond: Expr,
        then_stmt: Box<Stmt>,
        else_stmt: Option<Box<Stmt>>,
        loc: SourceLoc,
    },
    For {
        init: Option<Expr>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
        loc: SourceLoc,
    },
    Foreach {
        /// Loop variables bound per key column.
        indexes: Vec<String>,
        array: String,
        /// Loop variable bound to the element value, if requested.
        value: Option<String>,
        /// 0 unsorted, positive ascending, negative descending.
        sort_direction: i64,
        /// 1-based key column; 0 sorts by value.
        sort_column: u64,
        limit: Option<Expr>,
        body: Box<Stmt>,
        loc: SourceLoc,
    },
    Break(SourceLoc),
    Continue(SourceLoc),
    /// End the current probe invocation.
    Next(SourceLoc),
    Return {
        value: Option<Expr>,
        loc: SourceLoc,
    },
    Delete {
        target: DeleteTarget,
        loc: SourceLoc,
    },
    TryCatch {
        body: Box<Stmt>,
        /// Local receiving the raised message, if named.
        catch_var: Option<String>,
        handler: Box<Stmt>,
        loc: SourceLoc,
    },
    /// Raw embedded assembly passed to the embedded assembler.
    Embedded { code: String, loc: SourceLoc },
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_targets() {
        assert_eq!(ProbeKind::Begin.target(), Target::UserBpfInterp);
        let kp = ProbeKind::Kprobe {
            symbol: "do_sys_open".to_string(),
        };
        assert_eq!(kp.target(), Target::KernelBpf);
        assert_eq!(kp.section_name(), "kprobe/do_sys_open");
        assert_eq!(ProbeKind::End.section_name(), "stap_end");
        let tp = ProbeKind::Tracepoint {
            category: "sched".to_string(),
            name: "sched_switch".to_string(),
        };
        assert_eq!(tp.section_name(), "trace/sched/sched_switch");
    }
}
