//! Abstract syntax tree for the orchestra language.
//!
//! Each stage of the pipeline takes ownership of the [`Program`] and
//! returns it (possibly rewritten). Nodes own their children exclusively;
//! symbol references are by name and resolved through the symbol table.

/// Rate class of a variable or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rate {
    /// `a` prefix — one value per sample.
    Audio,
    /// `k` prefix — one value per control block.
    Control,
    /// `i` prefix — set once at instrument init.
    Init,
    /// `S` prefix — string.
    Str,
}

impl Rate {
    /// Classify a variable name by its prefix. A leading `g` marks a
    /// global and is skipped for rate purposes; a leading `#` marks a
    /// compiler-generated temporary. `p1`..`pN` are init-rate.
    pub fn of_name(name: &str) -> Option<Rate> {
        let bare = name.strip_prefix('#').unwrap_or(name);
        let bare = bare.strip_prefix('g').unwrap_or(bare);
        match bare.chars().next()? {
            'a' => Some(Rate::Audio),
            'k' => Some(Rate::Control),
            'i' => Some(Rate::Init),
            'S' => Some(Rate::Str),
            'p' if name.len() > 1 && name[1..].chars().all(|c| c.is_ascii_digit()) => {
                Some(Rate::Init)
            }
            _ => None,
        }
    }
}

/// True when `name` refers to global storage (`g` prefix followed by a
/// rate letter).
pub fn is_global_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('g') && matches!(chars.next(), Some('a' | 'k' | 'i' | 'S'))
}

/// True for `p1`..`pN` parameter fields (read-only).
pub fn is_pfield(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next() == Some('p')
        && name.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

/// A complete parsed program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub instruments: Vec<InstrDef>,
    pub opcodes: Vec<UdoDef>,
    /// Guard for the dependency pass: set once lock markers and weights
    /// have been attached, so re-running the pass is a no-op.
    pub annotated: bool,
}

/// An `instr ... endin` block.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrDef {
    /// Numeric instrument id, unique across the program. Named
    /// instruments are assigned the next free number by the parser.
    pub id: u32,
    /// Present for `instr name` definitions.
    pub name: Option<String>,
    pub body: Vec<Stmt>,
    /// Scheduling weight, filled in by the analyzer under multi-threaded
    /// compilation. Zero until then.
    pub weight: u32,
    pub line: usize,
}

/// An `opcode name, outtypes, intypes ... endop` block.
#[derive(Debug, Clone, PartialEq)]
pub struct UdoDef {
    pub name: String,
    pub out_rates: Vec<Rate>,
    pub in_rates: Vec<Rate>,
    pub body: Vec<Stmt>,
    pub line: usize,
}

/// A statement with its source line and any attached lock markers.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
    /// Shared resources this statement must hold while executing.
    /// Inserted by the dependency analyzer, consumed by the graph
    /// compiler. Sorted, duplicate-free.
    pub locks: Vec<String>,
}

impl Stmt {
    pub fn new(kind: StmtKind, line: usize) -> Self {
        Self {
            kind,
            line,
            locks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `target = value`
    Assign { target: String, value: Expr },
    /// `out1, out2 opname arg1, arg2`
    Call {
        outs: Vec<String>,
        opcode: String,
        args: Vec<Expr>,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While { cond: Expr, body: Vec<Stmt> },
    Label(String),
    Goto(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Var(String),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { opcode: String, args: Vec<Expr> },
}

impl Expr {
    /// Atomic expressions survive expression expansion unchanged.
    pub fn is_atomic(&self) -> bool {
        matches!(self, Expr::Number(_) | Expr::Str(_) | Expr::Var(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    /// Elementary opcode name this operator lowers to.
    pub fn opcode(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Pow => "pow",
            BinOp::Mod => "mod",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_from_prefix() {
        assert_eq!(Rate::of_name("asig"), Some(Rate::Audio));
        assert_eq!(Rate::of_name("kamp"), Some(Rate::Control));
        assert_eq!(Rate::of_name("ifreq"), Some(Rate::Init));
        assert_eq!(Rate::of_name("Sname"), Some(Rate::Str));
        assert_eq!(Rate::of_name("gkfreq"), Some(Rate::Control));
        assert_eq!(Rate::of_name("ga1"), Some(Rate::Audio));
        assert_eq!(Rate::of_name("p4"), Some(Rate::Init));
        assert_eq!(Rate::of_name("#k0"), Some(Rate::Control));
        assert_eq!(Rate::of_name("#a2"), Some(Rate::Audio));
        assert_eq!(Rate::of_name("x"), None);
    }

    #[test]
    fn global_name_detection() {
        assert!(is_global_name("gkfreq"));
        assert!(is_global_name("gasig"));
        assert!(is_global_name("gSname"));
        assert!(!is_global_name("kamp"));
        assert!(!is_global_name("goto1")); // 'o' is not a rate letter
    }

    #[test]
    fn pfield_detection() {
        assert!(is_pfield("p1"));
        assert!(is_pfield("p12"));
        assert!(!is_pfield("p"));
        assert!(!is_pfield("pluck"));
    }

    #[test]
    fn atomic_exprs() {
        assert!(Expr::Number(1.0).is_atomic());
        assert!(Expr::Var("kamp".to_string()).is_atomic());
        assert!(!Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(Expr::Number(1.0)),
            rhs: Box::new(Expr::Number(2.0)),
        }
        .is_atomic());
    }
}
