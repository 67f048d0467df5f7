//! Token types for the orchestra lexer.

/// A token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

/// The kind of token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Instr,
    Endin,
    Opcode,
    Endop,
    If,
    Then,
    Else,
    Endif,
    While,
    Do,
    Od,
    Goto,

    // Literals
    Ident(String),
    Number(f64),
    Str(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,
    EqEq,
    BangEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,        // =
    PlusEq,    // +=
    MinusEq,   // -=
    StarEq,    // *=
    SlashEq,   // /=

    // Delimiters
    LParen,
    RParen,
    Comma,
    Colon,

    // Special
    Newline,
    Eof,
}
