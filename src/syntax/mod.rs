//! Lexing, parsing, and the symbol table.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod symbol;
pub mod token;
