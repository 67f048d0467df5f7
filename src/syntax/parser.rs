//! Parser for the orchestra language.
//!
//! Grammar-derives a [`Program`] from the token stream and registers
//! instruments, user-defined opcodes, and globals in the symbol table.
//!
//! Grammar violations do not abort the parse: the parser records the
//! error, resynchronizes at the next statement boundary, and keeps going
//! so one pass can report every problem. A nonzero error count at end of
//! input fails the compilation with the `Syntax { count }` outcome.
//! Running off the end of the input inside a block is different: there is
//! nothing to resynchronize to, so it aborts at once as invalid input.

use crate::error::{CompileError, ErrorKind};

use super::ast::*;
use super::symbol::SymbolTable;
use super::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    pub fn parse(&mut self, symbols: &mut SymbolTable) -> Result<Program, CompileError> {
        let mut program = Program::default();

        self.skip_newlines();
        while !self.is_at_end() {
            self.skip_newlines();
            if self.is_at_end() {
                break;
            }

            match &self.peek().kind {
                TokenKind::Instr => match self.parse_instr(symbols) {
                    Ok(instr) => {
                        reserve(&mut program.instruments, self.peek().line)?;
                        program.instruments.push(instr);
                    }
                    Err(e) if self.unrecoverable(&e) => return Err(e),
                    Err(e) => self.recover(e),
                },
                TokenKind::Opcode => match self.parse_udo(symbols) {
                    Ok(udo) => {
                        reserve(&mut program.opcodes, self.peek().line)?;
                        program.opcodes.push(udo);
                    }
                    Err(e) if self.unrecoverable(&e) => return Err(e),
                    Err(e) => self.recover(e),
                },
                TokenKind::Eof => break,
                _ => {
                    let t = self.peek();
                    let err = CompileError::invalid_input(
                        format!("expected 'instr' or 'opcode', got {:?}", t.kind),
                        t.line,
                        t.col,
                    );
                    self.recover(err);
                }
            }
        }

        if !self.errors.is_empty() {
            return Err(CompileError::syntax(self.errors.len()));
        }
        Ok(program)
    }

    fn parse_instr(&mut self, symbols: &mut SymbolTable) -> Result<InstrDef, CompileError> {
        let start = self.expect(TokenKind::Instr)?;
        let line = start.line;

        let (id, name) = match self.peek().kind.clone() {
            TokenKind::Number(n) if n > 0.0 && n.fract() == 0.0 => {
                self.advance();
                (n as u32, None)
            }
            TokenKind::Ident(s) => {
                self.advance();
                (symbols.next_free_instrument_id(), Some(s))
            }
            ref other => {
                let t = self.peek();
                return Err(CompileError::invalid_input(
                    format!("expected instrument number or name, got {other:?}"),
                    t.line,
                    t.col,
                ));
            }
        };

        if !symbols.add_instrument(id, name.as_deref()) {
            self.errors.push(CompileError::invalid_input(
                match &name {
                    Some(n) => format!("duplicate instrument name '{n}'"),
                    None => format!("duplicate instrument number {id}"),
                },
                line,
                0,
            ));
        }

        self.expect_newline()?;
        let body = self.parse_body(&[TokenKind::Endin])?;
        self.expect(TokenKind::Endin)?;

        Ok(InstrDef {
            id,
            name,
            body,
            weight: 0,
            line,
        })
    }

    fn parse_udo(&mut self, symbols: &mut SymbolTable) -> Result<UdoDef, CompileError> {
        let start = self.expect(TokenKind::Opcode)?;
        let line = start.line;

        let name = self.expect_ident()?;
        if !symbols.add_udo(&name) {
            self.errors.push(CompileError::invalid_input(
                format!("duplicate opcode definition '{name}'"),
                line,
                0,
            ));
        }
        self.expect(TokenKind::Comma)?;
        let out_rates = self.parse_rate_list()?;
        self.expect(TokenKind::Comma)?;
        let in_rates = self.parse_rate_list()?;
        self.expect_newline()?;

        let body = self.parse_body(&[TokenKind::Endop])?;
        self.expect(TokenKind::Endop)?;

        Ok(UdoDef {
            name,
            out_rates,
            in_rates,
            body,
            line,
        })
    }

    /// A rate string such as `ak`, or `0` for an empty list.
    fn parse_rate_list(&mut self) -> Result<Vec<Rate>, CompileError> {
        let t = self.peek().clone();
        match &t.kind {
            TokenKind::Number(n) if *n == 0.0 => {
                self.advance();
                Ok(Vec::new())
            }
            TokenKind::Ident(s) => {
                let mut rates = Vec::new();
                for ch in s.chars() {
                    match ch {
                        'a' => rates.push(Rate::Audio),
                        'k' => rates.push(Rate::Control),
                        'i' => rates.push(Rate::Init),
                        'S' => rates.push(Rate::Str),
                        _ => {
                            return Err(CompileError::invalid_input(
                                format!("invalid rate letter '{ch}' in '{s}'"),
                                t.line,
                                t.col,
                            ));
                        }
                    }
                }
                self.advance();
                Ok(rates)
            }
            other => Err(CompileError::invalid_input(
                format!("expected rate string, got {other:?}"),
                t.line,
                t.col,
            )),
        }
    }

    /// Statements until one of `terminators` (not consumed).
    fn parse_body(&mut self, terminators: &[TokenKind]) -> Result<Vec<Stmt>, CompileError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.is_at_end() {
                let t = self.peek();
                return Err(CompileError::invalid_input(
                    "unexpected end of input inside a block",
                    t.line,
                    t.col,
                ));
            }
            if terminators.contains(&self.peek().kind) {
                return Ok(body);
            }
            match self.parse_stmt() {
                Ok(stmt) => {
                    reserve(&mut body, stmt.line)?;
                    body.push(stmt);
                }
                Err(e) => {
                    // Count the error and resynchronize at the next line.
                    self.errors.push(e);
                    self.sync_to_newline();
                }
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let t = self.peek().clone();
        match &t.kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Goto => {
                self.advance();
                let label = self.expect_ident()?;
                self.end_of_stmt()?;
                Ok(Stmt::new(StmtKind::Goto(label), t.line))
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.parse_ident_stmt(name, t.line)
            }
            other => Err(CompileError::invalid_input(
                format!("unexpected token at start of statement: {other:?}"),
                t.line,
                t.col,
            )),
        }
    }

    /// A statement opening with an identifier: label, assignment, or
    /// opcode call (with or without result names).
    fn parse_ident_stmt(&mut self, first: String, line: usize) -> Result<Stmt, CompileError> {
        self.advance(); // consume the identifier

        match self.peek().kind.clone() {
            TokenKind::Colon => {
                self.advance();
                Ok(Stmt::new(StmtKind::Label(first), line))
            }
            TokenKind::Eq => {
                self.advance();
                let value = self.parse_expr()?;
                self.end_of_stmt()?;
                Ok(Stmt::new(
                    StmtKind::Assign {
                        target: first,
                        value,
                    },
                    line,
                ))
            }
            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::SlashEq => {
                // Sugared compound assignment, normalized here so later
                // stages only ever see the canonical `x = x op e` shape.
                let op = match self.advance().kind {
                    TokenKind::PlusEq => BinOp::Add,
                    TokenKind::MinusEq => BinOp::Sub,
                    TokenKind::StarEq => BinOp::Mul,
                    _ => BinOp::Div,
                };
                let rhs = self.parse_expr()?;
                self.end_of_stmt()?;
                Ok(Stmt::new(
                    StmtKind::Assign {
                        target: first.clone(),
                        value: Expr::Binary {
                            op,
                            lhs: Box::new(Expr::Var(first)),
                            rhs: Box::new(rhs),
                        },
                    },
                    line,
                ))
            }
            TokenKind::Comma => {
                // Result list: out1, out2 opname args
                let mut outs = vec![first];
                while self.check(TokenKind::Comma) {
                    self.advance();
                    outs.push(self.expect_ident()?);
                }
                let opcode = self.expect_ident()?;
                let args = self.parse_arg_list()?;
                self.end_of_stmt()?;
                Ok(Stmt::new(StmtKind::Call { outs, opcode, args }, line))
            }
            _ => {
                // Either `result opname args` or a zero-result call
                // `opname args`. Result names always carry a rate prefix;
                // plain opcode names never do.
                if Rate::of_name(&first).is_some() && !is_pfield(&first) {
                    let opcode = self.expect_ident()?;
                    let args = self.parse_arg_list()?;
                    self.end_of_stmt()?;
                    Ok(Stmt::new(
                        StmtKind::Call {
                            outs: vec![first],
                            opcode,
                            args,
                        },
                        line,
                    ))
                } else {
                    let args = self.parse_arg_list()?;
                    self.end_of_stmt()?;
                    Ok(Stmt::new(
                        StmtKind::Call {
                            outs: Vec::new(),
                            opcode: first,
                            args,
                        },
                        line,
                    ))
                }
            }
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenKind::If)?;
        let line = start.line;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        self.expect_newline()?;

        let then_body = self.parse_body(&[TokenKind::Else, TokenKind::Endif])?;
        let else_body = if self.check(TokenKind::Else) {
            self.advance();
            self.expect_newline()?;
            self.parse_body(&[TokenKind::Endif])?
        } else {
            Vec::new()
        };
        self.expect(TokenKind::Endif)?;
        self.end_of_stmt()?;

        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            line,
        ))
    }

    fn parse_while(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(TokenKind::While)?;
        let line = start.line;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Do)?;
        self.expect_newline()?;
        let body = self.parse_body(&[TokenKind::Od])?;
        self.expect(TokenKind::Od)?;
        self.end_of_stmt()?;

        Ok(Stmt::new(StmtKind::While { cond, body }, line))
    }

    fn parse_arg_list(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.check(TokenKind::Newline) || self.check(TokenKind::Eof) {
            return Ok(args);
        }
        args.push(self.parse_expr()?);
        while self.check(TokenKind::Comma) {
            self.advance();
            args.push(self.parse_expr()?);
        }
        Ok(args)
    }

    // --- Expressions, by precedence ---

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::BangEq => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_power()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_unary()?;
        if self.check(TokenKind::Caret) {
            self.advance();
            // Right-associative
            let rhs = self.parse_power()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if self.check(TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary()?;
            // Fold negation of a literal immediately.
            if let Expr::Number(n) = operand {
                return Ok(Expr::Number(-n));
            }
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let t = self.peek().clone();
        match &t.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(*n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s.clone()))
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.check(TokenKind::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        while self.check(TokenKind::Comma) {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    Ok(Expr::Call {
                        opcode: name.clone(),
                        args,
                    })
                } else {
                    Ok(Expr::Var(name.clone()))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(CompileError::invalid_input(
                format!("expected expression, got {other:?}"),
                t.line,
                t.col,
            )),
        }
    }

    // --- Utility methods ---

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len() || self.peek().kind == TokenKind::Eof
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        if self.check(kind.clone()) {
            Ok(self.advance())
        } else {
            let t = self.peek();
            Err(CompileError::invalid_input(
                format!("expected {:?}, got {:?}", kind, t.kind),
                t.line,
                t.col,
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        let t = self.peek().clone();
        match &t.kind {
            TokenKind::Ident(s) => {
                self.advance();
                Ok(s.clone())
            }
            other => Err(CompileError::invalid_input(
                format!("expected identifier, got {other:?}"),
                t.line,
                t.col,
            )),
        }
    }

    fn expect_newline(&mut self) -> Result<(), CompileError> {
        if self.check(TokenKind::Newline) {
            self.advance();
            Ok(())
        } else {
            let t = self.peek();
            Err(CompileError::invalid_input(
                format!("expected end of line, got {:?}", t.kind),
                t.line,
                t.col,
            ))
        }
    }

    /// Statements end at a newline (or end of input).
    fn end_of_stmt(&mut self) -> Result<(), CompileError> {
        if self.check(TokenKind::Eof) {
            return Ok(());
        }
        self.expect_newline()
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn recover(&mut self, err: CompileError) {
        self.errors.push(err);
        self.sync_to_newline();
    }

    /// Errors the parser cannot resynchronize past: the input ran out, or
    /// allocation failed while growing the tree. These surface directly
    /// instead of joining the counted grammar violations.
    fn unrecoverable(&self, err: &CompileError) -> bool {
        self.is_at_end() || matches!(err.kind, ErrorKind::OutOfMemory)
    }

    fn sync_to_newline(&mut self) {
        while !self.is_at_end() && !self.check(TokenKind::Newline) {
            self.advance();
        }
        if self.check(TokenKind::Newline) {
            self.advance();
        }
    }
}

/// Grow `vec` by one slot, surfacing allocation failure as the
/// memory-exhaustion outcome instead of aborting.
fn reserve<T>(vec: &mut Vec<T>, line: usize) -> Result<(), CompileError> {
    vec.try_reserve(1)
        .map_err(|_| CompileError::out_of_memory(line))
}
