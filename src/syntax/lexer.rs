//! Lexer for the orchestra language.
//!
//! Consumes the macro-expanded source and produces a flat stream of
//! [`Token`]s. A malformed character sequence here is the unrecoverable
//! "invalid input" outcome, distinct from grammar errors found later.

use crate::error::CompileError;

use super::token::{Token, TokenKind};

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            self.skip_comment();
            self.skip_whitespace();

            if self.is_at_end() {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line: self.line,
                    col: self.col,
                });
                break;
            }

            let ch = self.peek();

            if ch == '\n' {
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    line: self.line,
                    col: self.col,
                });
                self.advance();
                self.line += 1;
                self.col = 1;
                continue;
            }

            let token = match ch {
                '(' => self.single_char(TokenKind::LParen),
                ')' => self.single_char(TokenKind::RParen),
                ',' => self.single_char(TokenKind::Comma),
                ':' => self.single_char(TokenKind::Colon),
                '^' => self.single_char(TokenKind::Caret),
                '%' => self.single_char(TokenKind::Percent),
                '+' => self.one_or_two('=', TokenKind::Plus, TokenKind::PlusEq),
                '-' => self.one_or_two('=', TokenKind::Minus, TokenKind::MinusEq),
                '*' => self.one_or_two('=', TokenKind::Star, TokenKind::StarEq),
                '/' => self.one_or_two('=', TokenKind::Slash, TokenKind::SlashEq),
                '=' => self.one_or_two('=', TokenKind::Eq, TokenKind::EqEq),
                '<' => self.one_or_two('=', TokenKind::Lt, TokenKind::Le),
                '>' => self.one_or_two('=', TokenKind::Gt, TokenKind::Ge),
                '!' => {
                    let line = self.line;
                    let col = self.col;
                    self.advance();
                    if !self.is_at_end() && self.peek() == '=' {
                        self.advance();
                        Token {
                            kind: TokenKind::BangEq,
                            line,
                            col,
                        }
                    } else {
                        return Err(CompileError::invalid_input(
                            "expected '=' after '!'",
                            line,
                            col,
                        ));
                    }
                }
                '"' => self.lex_string()?,
                '0'..='9' | '.' => self.lex_number()?,
                'a'..='z' | 'A'..='Z' | '_' | '#' => self.lex_ident_or_keyword(),
                _ => {
                    return Err(CompileError::invalid_input(
                        format!("unexpected character: '{ch}'"),
                        self.line,
                        self.col,
                    ));
                }
            };

            tokens.push(token);
        }

        Ok(tokens)
    }

    fn peek(&self) -> char {
        self.chars[self.pos]
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> char {
        let ch = self.chars[self.pos];
        self.pos += 1;
        if ch != '\n' {
            self.col += 1;
        }
        ch
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() {
            let ch = self.peek();
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) {
        if !self.is_at_end() && self.peek() == ';' {
            while !self.is_at_end() && self.peek() != '\n' {
                self.advance();
            }
        }
        if !self.is_at_end() && self.peek() == '/' && self.peek_next() == Some('/') {
            while !self.is_at_end() && self.peek() != '\n' {
                self.advance();
            }
        }
    }

    fn single_char(&mut self, kind: TokenKind) -> Token {
        let line = self.line;
        let col = self.col;
        self.advance();
        Token { kind, line, col }
    }

    /// Lex `ch` as `one`, or as `two` when followed by `second`.
    fn one_or_two(&mut self, second: char, one: TokenKind, two: TokenKind) -> Token {
        let line = self.line;
        let col = self.col;
        self.advance();
        if !self.is_at_end() && self.peek() == second {
            self.advance();
            Token { kind: two, line, col }
        } else {
            Token { kind: one, line, col }
        }
    }

    fn lex_string(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        let col = self.col;
        self.advance(); // consume opening '"'
        let mut s = String::new();
        while !self.is_at_end() && self.peek() != '"' && self.peek() != '\n' {
            s.push(self.advance());
        }
        if self.is_at_end() || self.peek() == '\n' {
            return Err(CompileError::invalid_input(
                "unclosed string literal",
                line,
                col,
            ));
        }
        self.advance(); // consume closing '"'
        Ok(Token {
            kind: TokenKind::Str(s),
            line,
            col,
        })
    }

    fn lex_number(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        let col = self.col;
        let mut s = String::new();

        while !self.is_at_end() && self.peek().is_ascii_digit() {
            s.push(self.advance());
        }
        if !self.is_at_end() && self.peek() == '.' {
            s.push(self.advance());
            while !self.is_at_end() && self.peek().is_ascii_digit() {
                s.push(self.advance());
            }
        }
        if !self.is_at_end() && (self.peek() == 'e' || self.peek() == 'E') {
            let saved = self.pos;
            let saved_col = self.col;
            let mut exp = String::new();
            exp.push(self.advance());
            if !self.is_at_end() && (self.peek() == '+' || self.peek() == '-') {
                exp.push(self.advance());
            }
            if !self.is_at_end() && self.peek().is_ascii_digit() {
                while !self.is_at_end() && self.peek().is_ascii_digit() {
                    exp.push(self.advance());
                }
                s.push_str(&exp);
            } else {
                // Not an exponent, restore
                self.pos = saved;
                self.col = saved_col;
            }
        }

        let val: f64 = s
            .parse()
            .map_err(|_| CompileError::invalid_input(format!("invalid number: {s}"), line, col))?;
        Ok(Token {
            kind: TokenKind::Number(val),
            line,
            col,
        })
    }

    fn lex_ident_or_keyword(&mut self) -> Token {
        let line = self.line;
        let col = self.col;
        let mut s = String::new();

        // '#' only appears in compiler-generated temporary names, which
        // re-enter the lexer in tests; accept it as a leading character.
        while !self.is_at_end()
            && (self.peek().is_ascii_alphanumeric() || self.peek() == '_' || self.peek() == '#')
        {
            s.push(self.advance());
        }

        let kind = match s.as_str() {
            "instr" => TokenKind::Instr,
            "endin" => TokenKind::Endin,
            "opcode" => TokenKind::Opcode,
            "endop" => TokenKind::Endop,
            "if" => TokenKind::If,
            "then" => TokenKind::Then,
            "else" => TokenKind::Else,
            "endif" => TokenKind::Endif,
            "while" => TokenKind::While,
            "do" => TokenKind::Do,
            "od" => TokenKind::Od,
            "goto" => TokenKind::Goto,
            _ => TokenKind::Ident(s),
        };

        Token { kind, line, col }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn lex_instr_block() {
        let mut lexer = Lexer::new("instr 1\nendin");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Instr);
        assert_eq!(tokens[1].kind, TokenKind::Number(1.0));
        assert_eq!(tokens[2].kind, TokenKind::Newline);
        assert_eq!(tokens[3].kind, TokenKind::Endin);
    }

    #[test]
    fn lex_assignment() {
        let mut lexer = Lexer::new("kamp = 0.5");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("kamp".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Eq);
        assert_eq!(tokens[2].kind, TokenKind::Number(0.5));
    }

    #[test]
    fn lex_compound_assign() {
        let mut lexer = Lexer::new("kx += 1");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[1].kind, TokenKind::PlusEq);
    }

    #[test]
    fn lex_comparison_operators() {
        let mut lexer = Lexer::new("== != < <= > >=");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::EqEq);
        assert_eq!(tokens[1].kind, TokenKind::BangEq);
        assert_eq!(tokens[2].kind, TokenKind::Lt);
        assert_eq!(tokens[3].kind, TokenKind::Le);
        assert_eq!(tokens[4].kind, TokenKind::Gt);
        assert_eq!(tokens[5].kind, TokenKind::Ge);
    }

    #[test]
    fn lex_call_line() {
        let mut lexer = Lexer::new("asig oscil kamp, 440");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("asig".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Ident("oscil".to_string()));
        assert_eq!(tokens[2].kind, TokenKind::Ident("kamp".to_string()));
        assert_eq!(tokens[3].kind, TokenKind::Comma);
        assert_eq!(tokens[4].kind, TokenKind::Number(440.0));
    }

    #[test]
    fn lex_semicolon_comment() {
        let mut lexer = Lexer::new("kamp = 1 ; gain\nout asig");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[3].kind, TokenKind::Newline);
        assert_eq!(tokens[4].kind, TokenKind::Ident("out".to_string()));
    }

    #[test]
    fn lex_string_literal() {
        let mut lexer = Lexer::new(r#"Sname = "impulse.wav""#);
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[2].kind, TokenKind::Str("impulse.wav".to_string()));
    }

    #[test]
    fn lex_exponent_number() {
        let mut lexer = Lexer::new("1.5e3");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number(1500.0));
    }

    #[test]
    fn lex_label_and_goto() {
        let mut lexer = Lexer::new("top:\ngoto top");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("top".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Colon);
        assert_eq!(tokens[3].kind, TokenKind::Goto);
    }

    #[test]
    fn lex_line_tracking() {
        let mut lexer = Lexer::new("instr 1\nkamp = 1\nendin");
        let tokens = lexer.tokenize().unwrap();
        let endin = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Endin)
            .unwrap();
        assert_eq!(endin.line, 3);
    }

    #[test]
    fn lex_error_is_invalid_input() {
        let mut lexer = Lexer::new("kamp = @");
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn lex_unclosed_string_is_invalid_input() {
        let mut lexer = Lexer::new("Sname = \"oops\nout asig");
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn lex_empty_input() {
        let mut lexer = Lexer::new("");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }

    #[test]
    fn lex_generated_temp_name() {
        let mut lexer = Lexer::new("#k0 = 2");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("#k0".to_string()));
    }
}
