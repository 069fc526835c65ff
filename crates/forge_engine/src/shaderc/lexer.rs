//! Hand-written lexer
//!
//! Skips whitespace and `//` line comments. Numbers starting with a digit
//! become integer literals unless a `.` appears, in which case a float
//! literal is produced and a trailing `f` is consumed. Identifiers match
//! `[A-Za-z_][A-Za-z0-9_]*` with the keywords `fn`, `let`, `pipeline`,
//! `uniform` and `var` carved out. Everything else is single-character
//! punctuation except the compound assignment operators.

use crate::shaderc::error::SourceLocation;
use crate::shaderc::token::{Token, TokenKind};

/// Token source with single-token lookahead.
pub struct Lexer<'src> {
    source: &'src [u8],
    position: usize,
    line: u32,
    column: u32,
    peeked: Option<Token>,
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

impl<'src> Lexer<'src> {
    /// Creates a lexer over the given source text.
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            position: 0,
            line: 1,
            column: 1,
            peeked: None,
        }
    }

    /// The location just past the last consumed token, for "expected X here"
    /// diagnostics.
    pub fn cursor_location(&self) -> SourceLocation {
        SourceLocation {
            line: self.line,
            column: self.column,
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex_token());
        }
        self.peeked.as_ref().unwrap()
    }

    /// Consumes and returns the next token.
    pub fn next(&mut self) -> Token {
        self.peeked.take().unwrap_or_else(|| self.lex_token())
    }

    fn peek_byte(&self) -> Option<u8> {
        self.source.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek_byte()?;
        self.position += 1;
        if byte == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(byte)
    }

    fn consume(&mut self, expected: u8) -> bool {
        if self.peek_byte() == Some(expected) {
            self.advance();
            return true;
        }
        false
    }

    fn lex_token(&mut self) -> Token {
        loop {
            while self.peek_byte().is_some_and(|byte| byte.is_ascii_whitespace()) {
                self.advance();
            }

            let location = self.cursor_location();
            let Some(byte) = self.advance() else {
                return Token::new(TokenKind::Eof, location);
            };

            if byte == b'/' && self.consume(b'/') {
                while self.peek_byte().is_some_and(|b| b != b'\n') {
                    self.advance();
                }
                continue;
            }

            if byte.is_ascii_digit() {
                return self.lex_number(location);
            }
            if is_ident_start(byte) {
                return self.lex_ident(location);
            }

            if byte == b'+' && self.consume(b'=') {
                return Token::new(TokenKind::PlusEqual, location);
            }
            if byte == b'-' && self.consume(b'=') {
                return Token::new(TokenKind::MinusEqual, location);
            }
            if byte == b'*' && self.consume(b'=') {
                return Token::new(TokenKind::AsteriskEqual, location);
            }
            if byte == b'/' && self.consume(b'=') {
                return Token::new(TokenKind::SlashEqual, location);
            }

            return Token::new(TokenKind::Punct(byte), location);
        }
    }

    fn lex_number(&mut self, location: SourceLocation) -> Token {
        let start = self.position - 1;
        let mut is_decimal = false;
        while self.peek_byte().is_some_and(|b| b.is_ascii_digit() || b == b'.') {
            if self.advance() == Some(b'.') {
                is_decimal = true;
            }
        }

        // The scanned range is ASCII digits and dots only.
        let text = std::str::from_utf8(&self.source[start..self.position]).unwrap();
        if is_decimal {
            let value = text.parse::<f32>().unwrap_or(0.0);
            self.consume(b'f');
            return Token::float(value, location);
        }
        Token::int(text.parse::<u64>().unwrap_or(0), location)
    }

    fn lex_ident(&mut self, location: SourceLocation) -> Token {
        let start = self.position - 1;
        while self.peek_byte().is_some_and(is_ident_continue) {
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[start..self.position]).unwrap();
        match text {
            "fn" => Token::new(TokenKind::KwFn, location),
            "let" => Token::new(TokenKind::KwLet, location),
            "pipeline" => Token::new(TokenKind::KwPipeline, location),
            "uniform" => Token::new(TokenKind::KwUniform, location),
            "var" => Token::new(TokenKind::KwVar, location),
            _ => Token::ident(text.to_owned(), location),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next();
            let kind = token.kind();
            kinds.push(kind);
            if kind == TokenKind::Eof {
                return kinds;
            }
        }
    }

    #[test]
    fn function_signature_token_sequence() {
        let mut lexer = Lexer::new("fn id(x: vec3, y: float) : vec4 { vec4(x, y) }");
        let expect_ident = |lexer: &mut Lexer, name: &str| {
            let token = lexer.next();
            assert_eq!(token.kind(), TokenKind::Ident);
            assert_eq!(token.string(), name);
        };
        assert_eq!(lexer.next().kind(), TokenKind::KwFn);
        expect_ident(&mut lexer, "id");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b'('));
        expect_ident(&mut lexer, "x");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b':'));
        expect_ident(&mut lexer, "vec3");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b','));
        expect_ident(&mut lexer, "y");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b':'));
        expect_ident(&mut lexer, "float");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b')'));
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b':'));
        expect_ident(&mut lexer, "vec4");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b'{'));
        expect_ident(&mut lexer, "vec4");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b'('));
        expect_ident(&mut lexer, "x");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b','));
        expect_ident(&mut lexer, "y");
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b')'));
        assert_eq!(lexer.next().kind(), TokenKind::Punct(b'}'));
        assert_eq!(lexer.next().kind(), TokenKind::Eof);
    }

    #[test]
    fn literals() {
        let mut lexer = Lexer::new("42 3.5f 1.0 7");
        assert_eq!(lexer.next().integer(), 42);
        assert_eq!(lexer.next().decimal(), 3.5);
        assert_eq!(lexer.next().decimal(), 1.0);
        assert_eq!(lexer.next().integer(), 7);
        assert_eq!(lexer.next().kind(), TokenKind::Eof);
    }

    #[test]
    fn comments_and_compound_assigns() {
        assert_eq!(
            kinds("a += b // trailing comment\na /= 2;"),
            vec![
                TokenKind::Ident,
                TokenKind::PlusEqual,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::SlashEqual,
                TokenKind::IntLit,
                TokenKind::Punct(b';'),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn eof_is_terminal() {
        let mut lexer = Lexer::new("");
        assert_eq!(lexer.next().kind(), TokenKind::Eof);
        assert_eq!(lexer.next().kind(), TokenKind::Eof);
        assert_eq!(lexer.peek().kind(), TokenKind::Eof);
    }

    #[test]
    fn locations_track_lines() {
        let mut lexer = Lexer::new("fn\n  main");
        assert_eq!(lexer.next().location().line, 1);
        let main = lexer.next();
        assert_eq!(main.location().line, 2);
        assert_eq!(main.location().column, 3);
    }
}
