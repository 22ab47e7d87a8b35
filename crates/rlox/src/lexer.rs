//! Lexer producing tokens on demand.
//!
//! The lexer holds a borrowed source buffer and a `(start, current, line)`
//! cursor; every call to [`Lexer::next_token`] scans exactly one token.
//! Nothing is buffered and no allocation happens here — token lexemes are
//! slices of the source, and error tokens carry a static diagnostic message
//! in place of a lexeme.

use std::str::FromStr;

use strum::EnumString;

/// Kind of a scanned token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    Str,
    Int,
    Float,
    // Keywords.
    And,
    Break,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    // Sentinels.
    Error,
    Eof,
}

/// Reserved words, recognized after an identifier has been scanned.
#[derive(Debug, Clone, Copy, EnumString)]
#[strum(serialize_all = "lowercase")]
enum Keyword {
    And,
    Break,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Return,
    Super,
    This,
    True,
    Var,
    While,
}

impl Keyword {
    fn token_kind(self) -> TokenKind {
        match self {
            Self::And => TokenKind::And,
            Self::Break => TokenKind::Break,
            Self::Class => TokenKind::Class,
            Self::Else => TokenKind::Else,
            Self::False => TokenKind::False,
            Self::For => TokenKind::For,
            Self::Fun => TokenKind::Fun,
            Self::If => TokenKind::If,
            Self::Nil => TokenKind::Nil,
            Self::Or => TokenKind::Or,
            Self::Return => TokenKind::Return,
            Self::Super => TokenKind::Super,
            Self::This => TokenKind::This,
            Self::True => TokenKind::True,
            Self::Var => TokenKind::Var,
            Self::While => TokenKind::While,
        }
    }
}

/// A scanned token. The lexeme borrows the source buffer; for `Error` tokens
/// it carries the diagnostic message instead.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl Token<'_> {
    /// Placeholder used to seed the parser before the first `advance`.
    pub fn synthetic_eof() -> Self {
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        }
    }
}

/// Scanner state: source buffer plus a `(start, current, line)` cursor.
#[derive(Debug)]
pub(crate) struct Lexer<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scans and returns the next token. Returns `Eof` on every call once
    /// the source is exhausted.
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        let Some(c) = self.advance() else {
            return self.make_token(TokenKind::Eof);
        };

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b';' => self.make_token(TokenKind::Semicolon),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => self.two_char(b'=', TokenKind::BangEqual, TokenKind::Bang),
            b'=' => self.two_char(b'=', TokenKind::EqualEqual, TokenKind::Equal),
            b'>' => self.two_char(b'=', TokenKind::GreaterEqual, TokenKind::Greater),
            b'<' => self.two_char(b'=', TokenKind::LessEqual, TokenKind::Less),
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            c if is_identifier_start(c) => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\r' | b'\t') => {
                    self.current += 1;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.current += 1;
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    // A comment runs to the end of the line.
                    while !matches!(self.peek(), Some(b'\n') | None) {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        loop {
            match self.peek() {
                Some(b'"') => break,
                Some(b'\n') => {
                    self.line += 1;
                    self.current += 1;
                }
                Some(_) => self.current += 1,
                None => return self.error_token("Unterminated string."),
            }
        }
        // The closing quote.
        self.current += 1;
        self.make_token(TokenKind::Str)
    }

    /// Scans a numeric literal: digits, an optional fraction (requiring at
    /// least one digit after the dot), and an optional exponent. Underscores
    /// are permitted between digits as separators; the compiler strips them
    /// before conversion. A fraction or exponent makes the token a float.
    fn number(&mut self) -> Token<'src> {
        let mut is_float = false;
        self.digits();

        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.current += 1;
            self.digits();
        }

        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut lookahead = self.current + 1;
            if matches!(self.source.as_bytes().get(lookahead).copied(), Some(b'+' | b'-')) {
                lookahead += 1;
            }
            // Only consume the exponent if at least one digit follows.
            if self.source.as_bytes().get(lookahead).copied().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.current = lookahead;
                self.digits();
            }
        }

        self.make_token(if is_float { TokenKind::Float } else { TokenKind::Int })
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'_') {
            self.current += 1;
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().is_some_and(is_identifier_continue) {
            self.current += 1;
        }
        let lexeme = &self.source[self.start..self.current];
        match Keyword::from_str(lexeme) {
            Ok(keyword) => self.make_token(keyword.token_kind()),
            Err(_) => self.make_token(TokenKind::Identifier),
        }
    }

    fn two_char(&mut self, expected: u8, double: TokenKind, single: TokenKind) -> Token<'src> {
        if self.peek() == Some(expected) {
            self.current += 1;
            self.make_token(double)
        } else {
            self.make_token(single)
        }
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.source.as_bytes().get(self.current).copied()?;
        self.current += 1;
        Some(byte)
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    #[inline]
    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }
}

fn is_identifier_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_identifier_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
