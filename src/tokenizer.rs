//=====================================================
// File: tokenizer.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Total, restartable lexer shared by every syntax level
// Objective: Turn source text into tokens without ever failing; malformed
//            input becomes Invalid tokens the parser reports later
//=====================================================

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::symbol::Symbol;

/// Position of a token in the source: 1-based line/column plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The four surface grammars. Selected by `@high`, `@medium`, `@low` and
/// `@assembly` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxLevel {
    High,
    #[default]
    Medium,
    Low,
    Assembly,
}

impl SyntaxLevel {
    pub fn from_marker(name: &str) -> Option<Self> {
        match name {
            "high" => Some(SyntaxLevel::High),
            "medium" => Some(SyntaxLevel::Medium),
            "low" => Some(SyntaxLevel::Low),
            "assembly" => Some(SyntaxLevel::Assembly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyntaxLevel::High => "high",
            SyntaxLevel::Medium => "medium",
            SyntaxLevel::Low => "low",
            SyntaxLevel::Assembly => "assembly",
        }
    }

    /// High and assembly are terminated by newlines, medium and low by braces
    /// and semicolons.
    pub fn is_line_oriented(self) -> bool {
        matches!(self, SyntaxLevel::High | SyntaxLevel::Assembly)
    }
}

impl fmt::Display for SyntaxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyntaxLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyntaxLevel::from_marker(s.trim_start_matches('@'))
            .ok_or_else(|| format!("unknown syntax level '{s}'"))
    }
}

/// Malformed input, carried inside `TokenKind::Invalid`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unrecognized character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("malformed number literal '{0}'")]
    MalformedNumber(String),
    #[error("unknown syntax level marker '@{0}'")]
    UnknownMarker(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer(i64),
    Float(f64),
    /// Number with a glued unit suffix, e.g. `9.81m`.
    Quantity(f64, Symbol),
    String(String),
    Boolean(bool),
    Null,

    Identifier(Symbol),

    // Keywords shared by the brace levels
    Let,
    Const,
    Mut,
    Fn,
    Return,
    If,
    Else,
    While,
    For,
    In,
    Loop,
    Break,
    Continue,
    Match,
    Try,
    Catch,
    Finally,
    Throw,
    Class,
    Interface,
    Enum,
    Struct,
    New,
    Sizeof,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    EqualEqual,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    AndAnd,
    OrOr,
    Bang,
    Amp,
    Pipe,
    Caret,
    Tilde,
    ShiftLeft,
    ShiftRight,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PlusPlus,
    MinusMinus,
    Arrow,
    FatArrow,
    Question,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Colon,
    ColonColon,
    Dot,
    DotDot,
    DotDotEqual,
    Hash,

    // Special
    LevelMarker(SyntaxLevel),
    Newline,
    Invalid(LexError),
    Eof,
}

impl TokenKind {
    /// Keywords that start a statement in the brace levels. Used as
    /// synchronization points after a parse error.
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            TokenKind::Let
                | TokenKind::Const
                | TokenKind::Fn
                | TokenKind::Return
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Loop
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Match
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Class
                | TokenKind::Interface
                | TokenKind::Enum
                | TokenKind::Struct
        )
    }

    pub fn same_variant(&self, other: &TokenKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Integer(n) => write!(f, "{n}"),
            TokenKind::Float(n) => write!(f, "{n}"),
            TokenKind::Quantity(n, unit) => write!(f, "{n}{unit}"),
            TokenKind::String(s) => write!(f, "\"{s}\""),
            TokenKind::Boolean(b) => write!(f, "{b}"),
            TokenKind::Null => write!(f, "null"),
            TokenKind::Identifier(s) => write!(f, "{s}"),
            TokenKind::LevelMarker(level) => write!(f, "@{level}"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Eof => write!(f, "end of input"),
            TokenKind::Invalid(err) => write!(f, "invalid token ({err})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub position: Position,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, position: Position) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            position,
        }
    }
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut keywords = HashMap::new();
    keywords.insert("let", TokenKind::Let);
    keywords.insert("const", TokenKind::Const);
    keywords.insert("mut", TokenKind::Mut);
    keywords.insert("fn", TokenKind::Fn);
    keywords.insert("return", TokenKind::Return);
    keywords.insert("if", TokenKind::If);
    keywords.insert("else", TokenKind::Else);
    keywords.insert("while", TokenKind::While);
    keywords.insert("for", TokenKind::For);
    keywords.insert("in", TokenKind::In);
    keywords.insert("loop", TokenKind::Loop);
    keywords.insert("break", TokenKind::Break);
    keywords.insert("continue", TokenKind::Continue);
    keywords.insert("match", TokenKind::Match);
    keywords.insert("try", TokenKind::Try);
    keywords.insert("catch", TokenKind::Catch);
    keywords.insert("finally", TokenKind::Finally);
    keywords.insert("throw", TokenKind::Throw);
    keywords.insert("class", TokenKind::Class);
    keywords.insert("interface", TokenKind::Interface);
    keywords.insert("enum", TokenKind::Enum);
    keywords.insert("struct", TokenKind::Struct);
    keywords.insert("new", TokenKind::New);
    keywords.insert("sizeof", TokenKind::Sizeof);
    keywords.insert("null", TokenKind::Null);
    keywords.insert("true", TokenKind::Boolean(true));
    keywords.insert("false", TokenKind::Boolean(false));
    keywords
});

/// Saved scanner state; restoring it re-scans from exactly this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    index: usize,
    position: Position,
    finished: bool,
}

/// Streaming tokenizer. Yields tokens up to and including one `Eof`.
pub struct Tokenizer {
    input: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
    offset: usize,
    finished: bool,
}

impl Tokenizer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
            offset: 0,
            finished: false,
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            index: self.index,
            position: self.current_position(),
            finished: self.finished,
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.index = checkpoint.index;
        self.line = checkpoint.position.line;
        self.column = checkpoint.position.column;
        self.offset = checkpoint.position.offset;
        self.finished = checkpoint.finished;
    }

    fn is_at_end(&self) -> bool {
        self.index >= self.input.len()
    }

    fn current_char(&self) -> char {
        self.input.get(self.index).copied().unwrap_or('\0')
    }

    fn peek_char(&self, ahead: usize) -> Option<char> {
        self.input.get(self.index + ahead).copied()
    }

    fn advance(&mut self) -> char {
        let ch = self.current_char();
        self.index += 1;
        self.offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn current_position(&self) -> Position {
        Position::new(self.line, self.column, self.offset)
    }

    fn lexeme_from(&self, start: usize) -> String {
        self.input[start..self.index].iter().collect()
    }

    /// Skips blanks and comments. Returns an error token for an unterminated
    /// block comment.
    fn skip_trivia(&mut self) -> Option<Token> {
        loop {
            let ch = self.current_char();
            if self.is_at_end() {
                return None;
            }
            if ch == '\n' {
                return None;
            }
            if ch.is_whitespace() {
                self.advance();
                continue;
            }
            if ch == '/' && self.peek_char(1) == Some('/') {
                while !self.is_at_end() && self.current_char() != '\n' {
                    self.advance();
                }
                continue;
            }
            if ch == '/' && self.peek_char(1) == Some('*') {
                let start = self.index;
                let position = self.current_position();
                self.advance();
                self.advance();
                let mut closed = false;
                while !self.is_at_end() {
                    if self.current_char() == '*' && self.peek_char(1) == Some('/') {
                        self.advance();
                        self.advance();
                        closed = true;
                        break;
                    }
                    self.advance();
                }
                if !closed {
                    return Some(Token::new(
                        TokenKind::Invalid(LexError::UnterminatedComment),
                        self.lexeme_from(start),
                        position,
                    ));
                }
                continue;
            }
            return None;
        }
    }

    fn scan_token(&mut self) -> Token {
        if let Some(invalid) = self.skip_trivia() {
            return invalid;
        }
        let position = self.current_position();
        let start = self.index;
        if self.is_at_end() {
            self.finished = true;
            return Token::new(TokenKind::Eof, "", position);
        }

        let ch = self.current_char();
        let kind = if ch == '\n' {
            self.advance();
            TokenKind::Newline
        } else if ch == '"' {
            self.scan_string()
        } else if ch.is_ascii_digit() {
            self.scan_number()
        } else if ch.is_alphabetic() || ch == '_' {
            self.scan_identifier()
        } else if ch == '@' {
            self.scan_marker()
        } else {
            self.scan_operator()
        };

        Token::new(kind, self.lexeme_from(start), position)
    }

    fn scan_string(&mut self) -> TokenKind {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            if self.is_at_end() || self.current_char() == '\n' {
                return TokenKind::Invalid(LexError::UnterminatedString);
            }
            match self.advance() {
                '"' => return TokenKind::String(value),
                '\\' => {
                    if self.is_at_end() {
                        return TokenKind::Invalid(LexError::UnterminatedString);
                    }
                    match self.advance() {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                other => value.push(other),
            }
        }
    }

    fn scan_number(&mut self) -> TokenKind {
        let start = self.index;
        if self.current_char() == '0' && matches!(self.peek_char(1), Some('x' | 'X' | 'b' | 'B')) {
            self.advance();
            let radix = if matches!(self.advance(), 'x' | 'X') { 16 } else { 2 };
            let digits_start = self.index;
            while self.current_char().is_digit(radix) || self.current_char() == '_' {
                self.advance();
            }
            let digits: String = self.input[digits_start..self.index]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            return match i64::from_str_radix(&digits, radix) {
                Ok(value) => TokenKind::Integer(value),
                Err(_) => TokenKind::Invalid(LexError::MalformedNumber(self.lexeme_from(start))),
            };
        }

        let mut is_float = false;
        while self.current_char().is_ascii_digit() || self.current_char() == '_' {
            self.advance();
        }
        // `1..5` is a range, not a float.
        if self.current_char() == '.' && self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.current_char().is_ascii_digit() || self.current_char() == '_' {
                self.advance();
            }
        }
        if matches!(self.current_char(), 'e' | 'E') {
            let exponent_digit = match self.peek_char(1) {
                Some(c) if c.is_ascii_digit() => true,
                Some('+' | '-') => self.peek_char(2).is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if exponent_digit {
                is_float = true;
                self.advance();
                if matches!(self.current_char(), '+' | '-') {
                    self.advance();
                }
                while self.current_char().is_ascii_digit() {
                    self.advance();
                }
            }
        }

        let text: String = self.input[start..self.index]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        let unit_start = self.index;
        if self.current_char().is_alphabetic() {
            while self.current_char().is_alphanumeric() || self.current_char() == '_' {
                self.advance();
            }
        }
        let unit = self.lexeme_from(unit_start);

        let value: Result<f64, _> = text.parse::<f64>();
        if !unit.is_empty() {
            return match value {
                Ok(v) => TokenKind::Quantity(v, Symbol::from(unit)),
                Err(_) => TokenKind::Invalid(LexError::MalformedNumber(self.lexeme_from(start))),
            };
        }
        if is_float {
            match value {
                Ok(v) => TokenKind::Float(v),
                Err(_) => TokenKind::Invalid(LexError::MalformedNumber(text)),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => TokenKind::Integer(v),
                Err(_) => TokenKind::Invalid(LexError::MalformedNumber(text)),
            }
        }
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.index;
        while self.current_char().is_alphanumeric() || self.current_char() == '_' {
            self.advance();
        }
        let text = self.lexeme_from(start);
        KEYWORDS
            .get(text.as_str())
            .cloned()
            .unwrap_or_else(|| TokenKind::Identifier(Symbol::from(text)))
    }

    fn scan_marker(&mut self) -> TokenKind {
        self.advance(); // '@'
        let start = self.index;
        while self.current_char().is_alphanumeric() || self.current_char() == '_' {
            self.advance();
        }
        let name = self.lexeme_from(start);
        match SyntaxLevel::from_marker(&name) {
            Some(level) => TokenKind::LevelMarker(level),
            None => TokenKind::Invalid(LexError::UnknownMarker(name)),
        }
    }

    fn scan_operator(&mut self) -> TokenKind {
        let ch = self.advance();
        let next = self.current_char();
        let take = |tokenizer: &mut Self, kind: TokenKind| {
            tokenizer.advance();
            kind
        };
        match ch {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '?' => TokenKind::Question,
            '#' => TokenKind::Hash,
            '~' => TokenKind::Tilde,
            '^' => TokenKind::Caret,
            '%' => TokenKind::Percent,
            ':' if next == ':' => take(self, TokenKind::ColonColon),
            ':' => TokenKind::Colon,
            '.' if next == '.' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    TokenKind::DotDotEqual
                } else {
                    TokenKind::DotDot
                }
            }
            '.' => TokenKind::Dot,
            '+' if next == '+' => take(self, TokenKind::PlusPlus),
            '+' if next == '=' => take(self, TokenKind::PlusEqual),
            '+' => TokenKind::Plus,
            '-' if next == '-' => take(self, TokenKind::MinusMinus),
            '-' if next == '=' => take(self, TokenKind::MinusEqual),
            '-' if next == '>' => take(self, TokenKind::Arrow),
            '-' => TokenKind::Minus,
            '*' if next == '=' => take(self, TokenKind::StarEqual),
            '*' => TokenKind::Star,
            '/' if next == '=' => take(self, TokenKind::SlashEqual),
            '/' => TokenKind::Slash,
            '=' if next == '=' => take(self, TokenKind::EqualEqual),
            '=' if next == '>' => take(self, TokenKind::FatArrow),
            '=' => TokenKind::Equal,
            '!' if next == '=' => take(self, TokenKind::NotEqual),
            '!' => TokenKind::Bang,
            '<' if next == '=' => take(self, TokenKind::LessEqual),
            '<' if next == '<' => take(self, TokenKind::ShiftLeft),
            '<' => TokenKind::Less,
            '>' if next == '=' => take(self, TokenKind::GreaterEqual),
            '>' if next == '>' => take(self, TokenKind::ShiftRight),
            '>' => TokenKind::Greater,
            '&' if next == '&' => take(self, TokenKind::AndAnd),
            '&' => TokenKind::Amp,
            '|' if next == '|' => take(self, TokenKind::OrOr),
            '|' => TokenKind::Pipe,
            // Extended glyphs share kinds with their ASCII spellings.
            '≤' => TokenKind::LessEqual,
            '≥' => TokenKind::GreaterEqual,
            '≠' => TokenKind::NotEqual,
            '←' => TokenKind::Equal,
            '→' => TokenKind::Arrow,
            '∧' => TokenKind::AndAnd,
            '∨' => TokenKind::OrOr,
            '¬' => TokenKind::Bang,
            '×' => TokenKind::Star,
            '÷' => TokenKind::Slash,
            other => TokenKind::Invalid(LexError::UnexpectedCharacter(other)),
        }
    }
}

impl Iterator for Tokenizer {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished {
            return None;
        }
        Some(self.scan_token())
    }
}

/// Tokenizes the whole input. Always ends with a single `Eof` token.
pub fn tokenize(source: &str) -> Vec<Token> {
    Tokenizer::new(source).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_basic_expression() {
        assert_eq!(
            kinds("let x = 2 + 3;"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier(Symbol::from("x")),
                TokenKind::Equal,
                TokenKind::Integer(2),
                TokenKind::Plus,
                TokenKind::Integer(3),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn extended_glyphs_map_to_ascii_kinds() {
        assert_eq!(
            kinds("a ≤ b ≠ c × d ÷ e ← ¬f"),
            kinds("a <= b != c * d / e = !f")
        );
    }

    #[test]
    fn quantities_and_exponents() {
        assert_eq!(
            kinds("9.81m 3s 2e3 1..4"),
            vec![
                TokenKind::Quantity(9.81, Symbol::from("m")),
                TokenKind::Quantity(3.0, Symbol::from("s")),
                TokenKind::Float(2000.0),
                TokenKind::Integer(1),
                TokenKind::DotDot,
                TokenKind::Integer(4),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn malformed_input_becomes_invalid_tokens() {
        let tokens = kinds("x $ \"open");
        assert!(matches!(
            tokens[1],
            TokenKind::Invalid(LexError::UnexpectedCharacter('$'))
        ));
        assert!(matches!(
            tokens[2],
            TokenKind::Invalid(LexError::UnterminatedString)
        ));
        assert_eq!(tokens.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn markers_and_newlines() {
        assert_eq!(
            kinds("@high\n@weird"),
            vec![
                TokenKind::LevelMarker(SyntaxLevel::High),
                TokenKind::Newline,
                TokenKind::Invalid(LexError::UnknownMarker("weird".into())),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("a /* block\ncomment */ b // line"),
            vec![
                TokenKind::Identifier(Symbol::from("a")),
                TokenKind::Identifier(Symbol::from("b")),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn checkpoint_restore_rescans() {
        let mut tokenizer = Tokenizer::new("a b c");
        tokenizer.next();
        let saved = tokenizer.checkpoint();
        let first = tokenizer.next().map(|t| t.kind);
        tokenizer.next();
        tokenizer.restore(saved);
        assert_eq!(tokenizer.next().map(|t| t.kind), first);
    }

    #[test]
    fn positions_track_lines_and_bytes() {
        let tokens = tokenize("≤\n  x");
        assert_eq!(tokens[0].position, Position::new(1, 1, 0));
        assert_eq!(tokens[2].position, Position::new(2, 3, 6));
    }
}

//=====================================================
// End of file
//=====================================================
