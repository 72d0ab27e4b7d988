//=============================================
// strata/parser/mod.rs
//=============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Level-dispatching recursive descent parser
// Objective: Drive the four syntax-level grammars over one token stream,
//            switching on level markers, and recover from errors at the
//            next statement boundary of the active level
//=============================================

//=============================================
//            Section 1: Imports & Submodules
//=============================================

mod assembly;
mod expr;
mod high;
mod medium;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::ast::{Program, Stmt};
use crate::diagnostics::{Diagnostic, Diagnostics, ErrorCode};
use crate::symbol::{Symbol, SymbolGenerator};
use crate::tokenizer::{LexError, Position, SyntaxLevel, Token, TokenKind, tokenize};

//=============================================
//            Section 2: Parse Errors
//=============================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        position: Position,
    },
    #[error("{message}")]
    InvalidSyntax { message: String, position: Position },
    #[error("{error}")]
    Lex { error: LexError, position: Position },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::InvalidSyntax { position, .. }
            | ParseError::Lex { position, .. } => *position,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Result of parsing a whole token stream. The program holds every
/// statement that parsed; failed statements are reported in `diagnostics`.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub program: Program,
    pub diagnostics: Diagnostics,
}

//=============================================
//            Section 3: Entry Points
//=============================================

/// Parses `tokens` starting at `initial_level`. Never fails: errors become
/// diagnostics and parsing resumes at the next statement boundary.
#[instrument(skip_all, fields(level = %initial_level, tokens = tokens.len()))]
pub fn parse(tokens: Vec<Token>, initial_level: SyntaxLevel) -> ParseOutput {
    let mut parser = Parser::new(tokens, initial_level);
    let statements = parser.parse_statements_until(&|_| false);
    debug!(
        statements = statements.len(),
        errors = parser.diagnostics.error_count(),
        "parse finished"
    );
    ParseOutput {
        program: Program::new(statements),
        diagnostics: parser.diagnostics,
    }
}

/// Convenience wrapper: tokenize then parse.
pub fn parse_source(source: &str, initial_level: SyntaxLevel) -> ParseOutput {
    parse(tokenize(source), initial_level)
}

//=============================================
//            Section 4: Parser State
//=============================================

const MAX_EXPRESSION_DEPTH: usize = 128;

pub(crate) type EndCheck<'a> = &'a dyn Fn(&Parser) -> bool;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    level: SyntaxLevel,
    diagnostics: Diagnostics,
    names: SymbolGenerator,
    expr_depth: usize,
}

impl Parser {
    //Function: new
    //Purpose: Strip invalid tokens into lexer diagnostics and reset the cursor
    //Inputs: tokens: Vec<Token>, level: SyntaxLevel
    //Returns: Self
    pub fn new(tokens: Vec<Token>, level: SyntaxLevel) -> Self {
        let mut diagnostics = Diagnostics::new();
        let mut kept = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token.kind {
                TokenKind::Invalid(error) => {
                    diagnostics.push(
                        Diagnostic::error(ErrorCode::Lex, error.to_string(), token.position)
                            .with_level(level),
                    );
                }
                _ => kept.push(token),
            }
        }
        if !matches!(kept.last().map(|t| &t.kind), Some(TokenKind::Eof)) {
            let position = kept.last().map(|t| t.position).unwrap_or_default();
            kept.push(Token::new(TokenKind::Eof, "", position));
        }
        Self {
            tokens: kept,
            current: 0,
            level,
            diagnostics,
            names: SymbolGenerator::new(),
            expr_depth: 0,
        }
    }

    pub fn level(&self) -> SyntaxLevel {
        self.level
    }

    //=============================================
    //            Section 5: Level Dispatch
    //=============================================

    /// Parses statements until `is_end` holds or input runs out. Level markers
    /// switch grammars for the statements that follow; the level in force
    /// when the block started is restored on exit.
    pub(crate) fn parse_statements_until(&mut self, is_end: EndCheck<'_>) -> Vec<Stmt> {
        let entry_level = self.level;
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if let TokenKind::LevelMarker(level) = self.peek().kind {
                trace!(from = %self.level, to = %level, "syntax level switch");
                self.advance();
                self.level = level;
                continue;
            }
            if self.is_at_end() || is_end(self) {
                break;
            }
            if self.level == SyntaxLevel::Assembly {
                let block = self.parse_asm_block(is_end);
                if !matches!(&block.kind, crate::ast::StmtKind::Asm(items) if items.is_empty()) {
                    statements.push(block);
                }
                continue;
            }
            let start = self.current;
            let result = match self.level {
                SyntaxLevel::High => self.parse_high_statement(),
                _ => self.parse_brace_statement(),
            };
            match result {
                Ok(stmt) => statements.push(stmt),
                Err(error) => {
                    self.report(error);
                    self.synchronize(start);
                }
            }
        }
        self.level = entry_level;
        statements
    }

    pub(crate) fn report(&mut self, error: ParseError) {
        debug!(level = %self.level, %error, "parse error");
        let code = match error {
            ParseError::Lex { .. } => ErrorCode::Lex,
            _ => ErrorCode::Syntax,
        };
        self.diagnostics.push(
            Diagnostic::error(code, error.to_string(), error.position()).with_level(self.level),
        );
    }

    /// Skips to the next statement boundary of the active level. Always makes
    /// progress when the failed statement consumed nothing.
    fn synchronize(&mut self, start: usize) {
        if self.current == start && !self.is_at_end() {
            self.current += 1;
        }
        if self.level.is_line_oriented() {
            while let Some(token) = self.tokens.get(self.current) {
                match token.kind {
                    TokenKind::Eof | TokenKind::LevelMarker(_) => break,
                    TokenKind::Newline => {
                        self.current += 1;
                        break;
                    }
                    _ => self.current += 1,
                }
            }
            return;
        }
        loop {
            let kind = &self.peek().kind;
            match kind {
                TokenKind::Eof | TokenKind::LevelMarker(_) | TokenKind::RightBrace => break,
                TokenKind::Semicolon => {
                    self.advance();
                    break;
                }
                kind if kind.starts_statement() => break,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_separators(&mut self) {
        while let Some(token) = self.tokens.get(self.current) {
            match token.kind {
                TokenKind::Newline | TokenKind::Semicolon => self.current += 1,
                _ => break,
            }
        }
    }

    //=============================================
    //            Section 6: Token Navigation
    //=============================================

    /// Index of the next significant token. Brace levels treat newlines as
    /// whitespace.
    fn significant_index(&self, from: usize) -> usize {
        let mut index = from.min(self.tokens.len() - 1);
        if !self.level.is_line_oriented() {
            while matches!(self.tokens[index].kind, TokenKind::Newline) {
                index += 1;
            }
        }
        index
    }

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.significant_index(self.current)]
    }

    pub(crate) fn peek_nth(&self, n: usize) -> &Token {
        let mut index = self.significant_index(self.current);
        for _ in 0..n {
            if matches!(self.tokens[index].kind, TokenKind::Eof) {
                break;
            }
            index = self.significant_index(index + 1);
        }
        &self.tokens[index]
    }

    pub(crate) fn advance(&mut self) -> Token {
        let index = self.significant_index(self.current);
        let token = self.tokens[index].clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.current = index + 1;
        }
        token
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    pub(crate) fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn consume(&mut self, kind: &TokenKind, expected: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    pub(crate) fn consume_identifier(&mut self, expected: &str) -> ParseResult<Symbol> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    /// True when the next token is the identifier `word`. Contextual
    /// keywords of the high level are plain identifiers to the lexer.
    pub(crate) fn check_word(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Identifier(name) if name.as_str() == word)
    }

    pub(crate) fn eat_word(&mut self, word: &str) -> bool {
        if self.check_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_word(&mut self, word: &str) -> ParseResult<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{word}'")))
        }
    }

    pub(crate) fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    pub(crate) fn current_position(&self) -> Position {
        self.peek().position
    }

    pub(crate) fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found: if token.lexeme.is_empty() {
                token.kind.to_string()
            } else {
                format!("'{}'", token.lexeme)
            },
            position: token.position,
        }
    }

    pub(crate) fn invalid(&self, message: impl Into<String>, position: Position) -> ParseError {
        ParseError::InvalidSyntax {
            message: message.into(),
            position,
        }
    }

    pub(crate) fn fresh_name(&mut self, prefix: &str) -> Symbol {
        self.names.fresh(prefix)
    }

    /// Counts one level of tree nesting. Later stages walk expressions
    /// recursively, so the limit bounds the tree, not just the parser.
    pub(crate) fn enter_expression(&mut self) -> ParseResult<()> {
        if self.expr_depth >= MAX_EXPRESSION_DEPTH {
            return Err(self.invalid("expression nesting too deep", self.current_position()));
        }
        self.expr_depth += 1;
        Ok(())
    }

    pub(crate) fn exit_expression(&mut self) {
        self.expr_depth = self.expr_depth.saturating_sub(1);
    }

    /// Runs a left-folding loop. Every node the loop wraps around its
    /// previous result is one level deeper; `link` records it and the levels
    /// are released when the loop ends, on success or error.
    pub(crate) fn with_chain<T>(
        &mut self,
        parse: impl FnOnce(&mut Self, &mut usize) -> ParseResult<T>,
    ) -> ParseResult<T> {
        let mut chain = 0;
        let result = parse(self, &mut chain);
        self.expr_depth = self.expr_depth.saturating_sub(chain);
        result
    }

    pub(crate) fn link(&mut self, chain: &mut usize) -> ParseResult<()> {
        self.enter_expression()?;
        *chain += 1;
        Ok(())
    }

    /// Low-level constructs are rejected at `@medium` with a diagnostic.
    pub(crate) fn require_low(&self, feature: &str, position: Position) -> ParseResult<()> {
        if self.level == SyntaxLevel::Low {
            Ok(())
        } else {
            Err(self.invalid(format!("{feature} requires @low"), position))
        }
    }
}

//=============================================
//            Section 7: Tests
//=============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ExprKind, StmtKind};

    #[test]
    fn level_markers_switch_grammar() {
        let output = parse_source(
            "@high\nlet x be 2 plus 3\n@medium\nlet y = x * 2;\n",
            SyntaxLevel::Medium,
        );
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        assert_eq!(output.program.statements.len(), 2);
        assert!(matches!(
            output.program.statements[0].kind,
            StmtKind::Let(_)
        ));
    }

    #[test]
    fn long_operator_chains_hit_the_nesting_limit() {
        let deep = format!("let y = {}1;\nlet ok = 2;", "x + ".repeat(400));
        let output = parse_source(&deep, SyntaxLevel::Medium);
        assert_eq!(output.diagnostics.error_count(), 1);
        assert!(output.diagnostics.to_string().contains("too deep"));

        let high = format!("let y be {}1\n", "x plus ".repeat(400));
        let output = parse_source(&high, SyntaxLevel::High);
        assert!(output.diagnostics.to_string().contains("too deep"));

        let shallow = format!("let y = {}1;", "x + ".repeat(100));
        assert!(parse_source(&shallow, SyntaxLevel::Medium).diagnostics.is_empty());

        let calls = format!("f{};", "()".repeat(400));
        assert!(parse_source(&calls, SyntaxLevel::Medium).diagnostics.has_errors());
        let negations = format!("let z = {}1;", "-".repeat(400));
        assert!(parse_source(&negations, SyntaxLevel::Medium).diagnostics.has_errors());
    }

    #[test]
    fn recovers_after_bad_statement() {
        let output = parse_source("let = 4;\nlet ok = 1;\nlet = ;\nok;", SyntaxLevel::Medium);
        assert_eq!(output.diagnostics.error_count(), 2);
        assert_eq!(output.program.statements.len(), 2);
    }

    #[test]
    fn high_level_recovers_at_newline() {
        let output = parse_source("let x be\nprint 1\nset to 3\nprint 2\n", SyntaxLevel::High);
        assert_eq!(output.diagnostics.error_count(), 2);
        assert_eq!(output.program.statements.len(), 2);
    }

    #[test]
    fn invalid_tokens_become_lex_diagnostics() {
        let output = parse_source("let a = 1 $ 2;", SyntaxLevel::Medium);
        let first = output.diagnostics.iter().next().map(|d| d.code);
        assert_eq!(first, Some(ErrorCode::Lex));
    }

    #[test]
    fn marker_inside_block_is_scoped_to_block() {
        let output = parse_source(
            "fn f() {\n@assembly\npush 1\nret\n}\nlet after = f();",
            SyntaxLevel::Medium,
        );
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        assert_eq!(output.program.statements.len(), 2);
        match &output.program.statements[0].kind {
            StmtKind::Function(decl) => {
                assert!(matches!(decl.body[0].kind, StmtKind::Asm(ref items) if items.len() == 2))
            }
            other => panic!("expected function, found {other:?}"),
        }
        match &output.program.statements[1].kind {
            StmtKind::Let(decl) => assert!(matches!(
                decl.init.as_ref().map(|e| &e.kind),
                Some(ExprKind::Call { .. })
            )),
            other => panic!("expected let, found {other:?}"),
        }
    }
}
