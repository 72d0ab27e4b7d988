//=====================================================
// File: diagnostics.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Shared diagnostic model for every front-end stage
// Objective: Accumulate lexer, parser, type and compile findings so a single
//            run can report all of them together
//=====================================================

use std::fmt;

use serde::Serialize;

use crate::tokenizer::{Position, SyntaxLevel};

/// Stable error codes printed next to every diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    Lex,
    Syntax,
    Type,
    Compile,
    Runtime,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Lex => "E001",
            ErrorCode::Syntax => "E002",
            ErrorCode::Type => "E003",
            ErrorCode::Compile => "E004",
            ErrorCode::Runtime => "E005",
        }
    }
}

/// Errors block code generation, warnings never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub position: Position,
    /// Syntax level active when the diagnostic was produced, when known.
    pub level: Option<SyntaxLevel>,
}

impl Diagnostic {
    pub fn error(code: ErrorCode, message: impl Into<String>, position: Position) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            position,
            level: None,
        }
    }

    pub fn warning(code: ErrorCode, message: impl Into<String>, position: Position) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
            position,
            level: None,
        }
    }

    pub fn with_level(mut self, level: SyntaxLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{severity}[{}] {}:{}",
            self.code.as_str(),
            self.position.line,
            self.position.column
        )?;
        if let Some(level) = self.level {
            write!(f, " ({level})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Ordered collection of diagnostics from one or more stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.is_error()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.is_error())
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diagnostic in &self.items {
            writeln!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::warning(
            ErrorCode::Type,
            "condition is not boolean",
            Position::new(1, 1, 0),
        ));
        assert!(!diagnostics.has_errors());
        diagnostics.push(Diagnostic::error(
            ErrorCode::Syntax,
            "expected ';'",
            Position::new(2, 4, 10),
        ));
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.error_count(), 1);
    }

    #[test]
    fn display_includes_code_and_level() {
        let diagnostic = Diagnostic::error(ErrorCode::Syntax, "bad token", Position::new(3, 7, 20))
            .with_level(SyntaxLevel::Medium);
        assert_eq!(diagnostic.to_string(), "error[E002] 3:7 (medium): bad token");
    }
}
