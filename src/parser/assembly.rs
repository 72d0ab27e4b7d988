//=============================================
// strata/parser/assembly.rs
//=============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Raw instruction grammar for @assembly
// Objective: Collect consecutive label and mnemonic lines into one inline
//            assembly statement
//=============================================

use super::{EndCheck, ParseResult, Parser};
use crate::ast::{AsmItem, AsmLine, AsmOp, AsmOperand, AsmOperandKind, Literal, Stmt, StmtKind};
use crate::tokenizer::TokenKind;

impl Parser {
    /// Parses lines until a level marker, the enclosing block's end or end of
    /// input. Bad lines are reported and skipped.
    pub(crate) fn parse_asm_block(&mut self, is_end: EndCheck<'_>) -> Stmt {
        let position = self.current_position();
        let mut items = Vec::new();
        loop {
            while self.eat(&TokenKind::Newline) {}
            if self.is_at_end()
                || matches!(self.peek().kind, TokenKind::LevelMarker(_))
                || is_end(self)
            {
                break;
            }
            let start = self.current;
            match self.parse_asm_line() {
                Ok(item) => items.push(item),
                Err(error) => {
                    self.report(error);
                    self.synchronize(start);
                }
            }
        }
        Stmt::new(StmtKind::Asm(items), position)
    }

    fn parse_asm_line(&mut self) -> ParseResult<AsmItem> {
        let position = self.current_position();
        let word = self.consume_identifier("mnemonic or label")?;
        if self.eat(&TokenKind::Colon) {
            self.end_asm_line()?;
            return Ok(AsmItem {
                line: AsmLine::Label(word),
                position,
            });
        }
        let op = AsmOp::from_mnemonic(word.as_str())
            .ok_or_else(|| self.invalid(format!("unknown mnemonic '{word}'"), position))?;
        let operand = match op.operand_kind() {
            AsmOperandKind::None => None,
            AsmOperandKind::Literal => Some(AsmOperand::Literal(self.parse_asm_literal()?)),
            AsmOperandKind::Name | AsmOperandKind::Label => Some(AsmOperand::Name(
                self.consume_identifier(&format!("operand for '{word}'"))?,
            )),
        };
        self.end_asm_line()?;
        Ok(AsmItem {
            line: AsmLine::Instruction { op, operand },
            position,
        })
    }

    fn parse_asm_literal(&mut self) -> ParseResult<Literal> {
        let negative = self.eat(&TokenKind::Minus);
        let token = self.peek().clone();
        let literal = super::expr::literal_of(&token.kind)
            .ok_or_else(|| self.unexpected("literal operand"))?;
        self.advance();
        if !negative {
            return Ok(literal);
        }
        match literal {
            Literal::Integer(n) => Ok(Literal::Integer(n.wrapping_neg())),
            Literal::Float(n) => Ok(Literal::Float(-n)),
            _ => Err(self.invalid("only numbers can be negated", token.position)),
        }
    }

    fn end_asm_line(&mut self) -> ParseResult<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof | TokenKind::LevelMarker(_) | TokenKind::RightBrace => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AsmLine, AsmOp, StmtKind};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    #[test]
    fn consecutive_lines_form_one_block() {
        let output = parse_source(
            "@assembly\npush 2\npush -3\nadd\ntop:\njmp top\n",
            SyntaxLevel::Medium,
        );
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        assert_eq!(output.program.statements.len(), 1);
        match &output.program.statements[0].kind {
            StmtKind::Asm(items) => {
                assert_eq!(items.len(), 5);
                assert!(matches!(items[3].line, AsmLine::Label(_)));
                assert!(matches!(
                    items[4].line,
                    AsmLine::Instruction {
                        op: AsmOp::Jmp,
                        ..
                    }
                ));
            }
            other => panic!("expected asm block, found {other:?}"),
        }
    }

    #[test]
    fn unknown_mnemonic_is_reported_and_skipped() {
        let output = parse_source("frobnicate 3\npush 1\npop\n", SyntaxLevel::Assembly);
        assert_eq!(output.diagnostics.error_count(), 1);
        match &output.program.statements[0].kind {
            StmtKind::Asm(items) => assert_eq!(items.len(), 2),
            other => panic!("expected asm block, found {other:?}"),
        }
    }
}
