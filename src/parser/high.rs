//=============================================
// strata/parser/high.rs
//=============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Natural-language grammar for @high
// Objective: Parse line-oriented statements and word operators into the
//            same AST the brace levels produce
//=============================================

use super::{ParseResult, Parser};
use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionDecl, LetDecl, Literal, Param, Stmt, StmtKind, UnaryOp,
};
use crate::tokenizer::TokenKind;

/// Words that close a high-level block.
const BLOCK_END: &str = "end";

impl Parser {
    //=============================================
    //            Section 1: Statements
    //=============================================

    pub(crate) fn parse_high_statement(&mut self) -> ParseResult<Stmt> {
        let token = self.peek().clone();
        let position = token.position;
        let stmt = match &token.kind {
            TokenKind::Let => {
                self.advance();
                let name = self.consume_identifier("variable name after 'let'")?;
                if !self.eat(&TokenKind::Equal) {
                    self.expect_word("be")?;
                }
                let init = self.parse_high_expression()?;
                Stmt::new(
                    StmtKind::Let(LetDecl {
                        name,
                        ty: None,
                        init: Some(init),
                        mutable: true,
                        constant: false,
                    }),
                    position,
                )
            }
            TokenKind::If => self.parse_high_if()?,
            TokenKind::While => {
                self.advance();
                let condition = self.parse_high_expression()?;
                self.expect_word("do")?;
                let body = self.parse_high_block()?;
                Stmt::new(StmtKind::While { condition, body }, position)
            }
            TokenKind::For => {
                self.advance();
                self.expect_word("each")?;
                let variable = self.consume_identifier("loop variable")?;
                self.expect_word("from")?;
                let start = self.parse_high_additive()?;
                self.expect_word("to")?;
                let end = self.parse_high_additive()?;
                self.eat_word("do");
                let body = self.parse_high_block()?;
                Stmt::new(
                    StmtKind::ForRange {
                        variable,
                        start,
                        end,
                        inclusive: true,
                        body,
                    },
                    position,
                )
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at_line_end() {
                    None
                } else {
                    Some(self.parse_high_expression()?)
                };
                Stmt::new(StmtKind::Return(value), position)
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_high_expression()?;
                Stmt::new(StmtKind::Throw(value), position)
            }
            TokenKind::Break => {
                self.advance();
                Stmt::new(StmtKind::Break, position)
            }
            TokenKind::Continue => {
                self.advance();
                Stmt::new(StmtKind::Continue, position)
            }
            TokenKind::Identifier(word) => match word.as_str() {
                "set" => {
                    self.advance();
                    let target = self.parse_high_postfix()?;
                    self.check_assign_target(&target)?;
                    self.expect_word("to")?;
                    let value = self.parse_high_expression()?;
                    Stmt::expr(Expr::assign(target, value, position))
                }
                "print" => {
                    self.advance();
                    let value = self.parse_high_expression()?;
                    let callee = Expr::variable("println", position);
                    Stmt::expr(Expr::call(callee, vec![value], position))
                }
                "repeat" => {
                    self.advance();
                    let count = self.parse_high_unary()?;
                    self.expect_word("times")?;
                    let body = self.parse_high_block()?;
                    let variable = self.fresh_name("repeat");
                    Stmt::new(
                        StmtKind::ForRange {
                            variable,
                            start: Expr::literal(Literal::Integer(0), position),
                            end: count,
                            inclusive: false,
                            body,
                        },
                        position,
                    )
                }
                "define" => self.parse_high_function()?,
                _ => Stmt::expr(self.parse_high_expression()?),
            },
            _ => Stmt::expr(self.parse_high_expression()?),
        };
        self.expect_line_end()?;
        Ok(stmt)
    }

    /// `if c then ... [else ...] end`; `else if` chains share one `end`.
    fn parse_high_if(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::If, "'if'")?.position;
        let condition = self.parse_high_expression()?;
        self.expect_word("then")?;
        let then_branch = self.parse_statements_until(&|p| {
            p.check_word(BLOCK_END) || p.check(&TokenKind::Else)
        });
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(vec![self.parse_high_if()?])
            } else {
                Some(self.parse_high_block()?)
            }
        } else {
            self.expect_word(BLOCK_END)?;
            None
        };
        Ok(Stmt::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            position,
        ))
    }

    /// `define function name [with a and b] ... end`
    fn parse_high_function(&mut self) -> ParseResult<Stmt> {
        let position = self.current_position();
        self.expect_word("define")?;
        self.expect_word("function")?;
        let name = self.consume_identifier("function name")?;
        let mut params = Vec::new();
        if self.eat_word("with") {
            loop {
                let param_position = self.current_position();
                let param = self.consume_identifier("parameter name")?;
                params.push(Param {
                    name: param,
                    ty: None,
                    position: param_position,
                });
                if !(self.eat_word("and") || self.eat(&TokenKind::Comma)) {
                    break;
                }
            }
        }
        let body = self.parse_high_block()?;
        Ok(Stmt::new(
            StmtKind::Function(FunctionDecl {
                name,
                generics: Vec::new(),
                params,
                return_type: None,
                body,
                attributes: Vec::new(),
                position,
            }),
            position,
        ))
    }

    /// Statements through the closing `end`.
    fn parse_high_block(&mut self) -> ParseResult<Vec<Stmt>> {
        let body = self.parse_statements_until(&|p| p.check_word(BLOCK_END));
        self.expect_word(BLOCK_END)?;
        Ok(body)
    }

    fn at_line_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Newline | TokenKind::Eof | TokenKind::LevelMarker(_) | TokenKind::Else
        ) || self.check_word(BLOCK_END)
    }

    fn expect_line_end(&mut self) -> ParseResult<()> {
        if self.eat(&TokenKind::Newline) || self.at_line_end() {
            Ok(())
        } else {
            Err(self.unexpected("end of line"))
        }
    }

    //=============================================
    //            Section 2: Word-Operator Expressions
    //=============================================

    pub(crate) fn parse_high_expression(&mut self) -> ParseResult<Expr> {
        self.enter_expression()?;
        let result = self.parse_high_or();
        self.exit_expression();
        result
    }

    fn parse_high_or(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_high_or_chain(chain))
    }

    fn parse_high_or_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut left = self.parse_high_and()?;
        loop {
            let position = self.current_position();
            if !(self.eat_word("or") || self.eat(&TokenKind::OrOr)) {
                return Ok(left);
            }
            self.link(chain)?;
            let right = self.parse_high_and()?;
            left = Expr::binary(BinaryOp::Or, left, right, position);
        }
    }

    fn parse_high_and(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_high_and_chain(chain))
    }

    fn parse_high_and_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut left = self.parse_high_not()?;
        loop {
            let position = self.current_position();
            if !(self.eat_word("and") || self.eat(&TokenKind::AndAnd)) {
                return Ok(left);
            }
            self.link(chain)?;
            let right = self.parse_high_not()?;
            left = Expr::binary(BinaryOp::And, left, right, position);
        }
    }

    fn parse_high_not(&mut self) -> ParseResult<Expr> {
        let position = self.current_position();
        if self.eat_word("not") || self.eat(&TokenKind::Bang) {
            self.enter_expression()?;
            let operand = self.parse_high_not();
            self.exit_expression();
            let operand = operand?;
            return Ok(Expr::unary(UnaryOp::Not, operand, position));
        }
        self.parse_high_comparison()
    }

    /// `is`, `is not`, `is greater than`, `is less than`, `is at least`,
    /// `is at most` and the symbolic comparisons.
    fn parse_high_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_high_additive()?;
        let position = self.current_position();
        let op = if self.eat_word("is") {
            if self.eat_word("not") {
                BinaryOp::NotEqual
            } else if self.eat_word("greater") {
                self.expect_word("than")?;
                BinaryOp::Greater
            } else if self.eat_word("less") {
                self.expect_word("than")?;
                BinaryOp::Less
            } else if self.eat_word("at") {
                if self.eat_word("least") {
                    BinaryOp::GreaterEqual
                } else {
                    self.expect_word("most")?;
                    BinaryOp::LessEqual
                }
            } else {
                BinaryOp::Equal
            }
        } else {
            let op = match self.peek().kind {
                TokenKind::EqualEqual => BinaryOp::Equal,
                TokenKind::NotEqual => BinaryOp::NotEqual,
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEqual => BinaryOp::LessEqual,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
                _ => return Ok(left),
            };
            self.advance();
            op
        };
        let right = self.parse_high_additive()?;
        Ok(Expr::binary(op, left, right, position))
    }

    fn parse_high_additive(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_high_additive_chain(chain))
    }

    fn parse_high_additive_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut left = self.parse_high_multiplicative()?;
        loop {
            let position = self.current_position();
            let op = if self.eat_word("plus") || self.eat(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.eat_word("minus") || self.eat(&TokenKind::Minus) {
                BinaryOp::Subtract
            } else {
                return Ok(left);
            };
            self.link(chain)?;
            let right = self.parse_high_multiplicative()?;
            left = Expr::binary(op, left, right, position);
        }
    }

    fn parse_high_multiplicative(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_high_multiplicative_chain(chain))
    }

    fn parse_high_multiplicative_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut left = self.parse_high_unary()?;
        loop {
            let position = self.current_position();
            let op = if self.eat_word("times") || self.eat(&TokenKind::Star) {
                BinaryOp::Multiply
            } else if self.check_word("divided") {
                self.advance();
                self.expect_word("by")?;
                BinaryOp::Divide
            } else if self.eat(&TokenKind::Slash) {
                BinaryOp::Divide
            } else if self.eat_word("modulo") || self.eat(&TokenKind::Percent) {
                BinaryOp::Modulo
            } else {
                return Ok(left);
            };
            self.link(chain)?;
            let right = self.parse_high_unary()?;
            left = Expr::binary(op, left, right, position);
        }
    }

    fn parse_high_unary(&mut self) -> ParseResult<Expr> {
        let position = self.current_position();
        if self.eat_word("minus") || self.eat(&TokenKind::Minus) {
            self.enter_expression()?;
            let operand = self.parse_high_unary();
            self.exit_expression();
            let operand = operand?;
            return Ok(Expr::unary(UnaryOp::Negate, operand, position));
        }
        self.parse_high_postfix()
    }

    fn parse_high_postfix(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_high_postfix_chain(chain))
    }

    fn parse_high_postfix_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut expr = self.parse_high_primary()?;
        loop {
            let position = self.current_position();
            if self.check(&TokenKind::LeftParen)
                || self.check(&TokenKind::LeftBracket)
                || self.check(&TokenKind::Dot)
            {
                self.link(chain)?;
            }
            if self.eat(&TokenKind::LeftParen) {
                let args = self.parse_high_arguments(&TokenKind::RightParen)?;
                expr = match expr.kind {
                    ExprKind::Field { object, field } => Expr::new(
                        ExprKind::MethodCall {
                            receiver: object,
                            method: field,
                            args,
                        },
                        position,
                    ),
                    _ => Expr::call(expr, args, position),
                };
            } else if self.eat(&TokenKind::LeftBracket) {
                let index = self.parse_high_expression()?;
                self.consume(&TokenKind::RightBracket, "']' after index")?;
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    position,
                );
            } else if self.eat(&TokenKind::Dot) {
                let field = self.consume_identifier("field name after '.'")?;
                expr = Expr::new(
                    ExprKind::Field {
                        object: Box::new(expr),
                        field,
                    },
                    position,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_high_arguments(&mut self, close: &TokenKind) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(close) {
            loop {
                args.push(self.parse_high_expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(close, "closing delimiter")?;
        Ok(args)
    }

    fn parse_high_primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let position = token.position;
        if let Some(literal) = super::expr::literal_of(&token.kind) {
            self.advance();
            return Ok(Expr::literal(literal, position));
        }
        match token.kind {
            TokenKind::Identifier(name) if name.as_str() == "call" => {
                self.advance();
                let callee = self.consume_identifier("function name after 'call'")?;
                let mut args = Vec::new();
                if self.eat_word("with") {
                    // `and` separates arguments here, so arguments stop below
                    // the logical operators.
                    loop {
                        args.push(self.parse_high_comparison()?);
                        if !(self.eat_word("and") || self.eat(&TokenKind::Comma)) {
                            break;
                        }
                    }
                }
                Ok(Expr::call(Expr::variable(callee, position), args, position))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::variable(name, position))
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_high_expression()?;
                self.consume(&TokenKind::RightParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let items = self.parse_high_arguments(&TokenKind::RightBracket)?;
                Ok(Expr::new(ExprKind::Array(items), position))
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{BinaryOp, ExprKind, StmtKind};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn parse_high(source: &str) -> Vec<StmtKind> {
        let output = parse_source(source, SyntaxLevel::High);
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        output.program.statements.into_iter().map(|s| s.kind).collect()
    }

    #[test]
    fn word_operators_build_binary_nodes() {
        let statements = parse_high("let total be 2 plus 3 times 4\n");
        match &statements[0] {
            StmtKind::Let(decl) => match decl.init.as_ref().map(|e| &e.kind) {
                Some(ExprKind::Binary { op, right, .. }) => {
                    assert_eq!(*op, BinaryOp::Add);
                    assert!(matches!(
                        right.kind,
                        ExprKind::Binary {
                            op: BinaryOp::Multiply,
                            ..
                        }
                    ));
                }
                other => panic!("expected binary, found {other:?}"),
            },
            other => panic!("expected let, found {other:?}"),
        }
    }

    #[test]
    fn comparison_phrases() {
        let statements = parse_high(
            "if x is at least 3 and y is not 2 then\nprint x\nelse\nprint y\nend\n",
        );
        match &statements[0] {
            StmtKind::If {
                condition,
                else_branch,
                ..
            } => {
                assert!(matches!(
                    condition.kind,
                    ExprKind::Binary {
                        op: BinaryOp::And,
                        ..
                    }
                ));
                assert!(else_branch.is_some());
            }
            other => panic!("expected if, found {other:?}"),
        }
    }

    #[test]
    fn loops_and_functions() {
        let source = "define function add with a and b\nreturn a plus b\nend\n\
                      repeat 3 times\nprint call add with 1 and 2\nend\n\
                      for each i from 1 to 5 do\nset total to total plus i\nend\n\
                      while total is less than 100 do\nset total to total times 2\nend\n";
        let statements = parse_high(source);
        assert_eq!(statements.len(), 4);
        match &statements[0] {
            StmtKind::Function(decl) => assert_eq!(decl.params.len(), 2),
            other => panic!("expected function, found {other:?}"),
        }
        assert!(matches!(
            statements[1],
            StmtKind::ForRange {
                inclusive: false,
                ..
            }
        ));
        assert!(matches!(
            statements[2],
            StmtKind::ForRange {
                inclusive: true,
                ..
            }
        ));
        assert!(matches!(statements[3], StmtKind::While { .. }));
    }
}
