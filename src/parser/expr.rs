//=============================================
// strata/parser/expr.rs
//=============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: C-like expression and type grammar shared by @medium and @low
// Objective: Precedence climbing from assignment down to primaries, with
//            the pointer and bitwise forms gated to @low
//=============================================

use super::{ParseResult, Parser};
use crate::ast::{
    BinaryOp, Expr, ExprKind, LambdaExpr, Literal, Param, Stmt, StmtKind, TypeExpr, UnaryOp, Unit,
};
use crate::symbol::Symbol;
use crate::tokenizer::{Position, TokenKind};

impl Parser {
    //=============================================
    //            Section 1: Assignment & Ternary
    //=============================================

    pub(crate) fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.enter_expression()?;
        let result = self.parse_assignment();
        self.exit_expression();
        result
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        let expr = self.parse_ternary()?;

        if let Some(op) = self.match_compound_assignment() {
            let position = expr.position;
            self.check_assign_target(&expr)?;
            let value = self.parse_expression()?;
            let combined = Expr::binary(op, expr.clone(), value, position);
            return Ok(Expr::assign(expr, combined, position));
        }

        if self.check(&TokenKind::Equal) {
            let position = expr.position;
            self.advance();
            self.check_assign_target(&expr)?;
            let value = self.parse_expression()?;
            return Ok(Expr::assign(expr, value, position));
        }

        Ok(expr)
    }

    fn match_compound_assignment(&mut self) -> Option<BinaryOp> {
        let op = match self.peek().kind {
            TokenKind::PlusEqual => BinaryOp::Add,
            TokenKind::MinusEqual => BinaryOp::Subtract,
            TokenKind::StarEqual => BinaryOp::Multiply,
            TokenKind::SlashEqual => BinaryOp::Divide,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    pub(crate) fn check_assign_target(&self, target: &Expr) -> ParseResult<()> {
        match target.kind {
            ExprKind::Variable(_)
            | ExprKind::Field { .. }
            | ExprKind::Index { .. }
            | ExprKind::Deref(_) => Ok(()),
            _ => Err(self.invalid("invalid assignment target", target.position)),
        }
    }

    fn parse_ternary(&mut self) -> ParseResult<Expr> {
        let condition = self.parse_binary(0)?;
        if !self.check(&TokenKind::Question) {
            return Ok(condition);
        }
        let position = condition.position;
        self.advance();
        let then_expr = self.parse_expression()?;
        self.consume(&TokenKind::Colon, "':' in conditional expression")?;
        let else_expr = self.parse_expression()?;
        Ok(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            position,
        ))
    }

    //=============================================
    //            Section 2: Binary Operators
    //=============================================

    /// Binding power table, lowest first. Bitwise rows only match at @low.
    fn binary_operator(&self, kind: &TokenKind) -> Option<(BinaryOp, u8)> {
        let entry = match kind {
            TokenKind::OrOr => (BinaryOp::Or, 1),
            TokenKind::AndAnd => (BinaryOp::And, 2),
            TokenKind::Pipe => (BinaryOp::BitwiseOr, 3),
            TokenKind::Caret => (BinaryOp::BitwiseXor, 4),
            TokenKind::Amp => (BinaryOp::BitwiseAnd, 5),
            TokenKind::EqualEqual => (BinaryOp::Equal, 6),
            TokenKind::NotEqual => (BinaryOp::NotEqual, 6),
            TokenKind::Less => (BinaryOp::Less, 7),
            TokenKind::LessEqual => (BinaryOp::LessEqual, 7),
            TokenKind::Greater => (BinaryOp::Greater, 7),
            TokenKind::GreaterEqual => (BinaryOp::GreaterEqual, 7),
            TokenKind::ShiftLeft => (BinaryOp::LeftShift, 8),
            TokenKind::ShiftRight => (BinaryOp::RightShift, 8),
            TokenKind::Plus => (BinaryOp::Add, 9),
            TokenKind::Minus => (BinaryOp::Subtract, 9),
            TokenKind::Star => (BinaryOp::Multiply, 10),
            TokenKind::Slash => (BinaryOp::Divide, 10),
            TokenKind::Percent => (BinaryOp::Modulo, 10),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_binary(&mut self, min_power: u8) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_binary_chain(min_power, chain))
    }

    fn parse_binary_chain(&mut self, min_power: u8, chain: &mut usize) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let token = self.peek().clone();
            let Some((op, power)) = self.binary_operator(&token.kind) else {
                break;
            };
            if power <= min_power {
                break;
            }
            if op.is_bitwise() {
                self.require_low(&format!("bitwise operator '{}'", op.symbol()), token.position)?;
            }
            self.advance();
            self.link(chain)?;
            let right = self.parse_binary(power)?;
            left = Expr::binary(op, left, right, token.position);
        }
        Ok(left)
    }

    //=============================================
    //            Section 3: Unary & Postfix
    //=============================================

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let position = token.position;
        match token.kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_prefix_operand()?;
                Ok(Expr::unary(UnaryOp::Negate, operand, position))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_prefix_operand()?;
                Ok(Expr::unary(UnaryOp::Not, operand, position))
            }
            TokenKind::Tilde => {
                self.require_low("bitwise operator '~'", position)?;
                self.advance();
                let operand = self.parse_prefix_operand()?;
                Ok(Expr::unary(UnaryOp::BitwiseNot, operand, position))
            }
            TokenKind::Amp => {
                self.require_low("address-of '&'", position)?;
                self.advance();
                let operand = self.parse_prefix_operand()?;
                Ok(Expr::new(ExprKind::AddressOf(Box::new(operand)), position))
            }
            TokenKind::Star => {
                self.require_low("dereference '*'", position)?;
                self.advance();
                let operand = self.parse_prefix_operand()?;
                Ok(Expr::new(ExprKind::Deref(Box::new(operand)), position))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                self.advance();
                let target = self.parse_prefix_operand()?;
                self.check_assign_target(&target)?;
                Ok(increment(target, token.kind == TokenKind::PlusPlus, position))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_prefix_operand(&mut self) -> ParseResult<Expr> {
        self.enter_expression()?;
        let result = self.parse_unary();
        self.exit_expression();
        result
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        self.with_chain(|parser, chain| parser.parse_postfix_chain(chain))
    }

    fn parse_postfix_chain(&mut self, chain: &mut usize) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let token = self.peek().clone();
            let position = token.position;
            if matches!(
                token.kind,
                TokenKind::LeftParen
                    | TokenKind::Dot
                    | TokenKind::Arrow
                    | TokenKind::LeftBracket
                    | TokenKind::PlusPlus
                    | TokenKind::MinusMinus
            ) {
                self.link(chain)?;
            }
            match token.kind {
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.parse_arguments()?;
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
                }
                TokenKind::Dot => {
                    self.advance();
                    let field = self.consume_identifier("field name after '.'")?;
                    expr = Expr::new(
                        ExprKind::Field {
                            object: Box::new(expr),
                            field,
                        },
                        position,
                    );
                }
                TokenKind::Arrow => {
                    self.require_low("pointer access '->'", position)?;
                    self.advance();
                    let field = self.consume_identifier("field name after '->'")?;
                    let target = Expr::new(ExprKind::Deref(Box::new(expr)), position);
                    expr = Expr::new(
                        ExprKind::Field {
                            object: Box::new(target),
                            field,
                        },
                        position,
                    );
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.consume(&TokenKind::RightBracket, "']' after index")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        position,
                    );
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    self.check_assign_target(&expr)?;
                    self.advance();
                    expr = increment(expr, token.kind == TokenKind::PlusPlus, position);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Arguments after an already consumed `(`.
    pub(crate) fn parse_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "')' after arguments")?;
        Ok(args)
    }

    //=============================================
    //            Section 4: Primaries
    //=============================================

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let position = token.position;
        if let Some(literal) = literal_of(&token.kind) {
            self.advance();
            return Ok(Expr::literal(literal, position));
        }
        match token.kind {
            TokenKind::Identifier(name) => {
                self.advance();
                if self.check(&TokenKind::ColonColon) {
                    self.advance();
                    let variant = self.consume_identifier("enum variant after '::'")?;
                    return Ok(Expr::new(
                        ExprKind::EnumVariant {
                            enum_name: name,
                            variant,
                        },
                        position,
                    ));
                }
                Ok(Expr::variable(name, position))
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.consume(&TokenKind::RightParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        items.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma) || self.check(&TokenKind::RightBracket) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightBracket, "']' after array elements")?;
                Ok(Expr::new(ExprKind::Array(items), position))
            }
            TokenKind::Fn => self.parse_lambda(),
            TokenKind::New => self.parse_new(),
            TokenKind::Sizeof => {
                self.require_low("sizeof", position)?;
                self.advance();
                self.consume(&TokenKind::LeftParen, "'(' after sizeof")?;
                let ty = self.parse_type()?;
                self.consume(&TokenKind::RightParen, "')' after sizeof type")?;
                Ok(Expr::new(ExprKind::SizeOf(ty), position))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_new(&mut self) -> ParseResult<Expr> {
        let position = self.consume(&TokenKind::New, "'new'")?.position;
        let name = self.consume_identifier("type name after 'new'")?;
        if self.check(&TokenKind::LeftBrace) {
            self.require_low("struct literal", position)?;
            self.advance();
            let mut fields = Vec::new();
            while !self.check(&TokenKind::RightBrace) {
                let field = self.consume_identifier("field name")?;
                self.consume(&TokenKind::Colon, "':' after field name")?;
                let value = self.parse_expression()?;
                fields.push((field, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(&TokenKind::RightBrace, "'}' after struct literal")?;
            return Ok(Expr::new(ExprKind::StructLiteral { name, fields }, position));
        }
        self.consume(&TokenKind::LeftParen, "'(' after class name")?;
        let args = self.parse_arguments()?;
        Ok(Expr::new(ExprKind::New { class: name, args }, position))
    }

    /// `fn(a, b) => e` or `fn(a: int) -> int { ... }`
    fn parse_lambda(&mut self) -> ParseResult<Expr> {
        let position = self.consume(&TokenKind::Fn, "'fn'")?.position;
        self.consume(&TokenKind::LeftParen, "'(' after fn")?;
        let params = self.parse_parameters()?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = if self.eat(&TokenKind::FatArrow) {
            let value = self.parse_expression()?;
            let value_position = value.position;
            vec![Stmt::new(StmtKind::Return(Some(value)), value_position)]
        } else {
            self.parse_brace_block()?
        };
        Ok(Expr::new(
            ExprKind::Lambda(Box::new(LambdaExpr {
                params,
                return_type,
                body,
            })),
            position,
        ))
    }

    /// Parameters after an already consumed `(`, through the closing `)`.
    pub(crate) fn parse_parameters(&mut self) -> ParseResult<Vec<Param>> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let position = self.current_position();
                let name = self.consume_identifier("parameter name")?;
                let ty = if self.eat(&TokenKind::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                params.push(Param { name, ty, position });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "')' after parameters")?;
        Ok(params)
    }

    //=============================================
    //            Section 5: Types & Units
    //=============================================

    pub(crate) fn parse_type(&mut self) -> ParseResult<TypeExpr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::LeftBracket => {
                self.advance();
                let inner = self.parse_type()?;
                self.consume(&TokenKind::RightBracket, "']' after array element type")?;
                Ok(TypeExpr::Array(Box::new(inner)))
            }
            TokenKind::Star => {
                self.require_low("pointer type", token.position)?;
                self.advance();
                Ok(TypeExpr::Pointer(Box::new(self.parse_type()?)))
            }
            TokenKind::Fn => {
                self.advance();
                self.consume(&TokenKind::LeftParen, "'(' in function type")?;
                let mut params = Vec::new();
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        params.push(self.parse_type()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightParen, "')' in function type")?;
                let ret = if self.eat(&TokenKind::Arrow) {
                    self.parse_type()?
                } else {
                    TypeExpr::Named(Symbol::from("void"))
                };
                Ok(TypeExpr::Function {
                    params,
                    ret: Box::new(ret),
                })
            }
            TokenKind::Null => {
                self.advance();
                Ok(TypeExpr::Named(Symbol::from("null")))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if name.as_str() == "float" && self.check(&TokenKind::LeftBracket) {
                    self.advance();
                    let unit = self.parse_unit()?;
                    self.consume(&TokenKind::RightBracket, "']' after unit")?;
                    return Ok(TypeExpr::Quantity(unit));
                }
                Ok(TypeExpr::Named(name))
            }
            _ => Err(self.unexpected("type")),
        }
    }

    /// `m`, `m/s`, `kg*m/s^2`, `1/s`
    pub(crate) fn parse_unit(&mut self) -> ParseResult<Unit> {
        let mut unit = self.parse_unit_factor()?;
        loop {
            if self.eat(&TokenKind::Star) {
                unit = unit.mul(&self.parse_unit_factor()?);
            } else if self.eat(&TokenKind::Slash) {
                unit = unit.div(&self.parse_unit_factor()?);
            } else {
                return Ok(unit);
            }
        }
    }

    fn parse_unit_factor(&mut self) -> ParseResult<Unit> {
        let token = self.peek().clone();
        let base = match token.kind {
            TokenKind::Identifier(name) => Unit::base(name),
            TokenKind::Integer(1) => Unit::dimensionless(),
            _ => return Err(self.unexpected("unit name")),
        };
        self.advance();
        if self.eat(&TokenKind::Caret) {
            let negative = self.eat(&TokenKind::Minus);
            let exponent = match self.peek().kind {
                TokenKind::Integer(n) => n,
                _ => return Err(self.unexpected("unit exponent")),
            };
            self.advance();
            let exponent = i32::try_from(exponent)
                .map_err(|_| self.invalid("unit exponent out of range", token.position))?;
            return Ok(base.pow(if negative { -exponent } else { exponent }));
        }
        Ok(base)
    }
}

/// Literal tokens shared by every grammar.
pub(crate) fn literal_of(kind: &TokenKind) -> Option<Literal> {
    Some(match kind {
        TokenKind::Integer(n) => Literal::Integer(*n),
        TokenKind::Float(n) => Literal::Float(*n),
        TokenKind::Quantity(n, unit) => Literal::Quantity(*n, Unit::base(unit.clone())),
        TokenKind::String(s) => Literal::String(Symbol::from(s.as_str())),
        TokenKind::Boolean(b) => Literal::Boolean(*b),
        TokenKind::Null => Literal::Null,
        _ => return None,
    })
}

/// `x++` / `x--` desugar to `x = x + 1` / `x = x - 1`; the expression
/// yields the updated value.
pub(crate) fn increment(target: Expr, up: bool, position: Position) -> Expr {
    let op = if up {
        BinaryOp::Add
    } else {
        BinaryOp::Subtract
    };
    let one = Expr::literal(Literal::Integer(1), position);
    let value = Expr::binary(op, target.clone(), one, position);
    Expr::assign(target, value, position)
}

#[cfg(test)]
mod tests {
    use crate::ast::{BinaryOp, ExprKind, StmtKind, TypeExpr};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn first_expr(source: &str, level: SyntaxLevel) -> ExprKind {
        let output = parse_source(source, level);
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        match output.program.statements.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(expr)) => expr.kind,
            other => panic!("expected expression statement, found {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        match first_expr("2 + 3 * 4;", SyntaxLevel::Medium) {
            ExprKind::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    right.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            other => panic!("expected binary, found {other:?}"),
        }
    }

    #[test]
    fn bitwise_is_gated_to_low() {
        let medium = parse_source("a & b;", SyntaxLevel::Medium);
        assert!(medium.diagnostics.has_errors());
        assert!(matches!(
            first_expr("a & b;", SyntaxLevel::Low),
            ExprKind::Binary {
                op: BinaryOp::BitwiseAnd,
                ..
            }
        ));
    }

    #[test]
    fn arrow_desugars_to_deref_field() {
        match first_expr("p->x;", SyntaxLevel::Low) {
            ExprKind::Field { object, field } => {
                assert_eq!(field.as_str(), "x");
                assert!(matches!(object.kind, ExprKind::Deref(_)));
            }
            other => panic!("expected field, found {other:?}"),
        }
    }

    #[test]
    fn method_calls_and_ternary() {
        assert!(matches!(
            first_expr("list.push(1);", SyntaxLevel::Medium),
            ExprKind::MethodCall { .. }
        ));
        assert!(matches!(
            first_expr("a > b ? a : b;", SyntaxLevel::Medium),
            ExprKind::Conditional { .. }
        ));
    }

    #[test]
    fn unit_annotations_parse() {
        let output = parse_source("let v: float[m/s^2] = 1.0;", SyntaxLevel::Medium);
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        match &output.program.statements[0].kind {
            StmtKind::Let(decl) => match &decl.ty {
                Some(TypeExpr::Quantity(unit)) => assert_eq!(unit.to_string(), "m/s^2"),
                other => panic!("expected quantity type, found {other:?}"),
            },
            other => panic!("expected let, found {other:?}"),
        }
    }
}
