//=====================================================
// File: optimizer/fold.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Constant folding
// Objective: Evaluate literal-only operator trees with the VM's own operator
//            implementation so folded and unfolded programs agree exactly
//=====================================================

use tracing::trace;

use super::rewrite::{Rewriter, walk_expr};
use crate::ast::{BinaryOp, Expr, ExprKind, Literal, Program};
use crate::runtime::{Value, ops};

#[derive(Default)]
pub struct Folder {
    pub folded: usize,
}

pub fn run(program: Program) -> Program {
    let mut folder = Folder::default();
    let statements = folder.block(program.statements);
    trace!(folded = folder.folded, "constant folding");
    Program::new(statements)
}

fn literal_value(expr: &Expr) -> Option<Value> {
    expr.as_literal().map(Value::from_literal)
}

impl Folder {
    fn replace(&mut self, expr: Expr, value: Value) -> Expr {
        match value.to_literal() {
            Some(literal) => {
                self.folded += 1;
                Expr {
                    kind: ExprKind::Literal(literal),
                    ..expr
                }
            }
            None => expr,
        }
    }
}

impl Rewriter for Folder {
    fn expr(&mut self, expr: Expr) -> Expr {
        let expr = walk_expr(self, expr);
        match &expr.kind {
            ExprKind::Binary { op, left, right } => {
                let op = *op;
                match (literal_value(left), literal_value(right)) {
                    (Some(a), Some(b)) => match ops::binary(op, &a, &b) {
                        Ok(value) => self.replace(expr, value),
                        // Leave faulting expressions for run time.
                        Err(_) => expr,
                    },
                    // Short-circuit operators decided by the left literal.
                    (Some(a), None) if op.is_short_circuit() => {
                        let decided = match op {
                            BinaryOp::And => !a.is_truthy(),
                            _ => a.is_truthy(),
                        };
                        match expr.kind {
                            ExprKind::Binary { left, right, .. } => {
                                self.folded += 1;
                                if decided { *left } else { *right }
                            }
                            kind => Expr { kind, ..expr },
                        }
                    }
                    _ => expr,
                }
            }
            ExprKind::Unary { op, operand } => match literal_value(operand) {
                Some(value) => match ops::unary(*op, &value) {
                    Ok(result) => self.replace(expr, result),
                    Err(_) => expr,
                },
                None => expr,
            },
            ExprKind::Conditional { condition, .. } => match condition.as_literal() {
                Some(literal) => {
                    let taken = Value::from_literal(literal).is_truthy();
                    match expr.kind {
                        ExprKind::Conditional {
                            then_expr,
                            else_expr,
                            ..
                        } => {
                            self.folded += 1;
                            if taken { *then_expr } else { *else_expr }
                        }
                        kind => Expr { kind, ..expr },
                    }
                }
                None => expr,
            },
            _ => expr,
        }
    }
}

/// True when the literal is the boolean `value`.
pub fn is_bool_literal(expr: &Expr, value: bool) -> bool {
    matches!(expr.as_literal(), Some(Literal::Boolean(b)) if *b == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StmtKind;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn fold_expr(source: &str) -> Expr {
        let output = parse_source(source, SyntaxLevel::Medium);
        let program = run(output.program);
        match program.statements.into_iter().next().map(|s| s.kind) {
            Some(StmtKind::Expr(expr)) => expr,
            other => panic!("expected expression statement, found {other:?}"),
        }
    }

    #[test]
    fn folds_nested_arithmetic() {
        assert_eq!(
            fold_expr("2 + 3 * 4;").as_literal(),
            Some(&Literal::Integer(14))
        );
    }

    #[test]
    fn folds_string_concatenation() {
        assert_eq!(
            fold_expr("\"a\" + 1 + true;").as_literal(),
            Some(&Literal::String("a1true".into()))
        );
    }

    #[test]
    fn integer_overflow_wraps_like_the_vm() {
        assert_eq!(
            fold_expr("9223372036854775807 + 1;").as_literal(),
            Some(&Literal::Integer(i64::MIN))
        );
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let expr = fold_expr("1 / 0;");
        assert!(matches!(expr.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn short_circuit_with_literal_left_side() {
        let expr = fold_expr("false && f();");
        assert!(is_bool_literal(&expr, false));
        let expr = fold_expr("true && f();");
        assert!(matches!(expr.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn conditional_on_literal_takes_one_branch() {
        let expr = fold_expr("true ? 1 : 2;");
        assert_eq!(expr.as_literal(), Some(&Literal::Integer(1)));
    }
}
