//=====================================================
// File: optimizer/loops.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Loop optimizations
// Objective: Fully unroll counted loops with small literal trip counts and
//            hoist loop-invariant `let` declarations out of the rest
//=====================================================

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::rewrite::{
    Rewriter, exits_enclosing_loop, mentioned_in_block, mentioned_in_expr, substitute_block,
    walk_stmt, written_names,
};
use crate::ast::{BinaryOp, Expr, ExprKind, LetDecl, Literal, Position, Program, Stmt, StmtKind};
use crate::config::OptimizerConfig;
use crate::symbol::Symbol;

pub struct LoopOptimizer {
    unroll_limit: usize,
    pub unrolled: usize,
    pub hoisted: usize,
}

pub fn run(program: Program, config: &OptimizerConfig) -> Program {
    let mut pass = LoopOptimizer {
        unroll_limit: config.unroll_limit,
        unrolled: 0,
        hoisted: 0,
    };
    let statements = pass.block(program.statements);
    trace!(
        unrolled = pass.unrolled,
        hoisted = pass.hoisted,
        "loop optimization"
    );
    Program::new(statements)
}

/// A loop with a known induction variable and literal bounds.
struct CountedLoop {
    variable: Symbol,
    start: i64,
    trips: usize,
    body: Vec<Stmt>,
}

impl Rewriter for LoopOptimizer {
    fn stmt(&mut self, stmt: Stmt) -> Stmt {
        let stmt = walk_stmt(self, stmt);
        let position = stmt.position;
        let stmt = match counted_loop(&stmt, self.unroll_limit) {
            Some(counted) => {
                self.unrolled += 1;
                return unroll(counted, position);
            }
            None => stmt,
        };
        self.hoist_invariants(stmt)
    }
}

//=====================================================
// Section 1.0 - Unrolling
//=====================================================

fn int_literal(expr: &Expr) -> Option<i64> {
    match expr.as_literal() {
        Some(Literal::Integer(n)) => Some(*n),
        _ => None,
    }
}

fn trip_count(start: i64, end: i64, inclusive: bool) -> i128 {
    let span = i128::from(end) - i128::from(start);
    let span = if inclusive { span + 1 } else { span };
    span.max(0)
}

/// Recognizes `for (let i = a; i < b; i = i + 1)` and `for i in a..b` with
/// integer literal bounds, a body that never writes `i` and no early exits.
fn counted_loop(stmt: &Stmt, limit: usize) -> Option<CountedLoop> {
    let (variable, start, trips, body) = match &stmt.kind {
        StmtKind::For {
            init: Some(init),
            condition: Some(condition),
            update: Some(update),
            body,
        } => {
            let StmtKind::Let(LetDecl {
                name,
                init: Some(first),
                ..
            }) = &init.kind
            else {
                return None;
            };
            let start = int_literal(first)?;
            let ExprKind::Binary { op, left, right } = &condition.kind else {
                return None;
            };
            let inclusive = match op {
                BinaryOp::Less => false,
                BinaryOp::LessEqual => true,
                _ => return None,
            };
            if left.as_variable() != Some(name) {
                return None;
            }
            let end = int_literal(right)?;
            if !is_increment(update, name) {
                return None;
            }
            (name.clone(), start, trip_count(start, end, inclusive), body)
        }
        StmtKind::ForRange {
            variable,
            start,
            end,
            inclusive,
            body,
        } => {
            let first = int_literal(start)?;
            let last = int_literal(end)?;
            (variable.clone(), first, trip_count(first, last, *inclusive), body)
        }
        _ => return None,
    };
    if trips > limit as i128 {
        return None;
    }
    if written_names(body).contains(&variable)
        || exits_enclosing_loop(body)
        || mentioned_in_block(body).has_asm
    {
        return None;
    }
    Some(CountedLoop {
        variable,
        start,
        trips: usize::try_from(trips).ok()?,
        body: body.clone(),
    })
}

/// `i = i + 1`
fn is_increment(update: &Expr, name: &Symbol) -> bool {
    let ExprKind::Assign { target, value } = &update.kind else {
        return false;
    };
    if target.as_variable() != Some(name) {
        return false;
    }
    matches!(
        &value.kind,
        ExprKind::Binary { op: BinaryOp::Add, left, right }
            if left.as_variable() == Some(name) && int_literal(right) == Some(1)
    )
}

fn unroll(counted: CountedLoop, position: Position) -> Stmt {
    let iterations = (0..counted.trips)
        .map(|offset| {
            let value = counted.start.wrapping_add(offset as i64);
            let bindings = HashMap::from([(
                counted.variable.clone(),
                Expr::literal(Literal::Integer(value), position),
            )]);
            Stmt::block(substitute_block(&counted.body, &bindings), position)
        })
        .collect();
    Stmt::block(iterations, position)
}

//=====================================================
// Section 2.0 - Invariant hoisting
//=====================================================

/// Parts of a loop evaluated outside its body.
fn loop_header(stmt: &Stmt) -> Option<(Vec<&Expr>, Option<&Stmt>)> {
    match &stmt.kind {
        StmtKind::While { condition, .. } => Some((vec![condition], None)),
        StmtKind::For {
            init,
            condition,
            update,
            ..
        } => {
            let exprs = condition.iter().chain(update.iter()).collect();
            Some((exprs, init.as_deref()))
        }
        StmtKind::ForRange { start, end, .. } => Some((vec![start, end], None)),
        StmtKind::Loop(_) => Some((Vec::new(), None)),
        _ => None,
    }
}

fn loop_body_mut(stmt: &mut Stmt) -> Option<&mut Vec<Stmt>> {
    match &mut stmt.kind {
        StmtKind::While { body, .. }
        | StmtKind::For { body, .. }
        | StmtKind::ForRange { body, .. }
        | StmtKind::Loop(body) => Some(body),
        _ => None,
    }
}

struct LoopFacts {
    /// Names read by the header and the `for` initializer.
    header_reads: HashSet<Symbol>,
    /// Names written by the header, the initializer or the loop variable.
    header_writes: HashSet<Symbol>,
    has_call: bool,
}

fn loop_facts(stmt: &Stmt) -> Option<LoopFacts> {
    let (exprs, init) = loop_header(stmt)?;
    let mut header_reads = HashSet::new();
    let mut header_writes = HashSet::new();
    let mut has_call = false;
    for expr in exprs {
        let mentioned = mentioned_in_expr(expr);
        has_call |= mentioned.has_call;
        header_reads.extend(mentioned.names);
        header_writes.extend(written_names(&[Stmt::expr(expr.clone())]));
    }
    if let Some(init) = init {
        let mentioned = mentioned_in_block(std::slice::from_ref(init));
        has_call |= mentioned.has_call;
        header_reads.extend(mentioned.names);
        header_writes.extend(written_names(std::slice::from_ref(init)));
    }
    if let StmtKind::ForRange { variable, .. } = &stmt.kind {
        header_writes.insert(variable.clone());
    }
    Some(LoopFacts {
        header_reads,
        header_writes,
        has_call,
    })
}

impl LoopOptimizer {
    fn hoist_invariants(&mut self, mut stmt: Stmt) -> Stmt {
        let Some(facts) = loop_facts(&stmt) else {
            return stmt;
        };
        let position = stmt.position;
        let Some(body) = loop_body_mut(&mut stmt) else {
            return stmt;
        };
        let summary = mentioned_in_block(body);
        if summary.has_asm {
            return stmt;
        }
        let has_call = facts.has_call || summary.has_call;

        let mut hoisted = Vec::new();
        while let Some(index) = (0..body.len()).find(|&i| is_invariant(body, i, &facts, has_call)) {
            hoisted.push(body.remove(index));
        }
        if hoisted.is_empty() {
            return stmt;
        }
        self.hoisted += hoisted.len();
        hoisted.push(stmt);
        Stmt::block(hoisted, position)
    }
}

fn is_invariant(body: &[Stmt], index: usize, facts: &LoopFacts, has_call: bool) -> bool {
    let StmtKind::Let(decl) = &body[index].kind else {
        return false;
    };
    let Some(init) = &decl.init else {
        return false;
    };
    // The loop may run zero times, so the hoisted initializer must not be
    // able to raise.
    if !init.is_pure() || !init.cannot_fault() {
        return false;
    }
    let reads = mentioned_in_expr(init).names;
    if has_call && !reads.is_empty() {
        return false;
    }
    let others: Vec<Stmt> = body
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, stmt)| stmt.clone())
        .collect();
    let mut written = written_names(&others);
    written.extend(facts.header_writes.iter().cloned());
    if !reads.is_disjoint(&written) || reads.contains(&decl.name) || written.contains(&decl.name) {
        return false;
    }
    if facts.header_reads.contains(&decl.name) {
        return false;
    }
    !mentioned_in_block(&body[..index]).names.contains(&decl.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn optimize(source: &str) -> Program {
        run(
            parse_source(source, SyntaxLevel::Medium).program,
            &OptimizerConfig::default(),
        )
    }

    fn function_body<'a>(program: &'a Program, name: &str) -> &'a [Stmt] {
        &program.find_function(name).expect("function").body
    }

    #[test]
    fn small_counted_loops_are_unrolled() {
        let program = optimize("fn f() { for (let i = 0; i < 3; i = i + 1) { print(i); } }");
        match &function_body(&program, "f")[0].kind {
            StmtKind::Block(iterations) => {
                assert_eq!(iterations.len(), 3);
                let StmtKind::Block(last) = &iterations[2].kind else {
                    panic!("expected iteration block");
                };
                let StmtKind::Expr(call) = &last[0].kind else {
                    panic!("expected call statement");
                };
                let ExprKind::Call { args, .. } = &call.kind else {
                    panic!("expected call");
                };
                assert_eq!(args[0].as_literal(), Some(&Literal::Integer(2)));
            }
            other => panic!("expected unrolled block, found {other:?}"),
        }
    }

    #[test]
    fn range_loops_over_the_limit_stay() {
        let program = optimize("fn f() { for i in 0..10 { print(i); } }");
        assert!(matches!(
            function_body(&program, "f")[0].kind,
            StmtKind::ForRange { .. }
        ));
    }

    #[test]
    fn loops_with_break_are_not_unrolled() {
        let program = optimize("fn f() { for i in 0..2 { if i == 1 { break; } } }");
        assert!(matches!(
            function_body(&program, "f")[0].kind,
            StmtKind::ForRange { .. }
        ));
    }

    #[test]
    fn invariant_lets_are_hoisted() {
        let program = optimize(
            "fn f(a, b) { let i = 0; while i < 10 { let k = a == b; i = i + 1; } return i; }",
        );
        match &function_body(&program, "f")[1].kind {
            StmtKind::Block(parts) => {
                assert!(matches!(&parts[0].kind, StmtKind::Let(decl) if decl.name.as_str() == "k"));
                let StmtKind::While { body, .. } = &parts[1].kind else {
                    panic!("expected loop after hoisted let");
                };
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected hoisting block, found {other:?}"),
        }
    }

    #[test]
    fn lets_that_can_fault_stay_in_the_loop() {
        let program = optimize(
            "fn f(a, n) { let i = 0; while i < n { let k = a * 2; i = i + k; } return i; }",
        );
        assert!(matches!(
            function_body(&program, "f")[1].kind,
            StmtKind::While { .. }
        ));
    }

    #[test]
    fn lets_reading_loop_written_names_stay() {
        let program = optimize(
            "fn f() { let i = 0; while i < 10 { let k = i * 2; i = i + 1; } return i; }",
        );
        assert!(matches!(
            function_body(&program, "f")[1].kind,
            StmtKind::While { .. }
        ));
    }

    #[test]
    fn calls_in_the_loop_block_variable_reads() {
        let program = optimize(
            "fn f(a) { let i = 0; while i < 3 { let k = a == 1; tick(); i = i + 1; } }",
        );
        assert!(matches!(
            function_body(&program, "f")[1].kind,
            StmtKind::While { .. }
        ));
    }
}
