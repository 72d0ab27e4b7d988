//=====================================================
// File: optimizer/cse.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Common subexpression elimination
// Objective: Within each straight-line block, compute repeated pure
//            expressions once into a synthetic local
//=====================================================

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::rewrite::{Rewriter, mentioned_in_block, mentioned_in_expr, structural_key, walk_block};
use crate::ast::{BinaryOp, Expr, ExprKind, Program, Stmt, StmtKind};
use crate::symbol::{Symbol, SymbolGenerator};

pub struct Cse {
    names: SymbolGenerator,
    taken: HashSet<Symbol>,
    pub eliminated: usize,
}

pub fn run(program: Program) -> Program {
    let mut pass = Cse {
        names: SymbolGenerator::new(),
        taken: mentioned_in_block(&program.statements).names,
        eliminated: 0,
    };
    let statements = pass.block(program.statements);
    trace!(eliminated = pass.eliminated, "common subexpression elimination");
    Program::new(statements)
}

/// Span of statements over which an expression's operands are not written.
struct Window {
    key: String,
    expr: Expr,
    reads: HashSet<Symbol>,
    first: usize,
    last: usize,
}

impl Cse {
    fn fresh_name(&mut self) -> Symbol {
        loop {
            let name = self.names.fresh("cse");
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

impl Rewriter for Cse {
    fn block(&mut self, block: Vec<Stmt>) -> Vec<Stmt> {
        let mut block = walk_block(self, block);
        let mut windows = find_windows(&block);
        // Larger expressions first so their inner parts are counted after
        // replacement.
        windows.sort_by(|a, b| b.key.len().cmp(&a.key.len()).then(a.first.cmp(&b.first)));

        let mut inserts: Vec<(usize, Stmt)> = Vec::new();
        for window in windows {
            let count: usize = block[window.first..=window.last]
                .iter()
                .map(|stmt| count_occurrences(stmt, &window.key))
                .sum();
            if count < 2 {
                continue;
            }
            let name = self.fresh_name();
            let mut replacer = Replace {
                key: &window.key,
                name: &name,
            };
            for stmt in &mut block[window.first..=window.last] {
                let position = stmt.position;
                let taken = std::mem::replace(stmt, Stmt::block(Vec::new(), position));
                *stmt = replacer.stmt(taken);
            }
            let position = window.expr.position;
            inserts.push((window.first, Stmt::let_decl(name, window.expr, position)));
            self.eliminated += count - 1;
        }
        if inserts.is_empty() {
            return block;
        }
        inserts.sort_by_key(|(index, _)| *index);
        let mut result = Vec::with_capacity(block.len() + inserts.len());
        let mut pending = inserts.into_iter().peekable();
        for (index, stmt) in block.into_iter().enumerate() {
            while let Some((_, temp)) = pending.next_if(|(at, _)| *at == index) {
                result.push(temp);
            }
            result.push(stmt);
        }
        result
    }
}

//=====================================================
// Section 1.0 - Window discovery
//=====================================================

/// A tree of arithmetic over variables and literals that cannot fault.
fn is_candidate(expr: &Expr) -> bool {
    fn simple(expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::Variable(_) => true,
            ExprKind::Unary { operand, .. } => simple(operand),
            ExprKind::Binary { left, right, .. } => simple(left) && simple(right),
            _ => false,
        }
    }
    matches!(expr.kind, ExprKind::Binary { .. })
        && simple(expr)
        && expr.is_pure()
        && !mentioned_in_expr(expr).names.is_empty()
}

/// Candidate subexpressions in evaluation order. Only operands that always
/// run are searched: lambda bodies, `?:` branches and the right side of
/// `&&`/`||` may never execute, and a hoisted copy could fault where the
/// guarded original would not.
fn collect(expr: &Expr, out: &mut Vec<Expr>) {
    if is_candidate(expr) {
        out.push(expr.clone());
    }
    match &expr.kind {
        ExprKind::Binary {
            op: BinaryOp::And | BinaryOp::Or,
            left,
            ..
        } => collect(left, out),
        ExprKind::Binary { left, right, .. } => {
            collect(left, out);
            collect(right, out);
        }
        ExprKind::Unary { operand, .. } => collect(operand, out),
        ExprKind::Assign { target, value } => {
            collect(target, out);
            collect(value, out);
        }
        ExprKind::Field { object, .. } => collect(object, out),
        ExprKind::Index { object, index } => {
            collect(object, out);
            collect(index, out);
        }
        ExprKind::Array(items) => items.iter().for_each(|item| collect(item, out)),
        ExprKind::Conditional { condition, .. } => collect(condition, out),
        ExprKind::StructLiteral { fields, .. } => {
            fields.iter().for_each(|(_, value)| collect(value, out));
        }
        ExprKind::AddressOf(inner) | ExprKind::Deref(inner) => collect(inner, out),
        _ => {}
    }
}

fn has_nested_assign(expr: &Expr) -> bool {
    let mut found = false;
    let mut stack = vec![expr];
    while let Some(next) = stack.pop() {
        match &next.kind {
            ExprKind::Assign { .. } => found = true,
            ExprKind::Binary { left, right, .. } => stack.extend([left.as_ref(), right.as_ref()]),
            ExprKind::Unary { operand, .. } => stack.push(operand),
            ExprKind::Field { object, .. } => stack.push(object),
            ExprKind::Index { object, index } => stack.extend([object.as_ref(), index.as_ref()]),
            ExprKind::Array(items) => stack.extend(items.iter()),
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => stack.extend([condition.as_ref(), then_expr.as_ref(), else_expr.as_ref()]),
            ExprKind::StructLiteral { fields, .. } => stack.extend(fields.iter().map(|(_, e)| e)),
            ExprKind::AddressOf(inner) | ExprKind::Deref(inner) => stack.push(inner),
            _ => {}
        }
    }
    found
}

/// Expressions of a straight-line statement and the variable it writes.
/// `None` marks a barrier that ends every open window.
fn straight_line(stmt: &Stmt) -> Option<(Vec<&Expr>, Option<Symbol>)> {
    let (exprs, written): (Vec<&Expr>, Option<Symbol>) = match &stmt.kind {
        StmtKind::Let(decl) => (decl.init.iter().collect(), Some(decl.name.clone())),
        StmtKind::Expr(expr) => match &expr.kind {
            ExprKind::Assign { target, value } => {
                if has_nested_assign(target) || has_nested_assign(value) {
                    return None;
                }
                (vec![expr], target.as_variable().cloned())
            }
            _ => (vec![expr], None),
        },
        StmtKind::Return(value) => (value.iter().collect(), None),
        StmtKind::Throw(value) => (vec![value], None),
        _ => return None,
    };
    let clean = exprs.iter().all(|expr| {
        !expr.contains_call()
            && !matches!(expr.kind, ExprKind::Lambda(_))
            && (matches!(expr.kind, ExprKind::Assign { .. }) || !has_nested_assign(expr))
    });
    clean.then_some((exprs, written))
}

fn find_windows(block: &[Stmt]) -> Vec<Window> {
    let mut closed = Vec::new();
    let mut open: HashMap<String, Window> = HashMap::new();
    for (index, stmt) in block.iter().enumerate() {
        let Some((exprs, written)) = straight_line(stmt) else {
            closed.extend(open.drain().map(|(_, window)| window));
            continue;
        };
        let mut found = Vec::new();
        for expr in exprs {
            collect(expr, &mut found);
        }
        for expr in found {
            let key = structural_key(&expr);
            match open.get_mut(&key) {
                Some(window) => window.last = index,
                None => {
                    let reads = mentioned_in_expr(&expr).names;
                    open.insert(
                        key.clone(),
                        Window {
                            key,
                            expr,
                            reads,
                            first: index,
                            last: index,
                        },
                    );
                }
            }
        }
        if let Some(name) = written {
            let killed: Vec<String> = open
                .iter()
                .filter(|(_, window)| window.reads.contains(&name))
                .map(|(key, _)| key.clone())
                .collect();
            for key in killed {
                if let Some(window) = open.remove(&key) {
                    closed.push(window);
                }
            }
        }
    }
    closed.extend(open.into_values());
    closed
}

//=====================================================
// Section 2.0 - Replacement
//=====================================================

fn count_occurrences(stmt: &Stmt, key: &str) -> usize {
    let Some((exprs, _)) = straight_line(stmt) else {
        return 0;
    };
    let mut found = Vec::new();
    for expr in exprs {
        collect(expr, &mut found);
    }
    // Occurrences nested inside another occurrence are not separate uses.
    let mut count = 0;
    let mut skip_inside: Vec<Expr> = Vec::new();
    for expr in found {
        if structural_key(&expr) != key {
            continue;
        }
        if skip_inside.iter().any(|outer| contains_node(outer, expr.id)) {
            continue;
        }
        count += 1;
        skip_inside.push(expr);
    }
    count
}

fn contains_node(expr: &Expr, id: u32) -> bool {
    if expr.id == id {
        return true;
    }
    match &expr.kind {
        ExprKind::Binary { left, right, .. } => contains_node(left, id) || contains_node(right, id),
        ExprKind::Unary { operand, .. } => contains_node(operand, id),
        _ => false,
    }
}

struct Replace<'a> {
    key: &'a str,
    name: &'a Symbol,
}

impl Rewriter for Replace<'_> {
    fn expr(&mut self, expr: Expr) -> Expr {
        if matches!(expr.kind, ExprKind::Lambda(_)) {
            return expr;
        }
        if is_candidate(&expr) && structural_key(&expr) == self.key {
            return Expr::variable(self.name.clone(), expr.position);
        }
        super::rewrite::walk_expr(self, expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, Position};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn cse(source: &str) -> Program {
        run(parse_source(source, SyntaxLevel::Medium).program)
    }

    fn body<'a>(program: &'a Program) -> &'a [Stmt] {
        &program.find_function("f").expect("f").body
    }

    fn let_name(stmt: &Stmt) -> Option<&str> {
        match &stmt.kind {
            StmtKind::Let(decl) => Some(decl.name.as_str()),
            _ => None,
        }
    }

    #[test]
    fn repeated_expression_is_computed_once() {
        let program = cse("fn f(a, b) { let x = a * b + 1; let y = a * b - 1; return x + y; }");
        let body = body(&program);
        assert_eq!(body.len(), 4);
        assert_eq!(let_name(&body[0]), Some("__cse0"));
        match &body[1].kind {
            StmtKind::Let(decl) => {
                let init = decl.init.as_ref().expect("init");
                let ExprKind::Binary { left, .. } = &init.kind else {
                    panic!("expected binary init");
                };
                assert_eq!(left.as_variable().map(Symbol::as_str), Some("__cse0"));
            }
            other => panic!("expected let, found {other:?}"),
        }
    }

    #[test]
    fn writes_to_an_operand_end_the_window() {
        let program = cse("fn f(a, b) { let x = a + b; a = 5; let y = a + b; return x * y; }");
        assert!(body(&program).iter().all(|stmt| let_name(stmt) != Some("__cse0")));
    }

    #[test]
    fn calls_are_barriers() {
        let program = cse("fn f(a, b) { let x = a + b; log(x); let y = a + b; return y; }");
        assert_eq!(body(&program).len(), 4);
    }

    #[test]
    fn existing_names_are_not_reused() {
        let first = cse("fn f(a, b) { let x = a * b; let y = a * b; return x + y; }");
        let mut statements = first.statements;
        statements.extend(
            parse_source("fn g(a, b) { let p = a - b; let q = a - b; return p; }", SyntaxLevel::Medium)
                .program
                .statements,
        );
        let second = run(Program::new(statements));
        let g = &second.find_function("g").expect("g").body;
        assert_eq!(let_name(&g[0]), Some("__cse1"));
    }

    #[test]
    fn guarded_operands_are_not_hoisted() {
        let program = cse(
            "fn f(a) { let r = a != null ? a + 1 : 0; let s = a != null ? a + 1 : 0; \
             let t = a && a * 2; let u = a && a * 2; return r + s + t + u; }",
        );
        let hoisted: Vec<String> = body(&program)
            .iter()
            .filter(|stmt| let_name(stmt).is_some_and(|name| name.starts_with("__cse")))
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Let(decl) => decl.init.as_ref().map(structural_key),
                _ => None,
            })
            .collect();
        let at = Position::default();
        let a = || Expr::variable("a", at);
        let guarded = [
            Expr::binary(BinaryOp::Add, a(), Expr::literal(Literal::Integer(1), at), at),
            Expr::binary(BinaryOp::Multiply, a(), Expr::literal(Literal::Integer(2), at), at),
        ];
        for expr in &guarded {
            assert!(!hoisted.contains(&structural_key(expr)), "{hoisted:?}");
        }
    }

    #[test]
    fn nested_blocks_are_processed_on_their_own() {
        let program = cse("fn f(a, b, c) { if c { let x = a * b; let y = a * b; } }");
        match &body(&program)[0].kind {
            StmtKind::If { then_branch, .. } => assert_eq!(then_branch.len(), 3),
            other => panic!("expected if, found {other:?}"),
        }
    }
}
