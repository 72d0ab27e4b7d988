//=====================================================
// File: optimizer/rewrite.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Tree traversal shared by the optimizer passes
// Objective: A consuming rewriter, a borrowing visitor, the cloning
//            substitution visitor and small queries built on them
//=====================================================

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

use crate::ast::{
    AsmLine, AsmOp, AsmOperand, ClassDecl, Expr, ExprKind, FunctionDecl, LambdaExpr, MatchArm,
    Pattern, Stmt, StmtKind, next_node_id,
};
use crate::symbol::Symbol;

//=====================================================
// Section 1.0 - Consuming rewriter
//=====================================================

/// Bottom-up tree rewriter. Implementors override the hooks they care about
/// and call the matching `walk_*` function to rebuild children.
pub trait Rewriter {
    fn expr(&mut self, expr: Expr) -> Expr {
        walk_expr(self, expr)
    }

    fn stmt(&mut self, stmt: Stmt) -> Stmt {
        walk_stmt(self, stmt)
    }

    fn block(&mut self, block: Vec<Stmt>) -> Vec<Stmt> {
        walk_block(self, block)
    }
}

pub fn walk_block<R: Rewriter + ?Sized>(r: &mut R, block: Vec<Stmt>) -> Vec<Stmt> {
    block.into_iter().map(|stmt| r.stmt(stmt)).collect()
}

fn boxed<R: Rewriter + ?Sized>(r: &mut R, expr: Box<Expr>) -> Box<Expr> {
    Box::new(r.expr(*expr))
}

fn exprs<R: Rewriter + ?Sized>(r: &mut R, items: Vec<Expr>) -> Vec<Expr> {
    items.into_iter().map(|item| r.expr(item)).collect()
}

pub fn walk_expr<R: Rewriter + ?Sized>(r: &mut R, expr: Expr) -> Expr {
    let Expr { id, position, kind } = expr;
    let kind = match kind {
        ExprKind::Literal(_)
        | ExprKind::Variable(_)
        | ExprKind::SizeOf(_)
        | ExprKind::EnumVariant { .. } => kind,
        ExprKind::Binary { op, left, right } => ExprKind::Binary {
            op,
            left: boxed(r, left),
            right: boxed(r, right),
        },
        ExprKind::Unary { op, operand } => ExprKind::Unary {
            op,
            operand: boxed(r, operand),
        },
        ExprKind::Assign { target, value } => ExprKind::Assign {
            target: boxed(r, target),
            value: boxed(r, value),
        },
        ExprKind::Call { callee, args } => ExprKind::Call {
            callee: boxed(r, callee),
            args: exprs(r, args),
        },
        ExprKind::MethodCall {
            receiver,
            method,
            args,
        } => ExprKind::MethodCall {
            receiver: boxed(r, receiver),
            method,
            args: exprs(r, args),
        },
        ExprKind::Field { object, field } => ExprKind::Field {
            object: boxed(r, object),
            field,
        },
        ExprKind::Index { object, index } => ExprKind::Index {
            object: boxed(r, object),
            index: boxed(r, index),
        },
        ExprKind::Array(items) => ExprKind::Array(exprs(r, items)),
        ExprKind::Lambda(lambda) => {
            let LambdaExpr {
                params,
                return_type,
                body,
            } = *lambda;
            ExprKind::Lambda(Box::new(LambdaExpr {
                params,
                return_type,
                body: r.block(body),
            }))
        }
        ExprKind::Conditional {
            condition,
            then_expr,
            else_expr,
        } => ExprKind::Conditional {
            condition: boxed(r, condition),
            then_expr: boxed(r, then_expr),
            else_expr: boxed(r, else_expr),
        },
        ExprKind::New { class, args } => ExprKind::New {
            class,
            args: exprs(r, args),
        },
        ExprKind::StructLiteral { name, fields } => ExprKind::StructLiteral {
            name,
            fields: fields
                .into_iter()
                .map(|(field, value)| (field, r.expr(value)))
                .collect(),
        },
        ExprKind::AddressOf(inner) => ExprKind::AddressOf(boxed(r, inner)),
        ExprKind::Deref(inner) => ExprKind::Deref(boxed(r, inner)),
    };
    Expr { id, position, kind }
}

fn function<R: Rewriter + ?Sized>(r: &mut R, decl: FunctionDecl) -> FunctionDecl {
    FunctionDecl {
        body: r.block(decl.body),
        ..decl
    }
}

pub fn walk_stmt<R: Rewriter + ?Sized>(r: &mut R, stmt: Stmt) -> Stmt {
    let Stmt { position, kind } = stmt;
    let kind = match kind {
        StmtKind::Expr(expr) => StmtKind::Expr(r.expr(expr)),
        StmtKind::Let(mut decl) => {
            decl.init = decl.init.map(|init| r.expr(init));
            StmtKind::Let(decl)
        }
        StmtKind::Function(decl) => StmtKind::Function(function(r, decl)),
        StmtKind::Class(decl) => {
            let ClassDecl {
                name,
                parents,
                fields,
                methods,
                position,
            } = decl;
            let fields = fields
                .into_iter()
                .map(|mut field| {
                    field.init = field.init.map(|init| r.expr(init));
                    field
                })
                .collect();
            let methods = methods.into_iter().map(|m| function(r, m)).collect();
            StmtKind::Class(ClassDecl {
                name,
                parents,
                fields,
                methods,
                position,
            })
        }
        StmtKind::Interface(_) | StmtKind::Struct(_) | StmtKind::Enum(_) | StmtKind::Asm(_) => kind,
        StmtKind::Block(body) => StmtKind::Block(r.block(body)),
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => StmtKind::If {
            condition: r.expr(condition),
            then_branch: r.block(then_branch),
            else_branch: else_branch.map(|b| r.block(b)),
        },
        StmtKind::While { condition, body } => StmtKind::While {
            condition: r.expr(condition),
            body: r.block(body),
        },
        StmtKind::For {
            init,
            condition,
            update,
            body,
        } => StmtKind::For {
            init: init.map(|s| Box::new(r.stmt(*s))),
            condition: condition.map(|c| r.expr(c)),
            update: update.map(|u| r.expr(u)),
            body: r.block(body),
        },
        StmtKind::ForRange {
            variable,
            start,
            end,
            inclusive,
            body,
        } => StmtKind::ForRange {
            variable,
            start: r.expr(start),
            end: r.expr(end),
            inclusive,
            body: r.block(body),
        },
        StmtKind::Loop(body) => StmtKind::Loop(r.block(body)),
        StmtKind::Match { scrutinee, arms } => StmtKind::Match {
            scrutinee: r.expr(scrutinee),
            arms: arms
                .into_iter()
                .map(|arm| MatchArm {
                    guard: arm.guard.map(|g| r.expr(g)),
                    body: r.block(arm.body),
                    ..arm
                })
                .collect(),
        },
        StmtKind::Return(value) => StmtKind::Return(value.map(|v| r.expr(v))),
        StmtKind::Break => StmtKind::Break,
        StmtKind::Continue => StmtKind::Continue,
        StmtKind::Throw(value) => StmtKind::Throw(r.expr(value)),
        StmtKind::Try {
            body,
            catches,
            finally,
        } => StmtKind::Try {
            body: r.block(body),
            catches: catches
                .into_iter()
                .map(|mut clause| {
                    clause.body = r.block(clause.body);
                    clause
                })
                .collect(),
            finally: finally.map(|f| r.block(f)),
        },
    };
    Stmt { position, kind }
}

//=====================================================
// Section 2.0 - Borrowing visitor
//=====================================================

pub trait Visitor {
    fn visit_expr(&mut self, expr: &Expr) {
        visit_expr_children(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        visit_stmt_children(self, stmt);
    }
}

pub fn visit_block<V: Visitor + ?Sized>(v: &mut V, block: &[Stmt]) {
    for stmt in block {
        v.visit_stmt(stmt);
    }
}

pub fn visit_expr_children<V: Visitor + ?Sized>(v: &mut V, expr: &Expr) {
    match &expr.kind {
        ExprKind::Literal(_)
        | ExprKind::Variable(_)
        | ExprKind::SizeOf(_)
        | ExprKind::EnumVariant { .. } => {}
        ExprKind::Binary { left, right, .. } => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        ExprKind::Unary { operand, .. } => v.visit_expr(operand),
        ExprKind::Assign { target, value } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        ExprKind::Call { callee, args } => {
            v.visit_expr(callee);
            args.iter().for_each(|arg| v.visit_expr(arg));
        }
        ExprKind::MethodCall { receiver, args, .. } => {
            v.visit_expr(receiver);
            args.iter().for_each(|arg| v.visit_expr(arg));
        }
        ExprKind::Field { object, .. } => v.visit_expr(object),
        ExprKind::Index { object, index } => {
            v.visit_expr(object);
            v.visit_expr(index);
        }
        ExprKind::Array(items) | ExprKind::New { args: items, .. } => {
            items.iter().for_each(|item| v.visit_expr(item));
        }
        ExprKind::Lambda(lambda) => visit_block(v, &lambda.body),
        ExprKind::Conditional {
            condition,
            then_expr,
            else_expr,
        } => {
            v.visit_expr(condition);
            v.visit_expr(then_expr);
            v.visit_expr(else_expr);
        }
        ExprKind::StructLiteral { fields, .. } => {
            fields.iter().for_each(|(_, value)| v.visit_expr(value));
        }
        ExprKind::AddressOf(inner) | ExprKind::Deref(inner) => v.visit_expr(inner),
    }
}

pub fn visit_stmt_children<V: Visitor + ?Sized>(v: &mut V, stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Expr(expr) | StmtKind::Throw(expr) => v.visit_expr(expr),
        StmtKind::Let(decl) => {
            if let Some(init) = &decl.init {
                v.visit_expr(init);
            }
        }
        StmtKind::Function(decl) => visit_block(v, &decl.body),
        StmtKind::Class(decl) => {
            for field in &decl.fields {
                if let Some(init) = &field.init {
                    v.visit_expr(init);
                }
            }
            for method in &decl.methods {
                visit_block(v, &method.body);
            }
        }
        StmtKind::Interface(_)
        | StmtKind::Struct(_)
        | StmtKind::Enum(_)
        | StmtKind::Asm(_)
        | StmtKind::Break
        | StmtKind::Continue => {}
        StmtKind::Block(body) | StmtKind::Loop(body) => visit_block(v, body),
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            v.visit_expr(condition);
            visit_block(v, then_branch);
            if let Some(else_branch) = else_branch {
                visit_block(v, else_branch);
            }
        }
        StmtKind::While { condition, body } => {
            v.visit_expr(condition);
            visit_block(v, body);
        }
        StmtKind::For {
            init,
            condition,
            update,
            body,
        } => {
            if let Some(init) = init {
                v.visit_stmt(init);
            }
            if let Some(condition) = condition {
                v.visit_expr(condition);
            }
            if let Some(update) = update {
                v.visit_expr(update);
            }
            visit_block(v, body);
        }
        StmtKind::ForRange {
            start, end, body, ..
        } => {
            v.visit_expr(start);
            v.visit_expr(end);
            visit_block(v, body);
        }
        StmtKind::Match { scrutinee, arms } => {
            v.visit_expr(scrutinee);
            for arm in arms {
                if let Some(guard) = &arm.guard {
                    v.visit_expr(guard);
                }
                visit_block(v, &arm.body);
            }
        }
        StmtKind::Return(value) => {
            if let Some(value) = value {
                v.visit_expr(value);
            }
        }
        StmtKind::Try {
            body,
            catches,
            finally,
        } => {
            visit_block(v, body);
            for clause in catches {
                visit_block(v, &clause.body);
            }
            if let Some(finally) = finally {
                visit_block(v, finally);
            }
        }
    }
}

//=====================================================
// Section 3.0 - Cloning substitution
//=====================================================

/// Deep copy that gives every expression a fresh id and replaces free uses
/// of the bound names. Lambda parameters shadow bindings inside the lambda.
pub struct Substitute<'a> {
    bindings: &'a HashMap<Symbol, Expr>,
    shadowed: Vec<HashSet<Symbol>>,
}

impl<'a> Substitute<'a> {
    pub fn new(bindings: &'a HashMap<Symbol, Expr>) -> Self {
        Self {
            bindings,
            shadowed: Vec::new(),
        }
    }

    fn is_shadowed(&self, name: &Symbol) -> bool {
        self.shadowed.iter().any(|scope| scope.contains(name))
    }
}

impl Rewriter for Substitute<'_> {
    fn expr(&mut self, expr: Expr) -> Expr {
        if let ExprKind::Variable(name) = &expr.kind {
            if !self.is_shadowed(name) {
                if let Some(replacement) = self.bindings.get(name) {
                    let mut copy = Substitute::new(&EMPTY).expr(replacement.clone());
                    copy.position = expr.position;
                    return copy;
                }
            }
        }
        let shadows = match &expr.kind {
            ExprKind::Lambda(lambda) => Some(
                lambda
                    .params
                    .iter()
                    .map(|p| p.name.clone())
                    .collect::<HashSet<_>>(),
            ),
            _ => None,
        };
        let pushed = shadows.is_some();
        if let Some(scope) = shadows {
            self.shadowed.push(scope);
        }
        let mut rewritten = walk_expr(self, expr);
        if pushed {
            self.shadowed.pop();
        }
        rewritten.id = next_node_id();
        rewritten
    }

    fn stmt(&mut self, stmt: Stmt) -> Stmt {
        let shadows = match &stmt.kind {
            StmtKind::Function(decl) => Some(decl.params.iter().map(|p| p.name.clone()).collect()),
            StmtKind::Class(_) => Some(HashSet::from([Symbol::from("self")])),
            _ => None,
        };
        let Some(scope) = shadows else {
            return walk_stmt(self, stmt);
        };
        self.shadowed.push(scope);
        let rewritten = walk_stmt(self, stmt);
        self.shadowed.pop();
        rewritten
    }
}

static EMPTY: Lazy<HashMap<Symbol, Expr>> = Lazy::new(HashMap::new);

/// Copy of `block` with fresh expression ids.
pub fn clone_fresh(block: &[Stmt]) -> Vec<Stmt> {
    Substitute::new(&EMPTY).block(block.to_vec())
}

pub fn substitute_block(block: &[Stmt], bindings: &HashMap<Symbol, Expr>) -> Vec<Stmt> {
    Substitute::new(bindings).block(block.to_vec())
}

pub fn substitute_expr(expr: &Expr, bindings: &HashMap<Symbol, Expr>) -> Expr {
    Substitute::new(bindings).expr(expr.clone())
}

//=====================================================
// Section 4.0 - Queries
//=====================================================

/// Names written anywhere in the statements: assignment targets, `let`
/// declarations, loop variables, catch and match bindings and assembly
/// `store` operands.
#[derive(Default)]
pub struct WrittenNames {
    pub names: HashSet<Symbol>,
}

impl Visitor for WrittenNames {
    fn visit_expr(&mut self, expr: &Expr) {
        if let ExprKind::Assign { target, .. } = &expr.kind {
            if let ExprKind::Variable(name) = &target.kind {
                self.names.insert(name.clone());
            }
        }
        visit_expr_children(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(decl) => {
                self.names.insert(decl.name.clone());
            }
            StmtKind::Function(decl) => {
                self.names.insert(decl.name.clone());
            }
            StmtKind::ForRange { variable, .. } => {
                self.names.insert(variable.clone());
            }
            StmtKind::Try { catches, .. } => {
                self.names.extend(catches.iter().map(|c| c.name.clone()));
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    if let Pattern::Binding(name) = &arm.pattern {
                        self.names.insert(name.clone());
                    }
                }
            }
            StmtKind::Asm(items) => {
                for item in items {
                    if let AsmLine::Instruction {
                        op: AsmOp::Store,
                        operand: Some(AsmOperand::Name(name)),
                    } = &item.line
                    {
                        self.names.insert(name.clone());
                    }
                }
            }
            _ => {}
        }
        visit_stmt_children(self, stmt);
    }
}

pub fn written_names(block: &[Stmt]) -> HashSet<Symbol> {
    let mut collector = WrittenNames::default();
    visit_block(&mut collector, block);
    collector.names
}

/// Every variable name read or written in an expression, lambda bodies
/// included.
#[derive(Default)]
pub struct MentionedNames {
    pub names: HashSet<Symbol>,
    pub has_call: bool,
    pub has_asm: bool,
}

impl Visitor for MentionedNames {
    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Variable(name) => {
                self.names.insert(name.clone());
            }
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } | ExprKind::New { .. } => {
                self.has_call = true;
            }
            _ => {}
        }
        visit_expr_children(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let StmtKind::Asm(items) = &stmt.kind {
            self.has_asm = true;
            for item in items {
                if let AsmLine::Instruction {
                    operand: Some(AsmOperand::Name(name)),
                    ..
                } = &item.line
                {
                    self.names.insert(name.clone());
                }
            }
        }
        visit_stmt_children(self, stmt);
    }
}

pub fn mentioned_in_expr(expr: &Expr) -> MentionedNames {
    let mut collector = MentionedNames::default();
    collector.visit_expr(expr);
    collector
}

pub fn mentioned_in_block(block: &[Stmt]) -> MentionedNames {
    let mut collector = MentionedNames::default();
    visit_block(&mut collector, block);
    collector
}

/// True when a `break` or `continue` in `block` would leave the loop that
/// directly owns it. Nested loops and lambdas are not searched.
pub fn exits_enclosing_loop(block: &[Stmt]) -> bool {
    block.iter().any(|stmt| match &stmt.kind {
        StmtKind::Break | StmtKind::Continue => true,
        StmtKind::Block(body) => exits_enclosing_loop(body),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            exits_enclosing_loop(then_branch)
                || else_branch.as_deref().is_some_and(exits_enclosing_loop)
        }
        StmtKind::Match { arms, .. } => arms.iter().any(|arm| exits_enclosing_loop(&arm.body)),
        StmtKind::Try {
            body,
            catches,
            finally,
        } => {
            exits_enclosing_loop(body)
                || catches.iter().any(|c| exits_enclosing_loop(&c.body))
                || finally.as_deref().is_some_and(exits_enclosing_loop)
        }
        _ => false,
    })
}

/// Structural key of an expression, ignoring ids and positions.
pub fn structural_key(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Literal(literal) => format!("{literal:?}"),
        ExprKind::Variable(name) => format!("${name}"),
        ExprKind::Binary { op, left, right } => {
            format!("({} {} {})", structural_key(left), op.symbol(), structural_key(right))
        }
        ExprKind::Unary { op, operand } => format!("({op} {})", structural_key(operand)),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Literal, Position};

    fn var(name: &str) -> Expr {
        Expr::variable(name, Position::default())
    }

    #[test]
    fn substitution_respects_lambda_parameters() {
        let mut bindings = HashMap::new();
        bindings.insert(
            Symbol::from("x"),
            Expr::literal(Literal::Integer(7), Position::default()),
        );
        let inner = Expr::binary(BinaryOp::Add, var("x"), var("x"), Position::default());
        let lambda = Expr::new(
            ExprKind::Lambda(Box::new(LambdaExpr {
                params: vec![crate::ast::Param {
                    name: Symbol::from("x"),
                    ty: None,
                    position: Position::default(),
                }],
                return_type: None,
                body: vec![Stmt::new(StmtKind::Return(Some(var("x"))), Position::default())],
            })),
            Position::default(),
        );
        let replaced = substitute_expr(&inner, &bindings);
        assert_eq!(structural_key(&replaced), "(Integer(7) + Integer(7))");
        let kept = substitute_expr(&lambda, &bindings);
        match kept.kind {
            ExprKind::Lambda(lambda) => match &lambda.body[0].kind {
                StmtKind::Return(Some(expr)) => assert_eq!(expr.as_variable().map(|s| s.as_str()), Some("x")),
                other => panic!("expected return, found {other:?}"),
            },
            other => panic!("expected lambda, found {other:?}"),
        }
    }

    #[test]
    fn clones_receive_fresh_ids() {
        let original = vec![Stmt::expr(var("a"))];
        let copy = clone_fresh(&original);
        match (&original[0].kind, &copy[0].kind) {
            (StmtKind::Expr(a), StmtKind::Expr(b)) => assert_ne!(a.id, b.id),
            other => panic!("expected expression statements, found {other:?}"),
        }
    }

    #[test]
    fn written_names_include_lets_and_assignments() {
        let block = vec![
            Stmt::let_decl("a", var("b"), Position::default()),
            Stmt::expr(Expr::assign(var("c"), var("d"), Position::default())),
        ];
        let written = written_names(&block);
        assert!(written.contains("a") && written.contains("c"));
        assert!(!written.contains("b"));
    }
}
