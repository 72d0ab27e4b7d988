//=====================================================
// File: optimizer/inline.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Function inlining
// Objective: Replace calls to small, non-recursive top-level functions with
//            their bodies, as a substituted expression when the body is a
//            single `return e` and as an immediately-invoked lambda otherwise
//=====================================================

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use super::rewrite::{
    Rewriter, Visitor, clone_fresh, mentioned_in_block, substitute_expr, visit_expr_children,
    visit_stmt_children, walk_expr,
};
use crate::ast::{
    Expr, ExprKind, FunctionDecl, LambdaExpr, Param, Pattern, Program, Stmt, StmtKind,
};
use crate::config::OptimizerConfig;
use crate::symbol::Symbol;

/// Attribute that opts a function out of inlining.
pub const NOINLINE: &str = "noinline";

struct Candidate {
    params: Vec<Param>,
    decl: FunctionDecl,
    /// Names the body reads from its environment.
    free: HashSet<Symbol>,
    /// Body of the form `return e` where `e` holds no lambda.
    single_expr: Option<Expr>,
}

pub fn run(program: Program, config: &OptimizerConfig) -> Program {
    let candidates = find_candidates(&program, config);
    if candidates.is_empty() {
        return program;
    }
    debug!(
        candidates = ?candidates.keys().map(Symbol::as_str).collect::<Vec<_>>(),
        "inline candidates"
    );
    let mut inlined = 0;
    let statements = program
        .statements
        .into_iter()
        .map(|stmt| {
            let mut inliner = Inliner {
                candidates: &candidates,
                shadowed: local_names_of(&stmt),
                inlined: 0,
            };
            let stmt = inliner.stmt(stmt);
            inlined += inliner.inlined;
            stmt
        })
        .collect();
    trace!(inlined, "inlining");
    Program::new(statements)
}

//=====================================================
// Section 1.0 - Candidate selection
//=====================================================

fn find_candidates(program: &Program, config: &OptimizerConfig) -> HashMap<Symbol, Candidate> {
    let functions: HashMap<Symbol, &FunctionDecl> = program
        .find_functions()
        .into_iter()
        .map(|decl| (decl.name.clone(), decl))
        .collect();
    let graph: HashMap<Symbol, HashSet<Symbol>> = functions
        .iter()
        .map(|(name, decl)| {
            let mentioned = mentioned_in_block(&decl.body).names;
            let callees = mentioned
                .into_iter()
                .filter(|callee| functions.contains_key(callee))
                .collect();
            (name.clone(), callees)
        })
        .collect();

    let mut candidates = HashMap::new();
    for (name, decl) in &functions {
        if decl.params.len() > config.inline_max_params
            || decl.body.len() > config.inline_max_statements
            || decl.has_attribute(NOINLINE)
            || reaches(&graph, name, name)
        {
            continue;
        }
        let mentioned = mentioned_in_block(&decl.body);
        if mentioned.has_asm || mentioned.names.contains("self") {
            continue;
        }
        let mut locals = declared_names(&decl.body);
        locals.extend(decl.params.iter().map(|p| p.name.clone()));
        let free = mentioned
            .names
            .into_iter()
            .filter(|n| !locals.contains(n))
            .collect();
        let single_expr = match decl.body.as_slice() {
            [
                Stmt {
                    kind: StmtKind::Return(Some(expr)),
                    ..
                },
            ] if !contains_lambda(expr) => Some(expr.clone()),
            _ => None,
        };
        candidates.insert(
            name.clone(),
            Candidate {
                params: decl.params.clone(),
                decl: (*decl).clone(),
                free,
                single_expr,
            },
        );
    }
    candidates
}

/// Whether `target` is reachable from `start` through at least one call.
fn reaches(graph: &HashMap<Symbol, HashSet<Symbol>>, start: &Symbol, target: &Symbol) -> bool {
    let mut seen = HashSet::new();
    let mut work: Vec<&Symbol> = graph.get(start).into_iter().flatten().collect();
    while let Some(next) = work.pop() {
        if next == target {
            return true;
        }
        if seen.insert(next) {
            work.extend(graph.get(next).into_iter().flatten());
        }
    }
    false
}

fn contains_lambda(expr: &Expr) -> bool {
    struct Finder(bool);
    impl Visitor for Finder {
        fn visit_expr(&mut self, expr: &Expr) {
            if matches!(expr.kind, ExprKind::Lambda(_)) {
                self.0 = true;
            }
            visit_expr_children(self, expr);
        }
    }
    let mut finder = Finder(false);
    finder.visit_expr(expr);
    finder.0
}

//=====================================================
// Section 2.0 - Local names
//=====================================================

/// Names bound by declarations inside the statements: lets, loop and catch
/// variables, match bindings, parameters of nested functions and lambdas.
#[derive(Default)]
struct DeclaredNames(HashSet<Symbol>);

impl Visitor for DeclaredNames {
    fn visit_expr(&mut self, expr: &Expr) {
        if let ExprKind::Lambda(lambda) = &expr.kind {
            self.0.extend(lambda.params.iter().map(|p| p.name.clone()));
        }
        visit_expr_children(self, expr);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(decl) => {
                self.0.insert(decl.name.clone());
            }
            StmtKind::Function(decl) => {
                self.0.insert(decl.name.clone());
                self.0.extend(decl.params.iter().map(|p| p.name.clone()));
            }
            StmtKind::Class(decl) => {
                self.0.insert(Symbol::from("self"));
                for method in &decl.methods {
                    self.0.extend(method.params.iter().map(|p| p.name.clone()));
                }
            }
            StmtKind::ForRange { variable, .. } => {
                self.0.insert(variable.clone());
            }
            StmtKind::Try { catches, .. } => {
                self.0.extend(catches.iter().map(|c| c.name.clone()));
            }
            StmtKind::Match { arms, .. } => {
                for arm in arms {
                    if let Pattern::Binding(name) = &arm.pattern {
                        self.0.insert(name.clone());
                    }
                }
            }
            _ => {}
        }
        visit_stmt_children(self, stmt);
    }
}

fn declared_names(block: &[Stmt]) -> HashSet<Symbol> {
    let mut collector = DeclaredNames::default();
    for stmt in block {
        collector.visit_stmt(stmt);
    }
    collector.0
}

/// Names that may shadow globals somewhere inside a top-level statement. A
/// top-level `let` declares a global, so only its initializer is searched.
fn local_names_of(stmt: &Stmt) -> HashSet<Symbol> {
    match &stmt.kind {
        StmtKind::Let(decl) => {
            let mut collector = DeclaredNames::default();
            if let Some(init) = &decl.init {
                collector.visit_expr(init);
            }
            collector.0
        }
        StmtKind::Function(decl) => {
            let mut names = declared_names(&decl.body);
            names.extend(decl.params.iter().map(|p| p.name.clone()));
            names
        }
        _ => {
            let mut collector = DeclaredNames::default();
            visit_stmt_children(&mut collector, stmt);
            collector.0
        }
    }
}

//=====================================================
// Section 3.0 - Call site rewriting
//=====================================================

struct Inliner<'a> {
    candidates: &'a HashMap<Symbol, Candidate>,
    shadowed: HashSet<Symbol>,
    inlined: usize,
}

impl<'a> Inliner<'a> {
    fn candidate_for(&self, callee: &Expr, argc: usize) -> Option<&'a Candidate> {
        let name = callee.as_variable()?;
        if self.shadowed.contains(name) {
            return None;
        }
        let candidates: &'a HashMap<Symbol, Candidate> = self.candidates;
        let candidate = candidates.get(name)?;
        let hygienic = candidate.free.is_disjoint(&self.shadowed);
        (candidate.params.len() == argc && hygienic).then_some(candidate)
    }
}

impl Rewriter for Inliner<'_> {
    fn expr(&mut self, expr: Expr) -> Expr {
        let expr = walk_expr(self, expr);
        let ExprKind::Call { callee, args } = &expr.kind else {
            return expr;
        };
        let Some(candidate) = self.candidate_for(callee, args.len()) else {
            return expr;
        };
        if let Some(body) = &candidate.single_expr {
            // A substituted argument is evaluated where the parameter is read,
            // possibly never or twice. Literals are safe anywhere; a variable
            // is only safe when nothing in the body can write it first.
            let substitutable = args.iter().all(|arg| {
                arg.is_literal() || (arg.cannot_fault() && body.is_pure())
            });
            if substitutable {
                let bindings: HashMap<Symbol, Expr> = candidate
                    .params
                    .iter()
                    .map(|p| p.name.clone())
                    .zip(args.iter().cloned())
                    .collect();
                let mut inlined = substitute_expr(body, &bindings);
                inlined.position = expr.position;
                self.inlined += 1;
                return inlined;
            }
        }
        let lambda = Expr::new(
            ExprKind::Lambda(Box::new(LambdaExpr {
                params: candidate.params.clone(),
                return_type: candidate.decl.return_type.clone(),
                body: clone_fresh(&candidate.decl.body),
            })),
            expr.position,
        );
        self.inlined += 1;
        let position = expr.position;
        let ExprKind::Call { args, .. } = expr.kind else {
            return Expr::call(lambda, Vec::new(), position);
        };
        Expr::call(lambda, args, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Literal;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn inline(source: &str) -> Program {
        run(
            parse_source(source, SyntaxLevel::Medium).program,
            &OptimizerConfig::default(),
        )
    }

    fn last_expr(program: &Program) -> &Expr {
        match program.statements.last().map(|s| &s.kind) {
            Some(StmtKind::Expr(expr)) => expr,
            other => panic!("expected expression statement, found {other:?}"),
        }
    }

    #[test]
    fn single_return_bodies_inline_as_expressions() {
        let program = inline("fn double(x) { return x * 2; }\ndouble(21);");
        match &last_expr(&program).kind {
            ExprKind::Binary { left, right, .. } => {
                assert_eq!(left.as_literal(), Some(&Literal::Integer(21)));
                assert_eq!(right.as_literal(), Some(&Literal::Integer(2)));
            }
            other => panic!("expected substituted body, found {other:?}"),
        }
    }

    #[test]
    fn larger_bodies_become_immediately_invoked_lambdas() {
        let program = inline("fn pick(c) { if c { return 1; } return 2; }\npick(true);");
        match &last_expr(&program).kind {
            ExprKind::Call { callee, args } => {
                assert!(matches!(callee.kind, ExprKind::Lambda(_)));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected lambda call, found {other:?}"),
        }
    }

    #[test]
    fn impure_arguments_use_the_lambda_form() {
        let program = inline("fn id(x) { return x; }\nid(next());");
        match &last_expr(&program).kind {
            ExprKind::Call { callee, .. } => assert!(matches!(callee.kind, ExprKind::Lambda(_))),
            other => panic!("expected lambda call, found {other:?}"),
        }
    }

    #[test]
    fn variables_are_not_substituted_into_bodies_with_calls() {
        let program = inline(
            "let g = 1;\nfn bump() { g = 10; return 0; }\nfn f(p) { return bump() + p; }\nf(g);",
        );
        match &last_expr(&program).kind {
            ExprKind::Call { callee, args } => {
                assert!(matches!(callee.kind, ExprKind::Lambda(_)));
                assert_eq!(args[0].as_variable().map(Symbol::as_str), Some("g"));
            }
            other => panic!("expected lambda call, found {other:?}"),
        }
    }

    #[test]
    fn recursive_and_noinline_functions_are_kept() {
        let program = inline(
            "fn fact(n) { if n < 2 { return 1; } return n * fact(n - 1); }\n\
             #[noinline]\nfn keep(x) { return x; }\n\
             fact(3) + keep(1);",
        );
        match &last_expr(&program).kind {
            ExprKind::Binary { left, right, .. } => {
                assert!(matches!(&left.kind, ExprKind::Call { callee, .. } if callee.as_variable().is_some()));
                assert!(matches!(&right.kind, ExprKind::Call { callee, .. } if callee.as_variable().is_some()));
            }
            other => panic!("expected binary expression, found {other:?}"),
        }
    }

    #[test]
    fn shadowed_globals_block_inlining() {
        let program = inline(
            "let scale = 3;\nfn apply(x) { return x * scale; }\nfn user() { let scale = 10; return apply(2); }",
        );
        let user = program.find_function("user").expect("user");
        match &user.body[1].kind {
            StmtKind::Return(Some(expr)) => {
                assert!(matches!(&expr.kind, ExprKind::Call { callee, .. } if callee.as_variable().is_some()));
            }
            other => panic!("expected return, found {other:?}"),
        }
    }
}
