//=====================================================
// File: optimizer/dce.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Dead code elimination
// Objective: Drop unreachable statements and branches decided by literals
//=====================================================

use tracing::trace;

use super::fold::is_bool_literal;
use super::rewrite::{Rewriter, walk_block, walk_stmt};
use crate::ast::{Program, Stmt, StmtKind};

#[derive(Default)]
pub struct DeadCode {
    pub removed: usize,
}

pub fn run(program: Program) -> Program {
    let mut pass = DeadCode::default();
    let statements = pass.block(program.statements);
    trace!(removed = pass.removed, "dead code elimination");
    Program::new(statements)
}

fn is_empty_block(stmt: &Stmt) -> bool {
    matches!(&stmt.kind, StmtKind::Block(body) if body.is_empty())
}

impl Rewriter for DeadCode {
    fn block(&mut self, block: Vec<Stmt>) -> Vec<Stmt> {
        let block = walk_block(self, block);
        let mut kept = Vec::with_capacity(block.len());
        let mut unreachable = false;
        for stmt in block {
            if is_empty_block(&stmt) {
                self.removed += 1;
                continue;
            }
            if unreachable && !stmt.is_declaration() {
                self.removed += 1;
                continue;
            }
            if stmt.is_terminator() {
                unreachable = true;
            }
            kept.push(stmt);
        }
        kept
    }

    fn stmt(&mut self, stmt: Stmt) -> Stmt {
        let stmt = walk_stmt(self, stmt);
        let position = stmt.position;
        match stmt.kind {
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } if is_bool_literal(&condition, true) || is_bool_literal(&condition, false) => {
                self.removed += 1;
                let taken = if is_bool_literal(&condition, true) {
                    then_branch
                } else {
                    else_branch.unwrap_or_default()
                };
                Stmt::block(taken, position)
            }
            StmtKind::While { condition, .. } if is_bool_literal(&condition, false) => {
                self.removed += 1;
                Stmt::block(Vec::new(), position)
            }
            kind => Stmt { position, kind },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn dce(source: &str) -> Program {
        run(parse_source(source, SyntaxLevel::Medium).program)
    }

    #[test]
    fn statements_after_return_are_removed_but_declarations_stay() {
        let program = dce("fn f() { return 1; let x = 2; fn inner() { } x = 3; }");
        let body = &program.find_function("f").expect("f").body;
        assert_eq!(body.len(), 2);
        assert!(matches!(body[0].kind, StmtKind::Return(_)));
        assert!(matches!(body[1].kind, StmtKind::Function(_)));
    }

    #[test]
    fn literal_if_is_replaced_by_the_taken_branch() {
        let program = dce("if false { a(); } else { b(); c(); }");
        match &program.statements[0].kind {
            StmtKind::Block(body) => assert_eq!(body.len(), 2),
            other => panic!("expected block, found {other:?}"),
        }
        let program = dce("if false { a(); }");
        assert!(program.statements.is_empty());
    }

    #[test]
    fn while_false_disappears() {
        let program = dce("while false { a(); }\nb();");
        assert_eq!(program.statements.len(), 1);
    }
}
