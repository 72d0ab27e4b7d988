//=====================================================
// File: optimizer/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: AST optimizer
// Objective: Run the tree passes in a fixed pipeline, each one switchable
//            from the configuration
//=====================================================

pub mod cse;
pub mod dce;
pub mod fold;
pub mod inline;
pub mod loops;
pub mod rewrite;

use std::fmt;

use tracing::{debug, instrument};

use crate::ast::Program;
use crate::config::OptimizerConfig;
use crate::typeck::TypedProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Fold,
    Dce,
    Inline,
    Loops,
    Cse,
}

/// Folding runs again after passes that expose new literal operands.
pub const DEFAULT_PIPELINE: &[Pass] = &[
    Pass::Fold,
    Pass::Dce,
    Pass::Inline,
    Pass::Fold,
    Pass::Loops,
    Pass::Fold,
    Pass::Dce,
    Pass::Cse,
];

impl Pass {
    pub fn name(self) -> &'static str {
        match self {
            Pass::Fold => "fold",
            Pass::Dce => "dce",
            Pass::Inline => "inline",
            Pass::Loops => "loops",
            Pass::Cse => "cse",
        }
    }

    pub fn enabled(self, config: &OptimizerConfig) -> bool {
        match self {
            Pass::Fold => config.fold,
            Pass::Dce => config.dce,
            Pass::Inline => config.inline,
            Pass::Loops => config.loops,
            Pass::Cse => config.cse,
        }
    }

    pub fn run(self, program: Program, config: &OptimizerConfig) -> Program {
        match self {
            Pass::Fold => fold::run(program),
            Pass::Dce => dce::run(program),
            Pass::Inline => inline::run(program, config),
            Pass::Loops => loops::run(program, config),
            Pass::Cse => cse::run(program),
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optimizes the checked tree. Symbols and recorded types carry over; nodes
/// created by the passes have no recorded type.
#[instrument(skip_all)]
pub fn optimize(typed: TypedProgram, config: &OptimizerConfig) -> TypedProgram {
    let TypedProgram {
        mut program,
        symbols,
        types,
    } = typed;
    for pass in DEFAULT_PIPELINE {
        if !pass.enabled(config) {
            continue;
        }
        program = pass.run(program, config);
        debug!(pass = %pass, statements = program.statements.len(), "pass finished");
    }
    TypedProgram {
        program,
        symbols,
        types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, StmtKind};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn optimized(source: &str, config: &OptimizerConfig) -> Program {
        let program = parse_source(source, SyntaxLevel::Medium).program;
        optimize(TypedProgram::unchecked(program), config).program
    }

    #[test]
    fn inlined_literals_fold_away() {
        let program = optimized(
            "fn double(x) { return x * 2; }\nlet y = double(21);",
            &OptimizerConfig::default(),
        );
        match &program.statements[1].kind {
            StmtKind::Let(decl) => assert_eq!(
                decl.init.as_ref().and_then(|e| e.as_literal()),
                Some(&Literal::Integer(42))
            ),
            other => panic!("expected let, found {other:?}"),
        }
    }

    #[test]
    fn disabled_configuration_leaves_the_tree_alone() {
        let source = "let y = 1 + 2;\nif false { print(y); }";
        let program = parse_source(source, SyntaxLevel::Medium).program;
        let unchanged = optimized(source, &OptimizerConfig::disabled());
        assert_eq!(unchanged.statements.len(), program.statements.len());
        assert!(matches!(&unchanged.statements[1].kind, StmtKind::If { .. }));
    }

    #[test]
    fn every_pass_has_a_switch() {
        let config = OptimizerConfig::disabled();
        assert!(DEFAULT_PIPELINE.iter().all(|pass| !pass.enabled(&config)));
    }
}
