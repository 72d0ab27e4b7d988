//=====================================================
// File: pipeline.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: End-to-end driver for Strata source
// Objective: Run lexing, parsing, checking, both optimizers, compilation and
//            execution in order, stopping before bytecode when any stage
//            reported an error
//=====================================================

use thiserror::Error;
use tracing::{debug, instrument};

use crate::bytecode::{BytecodeError, CompiledProgram, PeepholeError, peephole, register_alloc};
use crate::compiler::{CompileError, compile};
use crate::config::StrataConfig;
use crate::diagnostics::Diagnostics;
use crate::optimizer::optimize;
use crate::parser::{ParseOutput, parse_source};
use crate::runtime::Value;
use crate::tokenizer::SyntaxLevel;
use crate::typeck::{TypedProgram, check};
use crate::vm::{Vm, VmError};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Lex, parse or type errors. Warnings travel along with them.
    #[error("{0}")]
    Diagnostics(Diagnostics),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Peephole(#[from] PeepholeError),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl PipelineError {
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            PipelineError::Diagnostics(diagnostics) => Some(diagnostics),
            _ => None,
        }
    }
}

/// Checked program together with the warnings raised on the way.
#[derive(Debug, Clone)]
pub struct Checked {
    pub typed: TypedProgram,
    pub warnings: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: StrataConfig,
    level: SyntaxLevel,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(StrataConfig::default())
    }
}

impl Pipeline {
    /// Sources start at `@medium` unless a marker or [`Pipeline::with_level`]
    /// says otherwise.
    pub fn new(config: StrataConfig) -> Self {
        Self {
            config,
            level: SyntaxLevel::default(),
        }
    }

    pub fn with_level(mut self, level: SyntaxLevel) -> Self {
        self.level = level;
        self
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn level(&self) -> SyntaxLevel {
        self.level
    }

    pub fn parse(&self, source: &str) -> ParseOutput {
        parse_source(source, self.level)
    }

    /// Parses and type checks. Errors from both stages are reported together.
    #[instrument(skip_all, fields(level = %self.level))]
    pub fn check(&self, source: &str) -> Result<Checked, PipelineError> {
        let ParseOutput {
            program,
            mut diagnostics,
        } = self.parse(source);
        let (typed, type_diagnostics) = check(program);
        diagnostics.extend(type_diagnostics);
        if diagnostics.has_errors() {
            debug!(errors = diagnostics.error_count(), "front end rejected the program");
            return Err(PipelineError::Diagnostics(diagnostics));
        }
        Ok(Checked {
            typed,
            warnings: diagnostics,
        })
    }

    /// Source to optimized bytecode.
    #[instrument(skip_all)]
    pub fn compile(&self, source: &str) -> Result<CompiledProgram, PipelineError> {
        let checked = self.check(source)?;
        let typed = optimize(checked.typed, &self.config.optimizer);
        let mut program = compile(&typed)?;
        self.finish_bytecode(&mut program)?;
        Ok(program)
    }

    /// Peephole rewriting then register allocation, as configured.
    pub fn finish_bytecode(&self, program: &mut CompiledProgram) -> Result<(), PipelineError> {
        if self.config.optimizer.peephole {
            let stats = peephole::optimize(program)?;
            debug!(rewrites = stats.rewrites, removed = stats.removed_words, "peephole applied");
        }
        if self.config.optimizer.register_allocation {
            let report = register_alloc::allocate(program)?;
            debug!(spilled = report.spilled(), "registers assigned");
        }
        program.validate()?;
        Ok(())
    }

    /// Compiles `source` and returns a VM ready to run it.
    pub fn load(&self, source: &str) -> Result<Vm, PipelineError> {
        let program = self.compile(source)?;
        Ok(Vm::new(program, &self.config).with_source(source))
    }

    pub fn run(&self, source: &str) -> Result<Value, PipelineError> {
        let mut vm = self.load(source)?;
        Ok(vm.run()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_errors_stop_before_bytecode() {
        let err = Pipeline::default()
            .with_level(SyntaxLevel::Medium)
            .compile("let x: int = 1.5;")
            .expect_err("type error");
        assert!(err.diagnostics().is_some_and(|d| d.has_errors()));
    }

    #[test]
    fn run_returns_the_final_value() {
        let value = Pipeline::default()
            .run("let a = 20; a + 22")
            .expect("run");
        assert_eq!(value, Value::Int(42));
    }
}
