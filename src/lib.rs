//=====================================================
// File: lib.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Strata library root
// Objective: Expose every pipeline stage, from the level-aware lexer to the
//            bytecode virtual machine, plus the Pipeline driver tying them
//            together
//=====================================================

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod memory;
pub mod optimizer;
pub mod parser;
pub mod pipeline;
pub mod runtime;
pub mod symbol;
pub mod tokenizer;
pub mod typeck;
pub mod vm;

pub use config::StrataConfig;
pub use diagnostics::{Diagnostic, Diagnostics};
pub use pipeline::{Pipeline, PipelineError};
pub use runtime::Value;
pub use vm::{FatalError, Vm, VmError};
