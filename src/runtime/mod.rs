//==============================================
// File: runtime/mod.rs
//==============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Runtime vocabulary shared across the pipeline
// Objective: Values, operator semantics, runtime faults and the fixed lists
//            of builtin exception classes and native functions
//==============================================

pub mod ops;
pub mod value;

use thiserror::Error;

pub use value::{Constant, Value};

/// Root of every builtin exception class.
pub const ERROR_CLASS: &str = "Error";

/// Field holding the human readable message on exception objects.
pub const MESSAGE_FIELD: &str = "message";

/// Builtin subclasses of [`ERROR_CLASS`], one per runtime fault kind.
pub const BUILTIN_EXCEPTIONS: &[&str] = &[
    "DivisionByZero",
    "TypeError",
    "IndexError",
    "NullReference",
    "UndefinedVariable",
    "ArityError",
    "StackOverflow",
    "AssertionError",
];

/// Faults raised while executing bytecode. Each one is turned into an
/// exception object of the builtin class named by [`RuntimeFault::class_name`]
/// so user code can catch it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeFault {
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0}")]
    TypeError(String),
    #[error("index {index} out of bounds for length {len}")]
    IndexError { index: i64, len: usize },
    #[error("null reference: {0}")]
    NullReference(String),
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("'{name}' expects {expected} argument(s), got {found}")]
    ArityError {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("assertion failed: {0}")]
    AssertionError(String),
}

impl RuntimeFault {
    pub fn class_name(&self) -> &'static str {
        match self {
            RuntimeFault::DivisionByZero => "DivisionByZero",
            RuntimeFault::TypeError(_) => "TypeError",
            RuntimeFault::IndexError { .. } => "IndexError",
            RuntimeFault::NullReference(_) => "NullReference",
            RuntimeFault::UndefinedVariable(_) => "UndefinedVariable",
            RuntimeFault::ArityError { .. } => "ArityError",
            RuntimeFault::StackOverflow(_) => "StackOverflow",
            RuntimeFault::AssertionError(_) => "AssertionError",
        }
    }
}

/// Native function exposed to every program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSpec {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
}

const fn native(name: &'static str, min_args: usize, max_args: usize) -> NativeSpec {
    NativeSpec {
        name,
        min_args,
        max_args,
    }
}

pub const NATIVES: &[NativeSpec] = &[
    native("print", 1, 1),
    native("println", 1, 1),
    native("len", 1, 1),
    native("push", 2, 2),
    native("pop", 1, 1),
    native("str", 1, 1),
    native("int", 1, 1),
    native("float", 1, 1),
    native("sqrt", 1, 1),
    native("abs", 1, 1),
    native("floor", 1, 1),
    native("pow", 2, 2),
    native("type_of", 1, 1),
    native("assert", 1, 2),
    native("gc", 0, 0),
];

pub fn native_spec(name: &str) -> Option<&'static NativeSpec> {
    NATIVES.iter().find(|spec| spec.name == name)
}
