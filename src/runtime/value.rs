//==============================================
// File: runtime/value.rs
//==============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Runtime value representation
// Objective: One small Clone value type used on the operand stack, in
//            locals, registers, globals and heap objects
//==============================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::Literal;
use crate::memory::GcRef;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Reference to a non-capturing function by function-table index.
    Function(u32),
    /// Array, object, closure or pointer cell living on the heap.
    Object(GcRef),
}

impl Value {
    pub fn str(text: &str) -> Self {
        Value::Str(Arc::from(text))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Function(_) | Value::Object(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<GcRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    /// Literal form of a constant value, if it has one. Used by the constant
    /// folder to turn evaluated results back into AST literals.
    pub fn to_literal(&self) -> Option<Literal> {
        match self {
            Value::Null => Some(Literal::Null),
            Value::Bool(b) => Some(Literal::Boolean(*b)),
            Value::Int(n) => Some(Literal::Integer(*n)),
            Value::Float(n) => Some(Literal::Float(*n)),
            Value::Str(s) => Some(Literal::String(s.as_ref().into())),
            Value::Function(_) | Value::Object(_) => None,
        }
    }

    pub fn from_literal(literal: &Literal) -> Value {
        match literal {
            Literal::Integer(n) => Value::Int(*n),
            Literal::Float(n) | Literal::Quantity(n, _) => Value::Float(*n),
            Literal::String(s) => Value::str(s.as_str()),
            Literal::Boolean(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }
    }
}

/// Numbers compare by value across int/float, strings by content and heap
/// values by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{}", format_float(*n)),
            Value::Str(s) => f.write_str(s),
            Value::Function(index) => write!(f, "<fn #{index}>"),
            Value::Object(r) => write!(f, "<object {r}>"),
        }
    }
}

pub fn format_float(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

/// Serializable form of the values that can live in a constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::Str(s) => Value::str(s),
        }
    }

    pub fn from_literal(literal: &Literal) -> Constant {
        match literal {
            Literal::Integer(n) => Constant::Int(*n),
            Literal::Float(n) | Literal::Quantity(n, _) => Constant::Float(*n),
            Literal::String(s) => Constant::Str(s.to_string()),
            Literal::Boolean(b) => Constant::Bool(*b),
            Literal::Null => Constant::Null,
        }
    }

    /// Pool deduplication key. Floats compare bitwise so `0.0` and `-0.0`
    /// stay distinct.
    pub fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => f.write_str("null"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Float(n) => write!(f, "{}", format_float(*n)),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_value_kind() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("x").is_truthy());
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::str("2"));
    }

    #[test]
    fn floats_print_with_a_fraction() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
    }
}
