//==============================================
// File: runtime/ops.rs
//==============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Operator semantics shared by the VM and the constant folder
// Objective: Keep compile-time folding and run-time evaluation bit-for-bit
//            identical by routing both through these functions
//==============================================

use std::cmp::Ordering;

use super::{RuntimeFault, Value};
use crate::ast::{BinaryOp, UnaryOp};

//==============================================
// Section 1.0 - Binary operators
//==============================================

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Subtract => arithmetic(op, left, right, i64::wrapping_sub, |a, b| a - b),
        BinaryOp::Multiply => arithmetic(op, left, right, i64::wrapping_mul, |a, b| a * b),
        BinaryOp::Divide => divide(left, right),
        BinaryOp::Modulo => modulo(left, right),
        BinaryOp::Equal => Ok(Value::Bool(left == right)),
        BinaryOp::NotEqual => Ok(Value::Bool(left != right)),
        BinaryOp::Less => compare(op, left, right).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::LessEqual => {
            compare(op, left, right).map(|o| Value::Bool(o != Ordering::Greater))
        }
        BinaryOp::Greater => {
            compare(op, left, right).map(|o| Value::Bool(o == Ordering::Greater))
        }
        BinaryOp::GreaterEqual => {
            compare(op, left, right).map(|o| Value::Bool(o != Ordering::Less))
        }
        // Both operands already evaluated: yield the operand that decides.
        BinaryOp::And => Ok(if left.is_truthy() {
            right.clone()
        } else {
            left.clone()
        }),
        BinaryOp::Or => Ok(if left.is_truthy() {
            left.clone()
        } else {
            right.clone()
        }),
        BinaryOp::BitwiseAnd | BinaryOp::BitwiseOr | BinaryOp::BitwiseXor => {
            bitwise(op, left, right)
        }
        BinaryOp::LeftShift | BinaryOp::RightShift => shift(op, left, right),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Str(a), b) => Ok(Value::str(&format!("{a}{b}"))),
        (a, Value::Str(b)) => Ok(Value::str(&format!("{a}{b}"))),
        _ => arithmetic(BinaryOp::Add, left, right, i64::wrapping_add, |a, b| a + b),
    }
}

fn arithmetic(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(operand_error(op, left, right)),
        },
    }
}

fn divide(left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Int(_), Value::Int(0)) => Err(RuntimeFault::DivisionByZero),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(*b))),
        _ => arithmetic(BinaryOp::Divide, left, right, i64::wrapping_div, |a, b| a / b),
    }
}

fn modulo(left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Int(_), Value::Int(0)) => Err(RuntimeFault::DivisionByZero),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
        _ => arithmetic(BinaryOp::Modulo, left, right, i64::wrapping_rem, |a, b| a % b),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering, RuntimeFault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (left.as_float(), right.as_float()) {
            // NaN compares as neither less nor greater; every ordering test
            // other than `!=` reports false.
            (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(match op {
                BinaryOp::Less | BinaryOp::LessEqual => Ordering::Greater,
                _ => Ordering::Less,
            })),
            _ => Err(operand_error(op, left, right)),
        },
    }
}

fn bitwise(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
            BinaryOp::BitwiseAnd => a & b,
            BinaryOp::BitwiseOr => a | b,
            _ => a ^ b,
        })),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
            BinaryOp::BitwiseAnd => a & b,
            BinaryOp::BitwiseOr => a | b,
            _ => a ^ b,
        })),
        _ => Err(operand_error(op, left, right)),
    }
}

fn shift(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeFault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => {
            let amount = (*b & 63) as u32;
            Ok(Value::Int(if op == BinaryOp::LeftShift {
                a.wrapping_shl(amount)
            } else {
                a.wrapping_shr(amount)
            }))
        }
        _ => Err(operand_error(op, left, right)),
    }
}

fn operand_error(op: BinaryOp, left: &Value, right: &Value) -> RuntimeFault {
    RuntimeFault::TypeError(format!(
        "operator '{}' cannot be applied to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

//==============================================
// Section 2.0 - Unary operators
//==============================================

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeFault> {
    match (op, operand) {
        (UnaryOp::Negate, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
        (UnaryOp::Negate, Value::Float(n)) => Ok(Value::Float(-n)),
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::BitwiseNot, Value::Int(n)) => Ok(Value::Int(!n)),
        (op, value) => Err(RuntimeFault::TypeError(format!(
            "operator '{op}' cannot be applied to {}",
            value.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps() {
        let result = binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1));
        assert_eq!(result, Ok(Value::Int(i64::MIN)));
    }

    #[test]
    fn integer_division_by_zero_faults() {
        assert_eq!(
            binary(BinaryOp::Divide, &Value::Int(1), &Value::Int(0)),
            Err(RuntimeFault::DivisionByZero)
        );
        match binary(BinaryOp::Divide, &Value::Float(1.0), &Value::Int(0)) {
            Ok(Value::Float(n)) => assert!(n.is_infinite()),
            other => panic!("expected infinity, found {other:?}"),
        }
    }

    #[test]
    fn strings_concatenate_with_anything() {
        assert_eq!(
            binary(BinaryOp::Add, &Value::str("n="), &Value::Int(3)),
            Ok(Value::str("n=3"))
        );
    }

    #[test]
    fn mixed_numbers_widen() {
        assert_eq!(
            binary(BinaryOp::Multiply, &Value::Int(2), &Value::Float(1.5)),
            Ok(Value::Float(3.0))
        );
        assert_eq!(
            binary(BinaryOp::Less, &Value::Int(2), &Value::Float(2.5)),
            Ok(Value::Bool(true))
        );
    }

    #[test]
    fn nan_comparisons_are_false() {
        let nan = Value::Float(f64::NAN);
        for op in [
            BinaryOp::Less,
            BinaryOp::LessEqual,
            BinaryOp::Greater,
            BinaryOp::GreaterEqual,
        ] {
            assert_eq!(binary(op, &nan, &Value::Float(1.0)), Ok(Value::Bool(false)));
        }
    }

    #[test]
    fn mismatched_operands_are_type_errors() {
        assert!(matches!(
            binary(BinaryOp::Subtract, &Value::str("a"), &Value::Int(1)),
            Err(RuntimeFault::TypeError(_))
        ));
        assert!(matches!(
            unary(UnaryOp::Negate, &Value::Bool(true)),
            Err(RuntimeFault::TypeError(_))
        ));
    }
}
