// The semantic cube: a total function from (left type, operator, right
// type) to the result type of the operation, or None for a mismatch.
// The parser turns None into a TYPE_MISMATCH compile error.

use crate::memory::Type;
use crate::quadruples::Op;

pub fn result_type(left: &Type, op: Op, right: &Type) -> Option<Type> {
    use Type::*;
    match op {
        // Arithmetic promotes int to float; `+` also concatenates.
        Op::Add | Op::Sub | Op::Mul | Op::Div => match (left, right) {
            (Int, Int) => Some(Int),
            (Int, Float) | (Float, Int) | (Float, Float) => Some(Float),
            (Str, Str) if op == Op::Add => Some(Str),
            _ => None,
        },

        // Ordering is defined within a numeric type, never across.
        Op::Lt | Op::Le | Op::Gt | Op::Ge => match (left, right) {
            (Int, Int) | (Float, Float) => Some(Bool),
            _ => None,
        },

        // Equality between matching simple types.
        Op::Eq | Op::Ne => match (left, right) {
            (a, b) if a == b && a.is_simple() => Some(Bool),
            _ => None,
        },

        Op::And | Op::Or => match (left, right) {
            (Bool, Bool) => Some(Bool),
            _ => None,
        },

        // Assignment: same simple type, an int widening into a float
        // slot, or an object of the same class.
        Op::Assign => match (left, right) {
            (a, b) if a == b && a.is_simple() => Some(a.clone()),
            (Float, Int) => Some(Float),
            (Object(a), Object(b)) if a == b => Some(Object(a.clone())),
            _ => None,
        },

        // Statement operators never reach the cube.
        _ => None,
    }
}
