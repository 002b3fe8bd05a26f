use std::cmp::Ordering;

use serde_json::{json, Value};

use stepflow_core::definition::{ConditionExpr, ConditionOperator, SwitchStep};

use crate::resolver::{resolve, PathLookup};

/// Both operands after `${...}` resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCondition {
    pub operator: ConditionOperator,
    pub left: Value,
    pub right: Value,
}

impl ResolvedCondition {
    pub fn resolve(expr: &ConditionExpr, ctx: &impl PathLookup) -> Self {
        Self {
            operator: expr.operator,
            left: resolve(&expr.left, ctx),
            right: resolve(&expr.right, ctx),
        }
    }

    pub fn holds(&self) -> bool {
        compare(self.operator, &self.left, &self.right)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "operator": self.operator,
            "left": self.left,
            "right": self.right,
        })
    }
}

/// Evaluate a condition against the context.
pub fn evaluate(expr: &ConditionExpr, ctx: &impl PathLookup) -> bool {
    ResolvedCondition::resolve(expr, ctx).holds()
}

/// Apply `operator` to two resolved operands.
///
/// Numbers compare numerically regardless of integer/float representation.
/// Ordering operators also accept two strings (lexicographic); any other
/// pairing is false. `in` is false unless `right` is an array.
pub fn compare(operator: ConditionOperator, left: &Value, right: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => values_equal(left, right),
        ConditionOperator::NotEquals => !values_equal(left, right),
        ConditionOperator::GreaterThan => ordering(left, right) == Some(Ordering::Greater),
        ConditionOperator::LessThan => ordering(left, right) == Some(Ordering::Less),
        ConditionOperator::In => match right {
            Value::Array(items) => items.iter().any(|item| values_equal(left, item)),
            _ => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Id of the first case whose condition holds.
pub fn first_matching_case<'a>(switch: &'a SwitchStep, ctx: &impl PathLookup) -> Option<&'a str> {
    switch
        .cases
        .iter()
        .find(|case| evaluate(&case.condition, ctx))
        .map(|case| case.case_id.as_str())
}
