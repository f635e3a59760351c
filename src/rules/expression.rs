//! Match expression evaluation
//!
//! An expression is evaluated against a single element of a feature set.
//! An absent element (`None`) is distinct from one holding an empty value.

use regex::Regex;

use super::RuleError;
use crate::apis::{
    AttributeFeatureSet, FlagFeatureSet, InstanceFeatureSet, MatchExpression, MatchExpressionSet,
    MatchOp,
};

/// Check operand arity and syntax without evaluating anything
pub fn validate(element: &str, expr: &MatchExpression) -> Result<(), RuleError> {
    let invalid = |reason: &str| RuleError::InvalidExpression {
        element: element.to_string(),
        op: expr.op,
        reason: reason.to_string(),
    };

    match expr.op {
        MatchOp::In | MatchOp::NotIn => {
            if expr.value.is_empty() {
                return Err(invalid("expected at least one value"));
            }
        }
        MatchOp::InRegexp => {
            if expr.value.is_empty() {
                return Err(invalid("expected at least one value"));
            }
            for pattern in &expr.value {
                Regex::new(pattern)
                    .map_err(|e| RuleError::InvalidRegexp(pattern.clone(), e.to_string()))?;
            }
        }
        MatchOp::Exists | MatchOp::DoesNotExist | MatchOp::IsTrue | MatchOp::IsFalse => {
            if !expr.value.is_empty() {
                return Err(invalid("expected no values"));
            }
        }
        MatchOp::Gt | MatchOp::Lt => {
            if expr.value.len() != 1 {
                return Err(invalid("expected exactly one value"));
            }
            parse_int(&expr.value[0])?;
        }
        MatchOp::GtLt => {
            if expr.value.len() != 2 {
                return Err(invalid("expected exactly two values"));
            }
            let low = parse_int(&expr.value[0])?;
            let high = parse_int(&expr.value[1])?;
            if low >= high {
                return Err(invalid("lower bound must be less than upper bound"));
            }
        }
    }
    Ok(())
}

/// Evaluate one expression against an element value (`None` when absent)
pub fn evaluate(
    element: &str,
    expr: &MatchExpression,
    value: Option<&str>,
) -> Result<bool, RuleError> {
    validate(element, expr)?;

    let matched = match (expr.op, value) {
        (MatchOp::Exists, v) => v.is_some(),
        (MatchOp::DoesNotExist, v) => v.is_none(),
        (_, None) => false,
        (MatchOp::In, Some(v)) => expr.value.iter().any(|e| e == v),
        (MatchOp::NotIn, Some(v)) => !expr.value.iter().any(|e| e == v),
        (MatchOp::InRegexp, Some(v)) => {
            let mut any = false;
            for pattern in &expr.value {
                let re = Regex::new(pattern)
                    .map_err(|e| RuleError::InvalidRegexp(pattern.clone(), e.to_string()))?;
                if re.is_match(v) {
                    any = true;
                    break;
                }
            }
            any
        }
        (MatchOp::Gt, Some(v)) => parse_int(v)? > parse_int(&expr.value[0])?,
        (MatchOp::Lt, Some(v)) => parse_int(v)? < parse_int(&expr.value[0])?,
        (MatchOp::GtLt, Some(v)) => {
            let n = parse_int(v)?;
            n > parse_int(&expr.value[0])? && n < parse_int(&expr.value[1])?
        }
        (MatchOp::IsTrue, Some(v)) => v == "true",
        (MatchOp::IsFalse, Some(v)) => v == "false",
    };
    Ok(matched)
}

fn parse_int(s: &str) -> Result<i64, RuleError> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| RuleError::NotANumber(s.to_string()))
}

// ============================================================================
// Feature set matchers
// ============================================================================

/// Flags only know about presence
pub fn match_flags(
    feature: &str,
    set: &FlagFeatureSet,
    exprs: &MatchExpressionSet,
) -> Result<bool, RuleError> {
    for (element, expr) in exprs {
        if !matches!(expr.op, MatchOp::Exists | MatchOp::DoesNotExist) {
            return Err(RuleError::UnsupportedFlagOp {
                feature: feature.to_string(),
                op: expr.op,
            });
        }
        let present = set.elements.contains(element).then_some("");
        if !evaluate(element, expr, present)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn match_attributes(set: &AttributeFeatureSet, exprs: &MatchExpressionSet) -> Result<bool, RuleError> {
    for (element, expr) in exprs {
        let value = set.elements.get(element).map(String::as_str);
        if !evaluate(element, expr, value)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Matches when at least one instance satisfies every expression
pub fn match_instances(set: &InstanceFeatureSet, exprs: &MatchExpressionSet) -> Result<bool, RuleError> {
    // Validate up front so an empty instance list still reports bad expressions
    for (element, expr) in exprs {
        validate(element, expr)?;
    }

    for instance in &set.elements {
        let mut all = true;
        for (element, expr) in exprs {
            let value = instance.attributes.get(element).map(String::as_str);
            if !evaluate(element, expr, value)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}
