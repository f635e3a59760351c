//! # Rule evaluation
//!
//! Evaluates a single rule against a feature snapshot. Evaluation is pure:
//! it never touches the snapshot, and callers decide what to feed back.
//!
//! ```text
//!   matchAny (OR) ──► matchFeatures (AND) ──► outputs
//!        │                   │                  │
//!     no match            no match        @dynamic values resolved
//!        ▼                   ▼            from attribute features
//!      None                None
//! ```

pub mod expression;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::apis::{FeatureMatcherTerm, Features, GroupRule, MatchAnyElem, MatchOp, Rule, Taint};

/// Errors from evaluating a rule
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("invalid expression for element '{element}' ({op:?}): {reason}")]
    InvalidExpression {
        element: String,
        op: MatchOp,
        reason: String,
    },

    #[error("invalid regexp '{0}': {1}")]
    InvalidRegexp(String, String),

    #[error("not a number: '{0}'")]
    NotANumber(String),

    #[error("flag feature '{feature}' only supports Exists and DoesNotExist, got {op:?}")]
    UnsupportedFlagOp { feature: String, op: MatchOp },

    #[error("invalid feature name '{0}': expected <domain>.<feature>")]
    InvalidFeatureName(String),

    #[error("cannot resolve dynamic value '{0}': {1}")]
    DynamicValue(String, String),
}

/// Outputs of a matched rule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutput {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub extended_resources: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub vars: BTreeMap<String, String>,

    /// Dynamic values that could not be resolved; the affected items were dropped
    pub unresolved: Vec<RuleError>,
}

/// Evaluate `rule` against `features`.
///
/// Returns `Ok(None)` when the predicate does not match. An `Err` means the
/// predicate itself is broken and no output must be applied.
pub fn execute(rule: &Rule, features: &Features) -> Result<Option<RuleOutput>, RuleError> {
    if !matches(&rule.match_any, &rule.match_features, features)? {
        return Ok(None);
    }

    let mut output = RuleOutput {
        taints: rule.taints.clone(),
        ..Default::default()
    };
    output.labels = resolve_map(&rule.labels, features, &mut output.unresolved);
    output.annotations = resolve_map(&rule.annotations, features, &mut output.unresolved);
    output.extended_resources =
        resolve_map(&rule.extended_resources, features, &mut output.unresolved);
    output.vars = resolve_map(&rule.vars, features, &mut output.unresolved);

    Ok(Some(output))
}

/// Evaluate a group rule; on match only `vars` and `unresolved` are set
pub fn execute_group_rule(rule: &GroupRule, features: &Features) -> Result<Option<RuleOutput>, RuleError> {
    if !matches(&rule.match_any, &rule.match_features, features)? {
        return Ok(None);
    }
    let mut unresolved = Vec::new();
    let vars = resolve_map(&rule.vars, features, &mut unresolved);
    Ok(Some(RuleOutput {
        vars,
        unresolved,
        ..Default::default()
    }))
}

fn matches(
    match_any: &[MatchAnyElem],
    match_features: &[FeatureMatcherTerm],
    features: &Features,
) -> Result<bool, RuleError> {
    if !match_any.is_empty() {
        let mut any = false;
        for elem in match_any {
            if match_all(&elem.match_features, features)? {
                any = true;
                break;
            }
        }
        if !any {
            return Ok(false);
        }
    }
    match_all(match_features, features)
}

fn match_all(terms: &[FeatureMatcherTerm], features: &Features) -> Result<bool, RuleError> {
    for term in terms {
        if !match_term(term, features)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_term(term: &FeatureMatcherTerm, features: &Features) -> Result<bool, RuleError> {
    if !term.feature.contains('.') {
        return Err(RuleError::InvalidFeatureName(term.feature.clone()));
    }

    if let Some(set) = features.flags.get(&term.feature) {
        return expression::match_flags(&term.feature, set, &term.match_expressions);
    }
    if let Some(set) = features.attributes.get(&term.feature) {
        return expression::match_attributes(set, &term.match_expressions);
    }
    if let Some(set) = features.instances.get(&term.feature) {
        return expression::match_instances(set, &term.match_expressions);
    }

    // Unknown feature: evaluate against an empty set
    expression::match_attributes(&Default::default(), &term.match_expressions)
}

fn resolve_map(
    values: &BTreeMap<String, String>,
    features: &Features,
    unresolved: &mut Vec<RuleError>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in values {
        match resolve_value(value, features) {
            Ok(v) => {
                out.insert(key.clone(), v);
            }
            Err(e) => unresolved.push(e),
        }
    }
    out
}

/// Resolve `@<domain>.<feature>.<element>` against attribute features.
/// Any other value is returned as-is.
pub fn resolve_value(value: &str, features: &Features) -> Result<String, RuleError> {
    let Some(reference) = value.strip_prefix('@') else {
        return Ok(value.to_string());
    };

    let mut parts = reference.splitn(3, '.');
    let (Some(domain), Some(feature), Some(element)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(RuleError::DynamicValue(
            value.to_string(),
            "expected @<domain>.<feature>.<element>".to_string(),
        ));
    };

    let feature_name = format!("{}.{}", domain, feature);
    let set = features.attributes.get(&feature_name).ok_or_else(|| {
        RuleError::DynamicValue(
            value.to_string(),
            format!("attribute feature '{}' not found", feature_name),
        )
    })?;
    set.elements.get(element).cloned().ok_or_else(|| {
        RuleError::DynamicValue(
            value.to_string(),
            format!("element '{}' not found in '{}'", element, feature_name),
        )
    })
}
