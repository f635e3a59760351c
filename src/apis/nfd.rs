//! Custom resources consumed (and, for groups, updated) by the master

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::features::Features;
use super::taint::Taint;

// ============================================================================
// NodeFeature (fact object)
// ============================================================================

/// Features and labels published for one node.
///
/// Several objects may describe the same node; all objects carrying the same
/// `nfd.node.kubernetes.io/node-name` label are merged.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nfd.k8s-sigs.io",
    version = "v1alpha1",
    kind = "NodeFeature",
    namespaced
)]
pub struct NodeFeatureSpec {
    /// Discovered features
    #[serde(default)]
    pub features: Features,

    /// Labels requested directly by the publisher
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// ============================================================================
// NodeFeatureRule (rule object)
// ============================================================================

/// An ordered list of rules
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nfd.k8s-sigs.io",
    version = "v1alpha1",
    kind = "NodeFeatureRule",
    shortname = "nfr"
)]
pub struct NodeFeatureRuleSpec {
    pub rules: Vec<Rule>,
}

/// A single predicate → output rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Outputs visible only to later rules, never published
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_resources: BTreeMap<String, String>,

    /// All terms must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_features: Vec<FeatureMatcherTerm>,

    /// At least one element must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_any: Vec<MatchAnyElem>,
}

/// One `matchAny` alternative
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnyElem {
    pub match_features: Vec<FeatureMatcherTerm>,
}

/// Expressions evaluated against a single `<domain>.<feature>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMatcherTerm {
    pub feature: String,

    #[serde(default)]
    pub match_expressions: MatchExpressionSet,
}

/// Element name → expression
pub type MatchExpressionSet = BTreeMap<String, MatchExpression>;

/// An operator and its operands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MatchExpression {
    pub op: MatchOp,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<String>,
}

/// Match operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MatchOp {
    In,
    NotIn,
    InRegexp,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
    GtLt,
    IsTrue,
    IsFalse,
}

impl MatchExpression {
    pub fn new(op: MatchOp, value: &[&str]) -> Self {
        Self {
            op,
            value: value.iter().map(|v| v.to_string()).collect(),
        }
    }
}

// ============================================================================
// NodeFeatureGroup (group object)
// ============================================================================

/// A set of rules selecting nodes; a node belongs to the group when any rule matches
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nfd.k8s-sigs.io",
    version = "v1alpha1",
    kind = "NodeFeatureGroup",
    namespaced,
    status = "NodeFeatureGroupStatus",
    shortname = "nfg"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureGroupSpec {
    #[serde(rename = "featureGroupRules")]
    pub rules: Vec<GroupRule>,
}

/// A rule used for group membership (no published outputs)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupRule {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_features: Vec<FeatureMatcherTerm>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_any: Vec<MatchAnyElem>,
}

/// Observed group membership
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeFeatureGroupStatus {
    #[serde(default)]
    pub nodes: Vec<FeatureGroupNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FeatureGroupNode {
    pub name: String,
}
