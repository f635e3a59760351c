//! # Node feature API types
//!
//! Types shared by every part of the master:
//!
//! - **NodeFeature**: a fact object published by a worker agent for one node
//! - **NodeFeatureRule**: an ordered list of predicate → output rules
//! - **NodeFeatureGroup**: a node selector whose status lists matching nodes
//! - **Features**: the in-memory feature snapshot rules are evaluated against
//!
//! ## Naming
//!
//! ```text
//! feature.node.kubernetes.io/<name>       default namespace for outputs
//! <sub>.feature.node.kubernetes.io/<name> sub-namespaces of the default
//! nfd.node.kubernetes.io/<name>           reserved for the master's own bookkeeping
//! ```

pub mod features;
pub mod nfd;
pub mod report;
pub mod taint;

pub use features::{AttributeFeatureSet, Features, FlagFeatureSet, InstanceFeature, InstanceFeatureSet};
pub use nfd::{
    FeatureGroupNode, FeatureMatcherTerm, GroupRule, MatchAnyElem, MatchExpression,
    MatchExpressionSet, MatchOp, NodeFeature, NodeFeatureGroup, NodeFeatureGroupSpec,
    NodeFeatureGroupStatus, NodeFeatureRule, NodeFeatureRuleSpec, NodeFeatureSpec, Rule,
};
pub use report::SetLabelsRequest;
pub use taint::{Taint, TaintEffect};

/// API group of the fact, rule and group objects
pub const API_GROUP: &str = "nfd.k8s-sigs.io";

/// Default namespace for labels, annotations, extended resources and taints
pub const FEATURE_NS: &str = "feature.node.kubernetes.io";

/// Suffix identifying sub-namespaces of the default namespace
pub const FEATURE_SUB_NS_SUFFIX: &str = ".feature.node.kubernetes.io";

/// Namespace reserved for the master's own annotations and labels
pub const NFD_NS: &str = "nfd.node.kubernetes.io";

/// Label on NodeFeature objects naming the node they describe
pub const NODE_NAME_LABEL: &str = "nfd.node.kubernetes.io/node-name";

/// Domain of the synthetic feature holding outputs of earlier rules
pub const RULE_BACKREF_DOMAIN: &str = "rule";

/// Feature (within [`RULE_BACKREF_DOMAIN`]) holding outputs of earlier rules
pub const RULE_BACKREF_FEATURE: &str = "matched";

/// Split a qualified name into its namespace and base name.
///
/// Names without a `/` have an empty namespace.
pub fn split_ns(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((ns, base)) => (ns, base),
        None => ("", name),
    }
}

/// Prefix `name` with `ns` unless it already carries a namespace
pub fn add_ns(name: &str, ns: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("{}/{}", ns, name)
    }
}

/// Whether `ns` is the default feature namespace or one of its sub-namespaces
pub fn is_feature_ns(ns: &str) -> bool {
    ns == FEATURE_NS || ns.ends_with(FEATURE_SUB_NS_SUFFIX)
}
