//! Node reconciler: from rules and features to the desired node state
//!
//! ```text
//!  rules (sorted) ──► execute ──► outputs ──┐
//!       ▲                           │       │
//!       └── rule.matched feedback ◄─┘       ▼
//!                                    qualify names
//!                                          │
//!  direct labels ─────────────────────────►┤ (authoritative)
//!                                          ▼
//!           namespace policy ─► whitelist ─► promotion ─► format
//!                                          │
//!                                          ▼
//!                                    DesiredState
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::apis::{
    add_ns, Features, NodeFeatureRule, Taint, FEATURE_NS, RULE_BACKREF_DOMAIN, RULE_BACKREF_FEATURE,
};
use crate::metrics::MasterMetrics;
use crate::rules;

use super::merge::qualify_keys;
use super::validate::{
    validate_annotation_value, validate_extended_resource_value, validate_label_value,
    validate_qualified_name, validate_taint, LabelPolicy, ValidationError,
};
use super::DesiredState;

/// Raw, unfiltered outputs of all matching rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutputs {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub extended_resources: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

/// Computes the desired state of one node
pub struct NodeReconciler<'a> {
    policy: &'a LabelPolicy,
    metrics: &'a MasterMetrics,
}

impl<'a> NodeReconciler<'a> {
    pub fn new(policy: &'a LabelPolicy, metrics: &'a MasterMetrics) -> Self {
        Self { policy, metrics }
    }

    /// Run every step up to (not including) applying the result
    pub fn desired_state(
        &self,
        node: &str,
        direct_labels: &BTreeMap<String, String>,
        rule_objects: &[NodeFeatureRule],
        features: &Features,
    ) -> DesiredState {
        let outputs = self.process_rules(node, rule_objects, features);

        let (mut labels, annotations, mut extended_resources) = if self.policy.auto_default_ns {
            (
                qualify_keys(outputs.labels),
                qualify_keys(outputs.annotations),
                qualify_keys(outputs.extended_resources),
            )
        } else {
            (outputs.labels, outputs.annotations, outputs.extended_resources)
        };

        let direct = if self.policy.auto_default_ns {
            qualify_keys(direct_labels.clone())
        } else {
            direct_labels.clone()
        };
        labels.extend(direct);

        let mut state = DesiredState::default();
        self.filter_labels(node, labels, &mut state.labels, &mut extended_resources);
        state.annotations = self.filter_annotations(node, annotations);
        state.extended_resources = self.filter_extended_resources(node, extended_resources);
        state.taints = self.filter_taints(node, outputs.taints);
        state
    }

    /// Evaluate all rules in order, feeding labels and vars of each matched
    /// rule back into the snapshot before the next one runs
    pub fn process_rules(
        &self,
        node: &str,
        rule_objects: &[NodeFeatureRule],
        features: &Features,
    ) -> RuleOutputs {
        let mut features = features.clone();
        let mut outputs = RuleOutputs::default();

        let mut ordered: Vec<&NodeFeatureRule> = rule_objects.iter().collect();
        ordered.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        for object in ordered {
            let object_name = object.metadata.name.as_deref().unwrap_or_default();
            let started = Instant::now();

            for rule in &object.spec.rules {
                let output = match rules::execute(rule, &features) {
                    Ok(Some(output)) => output,
                    Ok(None) => {
                        debug!("Rule {}/{} did not match node {}", object_name, rule.name, node);
                        continue;
                    }
                    Err(e) => {
                        self.metrics.rule_processing_errors.inc();
                        error!(
                            "Failed to process rule {}/{} for node {}: {}",
                            object_name, rule.name, node, e
                        );
                        continue;
                    }
                };

                for e in &output.unresolved {
                    self.metrics.rule_processing_errors.inc();
                    error!(
                        "Rule {}/{} on node {}: {}",
                        object_name, rule.name, node, e
                    );
                }
                debug!("Rule {}/{} matched node {}", object_name, rule.name, node);

                features.insert_attribute_features(
                    RULE_BACKREF_DOMAIN,
                    RULE_BACKREF_FEATURE,
                    &output.labels,
                );
                features.insert_attribute_features(
                    RULE_BACKREF_DOMAIN,
                    RULE_BACKREF_FEATURE,
                    &output.vars,
                );

                outputs.labels.extend(output.labels);
                outputs.annotations.extend(output.annotations);
                outputs.extended_resources.extend(output.extended_resources);
                outputs.taints.extend(output.taints);
            }

            self.metrics
                .observe_rule_processing(object_name, node, started.elapsed());
        }

        outputs
    }

    fn reject(&self, kind: &str, node: &str, name: &str, reason: &ValidationError) {
        warn!("Ignoring {} {} on node {}: {}", kind, name, node, reason);
    }

    fn filter_labels(
        &self,
        node: &str,
        labels: BTreeMap<String, String>,
        out: &mut BTreeMap<String, String>,
        extended_resources: &mut BTreeMap<String, String>,
    ) {
        for (name, value) in labels {
            let checked = self
                .policy
                .check_namespace(&name)
                .and_then(|_| self.policy.check_whitelist(&name));
            if let Err(e) = checked {
                self.metrics.labels_rejected.inc();
                self.reject("label", node, &name, &e);
                continue;
            }

            if self.policy.is_resource_label(&name) {
                match validate_extended_resource_value(&value) {
                    Ok(_) => {
                        extended_resources.insert(name, value);
                    }
                    Err(e) => {
                        self.metrics.extended_resources_rejected.inc();
                        self.reject("extended resource", node, &name, &e);
                    }
                }
                continue;
            }

            match validate_qualified_name(&name).and_then(|_| validate_label_value(&value)) {
                Ok(()) => {
                    out.insert(name, value);
                }
                Err(e) => {
                    self.metrics.labels_rejected.inc();
                    self.reject("label", node, &name, &e);
                }
            }
        }
    }

    fn filter_annotations(
        &self,
        node: &str,
        annotations: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (name, value) in annotations {
            let checked = self
                .policy
                .check_namespace(&name)
                .and_then(|_| validate_qualified_name(&name))
                .and_then(|_| validate_annotation_value(&value));
            match checked {
                Ok(()) => {
                    out.insert(name, value);
                }
                Err(e) => {
                    self.metrics.annotations_rejected.inc();
                    self.reject("annotation", node, &name, &e);
                }
            }
        }
        out
    }

    fn filter_extended_resources(
        &self,
        node: &str,
        extended_resources: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (name, value) in extended_resources {
            let checked = self
                .policy
                .check_namespace(&name)
                .and_then(|_| validate_qualified_name(&name))
                .and_then(|_| validate_extended_resource_value(&value));
            match checked {
                Ok(n) => {
                    out.insert(name, n.to_string());
                }
                Err(e) => {
                    self.metrics.extended_resources_rejected.inc();
                    self.reject("extended resource", node, &name, &e);
                }
            }
        }
        out
    }

    fn filter_taints(&self, node: &str, taints: Vec<Taint>) -> Vec<Taint> {
        if !self.policy.enable_taints {
            if !taints.is_empty() {
                debug!("Taints disabled, ignoring {} taints for node {}", taints.len(), node);
            }
            return Vec::new();
        }

        let mut out: Vec<Taint> = Vec::new();
        for mut taint in taints {
            if self.policy.auto_default_ns {
                taint.key = add_ns(&taint.key, FEATURE_NS);
            }
            if let Err(e) = validate_taint(&taint) {
                self.metrics.taints_rejected.inc();
                self.reject("taint", node, &taint.to_string(), &e);
                continue;
            }
            match out.iter_mut().find(|t| t.matches(&taint)) {
                Some(existing) => *existing = taint,
                None => out.push(taint),
            }
        }
        out
    }
}
