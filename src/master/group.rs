//! Group membership evaluation

use tracing::{debug, error};

use crate::apis::{Features, GroupRule, RULE_BACKREF_DOMAIN, RULE_BACKREF_FEATURE};
use crate::metrics::MasterMetrics;
use crate::rules;

/// Whether a node with `features` belongs to the group defined by `rules`.
///
/// Every rule runs in order and the vars of a matched rule are visible to the
/// rules after it, as with node rules. The node is a member when any rule
/// matches. Broken rules are counted and skipped.
pub fn node_in_group(
    group: &str,
    node: &str,
    rules: &[GroupRule],
    features: &Features,
    metrics: &MasterMetrics,
) -> bool {
    let mut features = features.clone();
    let mut member = false;

    for rule in rules {
        match rules::execute_group_rule(rule, &features) {
            Ok(Some(output)) => {
                debug!("Group rule {}/{} matched node {}", group, rule.name, node);
                for e in &output.unresolved {
                    metrics.rule_processing_errors.inc();
                    error!("Group rule {}/{} on node {}: {}", group, rule.name, node, e);
                }
                features.insert_attribute_features(
                    RULE_BACKREF_DOMAIN,
                    RULE_BACKREF_FEATURE,
                    &output.vars,
                );
                member = true;
            }
            Ok(None) => {}
            Err(e) => {
                metrics.rule_processing_errors.inc();
                error!(
                    "Failed to process group rule {}/{} for node {}: {}",
                    group, rule.name, node, e
                );
            }
        }
    }
    member
}
