//! Feature snapshot - the merged view of everything known about one node
//!
//! Features are addressed as `<domain>.<feature>` (e.g. `cpu.cpuid`,
//! `kernel.version`) and come in three flavours:
//! - **flags**: a set of element names that are present
//! - **attributes**: element name → string value
//! - **instances**: a list of attribute maps (e.g. one per PCI device)

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All features of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Features {
    /// Flag features indexed by `<domain>.<feature>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, FlagFeatureSet>,

    /// Attribute features indexed by `<domain>.<feature>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeFeatureSet>,

    /// Instance features indexed by `<domain>.<feature>`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, InstanceFeatureSet>,
}

/// Set of present flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FlagFeatureSet {
    #[serde(default)]
    pub elements: BTreeSet<String>,
}

/// Named string values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttributeFeatureSet {
    #[serde(default)]
    pub elements: BTreeMap<String, String>,
}

/// List of attribute sets, one per instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceFeatureSet {
    #[serde(default)]
    pub elements: Vec<InstanceFeature>,
}

/// One instance of an instance feature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceFeature {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.attributes.is_empty() && self.instances.is_empty()
    }

    /// Merge `self` into `dst`.
    ///
    /// On collision `self` wins: flags are unioned, attribute elements are
    /// overwritten key by key and instance lists are appended (no dedup).
    pub fn merge_into(&self, dst: &mut Features) {
        for (name, set) in &self.flags {
            dst.flags
                .entry(name.clone())
                .or_default()
                .elements
                .extend(set.elements.iter().cloned());
        }

        for (name, set) in &self.attributes {
            let target = dst.attributes.entry(name.clone()).or_default();
            for (k, v) in &set.elements {
                target.elements.insert(k.clone(), v.clone());
            }
        }

        for (name, set) in &self.instances {
            dst.instances
                .entry(name.clone())
                .or_default()
                .elements
                .extend(set.elements.iter().cloned());
        }
    }

    /// Insert (overwriting) attribute elements under `<domain>.<feature>`
    pub fn insert_attribute_features(
        &mut self,
        domain: &str,
        feature: &str,
        values: &BTreeMap<String, String>,
    ) {
        if values.is_empty() {
            return;
        }
        let key = format!("{}.{}", domain, feature);
        let set = self.attributes.entry(key).or_default();
        for (k, v) in values {
            set.elements.insert(k.clone(), v.clone());
        }
    }

    /// Look up a single attribute element
    pub fn attribute(&self, feature: &str, element: &str) -> Option<&str> {
        self.attributes
            .get(feature)
            .and_then(|set| set.elements.get(element))
            .map(String::as_str)
    }

    // =========================================================================
    // Builders (mostly used by tests and the dry-run command)
    // =========================================================================

    pub fn with_flag(mut self, feature: &str, element: &str) -> Self {
        self.flags
            .entry(feature.to_string())
            .or_default()
            .elements
            .insert(element.to_string());
        self
    }

    pub fn with_attribute(mut self, feature: &str, element: &str, value: &str) -> Self {
        self.attributes
            .entry(feature.to_string())
            .or_default()
            .elements
            .insert(element.to_string(), value.to_string());
        self
    }

    pub fn with_instance(mut self, feature: &str, attributes: &[(&str, &str)]) -> Self {
        let instance = InstanceFeature {
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.instances
            .entry(feature.to_string())
            .or_default()
            .elements
            .push(instance);
        self
    }
}
