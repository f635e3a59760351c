//! Merging of the NodeFeature objects describing one node
//!
//! Objects in the master's own namespace come first, then the rest ordered by
//! name and namespace. Later objects win on collisions.

use std::collections::BTreeMap;

use crate::apis::{add_ns, Features, NodeFeature, FEATURE_NS};

/// Result of merging all objects of a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedFeatures {
    pub features: Features,
    pub labels: BTreeMap<String, String>,

    /// Number of objects that went into the merge
    pub count: usize,
}

impl MergedFeatures {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Order objects for merging: own namespace first, then by name, then by namespace
pub fn sort_for_merge(objects: &mut [NodeFeature], own_namespace: &str) {
    objects.sort_by(|a, b| {
        let a_ns = a.metadata.namespace.as_deref().unwrap_or_default();
        let b_ns = b.metadata.namespace.as_deref().unwrap_or_default();
        let a_name = a.metadata.name.as_deref().unwrap_or_default();
        let b_name = b.metadata.name.as_deref().unwrap_or_default();

        (b_ns == own_namespace)
            .cmp(&(a_ns == own_namespace))
            .then_with(|| a_name.cmp(b_name))
            .then_with(|| a_ns.cmp(b_ns))
    });
}

/// Merge the NodeFeature objects of one node into a single snapshot.
///
/// Zero objects give an empty snapshot with `count == 0`.
pub fn merge_node_features(mut objects: Vec<NodeFeature>, own_namespace: &str) -> MergedFeatures {
    if objects.is_empty() {
        return MergedFeatures::default();
    }

    sort_for_merge(&mut objects, own_namespace);
    let count = objects.len();

    let mut iter = objects.into_iter();
    let mut merged = match iter.next() {
        Some(first) => MergedFeatures {
            features: first.spec.features,
            labels: first.spec.labels,
            count,
        },
        None => return MergedFeatures::default(),
    };

    for object in iter {
        object.spec.features.merge_into(&mut merged.features);
        merged.labels.extend(object.spec.labels);
    }
    merged
}

/// Prefix bare keys with the default namespace.
///
/// An explicitly prefixed key wins over its bare counterpart.
pub fn qualify_keys(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut bare = Vec::new();

    for (key, value) in map {
        if key.contains('/') {
            out.insert(key, value);
        } else {
            bare.push((key, value));
        }
    }
    for (key, value) in bare {
        out.entry(add_ns(&key, FEATURE_NS)).or_insert(value);
    }
    out
}
