//! # Patch engine
//!
//! Computes the minimal set of operations that turns the live node into the
//! desired one, using the tracking annotations as the record of what this
//! master instance applied before.
//!
//! ```text
//!  tracked keys ─┐
//!  live map ─────┼──► create_patches ──► [remove…, add…, replace…]
//!  desired map ──┘
//! ```
//!
//! Only keys that were tracked are ever removed, so labels owned by other
//! parties are left alone.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::apis::{add_ns, split_ns, Taint, FEATURE_NS, NFD_NS};

use super::DesiredState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// Map on the node object a patch applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchPath {
    Labels,
    Annotations,
    Capacity,
    Allocatable,
}

impl PatchPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchPath::Labels => "/metadata/labels",
            PatchPath::Annotations => "/metadata/annotations",
            PatchPath::Capacity => "/status/capacity",
            PatchPath::Allocatable => "/status/allocatable",
        }
    }
}

/// A single JSON-patch style operation on one key of one map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPatch {
    pub op: PatchOp,
    pub path: PatchPath,
    pub key: String,
    pub value: Option<String>,
}

impl JsonPatch {
    pub fn add(path: PatchPath, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn replace(path: PatchPath, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove(path: PatchPath, key: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            key: key.into(),
            value: None,
        }
    }

    /// RFC 6901 pointer to the patched key
    pub fn pointer(&self) -> String {
        let escaped = self.key.replace('~', "~0").replace('/', "~1");
        format!("{}/{}", self.path.as_str(), escaped)
    }
}

impl fmt::Display for JsonPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{:?} {}={}", self.op, self.pointer(), v),
            None => write!(f, "{:?} {}", self.op, self.pointer()),
        }
    }
}

// ============================================================================
// Diffing
// ============================================================================

/// Diff `desired` against `current`.
///
/// Keys in `remove_candidates` that exist in `current` but not in `desired`
/// are removed. Removals come first, then additions and replacements in key
/// order.
pub fn create_patches<'a>(
    remove_candidates: impl IntoIterator<Item = &'a String>,
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    path: PatchPath,
) -> Vec<JsonPatch> {
    let mut patches = Vec::new();

    for key in remove_candidates {
        if current.contains_key(key) && !desired.contains_key(key) {
            patches.push(JsonPatch::remove(path, key.clone()));
        }
    }

    for (key, value) in desired {
        match current.get(key) {
            None => patches.push(JsonPatch::add(path, key.clone(), value.clone())),
            Some(old) if old != value => {
                patches.push(JsonPatch::replace(path, key.clone(), value.clone()))
            }
            Some(_) => {}
        }
    }

    patches
}

/// Status patches for extended resources; allocatable mirrors capacity
pub fn extended_resource_patches(
    tracked: &[String],
    capacity: &BTreeMap<String, String>,
    allocatable: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Vec<JsonPatch> {
    let mut patches = create_patches(tracked, capacity, desired, PatchPath::Capacity);
    patches.extend(create_patches(tracked, allocatable, desired, PatchPath::Allocatable));
    patches
}

/// New taint list for the node, or `None` if nothing changes.
///
/// Previously managed taints that are no longer desired are removed; desired
/// taints replace any live taint with the same key and effect.
pub fn taint_update(live: &[Taint], old_managed: &[Taint], desired: &[Taint]) -> Option<Vec<Taint>> {
    let mut result: Vec<Taint> = live
        .iter()
        .filter(|t| {
            let was_managed = old_managed.iter().any(|o| o.matches(t));
            let still_desired = desired.iter().any(|d| d.matches(t));
            !was_managed || still_desired
        })
        .cloned()
        .collect();

    for taint in desired {
        match result.iter_mut().find(|t| t.matches(taint)) {
            Some(existing) => *existing = taint.clone(),
            None => result.push(taint.clone()),
        }
    }

    if result == live {
        None
    } else {
        Some(result)
    }
}

// ============================================================================
// Tracking annotations
// ============================================================================

/// What a previous reconciliation applied, as read back from the node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedState {
    pub labels: Vec<String>,
    pub annotations: Vec<String>,
    pub extended_resources: Vec<String>,
    pub taints: Vec<Taint>,
}

/// Names and (de)serialisation of the tracking annotations of one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingAnnotations {
    instance: Option<String>,
}

impl TrackingAnnotations {
    pub fn new(instance: Option<&str>) -> Self {
        Self {
            instance: instance.filter(|i| !i.is_empty()).map(str::to_string),
        }
    }

    fn name(&self, suffix: &str) -> String {
        match &self.instance {
            Some(instance) => format!("{}/{}.{}", NFD_NS, instance, suffix),
            None => format!("{}/{}", NFD_NS, suffix),
        }
    }

    pub fn feature_labels(&self) -> String {
        self.name("feature-labels")
    }

    pub fn feature_annotations(&self) -> String {
        self.name("feature-annotations")
    }

    pub fn extended_resources(&self) -> String {
        self.name("extended-resources")
    }

    pub fn taints(&self) -> String {
        self.name("taints")
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.feature_labels(),
            self.feature_annotations(),
            self.extended_resources(),
            self.taints(),
        ]
    }

    /// Read the tracked state back from the node annotations
    pub fn read(&self, annotations: &BTreeMap<String, String>) -> TrackedState {
        let names = |key: String| -> Vec<String> {
            annotations
                .get(&key)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(|n| add_ns(n, FEATURE_NS))
                        .collect()
                })
                .unwrap_or_default()
        };

        let taints = annotations
            .get(&self.taints())
            .map(|v| match Taint::parse_list(v) {
                Ok(taints) => taints,
                Err(e) => {
                    tracing::warn!("Ignoring malformed taints annotation '{}': {}", v, e);
                    Vec::new()
                }
            })
            .unwrap_or_default();

        TrackedState {
            labels: names(self.feature_labels()),
            annotations: names(self.feature_annotations()),
            extended_resources: names(self.extended_resources()),
            taints,
        }
    }

    /// Tracking annotations describing `desired`; empty lists are omitted
    pub fn render(&self, desired: &DesiredState) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();

        let mut put = |key: String, value: String| {
            if !value.is_empty() {
                out.insert(key, value);
            }
        };
        put(self.feature_labels(), join_names(desired.labels.keys()));
        put(self.feature_annotations(), join_names(desired.annotations.keys()));
        put(
            self.extended_resources(),
            join_names(desired.extended_resources.keys()),
        );
        put(
            self.taints(),
            desired
                .taints
                .iter()
                .map(Taint::to_string)
                .collect::<Vec<_>>()
                .join(","),
        );
        out
    }
}

/// Comma-join sorted names, dropping the default namespace prefix
fn join_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let mut names: Vec<&str> = names
        .map(|n| match split_ns(n) {
            (FEATURE_NS, base) => base,
            _ => n.as_str(),
        })
        .collect();
    names.sort_unstable();
    names.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::TaintEffect;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_patches_minimal() {
        let current = map(&[("A", "1"), ("B", "1")]);
        let desired = map(&[("B", "1"), ("C", "1")]);

        let patches = create_patches(&keys(&["A", "B"]), &current, &desired, PatchPath::Labels);

        assert_eq!(
            patches,
            vec![
                JsonPatch::remove(PatchPath::Labels, "A"),
                JsonPatch::add(PatchPath::Labels, "C", "1"),
            ]
        );
    }

    #[test]
    fn test_create_patches_replace_changed_value() {
        let current = map(&[("A", "1")]);
        let desired = map(&[("A", "2")]);
        let patches = create_patches(&keys(&["A"]), &current, &desired, PatchPath::Labels);
        assert_eq!(patches, vec![JsonPatch::replace(PatchPath::Labels, "A", "2")]);
    }

    #[test]
    fn test_untracked_keys_are_never_removed() {
        let current = map(&[("kubernetes.io/hostname", "n1")]);
        let patches = create_patches(&keys(&[]), &current, &BTreeMap::new(), PatchPath::Labels);
        assert!(patches.is_empty());
    }

    #[test]
    fn test_unchanged_state_is_noop() {
        let current = map(&[("A", "1")]);
        assert!(create_patches(&keys(&["A"]), &current, &current, PatchPath::Labels).is_empty());
    }

    #[test]
    fn test_extended_resource_patches_are_paired() {
        let desired = map(&[("vendor/widgets", "3")]);
        let patches =
            extended_resource_patches(&[], &BTreeMap::new(), &BTreeMap::new(), &desired);
        assert_eq!(
            patches,
            vec![
                JsonPatch::add(PatchPath::Capacity, "vendor/widgets", "3"),
                JsonPatch::add(PatchPath::Allocatable, "vendor/widgets", "3"),
            ]
        );
    }

    #[test]
    fn test_pointer_escaping() {
        let patch = JsonPatch::add(PatchPath::Labels, "feature.node.kubernetes.io/a~b", "x");
        assert_eq!(
            patch.pointer(),
            "/metadata/labels/feature.node.kubernetes.io~1a~0b"
        );
    }

    #[test]
    fn test_taint_update() {
        let foreign = Taint::new("example.com/other", "", TaintEffect::NoSchedule);
        let old = Taint::new("feature.node.kubernetes.io/gpu", "true", TaintEffect::NoSchedule);
        let new = Taint::new("feature.node.kubernetes.io/fpga", "", TaintEffect::NoExecute);

        let live = vec![foreign.clone(), old.clone()];
        let result = taint_update(&live, &[old.clone()], &[new.clone()]).unwrap();
        assert_eq!(result, vec![foreign.clone(), new.clone()]);

        // Unchanged set needs no update
        assert!(taint_update(&result, &[new.clone()], &[new.clone()]).is_none());

        // Value change on the same key and effect is an update
        let mut changed = new.clone();
        changed.value = "2".to_string();
        let result = taint_update(&result, &[new], &[changed.clone()]).unwrap();
        assert_eq!(result, vec![foreign, changed]);
    }

    #[test]
    fn test_tracking_names_with_instance() {
        let tracking = TrackingAnnotations::new(Some("blue"));
        assert_eq!(tracking.feature_labels(), "nfd.node.kubernetes.io/blue.feature-labels");
        let tracking = TrackingAnnotations::new(None);
        assert_eq!(tracking.taints(), "nfd.node.kubernetes.io/taints");
    }

    #[test]
    fn test_tracking_render_and_read() {
        let tracking = TrackingAnnotations::new(None);
        let desired = DesiredState {
            labels: map(&[
                ("feature.node.kubernetes.io/b", "1"),
                ("feature.node.kubernetes.io/a", "1"),
                ("vendor.io/c", "1"),
            ]),
            taints: vec![Taint::new(
                "feature.node.kubernetes.io/gpu",
                "true",
                TaintEffect::NoSchedule,
            )],
            ..Default::default()
        };

        let rendered = tracking.render(&desired);
        assert_eq!(rendered["nfd.node.kubernetes.io/feature-labels"], "a,b,vendor.io/c");
        assert!(!rendered.contains_key("nfd.node.kubernetes.io/feature-annotations"));

        let tracked = tracking.read(&rendered);
        assert_eq!(
            tracked.labels,
            keys(&[
                "feature.node.kubernetes.io/a",
                "feature.node.kubernetes.io/b",
                "vendor.io/c"
            ])
        );
        assert_eq!(tracked.taints, desired.taints);
    }

    #[test]
    fn test_render_empty_state_is_empty() {
        let tracking = TrackingAnnotations::new(None);
        assert!(tracking.render(&DesiredState::default()).is_empty());
    }
}
