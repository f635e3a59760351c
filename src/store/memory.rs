//! In-memory stores
//!
//! Patches are applied strictly: adding an existing key, or replacing or
//! removing a missing one, is an error, so tests notice sloppy diffs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use super::{FeatureSource, NodeRecord, NodeStore, ResourceEvent, StoreError, Subresource};
use crate::apis::{
    NodeFeature, NodeFeatureGroup, NodeFeatureGroupStatus, NodeFeatureRule, Taint, NODE_NAME_LABEL,
};
use crate::master::patch::{JsonPatch, PatchOp, PatchPath};

// ============================================================================
// Nodes
// ============================================================================

/// A patch call as seen by the store
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCall {
    pub node: String,
    pub subresource: Subresource,
    pub patches: Vec<JsonPatch>,
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: DashMap<String, NodeRecord>,
    version: AtomicU64,
    patch_log: Mutex<Vec<PatchCall>>,
    taint_updates: AtomicUsize,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn insert(&self, mut node: NodeRecord) {
        node.resource_version = Some(self.next_version());
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn remove(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.remove(name).map(|(_, n)| n)
    }

    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(name).map(|n| n.clone())
    }

    /// Every patch call made so far
    pub async fn patch_calls(&self) -> Vec<PatchCall> {
        self.patch_log.lock().await.clone()
    }

    pub async fn clear_patch_calls(&self) {
        self.patch_log.lock().await.clear();
    }

    pub fn taint_update_count(&self) -> usize {
        self.taint_updates.load(Ordering::SeqCst)
    }
}

fn apply_patch(node: &mut NodeRecord, patch: &JsonPatch) -> Result<(), StoreError> {
    let target = match patch.path {
        PatchPath::Labels => &mut node.labels,
        PatchPath::Annotations => &mut node.annotations,
        PatchPath::Capacity => &mut node.capacity,
        PatchPath::Allocatable => &mut node.allocatable,
    };
    let exists = target.contains_key(&patch.key);

    match (patch.op, &patch.value) {
        (PatchOp::Add, Some(value)) if !exists => {
            target.insert(patch.key.clone(), value.clone());
        }
        (PatchOp::Replace, Some(value)) if exists => {
            target.insert(patch.key.clone(), value.clone());
        }
        (PatchOp::Remove, None) if exists => {
            target.remove(&patch.key);
        }
        _ => return Err(StoreError::InvalidPatch(patch.to_string())),
    }
    Ok(())
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get(&self, name: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.node(name))
    }

    async fn list(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let mut nodes: Vec<NodeRecord> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn patch(
        &self,
        name: &str,
        patches: &[JsonPatch],
        subresource: Subresource,
    ) -> Result<(), StoreError> {
        self.patch_log.lock().await.push(PatchCall {
            node: name.to_string(),
            subresource,
            patches: patches.to_vec(),
        });

        let mut entry = self.nodes.get_mut(name).ok_or_else(|| StoreError::NotFound {
            kind: "Node",
            name: name.to_string(),
        })?;

        // All or nothing, like a JSON patch
        let mut updated = entry.clone();
        for patch in patches {
            let allowed = match subresource {
                Subresource::Metadata => {
                    matches!(patch.path, PatchPath::Labels | PatchPath::Annotations)
                }
                Subresource::Status => {
                    matches!(patch.path, PatchPath::Capacity | PatchPath::Allocatable)
                }
            };
            if !allowed {
                return Err(StoreError::InvalidPatch(format!(
                    "{} not allowed on {:?}",
                    patch, subresource
                )));
            }
            apply_patch(&mut updated, patch)?;
        }
        updated.resource_version = Some(self.next_version());
        *entry = updated;
        Ok(())
    }

    async fn update_taints(&self, node: &NodeRecord, taints: Vec<Taint>) -> Result<(), StoreError> {
        let mut entry = self.nodes.get_mut(&node.name).ok_or_else(|| StoreError::NotFound {
            kind: "Node",
            name: node.name.clone(),
        })?;
        if entry.resource_version != node.resource_version {
            return Err(StoreError::Conflict(format!("node {}", node.name)));
        }
        entry.taints = taints;
        entry.resource_version = Some(self.next_version());
        self.taint_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Feature objects
// ============================================================================

pub struct MemoryFeatureSource {
    node_features: DashMap<(String, String), NodeFeature>,
    rules: DashMap<String, NodeFeatureRule>,
    groups: DashMap<(String, String), NodeFeatureGroup>,
    events: broadcast::Sender<ResourceEvent>,
}

impl Default for MemoryFeatureSource {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            node_features: DashMap::new(),
            rules: DashMap::new(),
            groups: DashMap::new(),
            events,
        }
    }
}

fn object_key(namespace: Option<&str>, name: Option<&str>) -> (String, String) {
    (
        namespace.unwrap_or_default().to_string(),
        name.unwrap_or_default().to_string(),
    )
}

impl MemoryFeatureSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event: ResourceEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub fn apply_node_feature(&self, object: NodeFeature) {
        let key = object_key(
            object.metadata.namespace.as_deref(),
            object.metadata.name.as_deref(),
        );
        let node_name = node_name_of(&object);
        self.node_features.insert(key.clone(), object);
        self.notify(ResourceEvent::NodeFeature {
            namespace: key.0,
            name: key.1,
            node_name,
            deleted: false,
        });
    }

    pub fn delete_node_feature(&self, namespace: &str, name: &str) -> Option<NodeFeature> {
        let (_, object) = self
            .node_features
            .remove(&(namespace.to_string(), name.to_string()))?;
        self.notify(ResourceEvent::NodeFeature {
            namespace: namespace.to_string(),
            name: name.to_string(),
            node_name: node_name_of(&object),
            deleted: true,
        });
        Some(object)
    }

    pub fn all_node_features(&self) -> Vec<NodeFeature> {
        self.node_features.iter().map(|o| o.clone()).collect()
    }

    pub fn apply_rule(&self, object: NodeFeatureRule) {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.rules.insert(name.clone(), object);
        self.notify(ResourceEvent::NodeFeatureRule { name, deleted: false });
    }

    pub fn delete_rule(&self, name: &str) {
        if self.rules.remove(name).is_some() {
            self.notify(ResourceEvent::NodeFeatureRule {
                name: name.to_string(),
                deleted: true,
            });
        }
    }

    pub fn apply_group(&self, object: NodeFeatureGroup) {
        let key = object_key(
            object.metadata.namespace.as_deref(),
            object.metadata.name.as_deref(),
        );
        self.groups.insert(key.clone(), object);
        self.notify(ResourceEvent::NodeFeatureGroup {
            namespace: key.0,
            name: key.1,
            deleted: false,
        });
    }

    pub fn group_status(&self, namespace: &str, name: &str) -> Option<NodeFeatureGroupStatus> {
        self.groups
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|g| g.status.clone())
    }
}

fn node_name_of(object: &NodeFeature) -> Option<String> {
    object
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_NAME_LABEL))
        .cloned()
}

#[async_trait]
impl FeatureSource for MemoryFeatureSource {
    async fn list_node_features(&self, node: &str) -> Result<Vec<NodeFeature>, StoreError> {
        Ok(self
            .node_features
            .iter()
            .filter(|o| node_name_of(o.value()).as_deref() == Some(node))
            .map(|o| o.clone())
            .collect())
    }

    async fn list_rules(&self) -> Result<Vec<NodeFeatureRule>, StoreError> {
        let mut rules: Vec<NodeFeatureRule> = self.rules.iter().map(|r| r.clone()).collect();
        rules.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(rules)
    }

    async fn list_groups(&self) -> Result<Vec<NodeFeatureGroup>, StoreError> {
        let mut groups: Vec<((String, String), NodeFeatureGroup)> = self
            .groups
            .iter()
            .map(|g| (g.key().clone(), g.value().clone()))
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(groups.into_iter().map(|(_, g)| g).collect())
    }

    async fn get_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeFeatureGroup>, StoreError> {
        Ok(self
            .groups
            .get(&(namespace.to_string(), name.to_string()))
            .map(|g| g.clone()))
    }

    async fn update_group_status(
        &self,
        group: &NodeFeatureGroup,
        status: NodeFeatureGroupStatus,
    ) -> Result<(), StoreError> {
        let key = object_key(
            group.metadata.namespace.as_deref(),
            group.metadata.name.as_deref(),
        );
        let mut entry = self.groups.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "NodeFeatureGroup",
            name: format!("{}/{}", key.0, key.1),
        })?;
        entry.status = Some(status);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    async fn wait_synced(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::NodeFeatureSpec;

    fn node_feature(namespace: &str, name: &str, node: &str) -> NodeFeature {
        let mut nf = NodeFeature::new(name, NodeFeatureSpec::default());
        nf.metadata.namespace = Some(namespace.to_string());
        nf.metadata.labels = Some([(NODE_NAME_LABEL.to_string(), node.to_string())].into());
        nf
    }

    #[tokio::test]
    async fn test_patch_is_strict() {
        let store = MemoryNodeStore::new();
        store.insert(NodeRecord::new("n1").with_label("a", "1"));

        let bad = [JsonPatch::add(PatchPath::Labels, "a", "2")];
        assert!(store.patch("n1", &bad, Subresource::Metadata).await.is_err());
        // Failed patch leaves the node untouched
        assert_eq!(store.node("n1").unwrap().labels["a"], "1");

        let good = [
            JsonPatch::replace(PatchPath::Labels, "a", "2"),
            JsonPatch::add(PatchPath::Labels, "b", "1"),
        ];
        store.patch("n1", &good, Subresource::Metadata).await.unwrap();
        assert_eq!(store.node("n1").unwrap().labels.len(), 2);
        assert_eq!(store.patch_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_patch_rejects_wrong_subresource() {
        let store = MemoryNodeStore::new();
        store.insert(NodeRecord::new("n1"));
        let patch = [JsonPatch::add(PatchPath::Capacity, "x", "1")];
        assert!(store.patch("n1", &patch, Subresource::Metadata).await.is_err());
        assert!(store.patch("n1", &patch, Subresource::Status).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_taints_conflict() {
        let store = MemoryNodeStore::new();
        store.insert(NodeRecord::new("n1"));
        let stale = store.node("n1").unwrap();

        store
            .patch("n1", &[JsonPatch::add(PatchPath::Labels, "a", "1")], Subresource::Metadata)
            .await
            .unwrap();

        let result = store.update_taints(&stale, Vec::new()).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_feature_source_lists_by_node_label() {
        let source = MemoryFeatureSource::new();
        let mut events = source.subscribe();

        source.apply_node_feature(node_feature("nfd", "a", "n1"));
        source.apply_node_feature(node_feature("nfd", "b", "n2"));

        assert_eq!(source.list_node_features("n1").await.unwrap().len(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ResourceEvent::NodeFeature {
                namespace: "nfd".to_string(),
                name: "a".to_string(),
                node_name: Some("n1".to_string()),
                deleted: false,
            }
        );

        source.delete_node_feature("nfd", "a");
        assert!(source.list_node_features("n1").await.unwrap().is_empty());
    }
}
