//! # NFD master
//!
//! [`NfdMaster`] ties the pieces together for one node or group at a time:
//!
//! ```text
//!  FeatureSource ──► merge ──► NodeReconciler ──► DesiredState
//!                                                     │
//!  NodeStore ◄── taints / status / metadata patches ◄─┘
//! ```
//!
//! Every reconciliation reads the current state fresh from the stores, so a
//! coalesced trigger still converges.

pub mod group;
pub mod merge;
pub mod patch;
pub mod reconcile;
pub mod validate;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::apis::{FeatureGroupNode, NodeFeatureGroupStatus, SetLabelsRequest, Taint};
use crate::config::{ConfigError, MasterConfig};
use crate::controller::UpdateHandler;
use crate::metrics::SharedMetrics;
use crate::store::{
    group_key, parse_group_key, with_timeout, NodeRecord, SharedFeatureSource, SharedNodeStore,
    StoreError, Subresource,
};

use self::merge::{merge_node_features, MergedFeatures};
use self::patch::{create_patches, extended_resource_patches, taint_update, PatchPath, TrackingAnnotations};
use self::reconcile::NodeReconciler;
use self::validate::LabelPolicy;

/// Namespace the master runs in when none is given
pub const DEFAULT_NAMESPACE: &str = "node-feature-discovery";

/// The labels, annotations, extended resources and taints computed for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub extended_resources: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

impl DesiredState {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.annotations.is_empty()
            && self.extended_resources.is_empty()
            && self.taints.is_empty()
    }
}

/// Outcome of one node or group update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeUpdate {
    /// At least one write was made
    Applied,
    /// Desired and live state already agree
    Unchanged,
    /// Nothing to do: no features reported, or publishing disabled
    Skipped,
    /// The node or group no longer exists
    NotFound,
}

#[derive(Error, Debug)]
pub enum MasterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Request for node '{claimed}' rejected for identity '{identity}'")]
    Unauthorized { claimed: String, identity: String },
}

impl MasterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MasterError::Store(e) if e.is_not_found())
    }
}

/// Configuration together with the policy derived from it
#[derive(Debug)]
pub struct ActiveConfig {
    pub config: MasterConfig,
    pub policy: LabelPolicy,
}

impl ActiveConfig {
    pub fn new(config: MasterConfig) -> Result<Self, ConfigError> {
        let policy = LabelPolicy::from_config(&config)?;
        Ok(Self { config, policy })
    }
}

// ============================================================================
// Master
// ============================================================================

pub struct NfdMaster {
    nodes: SharedNodeStore,
    features: SharedFeatureSource,
    metrics: SharedMetrics,
    active: RwLock<Arc<ActiveConfig>>,
    pending_prune: DashSet<String>,
    tracking: TrackingAnnotations,
    namespace: String,
}

impl NfdMaster {
    pub fn new(
        nodes: SharedNodeStore,
        features: SharedFeatureSource,
        metrics: SharedMetrics,
        config: MasterConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            nodes,
            features,
            metrics,
            active: RwLock::new(Arc::new(ActiveConfig::new(config)?)),
            pending_prune: DashSet::new(),
            tracking: TrackingAnnotations::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    /// Namespace whose NodeFeature objects take precedence in merges
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Instance name used to keep tracking annotations apart
    pub fn with_instance(mut self, instance: Option<&str>) -> Self {
        self.tracking = TrackingAnnotations::new(instance);
        self
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn tracking(&self) -> &TrackingAnnotations {
        &self.tracking
    }

    pub async fn config(&self) -> Arc<ActiveConfig> {
        self.active.read().await.clone()
    }

    /// Swap in a new configuration
    pub async fn set_config(&self, config: MasterConfig) -> Result<(), ConfigError> {
        let active = Arc::new(ActiveConfig::new(config)?);
        *self.active.write().await = active;
        info!("Master configuration updated");
        Ok(())
    }

    pub async fn namespace_selected(&self, namespace: &str) -> bool {
        self.active.read().await.config.namespace_selected(namespace)
    }

    /// Remember that the last NodeFeature of `node` went away, so the next
    /// update removes everything previously applied
    pub fn mark_pending_prune(&self, node: &str) {
        debug!("Node {} marked for pruning", node);
        self.pending_prune.insert(node.to_string());
    }

    pub fn is_pending_prune(&self, node: &str) -> bool {
        self.pending_prune.contains(node)
    }

    async fn merged_features(&self, node: &str, active: &ActiveConfig) -> Result<MergedFeatures, StoreError> {
        let objects = with_timeout(self.features.list_node_features(node)).await?;
        let selected = objects
            .into_iter()
            .filter(|o| {
                active
                    .config
                    .namespace_selected(o.metadata.namespace.as_deref().unwrap_or_default())
            })
            .collect();
        Ok(merge_node_features(selected, &self.namespace))
    }

    /// Whether any NodeFeature object in a selected namespace describes `node`
    pub async fn has_node_features(&self, node: &str) -> Result<bool, MasterError> {
        let active = self.config().await;
        Ok(!self.merged_features(node, &active).await?.is_empty())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::store::ResourceEvent> {
        self.features.subscribe()
    }

    /// Desired state of `node` from its NodeFeature objects and all rules.
    ///
    /// `None` means no NodeFeature object describes the node.
    pub async fn compute_node(&self, node: &str) -> Result<Option<DesiredState>, MasterError> {
        let active = self.config().await;
        let merged = self.merged_features(node, &active).await?;
        if merged.is_empty() {
            return Ok(None);
        }
        let state = self.compute(node, &merged.labels, &merged.features, &active).await?;
        Ok(Some(state))
    }

    async fn compute(
        &self,
        node: &str,
        direct_labels: &BTreeMap<String, String>,
        features: &crate::apis::Features,
        active: &ActiveConfig,
    ) -> Result<DesiredState, MasterError> {
        let rules = with_timeout(self.features.list_rules()).await?;
        Ok(NodeReconciler::new(&active.policy, &self.metrics).desired_state(
            node,
            direct_labels,
            &rules,
            features,
        ))
    }

    /// Reconcile one node from its NodeFeature objects
    pub async fn update_node(&self, name: &str) -> Result<NodeUpdate, MasterError> {
        self.metrics.node_update_requests.inc();

        let Some(node) = with_timeout(self.nodes.get(name)).await? else {
            info!("Node {} not found, skipping update", name);
            self.pending_prune.remove(name);
            return Ok(NodeUpdate::NotFound);
        };

        let active = self.config().await;
        let merged = self.merged_features(name, &active).await?;

        if merged.is_empty() {
            if !self.pending_prune.contains(name) {
                debug!("No NodeFeature objects for node {}, skipping", name);
                return Ok(NodeUpdate::Skipped);
            }
            info!("Last NodeFeature of node {} removed, pruning", name);
            let result = self.apply(&node, &DesiredState::default(), &active).await?;
            self.pending_prune.remove(name);
            return Ok(result);
        }
        self.pending_prune.remove(name);

        let desired = self.compute(name, &merged.labels, &merged.features, &active).await?;
        self.apply(&node, &desired, &active).await
    }

    /// Reconcile a node from a direct report
    pub async fn set_labels(&self, request: &SetLabelsRequest) -> Result<NodeUpdate, MasterError> {
        self.metrics.node_update_requests.inc();
        debug!(
            "Direct report for node {} from reporter {}",
            request.node_name, request.reporter_version
        );

        let node = with_timeout(self.nodes.get(&request.node_name))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "node",
                name: request.node_name.clone(),
            })?;

        let active = self.config().await;
        let desired = self
            .compute(&request.node_name, &request.labels, &request.features, &active)
            .await?;
        self.apply(&node, &desired, &active).await
    }

    /// Remove everything this instance applied from every node
    pub async fn prune_all(&self) -> Result<usize, MasterError> {
        let active = self.config().await;
        let nodes = with_timeout(self.nodes.list()).await?;
        let mut pruned = 0;
        for node in &nodes {
            info!("Pruning node {}", node.name);
            if self.apply(node, &DesiredState::default(), &active).await? == NodeUpdate::Applied {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Write `desired` to `node`, touching only what differs.
    ///
    /// Taints go first since their update is checked against the resource
    /// version that was read.
    async fn apply(
        &self,
        node: &NodeRecord,
        desired: &DesiredState,
        active: &ActiveConfig,
    ) -> Result<NodeUpdate, MasterError> {
        if active.config.no_publish {
            debug!("Publishing disabled, not updating node {}", node.name);
            return Ok(NodeUpdate::Skipped);
        }

        let tracked = self.tracking.read(&node.annotations);
        let mut changed = false;

        if let Some(taints) = taint_update(&node.taints, &tracked.taints, &desired.taints) {
            debug!("Updating taints of node {}: {:?}", node.name, taints);
            with_timeout(self.nodes.update_taints(node, taints)).await?;
            changed = true;
        }

        let status = extended_resource_patches(
            &tracked.extended_resources,
            &node.capacity,
            &node.allocatable,
            &desired.extended_resources,
        );
        if !status.is_empty() {
            debug!("Patching status of node {}: {} operations", node.name, status.len());
            with_timeout(self.nodes.patch(&node.name, &status, Subresource::Status)).await?;
            changed = true;
        }

        let mut metadata = create_patches(&tracked.labels, &node.labels, &desired.labels, PatchPath::Labels);

        let mut annotations = desired.annotations.clone();
        annotations.extend(self.tracking.render(desired));
        // Tracking annotations are always ours to remove
        let tracking_names = self.tracking.all();
        metadata.extend(create_patches(
            tracked.annotations.iter().chain(tracking_names.iter()),
            &node.annotations,
            &annotations,
            PatchPath::Annotations,
        ));

        if !metadata.is_empty() {
            debug!("Patching metadata of node {}: {} operations", node.name, metadata.len());
            with_timeout(self.nodes.patch(&node.name, &metadata, Subresource::Metadata)).await?;
            changed = true;
        }

        if changed {
            self.metrics.node_updates.inc();
            info!("Node {} updated", node.name);
            Ok(NodeUpdate::Applied)
        } else {
            debug!("Node {} up to date", node.name);
            Ok(NodeUpdate::Unchanged)
        }
    }

    /// Recompute the member list of one NodeFeatureGroup
    pub async fn update_group(&self, key: &str) -> Result<NodeUpdate, MasterError> {
        let (namespace, name) = parse_group_key(key);
        let Some(group) = with_timeout(self.features.get_group(namespace, name)).await? else {
            debug!("NodeFeatureGroup {} not found, skipping", key);
            return Ok(NodeUpdate::NotFound);
        };

        let active = self.config().await;
        let nodes = with_timeout(self.nodes.list()).await?;
        let mut members = Vec::new();

        for node in &nodes {
            let merged = self.merged_features(&node.name, &active).await?;
            if merged.is_empty() {
                continue;
            }
            if group::node_in_group(key, &node.name, &group.spec.rules, &merged.features, &self.metrics) {
                members.push(FeatureGroupNode {
                    name: node.name.clone(),
                });
            }
        }
        members.sort_by(|a, b| a.name.cmp(&b.name));

        let status = NodeFeatureGroupStatus { nodes: members };
        if group.status.as_ref() == Some(&status) {
            debug!("NodeFeatureGroup {} up to date", key);
            return Ok(NodeUpdate::Unchanged);
        }
        if active.config.no_publish {
            return Ok(NodeUpdate::Skipped);
        }

        with_timeout(self.features.update_group_status(&group, status)).await?;
        self.metrics.group_updates.inc();
        info!("NodeFeatureGroup {} updated", key);
        Ok(NodeUpdate::Applied)
    }

    pub async fn node_names(&self) -> Result<Vec<String>, MasterError> {
        let nodes = with_timeout(self.nodes.list()).await?;
        Ok(nodes.into_iter().map(|n| n.name).collect())
    }

    pub async fn group_keys(&self) -> Result<Vec<String>, MasterError> {
        let groups = with_timeout(self.features.list_groups()).await?;
        Ok(groups
            .iter()
            .map(|g| {
                group_key(
                    g.metadata.namespace.as_deref().unwrap_or_default(),
                    g.metadata.name.as_deref().unwrap_or_default(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl UpdateHandler for NfdMaster {
    async fn update_node(&self, name: &str) -> Result<NodeUpdate, MasterError> {
        NfdMaster::update_node(self, name).await
    }

    async fn update_group(&self, key: &str) -> Result<NodeUpdate, MasterError> {
        NfdMaster::update_group(self, key).await
    }

    async fn node_names(&self) -> Result<Vec<String>, MasterError> {
        NfdMaster::node_names(self).await
    }

    async fn group_keys(&self) -> Result<Vec<String>, MasterError> {
        NfdMaster::group_keys(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{
        Features, GroupRule, NodeFeature, NodeFeatureGroup, NodeFeatureGroupSpec, NodeFeatureSpec,
        NODE_NAME_LABEL,
    };
    use crate::metrics::new_shared_metrics;
    use crate::store::{MemoryFeatureSource, MemoryNodeStore};

    fn node_feature(ns: &str, name: &str, node: &str, labels: &[(&str, &str)]) -> NodeFeature {
        let mut object = NodeFeature::new(
            name,
            NodeFeatureSpec {
                features: Features::new(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        object.metadata.namespace = Some(ns.to_string());
        object.metadata.labels = Some([(NODE_NAME_LABEL.to_string(), node.to_string())].into());
        object
    }

    fn setup(config: MasterConfig) -> (Arc<MemoryNodeStore>, Arc<MemoryFeatureSource>, NfdMaster) {
        let nodes = Arc::new(MemoryNodeStore::new());
        let features = Arc::new(MemoryFeatureSource::new());
        let master = NfdMaster::new(
            nodes.clone(),
            features.clone(),
            new_shared_metrics().unwrap(),
            config,
        )
        .unwrap();
        (nodes, features, master)
    }

    #[tokio::test]
    async fn test_update_and_idempotence() {
        let (nodes, features, master) = setup(MasterConfig::default());
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[("cpu", "true")]));

        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Applied);
        let node = nodes.node("n1").unwrap();
        assert_eq!(node.labels["feature.node.kubernetes.io/cpu"], "true");
        assert_eq!(node.annotations["nfd.node.kubernetes.io/feature-labels"], "cpu");

        nodes.clear_patch_calls().await;
        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Unchanged);
        assert!(nodes.patch_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_node_is_not_found() {
        let (_, _, master) = setup(MasterConfig::default());
        master.mark_pending_prune("gone");
        assert_eq!(master.update_node("gone").await.unwrap(), NodeUpdate::NotFound);
        assert!(!master.is_pending_prune("gone"));
    }

    #[tokio::test]
    async fn test_no_features_skips_unless_pending_prune() {
        let (nodes, features, master) = setup(MasterConfig::default());
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[("cpu", "true")]));
        master.update_node("n1").await.unwrap();

        features.delete_node_feature("nfd", "n1");
        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Skipped);
        assert!(nodes.node("n1").unwrap().labels.contains_key("feature.node.kubernetes.io/cpu"));

        master.mark_pending_prune("n1");
        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Applied);
        let node = nodes.node("n1").unwrap();
        assert!(node.labels.is_empty());
        assert!(node.annotations.is_empty());
        assert!(!master.is_pending_prune("n1"));
    }

    #[tokio::test]
    async fn test_foreign_labels_survive() {
        let (nodes, features, master) = setup(MasterConfig::default());
        nodes.insert(NodeRecord::new("n1").with_label("kubernetes.io/hostname", "n1"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[("cpu", "true")]));
        master.update_node("n1").await.unwrap();
        master.prune_all().await.unwrap();

        let node = nodes.node("n1").unwrap();
        assert_eq!(node.labels.len(), 1);
        assert_eq!(node.labels["kubernetes.io/hostname"], "n1");
    }

    #[tokio::test]
    async fn test_no_publish_never_writes() {
        let config = MasterConfig {
            no_publish: true,
            ..Default::default()
        };
        let (nodes, features, master) = setup(config);
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[("cpu", "true")]));

        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Skipped);
        assert!(nodes.patch_calls().await.is_empty());

        let desired = master.compute_node("n1").await.unwrap().unwrap();
        assert_eq!(desired.labels["feature.node.kubernetes.io/cpu"], "true");
    }

    #[tokio::test]
    async fn test_watch_namespaces_filter() {
        let config = MasterConfig {
            watch_namespaces: ["nfd".to_string()].into(),
            ..Default::default()
        };
        let (nodes, features, master) = setup(config);
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("other", "n1", "n1", &[("cpu", "true")]));

        assert_eq!(master.update_node("n1").await.unwrap(), NodeUpdate::Skipped);
    }

    #[tokio::test]
    async fn test_instance_tracking_is_separate() {
        let (nodes, features, master) = setup(MasterConfig::default());
        let master = master.with_instance(Some("blue"));
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[("cpu", "true")]));
        master.update_node("n1").await.unwrap();

        let node = nodes.node("n1").unwrap();
        assert!(node
            .annotations
            .contains_key("nfd.node.kubernetes.io/blue.feature-labels"));
    }

    #[tokio::test]
    async fn test_set_labels_direct_report() {
        let (nodes, _, master) = setup(MasterConfig::default());
        nodes.insert(NodeRecord::new("n1"));
        let request = SetLabelsRequest {
            node_name: "n1".to_string(),
            labels: [("direct".to_string(), "yes".to_string())].into(),
            ..Default::default()
        };
        assert_eq!(master.set_labels(&request).await.unwrap(), NodeUpdate::Applied);
        assert_eq!(
            nodes.node("n1").unwrap().labels["feature.node.kubernetes.io/direct"],
            "yes"
        );

        let missing = SetLabelsRequest {
            node_name: "n2".to_string(),
            ..Default::default()
        };
        assert!(master.set_labels(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_group_membership_written_once() {
        let (nodes, features, master) = setup(MasterConfig::default());
        nodes.insert(NodeRecord::new("n2"));
        nodes.insert(NodeRecord::new("n1"));
        nodes.insert(NodeRecord::new("n3"));
        features.apply_node_feature(node_feature("nfd", "n1", "n1", &[]));
        features.apply_node_feature(node_feature("nfd", "n2", "n2", &[]));

        let mut group = NodeFeatureGroup::new(
            "all",
            NodeFeatureGroupSpec {
                rules: vec![GroupRule {
                    name: "any".to_string(),
                    ..Default::default()
                }],
            },
        );
        group.metadata.namespace = Some("nfd".to_string());
        features.apply_group(group);

        assert_eq!(master.update_group("nfd/all").await.unwrap(), NodeUpdate::Applied);
        let status = features.group_status("nfd", "all").unwrap();
        let names: Vec<&str> = status.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["n1", "n2"]);

        assert_eq!(master.update_group("nfd/all").await.unwrap(), NodeUpdate::Unchanged);
        assert_eq!(master.update_group("nfd/gone").await.unwrap(), NodeUpdate::NotFound);
    }
}
