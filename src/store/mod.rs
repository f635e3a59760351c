//! # External stores
//!
//! The master talks to two external systems through narrow capability traits:
//!
//! - [`NodeStore`]: the node objects the master writes to
//! - [`FeatureSource`]: a cached, watchable view of the NodeFeature,
//!   NodeFeatureRule and NodeFeatureGroup objects
//!
//! [`kube`] holds the Kubernetes implementations, [`memory`] the in-memory
//! ones used by tests and the dry-run command.

pub mod kube;
pub mod memory;

pub use self::kube::{create_client, KubeFeatureSource, KubeNodeStore};
pub use memory::{MemoryFeatureSource, MemoryNodeStore};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::apis::{NodeFeature, NodeFeatureGroup, NodeFeatureGroupStatus, NodeFeatureRule, Taint};
use crate::master::patch::JsonPatch;

/// Upper bound for a single call to an external store
pub const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from external stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Conflict while updating {0}")]
    Conflict(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Kubernetes client configuration error: {0}")]
    ClientConfig(String),

    #[error("Cache not synced: {0}")]
    NotSynced(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Run an external call with [`EXTERNAL_CALL_TIMEOUT`]
pub async fn with_timeout<T, F>(fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(EXTERNAL_CALL_TIMEOUT, fut)
        .await
        .map_err(|_| StoreError::Timeout(EXTERNAL_CALL_TIMEOUT))?
}

// ============================================================================
// Node store
// ============================================================================

/// The parts of a node the master reads and writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub resource_version: Option<String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }
}

/// Which part of the node a patch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subresource {
    /// Labels and annotations
    Metadata,
    /// Capacity and allocatable
    Status,
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch one node; `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<NodeRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<NodeRecord>, StoreError>;

    /// Apply patches to one subresource. Callers skip empty patch lists.
    async fn patch(
        &self,
        name: &str,
        patches: &[JsonPatch],
        subresource: Subresource,
    ) -> Result<(), StoreError>;

    /// Replace the taints of `node`, failing with `Conflict` if the node
    /// changed since it was read
    async fn update_taints(&self, node: &NodeRecord, taints: Vec<Taint>) -> Result<(), StoreError>;
}

// ============================================================================
// Feature source
// ============================================================================

/// Change notification from the feature source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    NodeFeature {
        namespace: String,
        name: String,
        node_name: Option<String>,
        deleted: bool,
    },
    NodeFeatureRule {
        name: String,
        deleted: bool,
    },
    NodeFeatureGroup {
        namespace: String,
        name: String,
        deleted: bool,
    },
}

#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// All NodeFeature objects labelled for `node`, in any namespace
    async fn list_node_features(&self, node: &str) -> Result<Vec<NodeFeature>, StoreError>;

    /// All rule objects, sorted by name
    async fn list_rules(&self) -> Result<Vec<NodeFeatureRule>, StoreError>;

    /// All group objects, sorted by namespace and name
    async fn list_groups(&self) -> Result<Vec<NodeFeatureGroup>, StoreError>;

    async fn get_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeFeatureGroup>, StoreError>;

    async fn update_group_status(
        &self,
        group: &NodeFeatureGroup,
        status: NodeFeatureGroupStatus,
    ) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;

    /// Resolve once the initial listing of every watched kind is complete
    async fn wait_synced(&self) -> Result<(), StoreError>;
}

pub type SharedNodeStore = Arc<dyn NodeStore>;
pub type SharedFeatureSource = Arc<dyn FeatureSource>;

/// Queue key of a group object
pub fn group_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a group queue key back into namespace and name
pub fn parse_group_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_roundtrip() {
        let key = group_key("nfd", "gpu-nodes");
        assert_eq!(key, "nfd/gpu-nodes");
        assert_eq!(parse_group_key(&key), ("nfd", "gpu-nodes"));
        assert_eq!(parse_group_key("bare"), ("", "bare"));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(async { Ok::<_, StoreError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), StoreError> = with_timeout(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
