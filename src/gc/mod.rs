//! # Garbage collector
//!
//! Deletes NodeFeature and NodeResourceTopology objects whose node no longer
//! exists. Runs once per interval until shut down.

pub mod kube;

pub use self::kube::{KubeNodeFeatureTarget, KubeTopologyTarget};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{with_timeout, SharedNodeStore, StoreError};

/// Default interval between collections
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum GcError {
    #[error("Failed to list nodes: {0}")]
    ListNodes(StoreError),

    #[error("Failed to list {kind} objects: {source}")]
    ListObjects {
        kind: &'static str,
        source: StoreError,
    },
}

/// An object that belongs to one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnedObject {
    pub namespace: Option<String>,
    pub name: String,
    pub node: String,
}

impl OwnedObject {
    pub fn new(namespace: Option<&str>, name: &str, node: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            node: node.to_string(),
        }
    }

    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// A kind of object the collector cleans up
#[async_trait]
pub trait GcTarget: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn list(&self) -> Result<Vec<OwnedObject>, StoreError>;

    async fn delete(&self, object: &OwnedObject) -> Result<(), StoreError>;
}

/// Outcome of one collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: Vec<OwnedObject>,
    pub failed: usize,
}

pub struct GarbageCollector {
    nodes: SharedNodeStore,
    targets: Vec<Arc<dyn GcTarget>>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(nodes: SharedNodeStore) -> Self {
        Self {
            nodes,
            targets: Vec::new(),
            interval: DEFAULT_GC_INTERVAL,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn GcTarget>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Delete every object of every target whose node is gone
    pub async fn run_once(&self) -> Result<GcReport, GcError> {
        let nodes: BTreeSet<String> = with_timeout(self.nodes.list())
            .await
            .map_err(GcError::ListNodes)?
            .into_iter()
            .map(|n| n.name)
            .collect();

        let mut report = GcReport::default();
        for target in &self.targets {
            let objects = with_timeout(target.list())
                .await
                .map_err(|source| GcError::ListObjects {
                    kind: target.kind(),
                    source,
                })?;

            for object in objects.into_iter().filter(|o| !nodes.contains(&o.node)) {
                match with_timeout(target.delete(&object)).await {
                    Ok(()) => {
                        info!(
                            "Deleted {} {} of missing node {}",
                            target.kind(),
                            object.display_name(),
                            object.node
                        );
                        report.deleted.push(object);
                    }
                    Err(e) if e.is_not_found() => {
                        debug!("{} {} already gone", target.kind(), object.display_name());
                    }
                    Err(e) => {
                        warn!("Failed to delete {} {}: {}", target.kind(), object.display_name(), e);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Collect every interval until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Garbage collector started (interval {:?})", self.interval);
        loop {
            match self.run_once().await {
                Ok(report) => debug!(
                    "Garbage collection done: {} deleted, {} failed",
                    report.deleted.len(),
                    report.failed
                ),
                Err(e) => error!("Garbage collection failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Garbage collector shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

// ============================================================================
// In-memory target
// ============================================================================

pub struct MemoryGcTarget {
    kind: &'static str,
    objects: DashMap<(Option<String>, String), OwnedObject>,
}

impl MemoryGcTarget {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: DashMap::new(),
        }
    }

    pub fn insert(&self, object: OwnedObject) {
        self.objects
            .insert((object.namespace.clone(), object.name.clone()), object);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.iter().map(|o| o.display_name()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl GcTarget for MemoryGcTarget {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn list(&self) -> Result<Vec<OwnedObject>, StoreError> {
        let mut objects: Vec<OwnedObject> = self.objects.iter().map(|o| o.clone()).collect();
        objects.sort();
        Ok(objects)
    }

    async fn delete(&self, object: &OwnedObject) -> Result<(), StoreError> {
        self.objects
            .remove(&(object.namespace.clone(), object.name.clone()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                name: object.display_name(),
            })
    }
}
