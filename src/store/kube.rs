//! Kubernetes backed stores
//!
//! Nodes are read and patched directly through the API server. NodeFeature,
//! NodeFeatureRule and NodeFeatureGroup objects are served from reflector
//! caches whose watch events are re-published as [`ResourceEvent`]s.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Taint as K8sTaint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FeatureSource, NodeRecord, NodeStore, ResourceEvent, StoreError, Subresource};
use crate::apis::{
    NodeFeature, NodeFeatureGroup, NodeFeatureGroupStatus, NodeFeatureRule, Taint, NODE_NAME_LABEL,
};
use crate::master::patch::{JsonPatch, PatchOp, PatchPath};

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, StoreError> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| StoreError::ClientConfig(format!("failed to read kubeconfig: {}", e)))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| StoreError::ClientConfig(format!("failed to load kubeconfig: {}", e)))?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

pub(crate) fn map_kube_error(kind: &'static str, name: &str, e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict(format!("{} {}", kind, name))
        }
        _ => StoreError::Kube(e),
    }
}

// ============================================================================
// Nodes
// ============================================================================

pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn from_k8s_taint(t: &K8sTaint) -> Taint {
    Taint {
        key: t.key.clone(),
        value: t.value.clone().unwrap_or_default(),
        effect: t.effect.clone(),
    }
}

fn to_k8s_taint(t: &Taint) -> K8sTaint {
    K8sTaint {
        key: t.key.clone(),
        value: (!t.value.is_empty()).then(|| t.value.clone()),
        effect: t.effect.clone(),
        time_added: None,
    }
}

/// The fields of a node the master cares about
pub fn node_record(node: &Node) -> NodeRecord {
    let quantities = |q: Option<&BTreeMap<String, Quantity>>| -> BTreeMap<String, String> {
        q.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default()
    };
    let status = node.status.as_ref();

    NodeRecord {
        name: node.name_any(),
        labels: node.labels().clone(),
        annotations: node.annotations().clone(),
        capacity: quantities(status.and_then(|s| s.capacity.as_ref())),
        allocatable: quantities(status.and_then(|s| s.allocatable.as_ref())),
        taints: node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .map(|t| t.iter().map(from_k8s_taint).collect())
            .unwrap_or_default(),
        resource_version: node.resource_version(),
    }
}

/// Turn key-level patches into a JSON merge patch body; removals become `null`
pub fn merge_patch_body(patches: &[JsonPatch]) -> Value {
    let mut body = Map::new();
    for patch in patches {
        let (section, field) = match patch.path {
            PatchPath::Labels => ("metadata", "labels"),
            PatchPath::Annotations => ("metadata", "annotations"),
            PatchPath::Capacity => ("status", "capacity"),
            PatchPath::Allocatable => ("status", "allocatable"),
        };
        let value = match (patch.op, &patch.value) {
            (PatchOp::Remove, _) | (_, None) => Value::Null,
            (_, Some(v)) => Value::String(v.clone()),
        };
        let section = body
            .entry(section)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(section) = section {
            let field = section
                .entry(field)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(field) = field {
                field.insert(patch.key.clone(), value);
            }
        }
    }
    Value::Object(body)
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &str) -> Result<Option<NodeRecord>, StoreError> {
        let node = self.api.get_opt(name).await?;
        Ok(node.as_ref().map(node_record))
    }

    async fn list(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let nodes = self.api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(node_record).collect())
    }

    async fn patch(
        &self,
        name: &str,
        patches: &[JsonPatch],
        subresource: Subresource,
    ) -> Result<(), StoreError> {
        let body = merge_patch_body(patches);
        debug!("Patching node {} ({:?}): {}", name, subresource, body);
        let params = PatchParams::default();
        let result = match subresource {
            Subresource::Metadata => self.api.patch(name, &params, &Patch::Merge(&body)).await,
            Subresource::Status => self.api.patch_status(name, &params, &Patch::Merge(&body)).await,
        };
        result
            .map(|_| ())
            .map_err(|e| map_kube_error("Node", name, e))
    }

    async fn update_taints(&self, node: &NodeRecord, taints: Vec<Taint>) -> Result<(), StoreError> {
        let taints: Vec<K8sTaint> = taints.iter().map(to_k8s_taint).collect();
        // resourceVersion makes the write optimistic
        let body = json!({
            "metadata": { "resourceVersion": node.resource_version },
            "spec": { "taints": taints },
        });
        self.api
            .patch(&node.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error("Node", &node.name, e))
    }
}

// ============================================================================
// Feature objects
// ============================================================================

/// Reflector backed [`FeatureSource`]
pub struct KubeFeatureSource {
    client: Client,
    node_features: Store<NodeFeature>,
    rules: Store<NodeFeatureRule>,
    groups: Store<NodeFeatureGroup>,
    events: broadcast::Sender<ResourceEvent>,
}

fn node_feature_event(object: &NodeFeature, deleted: bool) -> ResourceEvent {
    ResourceEvent::NodeFeature {
        namespace: object.namespace().unwrap_or_default(),
        name: object.name_any(),
        node_name: object.labels().get(NODE_NAME_LABEL).cloned(),
        deleted,
    }
}

fn rule_event(object: &NodeFeatureRule, deleted: bool) -> ResourceEvent {
    ResourceEvent::NodeFeatureRule {
        name: object.name_any(),
        deleted,
    }
}

fn group_event(object: &NodeFeatureGroup, deleted: bool) -> ResourceEvent {
    ResourceEvent::NodeFeatureGroup {
        namespace: object.namespace().unwrap_or_default(),
        name: object.name_any(),
        deleted,
    }
}

impl KubeFeatureSource {
    /// Start the reflectors; they run until `shutdown` is cancelled
    pub fn start(client: Client, shutdown: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(1024);

        let node_features = spawn_reflector(
            Api::<NodeFeature>::all(client.clone()),
            events.clone(),
            node_feature_event,
            shutdown.clone(),
        );
        let rules = spawn_reflector(
            Api::<NodeFeatureRule>::all(client.clone()),
            events.clone(),
            rule_event,
            shutdown.clone(),
        );
        let groups = spawn_reflector(
            Api::<NodeFeatureGroup>::all(client.clone()),
            events.clone(),
            group_event,
            shutdown,
        );

        Self {
            client,
            node_features,
            rules,
            groups,
            events,
        }
    }
}

fn spawn_reflector<K>(
    api: Api<K>,
    events: broadcast::Sender<ResourceEvent>,
    to_event: fn(&K, bool) -> ResourceEvent,
    shutdown: CancellationToken,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher(api, watcher::Config::default()).default_backoff(),
    );

    tokio::spawn(async move {
        let mut stream = stream.boxed();
        info!("Starting {} reflector", kind);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("{} reflector shutting down", kind);
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(watcher::Event::Apply(obj))) | Some(Ok(watcher::Event::InitApply(obj))) => {
                        let _ = events.send(to_event(&obj, false));
                    }
                    Some(Ok(watcher::Event::Delete(obj))) => {
                        let _ = events.send(to_event(&obj, true));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("{} watch error: {}", kind, e),
                    None => {
                        warn!("{} reflector stream terminated", kind);
                        break;
                    }
                }
            }
        }
    });

    reader
}

fn sorted<K: Resource + Clone>(objects: Vec<std::sync::Arc<K>>) -> Vec<K> {
    let mut objects: Vec<K> = objects.iter().map(|o| K::clone(o)).collect();
    objects.sort_by(|a, b| {
        a.meta()
            .namespace
            .cmp(&b.meta().namespace)
            .then_with(|| a.meta().name.cmp(&b.meta().name))
    });
    objects
}

#[async_trait]
impl FeatureSource for KubeFeatureSource {
    async fn list_node_features(&self, node: &str) -> Result<Vec<NodeFeature>, StoreError> {
        Ok(self
            .node_features
            .state()
            .iter()
            .filter(|o| o.labels().get(NODE_NAME_LABEL).map(String::as_str) == Some(node))
            .map(|o| NodeFeature::clone(o))
            .collect())
    }

    async fn list_rules(&self) -> Result<Vec<NodeFeatureRule>, StoreError> {
        Ok(sorted(self.rules.state()))
    }

    async fn list_groups(&self) -> Result<Vec<NodeFeatureGroup>, StoreError> {
        Ok(sorted(self.groups.state()))
    }

    async fn get_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeFeatureGroup>, StoreError> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.groups.get(&key).map(|g| NodeFeatureGroup::clone(&g)))
    }

    async fn update_group_status(
        &self,
        group: &NodeFeatureGroup,
        status: NodeFeatureGroupStatus,
    ) -> Result<(), StoreError> {
        let namespace = group.namespace().unwrap_or_default();
        let name = group.name_any();
        let api = Api::<NodeFeatureGroup>::namespaced(self.client.clone(), &namespace);
        let body = json!({ "status": status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error("NodeFeatureGroup", &name, e))
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    async fn wait_synced(&self) -> Result<(), StoreError> {
        let not_synced = |kind: &str| StoreError::NotSynced(format!("{} reflector stopped", kind));
        self.node_features
            .wait_until_ready()
            .await
            .map_err(|_| not_synced("NodeFeature"))?;
        self.rules
            .wait_until_ready()
            .await
            .map_err(|_| not_synced("NodeFeatureRule"))?;
        self.groups
            .wait_until_ready()
            .await
            .map_err(|_| not_synced("NodeFeatureGroup"))?;
        info!("Feature caches synced");
        Ok(())
    }
}
