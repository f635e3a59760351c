//! Kubernetes garbage collection targets

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};

use super::{GcTarget, OwnedObject};
use crate::apis::{NodeFeature, NODE_NAME_LABEL};
use crate::store::kube::map_kube_error;
use crate::store::StoreError;

/// NodeFeature objects in all namespaces; owned by the node in their
/// node-name label, or by the node named like the object
pub struct KubeNodeFeatureTarget {
    client: Client,
}

impl KubeNodeFeatureTarget {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GcTarget for KubeNodeFeatureTarget {
    fn kind(&self) -> &'static str {
        "NodeFeature"
    }

    async fn list(&self) -> Result<Vec<OwnedObject>, StoreError> {
        let api: Api<NodeFeature> = Api::all(self.client.clone());
        let objects = api
            .list_metadata(&ListParams::default())
            .await
            .map_err(|e| map_kube_error("NodeFeature", "*", e))?;

        Ok(objects
            .items
            .iter()
            .map(|o| {
                let name = o.name_any();
                let node = o
                    .labels()
                    .get(NODE_NAME_LABEL)
                    .cloned()
                    .unwrap_or_else(|| name.clone());
                OwnedObject::new(o.namespace().as_deref(), &name, &node)
            })
            .collect())
    }

    async fn delete(&self, object: &OwnedObject) -> Result<(), StoreError> {
        let namespace = object.namespace.as_deref().unwrap_or_default();
        let api: Api<NodeFeature> = Api::namespaced(self.client.clone(), namespace);
        api.delete(&object.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error("NodeFeature", &object.name, e))?;
        Ok(())
    }
}

/// `topology.node.k8s.io/v1alpha2` NodeResourceTopology; cluster scoped and
/// named after their node
pub struct KubeTopologyTarget {
    client: Client,
    resource: ApiResource,
}

pub fn topology_api_resource() -> ApiResource {
    ApiResource {
        group: "topology.node.k8s.io".to_string(),
        version: "v1alpha2".to_string(),
        api_version: "topology.node.k8s.io/v1alpha2".to_string(),
        kind: "NodeResourceTopology".to_string(),
        plural: "noderesourcetopologies".to_string(),
    }
}

impl KubeTopologyTarget {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: topology_api_resource(),
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.resource)
    }
}

#[async_trait]
impl GcTarget for KubeTopologyTarget {
    fn kind(&self) -> &'static str {
        "NodeResourceTopology"
    }

    async fn list(&self) -> Result<Vec<OwnedObject>, StoreError> {
        let objects = match self.api().list_metadata(&ListParams::default()).await {
            Ok(objects) => objects,
            // CRD not installed
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(Vec::new()),
            Err(e) => return Err(map_kube_error("NodeResourceTopology", "*", e)),
        };
        Ok(objects
            .items
            .iter()
            .map(|o| {
                let name = o.name_any();
                OwnedObject::new(None, &name, &name)
            })
            .collect())
    }

    async fn delete(&self, object: &OwnedObject) -> Result<(), StoreError> {
        self.api()
            .delete(&object.name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error("NodeResourceTopology", &object.name, e))?;
        Ok(())
    }
}
