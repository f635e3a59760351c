//! `coordination.k8s.io/v1` Lease backed lock

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;

use super::{LeaseLock, LeaseRecord};
use crate::store::kube::map_kube_error;
use crate::store::{with_timeout, StoreError};

/// Lease name for an optional instance name
pub fn lease_name(instance: Option<&str>) -> String {
    match instance.filter(|i| !i.is_empty()) {
        Some(instance) => format!("nfd-master.{}", instance),
        None => "nfd-master".to_string(),
    }
}

pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(record.holder_identity.clone()),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(record.acquire_time)),
                renew_time: Some(MicroTime(record.renew_time)),
                lease_transitions: Some(record.transitions),
                ..Default::default()
            }),
        }
    }
}

fn from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    let epoch = chrono::DateTime::<Utc>::default();
    LeaseRecord {
        holder_identity: spec.holder_identity.unwrap_or_default(),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0).unwrap_or(epoch),
        renew_time: spec.renew_time.map(|t| t.0).unwrap_or(epoch),
        transitions: spec.lease_transitions.unwrap_or(0),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<(LeaseRecord, String)>, StoreError> {
        let lease = with_timeout(async {
            self.api
                .get_opt(&self.name)
                .await
                .map_err(|e| map_kube_error("Lease", &self.name, e))
        })
        .await?;

        Ok(lease.map(|l| {
            let version = l.metadata.resource_version.clone().unwrap_or_default();
            (from_lease(&l), version)
        }))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        let lease = self.to_lease(record, None);
        with_timeout(async {
            self.api
                .create(&PostParams::default(), &lease)
                .await
                .map_err(|e| map_kube_error("Lease", &self.name, e))
        })
        .await?;
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<(), StoreError> {
        let lease = self.to_lease(record, Some(version));
        with_timeout(async {
            self.api
                .replace(&self.name, &PostParams::default(), &lease)
                .await
                .map_err(|e| map_kube_error("Lease", &self.name, e))
        })
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
