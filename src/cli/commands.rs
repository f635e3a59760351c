//! Command implementations for the CLI
//!
//! Commands return data; printing is left to the caller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ConfigArgs, DryRunArgs, GcArgs, PruneArgs, ReportArgs, ServeArgs};
use crate::apis::{Features, NodeFeature, NodeFeatureRule, SetLabelsRequest, NODE_NAME_LABEL};
use crate::client::{ReportClient, ReportClientTrait, TlsFiles};
use crate::config::{expand_path, load_config, validate_instance_name, MasterConfig};
use crate::gc::{GarbageCollector, GcReport, KubeNodeFeatureTarget, KubeTopologyTarget};
use crate::master::{DesiredState, NfdMaster, DEFAULT_NAMESPACE};
use crate::metrics::new_shared_metrics;
use crate::service::{self, ServiceOptions};
use crate::store::{create_client, KubeNodeStore, MemoryFeatureSource, MemoryNodeStore};

/// Version string sent with direct reports
pub fn reporter_version() -> String {
    format!("nfd-master/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Parse every non-empty document of a YAML stream
pub fn parse_yaml_documents<T: DeserializeOwned>(content: &str) -> Result<Vec<T>, serde_yaml::Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

/// Build the direct report for `node_name`
pub fn build_report(
    node_name: &str,
    labels: &[(String, String)],
    features: Option<Features>,
) -> SetLabelsRequest {
    SetLabelsRequest {
        node_name: node_name.to_string(),
        reporter_version: reporter_version(),
        labels: labels.iter().cloned().collect::<BTreeMap<_, _>>(),
        features: features.unwrap_or_default(),
    }
}

/// The node a dry run evaluates: the explicit one, else the one the first
/// NodeFeature object is labelled (or named) for
pub fn dry_run_node(explicit: Option<&str>, objects: &[NodeFeature]) -> Option<String> {
    if let Some(node) = explicit {
        return Some(node.to_string());
    }
    let first = objects.first()?;
    first
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_NAME_LABEL))
        .cloned()
        .or_else(|| first.metadata.name.clone())
}

// ============================================================================
// I/O
// ============================================================================

fn load_yaml_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let path = expand_path(path);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_yaml_documents(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_master_config(args: &ConfigArgs) -> anyhow::Result<MasterConfig> {
    if let Some(instance) = &args.instance {
        validate_instance_name(instance)?;
    }
    load_config(Some(&args.config), args.options.as_deref())
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))
}

/// Evaluate rule files against a NodeFeature file
pub async fn dry_run(args: &DryRunArgs) -> anyhow::Result<(String, DesiredState)> {
    let mut config = load_master_config(&args.config)?;
    config.no_publish = true;

    let mut objects: Vec<NodeFeature> = load_yaml_file(&args.features)?;
    let Some(node) = dry_run_node(args.node_name.as_deref(), &objects) else {
        bail!("No NodeFeature objects in {}", args.features.display());
    };

    let features = Arc::new(MemoryFeatureSource::new());
    for object in objects.iter_mut() {
        object
            .metadata
            .namespace
            .get_or_insert_with(|| DEFAULT_NAMESPACE.to_string());
        object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .entry(NODE_NAME_LABEL.to_string())
            .or_insert_with(|| node.clone());
    }
    for object in objects {
        features.apply_node_feature(object);
    }
    for path in &args.rules {
        for rule in load_yaml_file::<NodeFeatureRule>(path)? {
            features.apply_rule(rule);
        }
    }

    let master = NfdMaster::new(
        Arc::new(MemoryNodeStore::new()),
        features,
        new_shared_metrics()?,
        config,
    )?
    .with_instance(args.config.instance.as_deref());

    match master.compute_node(&node).await? {
        Some(state) => Ok((node, state)),
        None => bail!("No NodeFeature objects describe node {}", node),
    }
}

/// Send one direct report
pub async fn report(args: &ReportArgs) -> anyhow::Result<SetLabelsRequest> {
    let node_name = match &args.node_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .context("Failed to read the host name")?
            .to_string_lossy()
            .into_owned(),
    };

    let features = match &args.features {
        Some(path) => {
            let path = expand_path(path);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some(
                serde_yaml::from_str::<Features>(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?,
            )
        }
        None => None,
    };

    let tls = TlsFiles {
        ca_file: args.ca_file.clone(),
        cert_file: args.cert_file.clone(),
        key_file: args.key_file.clone(),
    };
    let client = ReportClient::new(args.server.clone(), &tls)?;
    let request = build_report(&node_name, &args.labels, features);
    client
        .set_labels(&request)
        .await
        .with_context(|| format!("Report to {} failed", client.base_url()))?;
    Ok(request)
}

/// Remove everything this instance applied from every node
pub async fn prune(args: &PruneArgs) -> anyhow::Result<usize> {
    let config = load_master_config(&args.config)?;
    if config.no_publish {
        warn!("noPublish is set, nothing will be removed");
    }

    let client = create_client(args.kube.kubeconfig.as_deref()).await?;
    // Pruning reads no feature objects
    let master = NfdMaster::new(
        Arc::new(KubeNodeStore::new(client)),
        Arc::new(MemoryFeatureSource::new()),
        new_shared_metrics()?,
        config,
    )?
    .with_namespace(args.kube.namespace.clone())
    .with_instance(args.config.instance.as_deref());

    let pruned = master.prune_all().await?;
    info!("Pruned {} nodes", pruned);
    Ok(pruned)
}

/// Run the garbage collector; with `--once` a single pass is returned
pub async fn gc(args: &GcArgs, shutdown: CancellationToken) -> anyhow::Result<Option<GcReport>> {
    let client = create_client(args.kube.kubeconfig.as_deref()).await?;
    let collector = GarbageCollector::new(Arc::new(KubeNodeStore::new(client.clone())))
        .with_target(Arc::new(KubeNodeFeatureTarget::new(client.clone())))
        .with_target(Arc::new(KubeTopologyTarget::new(client)))
        .with_interval(args.interval);

    if args.once {
        return Ok(Some(collector.run_once().await?));
    }
    collector.run(shutdown).await;
    Ok(None)
}

/// Run the master until `shutdown` fires or the lease is lost
pub async fn serve(args: &ServeArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let options = ServiceOptions {
        config_file: args.config.config.clone(),
        options: args.config.options.clone(),
        instance: args.config.instance.clone(),
        namespace: args.kube.namespace.clone(),
        kubeconfig: args.kube.kubeconfig.clone(),
        addr: args.addr(),
        verify_node_name: args.verify_node_name,
        tls: TlsFiles {
            ca_file: args.tls_ca_file.clone(),
            cert_file: args.tls_cert_file.clone(),
            key_file: args.tls_key_file.clone(),
        },
        trust_identity_header: args.trust_identity_header,
        leader_elect: !args.no_leader_elect,
        config_poll_interval: args.config_poll_interval,
    };
    service::run(options, shutdown).await?;
    Ok(())
}
