//! Change notification ingestion
//!
//! Maps store events onto update signals. NodeFeature objects outside the
//! selected namespaces are ignored.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::UpdateSignals;
use crate::master::NfdMaster;
use crate::store::{group_key, ResourceEvent};

/// Forward events from `events` to `signals` until `shutdown` fires
pub async fn run_informer(
    master: Arc<NfdMaster>,
    mut events: broadcast::Receiver<ResourceEvent>,
    signals: UpdateSignals,
    shutdown: CancellationToken,
) {
    info!("Informer started");
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => handle_event(&master, &signals, event).await,
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} change notifications, updating everything", missed);
                signals.update_all_nodes();
                signals.update_all_groups();
            }
            Err(RecvError::Closed) => {
                info!("Change notifications closed");
                break;
            }
        }
    }
    debug!("Informer stopped");
}

async fn handle_event(master: &NfdMaster, signals: &UpdateSignals, event: ResourceEvent) {
    match event {
        ResourceEvent::NodeFeature {
            namespace,
            name,
            node_name,
            deleted,
        } => {
            if !master.namespace_selected(&namespace).await {
                trace!("Ignoring NodeFeature {}/{} outside watched namespaces", namespace, name);
                return;
            }
            let Some(node) = node_name else {
                warn!("NodeFeature {}/{} has no node name label, ignoring", namespace, name);
                return;
            };
            debug!("NodeFeature {}/{} changed, updating node {}", namespace, name, node);

            if deleted {
                match master.has_node_features(&node).await {
                    Ok(false) => master.mark_pending_prune(&node),
                    Ok(true) => {}
                    Err(e) => warn!("Failed to list NodeFeatures of node {}: {}", node, e),
                }
            }
            signals.update_node(&node);
            signals.update_all_groups();
        }
        ResourceEvent::NodeFeatureRule { name, .. } => {
            debug!("NodeFeatureRule {} changed, updating all nodes", name);
            signals.update_all_nodes();
        }
        ResourceEvent::NodeFeatureGroup {
            namespace,
            name,
            deleted,
        } => {
            if deleted {
                trace!("NodeFeatureGroup {}/{} deleted", namespace, name);
                return;
            }
            signals.update_group(&group_key(&namespace, &name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{Features, NodeFeature, NodeFeatureRule, NodeFeatureRuleSpec, NodeFeatureSpec, NODE_NAME_LABEL};
    use crate::config::MasterConfig;
    use crate::controller::{signal_channels, SignalReceivers};
    use crate::metrics::new_shared_metrics;
    use crate::store::{MemoryFeatureSource, MemoryNodeStore};
    use std::time::Duration;

    fn node_feature(ns: &str, name: &str, node: Option<&str>) -> NodeFeature {
        let mut object = NodeFeature::new(
            name,
            NodeFeatureSpec {
                features: Features::new(),
                labels: Default::default(),
            },
        );
        object.metadata.namespace = Some(ns.to_string());
        if let Some(node) = node {
            object.metadata.labels = Some([(NODE_NAME_LABEL.to_string(), node.to_string())].into());
        }
        object
    }

    async fn start(config: MasterConfig) -> (Arc<MemoryFeatureSource>, Arc<NfdMaster>, SignalReceivers, CancellationToken) {
        let source = Arc::new(MemoryFeatureSource::new());
        let master = Arc::new(
            NfdMaster::new(
                Arc::new(MemoryNodeStore::new()),
                source.clone(),
                new_shared_metrics().unwrap(),
                config,
            )
            .unwrap(),
        );
        let (signals, receivers) = signal_channels(16);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_informer(master.clone(), master.subscribe(), signals, shutdown.clone()));
        (source, master, receivers, shutdown)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_node_feature_signals_node_and_groups() {
        let (source, _, mut rx, shutdown) = start(MasterConfig::default()).await;
        source.apply_node_feature(node_feature("nfd", "n1", Some("n1")));
        source.apply_node_feature(node_feature("nfd", "orphan", None));
        settle().await;

        assert_eq!(rx.node.try_recv().ok().as_deref(), Some("n1"));
        assert!(rx.node.try_recv().is_err());
        assert!(rx.all_groups.try_recv().is_ok());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unselected_namespace_is_ignored() {
        let config = MasterConfig {
            watch_namespaces: ["nfd".to_string()].into(),
            ..Default::default()
        };
        let (source, _, mut rx, shutdown) = start(config).await;
        source.apply_node_feature(node_feature("other", "n1", Some("n1")));
        settle().await;

        assert!(rx.node.try_recv().is_err());
        assert!(rx.all_groups.try_recv().is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_last_delete_marks_pending_prune() {
        let (source, master, mut rx, shutdown) = start(MasterConfig::default()).await;
        source.apply_node_feature(node_feature("nfd", "a", Some("n1")));
        source.apply_node_feature(node_feature("nfd", "b", Some("n1")));

        source.delete_node_feature("nfd", "a");
        settle().await;
        assert!(!master.is_pending_prune("n1"));

        source.delete_node_feature("nfd", "b");
        settle().await;
        assert!(master.is_pending_prune("n1"));
        assert_eq!(rx.node.try_recv().ok().as_deref(), Some("n1"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rule_change_updates_all_nodes() {
        let (source, _, mut rx, shutdown) = start(MasterConfig::default()).await;
        source.apply_rule(NodeFeatureRule::new("r", NodeFeatureRuleSpec { rules: vec![] }));
        settle().await;
        assert!(rx.all_nodes.try_recv().is_ok());
        shutdown.cancel();
    }
}
