//! Metrics registry for the master
//!
//! All collectors live in one [`MasterMetrics`] object that owns its own
//! prometheus [`Registry`]. It is created once at startup and handed to the
//! reconciler, the worker pool and the HTTP server; tests create their own.

use std::sync::Arc;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Shared handle to the metrics
pub type SharedMetrics = Arc<MasterMetrics>;

/// Counters and histograms exported on `/metrics`
pub struct MasterMetrics {
    registry: Registry,

    pub node_update_requests: IntCounter,
    pub node_updates: IntCounter,
    pub node_update_failures: IntCounter,
    pub group_updates: IntCounter,
    pub labels_rejected: IntCounter,
    pub annotations_rejected: IntCounter,
    pub extended_resources_rejected: IntCounter,
    pub taints_rejected: IntCounter,
    pub rule_processing_errors: IntCounter,
    pub rule_processing_time: HistogramVec,
    build_info: IntGaugeVec,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Clone + Collector + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    register(registry, IntCounter::with_opts(Opts::new(name, help))?)
}

impl MasterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("nfd".to_string()), None)?;

        let rule_processing_time = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "nodefeaturerule_processing_duration_seconds",
                    "Time taken to process one NodeFeatureRule object for one node",
                ),
                &["name", "node"],
            )?,
        )?;

        let build_info = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("master_build_info", "Build information of the master"),
                &["version"],
            )?,
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        Ok(Self {
            node_update_requests: counter(
                &registry,
                "node_update_requests_total",
                "Number of node update requests processed",
            )?,
            node_updates: counter(&registry, "node_updates_total", "Number of nodes updated")?,
            node_update_failures: counter(
                &registry,
                "node_update_failures_total",
                "Number of node updates that failed past the retry threshold",
            )?,
            group_updates: counter(
                &registry,
                "nodefeaturegroup_updates_total",
                "Number of NodeFeatureGroup status updates",
            )?,
            labels_rejected: counter(
                &registry,
                "node_labels_rejected_total",
                "Number of node labels rejected",
            )?,
            annotations_rejected: counter(
                &registry,
                "node_annotations_rejected_total",
                "Number of node annotations rejected",
            )?,
            extended_resources_rejected: counter(
                &registry,
                "node_extendedresources_rejected_total",
                "Number of extended resources rejected",
            )?,
            taints_rejected: counter(
                &registry,
                "node_taints_rejected_total",
                "Number of node taints rejected",
            )?,
            rule_processing_errors: counter(
                &registry,
                "nodefeaturerule_processing_errors_total",
                "Number of errors encountered while processing rules",
            )?,
            rule_processing_time,
            build_info,
            registry,
        })
    }

    /// Record the time spent evaluating one rule object against one node
    pub fn observe_rule_processing(&self, rule_object: &str, node: &str, elapsed: Duration) {
        self.rule_processing_time
            .with_label_values(&[rule_object, node])
            .observe(elapsed.as_secs_f64());
    }

    /// Render all metrics in the prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn build_info(&self) -> &IntGaugeVec {
        &self.build_info
    }
}

/// Create a new shared metrics registry
pub fn new_shared_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(MasterMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = MasterMetrics::new().unwrap();
        let b = MasterMetrics::new().unwrap();

        a.node_updates.inc();

        assert_eq!(a.node_updates.get(), 1);
        assert_eq!(b.node_updates.get(), 0);
    }

    #[test]
    fn test_render_contains_prefixed_names() {
        let metrics = MasterMetrics::new().unwrap();
        metrics.labels_rejected.inc();
        metrics.observe_rule_processing("my-rules", "node-1", Duration::from_millis(3));

        let text = metrics.render();
        assert!(text.contains("nfd_node_labels_rejected_total 1"));
        assert!(text.contains("nfd_nodefeaturerule_processing_duration_seconds"));
        assert!(text.contains("nfd_master_build_info"));
    }
}
