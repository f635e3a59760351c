//! Worker pool applying node and group updates
//!
//! Each queue gets `parallelism` workers. A failed item is retried with
//! backoff; only items that keep failing past
//! [`CHRONIC_FAILURE_THRESHOLD`](super::CHRONIC_FAILURE_THRESHOLD) retries
//! are reported as failures.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{UpdateHandler, CHRONIC_FAILURE_THRESHOLD};
use crate::master::{MasterError, NodeUpdate};
use crate::metrics::SharedMetrics;
use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Node,
    Group,
}

struct Running {
    nodes: Arc<WorkQueue>,
    groups: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

pub struct UpdaterPool {
    handler: Arc<dyn UpdateHandler>,
    metrics: SharedMetrics,
    running: Mutex<Option<Running>>,
}

impl UpdaterPool {
    pub fn new(handler: Arc<dyn UpdateHandler>, metrics: SharedMetrics) -> Self {
        Self {
            handler,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Start `parallelism` workers per queue; no-op if already running
    pub async fn start(&self, parallelism: usize) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Updater pool already running");
            return;
        }

        let nodes = WorkQueue::new("nodes");
        let groups = WorkQueue::new("groups");
        let mut workers = Vec::with_capacity(parallelism * 2);

        for _ in 0..parallelism {
            workers.push(self.spawn_worker(WorkKind::Node, Arc::clone(&nodes)));
            workers.push(self.spawn_worker(WorkKind::Group, Arc::clone(&groups)));
        }

        info!("Started updater pool with {} workers per queue", parallelism);
        *running = Some(Running {
            nodes,
            groups,
            workers,
        });
    }

    /// Shut the queues down and wait for every worker to exit; no-op if stopped
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.nodes.shutdown().await;
        running.groups.shutdown().await;
        for worker in running.workers {
            if let Err(e) = worker.await {
                error!("Updater worker panicked: {}", e);
            }
        }
        info!("Updater pool stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Queue a node update; dropped when the pool is stopped
    pub async fn enqueue_node(&self, name: &str) {
        if let Some(running) = self.running.lock().await.as_ref() {
            running.nodes.add(name).await;
        }
    }

    pub async fn enqueue_group(&self, key: &str) {
        if let Some(running) = self.running.lock().await.as_ref() {
            running.groups.add(key).await;
        }
    }

    fn spawn_worker(&self, kind: WorkKind, queue: Arc<WorkQueue>) -> JoinHandle<()> {
        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                let result = match kind {
                    WorkKind::Node => handler.update_node(&key).await,
                    WorkKind::Group => handler.update_group(&key).await,
                };
                handle_result(kind, &queue, &key, result, || {
                    if kind == WorkKind::Node {
                        metrics.node_update_failures.inc();
                    }
                });
                queue.done(&key).await;
            }
            debug!("{} worker exiting", queue.name());
        })
    }
}

fn handle_result(
    kind: WorkKind,
    queue: &Arc<WorkQueue>,
    key: &str,
    result: Result<NodeUpdate, MasterError>,
    on_chronic: impl FnOnce(),
) {
    match result {
        Ok(NodeUpdate::NotFound) => {
            debug!("{:?} {} is gone, forgetting", kind, key);
            queue.forget(key);
        }
        Ok(_) => queue.forget(key),
        Err(e) if e.is_not_found() => {
            info!("{:?} {} not found, dropping", kind, key);
            queue.forget(key);
        }
        Err(e) => {
            let requeues = queue.num_requeues(key);
            if requeues < CHRONIC_FAILURE_THRESHOLD {
                info!(
                    "Failed to update {:?} {} (attempt {}), requeueing: {}",
                    kind,
                    key,
                    requeues + 1,
                    e
                );
            } else {
                error!(
                    "Failed to update {:?} {} after {} attempts: {}",
                    kind,
                    key,
                    requeues + 1,
                    e
                );
                on_chronic();
            }
            queue.add_rate_limited(key);
        }
    }
}
