//! Event router
//!
//! Collects update signals and hands them to the pool once per tick, so a
//! burst of notifications for one node results in a single update. A failed
//! enumeration during an "all" flush leaves the flag set for the next tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SignalReceivers, UpdateHandler, UpdaterPool};

/// Interval between flushes
pub const ROUTER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Pending {
    nodes: BTreeSet<String>,
    all_nodes: bool,
    groups: BTreeSet<String>,
    all_groups: bool,
}

pub struct EventRouter {
    handler: Arc<dyn UpdateHandler>,
    pool: Arc<UpdaterPool>,
    signals: SignalReceivers,
    resync_period: Duration,
    tick: Duration,
}

impl EventRouter {
    pub fn new(
        handler: Arc<dyn UpdateHandler>,
        pool: Arc<UpdaterPool>,
        signals: SignalReceivers,
        resync_period: Duration,
    ) -> Self {
        Self {
            handler,
            pool,
            signals,
            resync_period,
            tick: ROUTER_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Route signals until `shutdown` fires. Everything starts out pending.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut pending = Pending {
            all_nodes: true,
            all_groups: true,
            ..Default::default()
        };

        let mut tick = interval_at(Instant::now() + self.tick, self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Event router started (tick {:?}, resync every {:?})",
            self.tick, self.resync_period
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Event router shutting down");
                    break;
                }
                Some(node) = self.signals.node.recv() => {
                    pending.nodes.insert(node);
                }
                Some(()) = self.signals.all_nodes.recv() => {
                    pending.all_nodes = true;
                }
                Some(group) = self.signals.group.recv() => {
                    pending.groups.insert(group);
                }
                Some(()) = self.signals.all_groups.recv() => {
                    pending.all_groups = true;
                }
                _ = resync.tick() => {
                    debug!("Resync period elapsed, updating all nodes");
                    pending.all_nodes = true;
                }
                _ = tick.tick() => {
                    self.flush(&mut pending).await;
                }
            }
        }
    }

    async fn flush(&self, pending: &mut Pending) {
        if pending.all_nodes {
            match self.handler.node_names().await {
                Ok(names) => {
                    debug!("Queueing all {} nodes", names.len());
                    for name in &names {
                        self.pool.enqueue_node(name).await;
                    }
                    pending.all_nodes = false;
                    pending.nodes.clear();
                }
                Err(e) => warn!("Failed to list nodes, retrying next tick: {}", e),
            }
        } else {
            for name in std::mem::take(&mut pending.nodes) {
                self.pool.enqueue_node(&name).await;
            }
        }

        if pending.all_groups {
            match self.handler.group_keys().await {
                Ok(keys) => {
                    debug!("Queueing all {} groups", keys.len());
                    for key in &keys {
                        self.pool.enqueue_group(key).await;
                    }
                    pending.all_groups = false;
                    pending.groups.clear();
                }
                Err(e) => warn!("Failed to list groups, retrying next tick: {}", e),
            }
        } else {
            for key in std::mem::take(&mut pending.groups) {
                self.pool.enqueue_group(&key).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::signal_channels;
    use crate::master::{MasterError, NodeUpdate};
    use crate::metrics::new_shared_metrics;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        updated: Mutex<Vec<String>>,
        list_fails: AtomicBool,
    }

    #[async_trait]
    impl UpdateHandler for RecordingHandler {
        async fn update_node(&self, name: &str) -> Result<NodeUpdate, MasterError> {
            self.updated.lock().await.push(name.to_string());
            Ok(NodeUpdate::Applied)
        }

        async fn update_group(&self, key: &str) -> Result<NodeUpdate, MasterError> {
            self.updated.lock().await.push(format!("group:{}", key));
            Ok(NodeUpdate::Applied)
        }

        async fn node_names(&self) -> Result<Vec<String>, MasterError> {
            if self.list_fails.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout(Duration::from_secs(1)).into());
            }
            Ok(vec!["n1".to_string(), "n2".to_string()])
        }

        async fn group_keys(&self) -> Result<Vec<String>, MasterError> {
            Ok(vec!["nfd/g".to_string()])
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_initial_flush_and_coalescing() {
        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(UpdaterPool::new(handler.clone(), new_shared_metrics().unwrap()));
        pool.start(1).await;

        let (signals, receivers) = signal_channels(16);
        let router = EventRouter::new(handler.clone(), pool.clone(), receivers, Duration::from_secs(3600))
            .with_tick(Duration::from_millis(50));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(router.run(shutdown.clone()));

        settle().await;
        {
            let mut updated = handler.updated.lock().await;
            updated.sort();
            assert_eq!(*updated, vec!["group:nfd/g", "n1", "n2"]);
            updated.clear();
        }

        for _ in 0..5 {
            signals.update_node("n1");
        }
        settle().await;
        assert_eq!(*handler.updated.lock().await, vec!["n1"]);

        shutdown.cancel();
        task.await.unwrap();
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failed_enumeration_stays_pending() {
        let handler = Arc::new(RecordingHandler::default());
        handler.list_fails.store(true, Ordering::SeqCst);
        let pool = Arc::new(UpdaterPool::new(handler.clone(), new_shared_metrics().unwrap()));
        pool.start(1).await;

        let (_signals, receivers) = signal_channels(16);
        let router = EventRouter::new(handler.clone(), pool.clone(), receivers, Duration::from_secs(3600))
            .with_tick(Duration::from_millis(50));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(router.run(shutdown.clone()));

        settle().await;
        assert_eq!(*handler.updated.lock().await, vec!["group:nfd/g"]);

        handler.list_fails.store(false, Ordering::SeqCst);
        settle().await;
        let mut updated = handler.updated.lock().await.clone();
        updated.sort();
        assert_eq!(updated, vec!["group:nfd/g", "n1", "n2"]);

        shutdown.cancel();
        task.await.unwrap();
        pool.stop().await;
    }
}
