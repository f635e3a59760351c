//! # Controller
//!
//! Turns change notifications into node and group updates.
//!
//! ```text
//!  FeatureSource ──► informer ──► UpdateSignals ──► router ──(1s tick)──► pool
//!                                                                        │
//!                                               UpdateHandler ◄── workers┘
//! ```

pub mod informer;
pub mod pool;
pub mod router;

pub use informer::run_informer;
pub use pool::UpdaterPool;
pub use router::EventRouter;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::master::{MasterError, NodeUpdate};

/// Requeue count from which a failing item counts as a chronic failure
pub const CHRONIC_FAILURE_THRESHOLD: u32 = 15;

/// Capacity of each signal channel
pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// The work the pool and router delegate
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn update_node(&self, name: &str) -> Result<NodeUpdate, MasterError>;

    async fn update_group(&self, key: &str) -> Result<NodeUpdate, MasterError>;

    async fn node_names(&self) -> Result<Vec<String>, MasterError>;

    async fn group_keys(&self) -> Result<Vec<String>, MasterError>;
}

/// Sending side of the four router channels
#[derive(Clone)]
pub struct UpdateSignals {
    node: mpsc::Sender<String>,
    all_nodes: mpsc::Sender<()>,
    group: mpsc::Sender<String>,
    all_groups: mpsc::Sender<()>,
}

/// Receiving side of the four router channels
pub struct SignalReceivers {
    pub node: mpsc::Receiver<String>,
    pub all_nodes: mpsc::Receiver<()>,
    pub group: mpsc::Receiver<String>,
    pub all_groups: mpsc::Receiver<()>,
}

pub fn signal_channels(capacity: usize) -> (UpdateSignals, SignalReceivers) {
    let (node_tx, node_rx) = mpsc::channel(capacity);
    let (all_nodes_tx, all_nodes_rx) = mpsc::channel(1);
    let (group_tx, group_rx) = mpsc::channel(capacity);
    let (all_groups_tx, all_groups_rx) = mpsc::channel(1);
    (
        UpdateSignals {
            node: node_tx,
            all_nodes: all_nodes_tx,
            group: group_tx,
            all_groups: all_groups_tx,
        },
        SignalReceivers {
            node: node_rx,
            all_nodes: all_nodes_rx,
            group: group_rx,
            all_groups: all_groups_rx,
        },
    )
}

impl UpdateSignals {
    /// Signal one node; a full channel escalates to all nodes
    pub fn update_node(&self, name: &str) {
        if let Err(mpsc::error::TrySendError::Full(name)) = self.node.try_send(name.to_string()) {
            warn!("Node signal channel full, dropping {} in favour of a full resync", name);
            self.update_all_nodes();
        }
    }

    /// A full channel already carries the signal
    pub fn update_all_nodes(&self) {
        let _ = self.all_nodes.try_send(());
    }

    pub fn update_group(&self, key: &str) {
        if let Err(mpsc::error::TrySendError::Full(key)) = self.group.try_send(key.to_string()) {
            warn!("Group signal channel full, dropping {} in favour of a full resync", key);
            self.update_all_groups();
        }
    }

    pub fn update_all_groups(&self) {
        let _ = self.all_groups.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_node_channel_escalates() {
        let (signals, mut rx) = signal_channels(1);
        signals.update_node("n1");
        signals.update_node("n2");
        signals.update_all_nodes();

        assert_eq!(rx.node.recv().await.as_deref(), Some("n1"));
        assert!(rx.node.try_recv().is_err());
        assert!(rx.all_nodes.try_recv().is_ok());
        assert!(rx.all_nodes.try_recv().is_err());
    }
}
