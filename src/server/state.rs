use std::sync::Arc;

use crate::master::NfdMaster;
use crate::metrics::SharedMetrics;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub master: Arc<NfdMaster>,
    pub metrics: SharedMetrics,

    /// Require the client identity to match the reported node name
    pub verify_node_name: bool,

    /// Accept the identity forwarded by a TLS-terminating front end
    pub trust_identity_header: bool,
}

impl ServerState {
    pub fn new(master: Arc<NfdMaster>) -> Self {
        let metrics = Arc::clone(master.metrics());
        Self {
            master,
            metrics,
            verify_node_name: false,
            trust_identity_header: false,
        }
    }

    pub fn with_node_name_verification(mut self, enabled: bool) -> Self {
        self.verify_node_name = enabled;
        self
    }

    pub fn with_trusted_identity_header(mut self, trusted: bool) -> Self {
        self.trust_identity_header = trusted;
        self
    }
}
