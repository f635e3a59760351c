//! # Service lifecycle
//!
//! ```text
//!  load config ─► kube client ─► reflectors synced ─► HTTP server
//!                                                        │
//!            lease acquired ◄── leader election ◄────────┘
//!                  │
//!                  ▼
//!   Controller::start ──(config file changed)──► stop / set_config / start
//!                  │
//!    shutdown or lease lost ─► Controller::stop ─► release lease
//! ```
//!
//! The HTTP server runs on every replica; only the lease holder runs the
//! controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    load_config, spawn_config_watcher, validate_config, validate_instance_name, ConfigError,
    MasterConfig, TlsFiles,
};
use crate::controller::{
    run_informer, signal_channels, EventRouter, UpdateHandler, UpdaterPool,
    SIGNAL_CHANNEL_CAPACITY,
};
use crate::leader::kube::lease_name;
use crate::leader::{default_identity, KubeLeaseLock, LeaderElector, LeaderError};
use crate::master::NfdMaster;
use crate::metrics::new_shared_metrics;
use crate::server::{self, build_tls_acceptor, ServerState, TlsError};
use crate::store::{create_client, FeatureSource, KubeFeatureSource, KubeNodeStore, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Leader(#[from] LeaderError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Failed to set up metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server failed: {0}")]
    Server(String),

    #[error("Leader lease lost")]
    LeaseLost,
}

/// Everything `serve` needs
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub config_file: PathBuf,
    pub options: Option<String>,
    pub instance: Option<String>,
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub addr: SocketAddr,
    pub verify_node_name: bool,
    pub tls: TlsFiles,
    pub trust_identity_header: bool,
    pub leader_elect: bool,
    pub config_poll_interval: Duration,
}

// ============================================================================
// Controller: the restartable part
// ============================================================================

struct RunningController {
    token: CancellationToken,
    router: JoinHandle<()>,
    informer: JoinHandle<()>,
}

/// Worker pool, event router and informer of one master
pub struct Controller {
    master: Arc<NfdMaster>,
    pool: Arc<UpdaterPool>,
    tick: Option<Duration>,
    running: Option<RunningController>,
}

impl Controller {
    pub fn new(master: Arc<NfdMaster>) -> Self {
        let handler: Arc<dyn UpdateHandler> = master.clone();
        let pool = Arc::new(UpdaterPool::new(handler, Arc::clone(master.metrics())));
        Self {
            master,
            pool,
            tick: None,
            running: None,
        }
    }

    /// Override the router tick
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start with the master's current configuration. Everything starts out
    /// pending, so all nodes and groups are reconciled once.
    pub async fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let active = self.master.config().await;

        self.pool.start(active.config.nfd_api_parallelism).await;

        let token = CancellationToken::new();
        let (signals, receivers) = signal_channels(SIGNAL_CHANNEL_CAPACITY);
        let handler: Arc<dyn UpdateHandler> = self.master.clone();
        let mut router = EventRouter::new(
            handler,
            Arc::clone(&self.pool),
            receivers,
            active.config.resync_period,
        );
        if let Some(tick) = self.tick {
            router = router.with_tick(tick);
        }

        let router = tokio::spawn(router.run(token.clone()));
        let informer = tokio::spawn(run_informer(
            Arc::clone(&self.master),
            self.master.subscribe(),
            signals,
            token.clone(),
        ));

        info!("Controller started");
        self.running = Some(RunningController {
            token,
            router,
            informer,
        });
    }

    /// Stop the router and informer, then drain the pool
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.token.cancel();
        if let Err(e) = running.router.await {
            warn!("Event router task failed: {}", e);
        }
        if let Err(e) = running.informer.await {
            warn!("Informer task failed: {}", e);
        }
        self.pool.stop().await;
        info!("Controller stopped");
    }

    /// Swap the configuration while stopped. An invalid configuration is
    /// rejected before anything stops.
    pub async fn reload(&mut self, config: MasterConfig) -> Result<(), ConfigError> {
        validate_config(&config)?;
        let was_running = self.is_running();

        self.stop().await;
        let result = self.master.set_config(config).await;
        if was_running {
            self.start().await;
        }
        result
    }
}

// ============================================================================
// Process lifecycle
// ============================================================================

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn server_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) -> ServiceError {
    match result {
        Ok(Ok(())) => ServiceError::Server("stopped unexpectedly".to_string()),
        Ok(Err(e)) => ServiceError::Server(e.to_string()),
        Err(e) => ServiceError::Server(e.to_string()),
    }
}

/// Run the master until `shutdown` fires. Losing the lease is an error.
pub async fn run(options: ServiceOptions, shutdown: CancellationToken) -> Result<(), ServiceError> {
    if let Some(instance) = &options.instance {
        validate_instance_name(instance)?;
    }
    let config = load_config(Some(&options.config_file), options.options.as_deref())?;
    let acceptor = build_tls_acceptor(&options.tls)?;
    if options.verify_node_name && acceptor.is_none() && !options.trust_identity_header {
        return Err(ConfigError::UnverifiableIdentity.into());
    }
    if options.trust_identity_header {
        warn!("Trusting caller identity from the {} header", server::CLIENT_CN_HEADER);
    }
    let metrics = new_shared_metrics()?;
    let client = create_client(options.kubeconfig.as_deref()).await?;

    let root = shutdown.child_token();
    let features = Arc::new(KubeFeatureSource::start(client.clone(), root.clone()));
    info!("Waiting for NodeFeature, NodeFeatureRule and NodeFeatureGroup caches");
    tokio::select! {
        _ = root.cancelled() => return Ok(()),
        synced = features.wait_synced() => synced?,
    }

    let master = Arc::new(
        NfdMaster::new(
            Arc::new(KubeNodeStore::new(client.clone())),
            features,
            metrics,
            config.clone(),
        )?
        .with_namespace(options.namespace.clone())
        .with_instance(options.instance.as_deref()),
    );

    let state = ServerState::new(Arc::clone(&master))
        .with_node_name_verification(options.verify_node_name)
        .with_trusted_identity_header(options.trust_identity_header);
    let mut server = tokio::spawn(server::serve(options.addr, state, acceptor, root.clone()));

    // Cancelled by the renewal task when the lease is lost, and with `root`
    let lost = root.child_token();
    let mut elector = None;
    if options.leader_elect {
        let identity = default_identity()?;
        let lock = Arc::new(KubeLeaseLock::new(
            client,
            &options.namespace,
            lease_name(options.instance.as_deref()),
        ));
        let candidate = Arc::new(LeaderElector::new(lock, identity, config.leader_election.clone()));
        match candidate.acquire(&root).await {
            Ok(()) => {}
            Err(LeaderError::Cancelled) => {
                root.cancel();
                let _ = server.await;
                return Ok(());
            }
            Err(e) => {
                root.cancel();
                return Err(e.into());
            }
        }
        let renewal = Arc::clone(&candidate).spawn_renewal(lost.clone());
        elector = Some((candidate, renewal));
    } else {
        info!("Leader election disabled");
    }

    let mut controller = Controller::new(Arc::clone(&master));
    controller.start().await;

    let mut config_changes = spawn_config_watcher(
        options.config_file.clone(),
        options.config_poll_interval,
        root.clone(),
    );

    let mut server_done = false;
    let result = loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break Ok(()),
            _ = lost.cancelled() => break Err(ServiceError::LeaseLost),
            exit = &mut server => {
                server_done = true;
                break Err(server_exit(exit));
            }
            Some(()) = config_changes.recv() => {
                info!("Reloading configuration from {}", options.config_file.display());
                let reloaded = match load_config(Some(&options.config_file), options.options.as_deref()) {
                    Ok(config) => controller.reload(config).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = reloaded {
                    error!("Keeping the previous configuration: {}", e);
                }
            }
        }
    };

    controller.stop().await;

    if let Some((elector, renewal)) = elector {
        lost.cancel();
        if let Err(e) = renewal.await {
            warn!("Lease renewal task failed: {}", e);
        }
        if result.is_ok() {
            if let Err(e) = elector.release().await {
                warn!("Failed to release lease: {}", e);
            }
        }
    }

    root.cancel();
    if !server_done {
        match server.await {
            Ok(Ok(())) => debug!("HTTP server stopped"),
            Ok(Err(e)) => warn!("HTTP server failed: {}", e),
            Err(e) => warn!("HTTP server task failed: {}", e),
        }
    }

    if let Err(e) = &result {
        error!("Master stopped: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::{NodeFeature, NodeFeatureSpec, NODE_NAME_LABEL};
    use crate::metrics::MasterMetrics;
    use crate::store::{MemoryFeatureSource, MemoryNodeStore, NodeRecord};

    fn node_feature(node: &str, label: &str) -> NodeFeature {
        let mut object = NodeFeature::new(
            node,
            NodeFeatureSpec {
                labels: [(label.to_string(), "true".to_string())].into(),
                ..Default::default()
            },
        );
        object.metadata.namespace = Some("node-feature-discovery".to_string());
        object.metadata.labels = Some([(NODE_NAME_LABEL.to_string(), node.to_string())].into());
        object
    }

    fn options(dir: &std::path::Path) -> ServiceOptions {
        ServiceOptions {
            config_file: dir.join("nfd-master.conf"),
            options: None,
            instance: None,
            namespace: "node-feature-discovery".to_string(),
            kubeconfig: Some(dir.join("missing-kubeconfig")),
            addr: "127.0.0.1:0".parse().unwrap(),
            verify_node_name: true,
            tls: TlsFiles::default(),
            trust_identity_header: false,
            leader_elect: false,
            config_poll_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_verification_without_identity_source_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(options(dir.path()), CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ServiceError::Config(ConfigError::UnverifiableIdentity))
        ));
    }

    #[tokio::test]
    async fn test_partial_tls_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.tls.cert_file = Some(dir.path().join("tls.crt"));
        let result = run(options, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ServiceError::Tls(TlsError::Config(ConfigError::PartialTls)))
        ));
    }

    async fn wait_for_label(nodes: &MemoryNodeStore, node: &str, label: &str) -> bool {
        for _ in 0..200 {
            if nodes
                .node(node)
                .map(|n| n.labels.contains_key(label))
                .unwrap_or(false)
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn setup() -> (Arc<MemoryNodeStore>, Arc<MemoryFeatureSource>, Arc<NfdMaster>) {
        let nodes = Arc::new(MemoryNodeStore::new());
        let features = Arc::new(MemoryFeatureSource::new());
        let master = Arc::new(
            NfdMaster::new(
                nodes.clone(),
                features.clone(),
                Arc::new(MasterMetrics::new().unwrap()),
                MasterConfig::default(),
            )
            .unwrap(),
        );
        (nodes, features, master)
    }

    #[tokio::test]
    async fn test_controller_reconciles_on_start_and_on_events() {
        let (nodes, features, master) = setup();
        nodes.insert(NodeRecord::new("n1"));
        features.apply_node_feature(node_feature("n1", "first"));

        let mut controller = Controller::new(master).with_tick(Duration::from_millis(20));
        controller.start().await;
        assert!(wait_for_label(&nodes, "n1", "feature.node.kubernetes.io/first").await);

        features.apply_node_feature(node_feature("n1", "second"));
        assert!(wait_for_label(&nodes, "n1", "feature.node.kubernetes.io/second").await);

        controller.stop().await;
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_reload_restarts_with_new_config() {
        let (nodes, features, master) = setup();
        nodes.insert(NodeRecord::new("n1"));

        let mut controller = Controller::new(master.clone()).with_tick(Duration::from_millis(20));
        controller.start().await;

        let config = MasterConfig {
            no_publish: true,
            ..Default::default()
        };
        controller.reload(config).await.unwrap();
        assert!(controller.is_running());
        assert!(master.config().await.config.no_publish);

        features.apply_node_feature(node_feature("n1", "quiet"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(nodes.node("n1").unwrap().labels.is_empty());

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running() {
        let (_, _, master) = setup();
        let mut controller = Controller::new(master.clone()).with_tick(Duration::from_millis(20));
        controller.start().await;

        let config = MasterConfig {
            nfd_api_parallelism: 0,
            ..Default::default()
        };
        assert!(matches!(
            controller.reload(config).await,
            Err(ConfigError::InvalidParallelism)
        ));
        assert!(controller.is_running());
        assert_eq!(master.config().await.config.nfd_api_parallelism, 10);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_, _, master) = setup();
        let mut controller = Controller::new(master);
        controller.stop().await;
        controller.start().await;
        controller.start().await;
        controller.stop().await;
        controller.stop().await;
        assert!(!controller.is_running());
    }
}
