//! Direct-report HTTP surface through a real listener
//!
//! The master runs on an ephemeral port with in-memory stores; requests go
//! through the report client and plain reqwest. The TLS tests mint a CA and
//! node certificates with rcgen.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nfd_master::apis::SetLabelsRequest;
use nfd_master::client::{ClientError, ReportClient, ReportClientTrait, TlsFiles};
use nfd_master::config::MasterConfig;
use nfd_master::master::NfdMaster;
use nfd_master::metrics::new_shared_metrics;
use nfd_master::server::{build_tls_acceptor, serve_on, serve_tls_on, ServerState, CLIENT_CN_HEADER};
use nfd_master::store::{MemoryFeatureSource, MemoryNodeStore, NodeRecord};

struct TestServer {
    base_url: String,
    nodes: Arc<MemoryNodeStore>,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

fn test_state(nodes: &Arc<MemoryNodeStore>, verify_node_name: bool) -> ServerState {
    let master = NfdMaster::new(
        nodes.clone(),
        Arc::new(MemoryFeatureSource::new()),
        new_shared_metrics().unwrap(),
        MasterConfig::default(),
    )
    .unwrap();
    ServerState::new(Arc::new(master)).with_node_name_verification(verify_node_name)
}

fn test_nodes() -> Arc<MemoryNodeStore> {
    let nodes = Arc::new(MemoryNodeStore::new());
    nodes.insert(NodeRecord::new("worker-1"));
    nodes.insert(NodeRecord::new("worker-2"));
    nodes
}

impl TestServer {
    async fn start(verify_node_name: bool) -> Self {
        Self::start_with(verify_node_name, false).await
    }

    async fn start_with(verify_node_name: bool, trust_identity_header: bool) -> Self {
        let nodes = test_nodes();
        let state = test_state(&nodes, verify_node_name)
            .with_trusted_identity_header(trust_identity_header);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve_on(listener, state, shutdown.clone()));

        Self {
            base_url: format!("http://{}", addr),
            nodes,
            shutdown,
            handle,
        }
    }

    async fn start_tls(pki: &TestPki) -> Self {
        let nodes = test_nodes();
        let state = test_state(&nodes, true);
        let acceptor = build_tls_acceptor(&pki.server_files()).unwrap().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve_tls_on(listener, acceptor, state, shutdown.clone()));

        Self {
            base_url: format!("https://{}", addr),
            nodes,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn request(node: &str, labels: &[(&str, &str)]) -> SetLabelsRequest {
    SetLabelsRequest {
        node_name: node.to_string(),
        reporter_version: "test".to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_report_client_applies_labels() {
    let server = TestServer::start(false).await;
    let client = ReportClient::new(server.base_url.clone(), &TlsFiles::default()).unwrap();

    client
        .set_labels(&request("worker-1", &[("gpu", "true")]))
        .await
        .unwrap();

    let node = server.nodes.node("worker-1").unwrap();
    assert_eq!(node.labels["feature.node.kubernetes.io/gpu"], "true");
    assert_eq!(node.annotations["nfd.node.kubernetes.io/feature-labels"], "gpu");

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_node_is_reported_back() {
    let server = TestServer::start(false).await;
    let client = ReportClient::new(server.base_url.clone(), &TlsFiles::default()).unwrap();

    let result = client.set_labels(&request("ghost", &[("gpu", "true")])).await;
    assert!(matches!(result, Err(ClientError::Api { status: 404, .. })));

    server.stop().await;
}

// ============================================================================
// Certificates
// ============================================================================

/// A throwaway CA with a server certificate and per-node client certificates
struct TestPki {
    dir: tempfile::TempDir,
    ca_cert: rcgen::Certificate,
    ca_key: rcgen::KeyPair,
}

impl TestPki {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "nfd-test-ca");
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let ca_cert = params.self_signed(&ca_key).unwrap();
        write(dir.path(), "ca.crt", &ca_cert.pem());

        let pki = Self { dir, ca_cert, ca_key };
        pki.issue(
            "server",
            "nfd-master",
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        );
        pki
    }

    fn issue(
        &self,
        file_stem: &str,
        common_name: &str,
        names: Vec<String>,
        usage: rcgen::ExtendedKeyUsagePurpose,
    ) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(names).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        write(self.dir.path(), &format!("{}.crt", file_stem), &cert.pem());
        write(self.dir.path(), &format!("{}.key", file_stem), &key.serialize_pem());
    }

    fn files(&self, file_stem: &str) -> TlsFiles {
        TlsFiles {
            ca_file: Some(self.dir.path().join("ca.crt")),
            cert_file: Some(self.dir.path().join(format!("{}.crt", file_stem))),
            key_file: Some(self.dir.path().join(format!("{}.key", file_stem))),
        }
    }

    fn server_files(&self) -> TlsFiles {
        self.files("server")
    }

    /// Client certificate for `node`, named after it
    fn node_files(&self, node: &str) -> TlsFiles {
        self.issue(
            node,
            node,
            Vec::new(),
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        );
        self.files(node)
    }
}

fn write(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_forwarded_identity_requires_trust() {
    let server = TestServer::start(true).await;
    let http = reqwest::Client::new();
    let url = format!("{}/v1/nodes/worker-1/labels", server.base_url);
    let body = request("worker-1", &[("gpu", "true")]);

    // Anyone can claim to be worker-1 over plain HTTP
    let response = http
        .post(&url)
        .header(CLIENT_CN_HEADER, "worker-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(server.nodes.node("worker-1").unwrap().labels.is_empty());
    assert!(server.nodes.patch_calls().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_identity_must_match_node() {
    let server = TestServer::start_with(true, true).await;
    let http = reqwest::Client::new();
    let url = format!("{}/v1/nodes/worker-1/labels", server.base_url);
    let body = request("worker-1", &[("gpu", "true")]);

    // Another node's identity
    let response = http
        .post(&url)
        .header(CLIENT_CN_HEADER, "worker-2")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(server.nodes.node("worker-1").unwrap().labels.is_empty());
    assert!(server.nodes.patch_calls().await.is_empty());

    // No identity at all
    let response = http.post(&url).json(&body).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = http
        .post(&url)
        .header(CLIENT_CN_HEADER, "worker-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        server.nodes.node("worker-1").unwrap().labels["feature.node.kubernetes.io/gpu"],
        "true"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = TestServer::start(false).await;
    let http = reqwest::Client::new();

    let health = http
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let client = ReportClient::new(server.base_url.clone(), &TlsFiles::default()).unwrap();
    client
        .set_labels(&request("worker-2", &[("cpu", "true")]))
        .await
        .unwrap();

    let metrics = http
        .get(format!("{}/metrics", server.base_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("nfd_node_update_requests_total 1"));
    assert!(metrics.contains("nfd_node_updates_total 1"));

    server.stop().await;
}

#[tokio::test]
async fn test_client_certificate_identity() {
    let pki = TestPki::new();
    let server = TestServer::start_tls(&pki).await;

    // Own certificate
    let worker1 = ReportClient::new(server.base_url.clone(), &pki.node_files("worker-1")).unwrap();
    worker1
        .set_labels(&request("worker-1", &[("gpu", "true")]))
        .await
        .unwrap();
    assert_eq!(
        server.nodes.node("worker-1").unwrap().labels["feature.node.kubernetes.io/gpu"],
        "true"
    );

    // Another node's certificate
    let worker2 = ReportClient::new(server.base_url.clone(), &pki.node_files("worker-2")).unwrap();
    let result = worker2
        .set_labels(&request("worker-1", &[("evil", "true")]))
        .await;
    assert!(matches!(result, Err(ClientError::Api { status: 403, .. })));

    // No certificate, forged header
    let ca = std::fs::read(pki.dir.path().join("ca.crt")).unwrap();
    let http = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(&ca).unwrap())
        .build()
        .unwrap();
    let response = http
        .post(format!("{}/v1/nodes/worker-1/labels", server.base_url))
        .header(CLIENT_CN_HEADER, "worker-1")
        .json(&request("worker-1", &[("evil", "true")]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    // Health needs no certificate
    let health = http
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let labels = server.nodes.node("worker-1").unwrap().labels;
    assert!(!labels.contains_key("feature.node.kubernetes.io/evil"));

    server.stop().await;
}
