//! CLI module for nfd-master
//!
//! Sub-commands:
//! - `nfd-master serve` - Run the master (leader election, controller, HTTP server)
//! - `nfd-master prune` - Remove everything the master applied from all nodes
//! - `nfd-master dry-run` - Evaluate rule files against a NodeFeature file
//! - `nfd-master report` - Send one direct report to a running master
//! - `nfd-master gc` - Delete NodeFeature and topology objects of deleted nodes

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::master::DEFAULT_NAMESPACE;

/// Default location of the config file
pub const DEFAULT_CONFIG_FILE: &str = "/etc/kubernetes/node-feature-discovery/nfd-master.conf";

#[derive(Parser, Debug)]
#[command(name = "nfd-master")]
#[command(about = "Turn discovered node features into node labels, annotations, extended resources and taints")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the master
    Serve(ServeArgs),

    /// Remove all labels, annotations, extended resources and taints the master applied
    Prune(PruneArgs),

    /// Print what the master would apply to one node, without touching the cluster
    #[command(name = "dry-run")]
    DryRun(DryRunArgs),

    /// Send a direct label report to a running master
    Report(ReportArgs),

    /// Garbage collect objects of deleted nodes
    Gc(GcArgs),
}

/// Configuration shared by the commands that reconcile nodes
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the config file
    #[arg(long, env = "NFD_MASTER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Inline YAML merged over the config file
    #[arg(long, value_name = "YAML")]
    pub options: Option<String>,

    /// Instance name; separates the bookkeeping of independent masters
    #[arg(long, env = "NFD_INSTANCE")]
    pub instance: Option<String>,
}

/// Cluster access
#[derive(Args, Debug, Clone)]
pub struct KubeArgs {
    /// Kubeconfig file (in-cluster config or the default kubeconfig otherwise)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace the master runs in
    #[arg(short, long, env = "POD_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
}

/// Arguments for the serve command
#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub kube: KubeArgs,

    /// Bind address of the HTTP server
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    /// Port of the HTTP server (health, metrics, direct reports)
    #[arg(short, long, env = "NFD_MASTER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Require the client certificate name to match the reported node
    #[arg(long)]
    pub verify_node_name: bool,

    /// CA that signs client certificates; with the two below enables TLS
    #[arg(long, env = "NFD_MASTER_TLS_CA_FILE")]
    pub tls_ca_file: Option<PathBuf>,

    /// Server certificate
    #[arg(long, env = "NFD_MASTER_TLS_CERT_FILE")]
    pub tls_cert_file: Option<PathBuf>,

    /// Server private key
    #[arg(long, env = "NFD_MASTER_TLS_KEY_FILE")]
    pub tls_key_file: Option<PathBuf>,

    /// Take the caller identity from the x-client-cert-cn header set by a
    /// TLS-terminating proxy in front of the master
    #[arg(long)]
    pub trust_identity_header: bool,

    /// Run without leader election (single replica only)
    #[arg(long)]
    pub no_leader_elect: bool,

    /// How often the config file is checked for changes
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub config_poll_interval: Duration,
}

impl ServeArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Arguments for the prune command
#[derive(Args, Debug)]
pub struct PruneArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub kube: KubeArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// Arguments for the dry-run command
#[derive(Args, Debug)]
pub struct DryRunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// NodeFeatureRule files (YAML, several documents per file allowed)
    #[arg(short, long = "rules", required = true, num_args = 1..)]
    pub rules: Vec<PathBuf>,

    /// NodeFeature file (YAML, several documents per file allowed)
    #[arg(short, long)]
    pub features: PathBuf,

    /// Node to evaluate (defaults to the node named in the NodeFeature file)
    #[arg(long)]
    pub node_name: Option<String>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,
}

/// Arguments for the report command
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Master URL
    #[arg(long, env = "NFD_SERVER", default_value = "http://localhost:8080")]
    pub server: String,

    /// Reported node (defaults to the host name)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Label to report (repeatable)
    #[arg(short, long = "label", value_name = "KEY=VALUE", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    /// Features to report (YAML or JSON feature tree)
    #[arg(long)]
    pub features: Option<PathBuf>,

    /// CA certificate of the master
    #[arg(long, env = "NFD_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Client certificate
    #[arg(long, env = "NFD_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// Client key
    #[arg(long, env = "NFD_KEY_FILE")]
    pub key_file: Option<PathBuf>,
}

/// Arguments for the gc command
#[derive(Args, Debug)]
pub struct GcArgs {
    #[command(flatten)]
    pub kube: KubeArgs,

    /// Interval between collections
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    pub interval: Duration,

    /// Collect once and exit
    #[arg(long)]
    pub once: bool,
}

/// Parse `key=value`
pub fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}
