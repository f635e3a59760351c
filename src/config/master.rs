use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::ConfigError;

/// Runtime configuration of the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterConfig {
    /// Compute everything but never write to nodes
    pub no_publish: bool,

    /// Prefix bare output names with the default feature namespace
    pub auto_default_ns: bool,

    /// Additional label namespaces to accept
    pub extra_label_ns: BTreeSet<String>,

    /// Label namespaces to reject; `*.example.com` matches any sub-domain
    pub deny_label_ns: BTreeSet<String>,

    /// Labels promoted to extended resources
    pub resource_labels: BTreeSet<String>,

    pub enable_taints: bool,

    /// Regexp the base name of every label must match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_white_list: Option<String>,

    /// Interval of the full resync of all nodes
    #[serde(with = "duration_str")]
    pub resync_period: Duration,

    /// Number of workers per queue
    pub nfd_api_parallelism: usize,

    pub leader_election: LeaderElectionConfig,

    /// Only NodeFeature objects from these namespaces are used (empty = all)
    pub watch_namespaces: BTreeSet<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            no_publish: false,
            auto_default_ns: true,
            extra_label_ns: BTreeSet::new(),
            deny_label_ns: BTreeSet::new(),
            resource_labels: BTreeSet::new(),
            enable_taints: false,
            label_white_list: None,
            resync_period: Duration::from_secs(60 * 60),
            nfd_api_parallelism: 10,
            leader_election: LeaderElectionConfig::default(),
            watch_namespaces: BTreeSet::new(),
        }
    }
}

impl MasterConfig {
    /// Whether NodeFeature objects from `namespace` should be considered
    pub fn namespace_selected(&self, namespace: &str) -> bool {
        self.watch_namespaces.is_empty() || self.watch_namespaces.contains(namespace)
    }
}

/// Lease timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionConfig {
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,

    #[serde(with = "duration_str")]
    pub renew_deadline: Duration,

    #[serde(with = "duration_str")]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Durations are written the human way: `90s`, `1h 30m`
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Pure parsing and validation
// ============================================================================

/// Parse the file content and deep-merge the inline override on top
pub fn parse_config(file: Option<&str>, options: Option<&str>) -> Result<MasterConfig, ConfigError> {
    let mut merged = match file {
        Some(content) if !content.trim().is_empty() => {
            serde_yaml::from_str::<Value>(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        _ => Value::Mapping(Default::default()),
    };

    if let Some(options) = options.filter(|o| !o.trim().is_empty()) {
        let overlay = serde_yaml::from_str::<Value>(options)
            .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;
        merge_values(&mut merged, overlay);
    }

    // An empty document parses as null
    if merged.is_null() {
        merged = Value::Mapping(Default::default());
    }

    serde_yaml::from_value(merged).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Reject settings the master cannot run with
pub fn validate_config(config: &MasterConfig) -> Result<(), ConfigError> {
    if config.nfd_api_parallelism == 0 {
        return Err(ConfigError::InvalidParallelism);
    }

    if let Some(pattern) = &config.label_white_list {
        Regex::new(pattern).map_err(|e| ConfigError::InvalidWhitelist(pattern.clone(), e.to_string()))?;
    }

    for ns in &config.deny_label_ns {
        let domain = ns.strip_prefix('*').unwrap_or(ns);
        if domain.is_empty() || domain.contains('/') || domain.contains('*') {
            return Err(ConfigError::InvalidDenyNs(ns.clone()));
        }
    }

    if config.resync_period.is_zero() {
        return Err(ConfigError::ZeroDuration("resyncPeriod"));
    }

    let le = &config.leader_election;
    if le.lease_duration.is_zero() {
        return Err(ConfigError::ZeroDuration("leaderElection.leaseDuration"));
    }
    if le.renew_deadline.is_zero() {
        return Err(ConfigError::ZeroDuration("leaderElection.renewDeadline"));
    }
    if le.retry_period.is_zero() {
        return Err(ConfigError::ZeroDuration("leaderElection.retryPeriod"));
    }
    if le.renew_deadline >= le.lease_duration {
        return Err(ConfigError::InvalidLeaderElection(
            "renewDeadline must be less than leaseDuration".to_string(),
        ));
    }
    if le.retry_period >= le.renew_deadline {
        return Err(ConfigError::InvalidLeaderElection(
            "retryPeriod must be less than renewDeadline".to_string(),
        ));
    }

    Ok(())
}

/// Instance names end up in annotation and lease names
pub fn validate_instance_name(instance: &str) -> Result<(), ConfigError> {
    if instance.is_empty() {
        return Ok(());
    }
    let valid = instance.len() <= 63
        && instance
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && instance.starts_with(|c: char| c.is_ascii_alphanumeric())
        && instance.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidInstance(instance.to_string()))
    }
}
