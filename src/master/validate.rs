//! Output policy and format validation
//!
//! Every label, annotation, extended resource and taint produced for a node
//! passes through here. A rejected item is dropped; nothing in this module
//! aborts a reconciliation.

use std::collections::BTreeSet;

use regex::Regex;
use thiserror::Error;

use crate::apis::{is_feature_ns, split_ns, Taint, TaintEffect, FEATURE_NS, NFD_NS};
use crate::config::{ConfigError, MasterConfig};

/// Why an output item was rejected
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("namespace '{0}' is reserved")]
    ReservedNamespace(String),

    #[error("namespace '{0}' is denied")]
    DeniedNamespace(String),

    #[error("namespace '{0}' is not allowed")]
    NamespaceNotAllowed(String),

    #[error("name has no namespace")]
    MissingNamespace,

    #[error("name '{0}' does not match the label whitelist")]
    NotWhitelisted(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid value '{0}': {1}")]
    InvalidValue(String, String),

    #[error("invalid taint effect '{0}'")]
    InvalidTaintEffect(String),

    #[error("taint key must be in the {} namespace or one of its sub-namespaces", FEATURE_NS)]
    TaintNamespace,
}

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;
const MAX_ANNOTATION_VALUE_LEN: usize = 1024;

// ============================================================================
// Policy compiled from the configuration
// ============================================================================

#[derive(Debug, Clone)]
enum DenyEntry {
    Exact(String),
    Suffix(String),
}

impl DenyEntry {
    fn matches(&self, ns: &str) -> bool {
        match self {
            DenyEntry::Exact(d) => ns == d,
            DenyEntry::Suffix(s) => ns.ends_with(s.as_str()),
        }
    }
}

/// Namespace, whitelist and promotion rules in a ready-to-use form
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    pub auto_default_ns: bool,
    pub enable_taints: bool,
    extra_ns: BTreeSet<String>,
    deny: Vec<DenyEntry>,
    whitelist: Option<Regex>,
    resource_labels: BTreeSet<String>,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            auto_default_ns: true,
            enable_taints: false,
            extra_ns: BTreeSet::new(),
            deny: Vec::new(),
            whitelist: None,
            resource_labels: BTreeSet::new(),
        }
    }
}

impl LabelPolicy {
    pub fn from_config(config: &MasterConfig) -> Result<Self, ConfigError> {
        let whitelist = match &config.label_white_list {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .map_err(|e| ConfigError::InvalidWhitelist(pattern.clone(), e.to_string()))?,
            ),
            None => None,
        };

        let deny = config
            .deny_label_ns
            .iter()
            .map(|ns| match ns.strip_prefix('*') {
                Some(suffix) => DenyEntry::Suffix(suffix.to_string()),
                None => DenyEntry::Exact(ns.clone()),
            })
            .collect();

        Ok(Self {
            auto_default_ns: config.auto_default_ns,
            enable_taints: config.enable_taints,
            extra_ns: config.extra_label_ns.clone(),
            deny,
            whitelist,
            resource_labels: config.resource_labels.clone(),
        })
    }

    /// Check the namespace of a label, annotation or extended resource name
    pub fn check_namespace(&self, name: &str) -> Result<(), ValidationError> {
        let (ns, _) = split_ns(name);

        if ns == NFD_NS || ns.ends_with(&format!(".{}", NFD_NS)) {
            return Err(ValidationError::ReservedNamespace(ns.to_string()));
        }
        if is_feature_ns(ns) {
            return Ok(());
        }
        if ns.is_empty() {
            return Err(ValidationError::MissingNamespace);
        }
        if self.deny.iter().any(|d| d.matches(ns)) {
            return Err(ValidationError::DeniedNamespace(ns.to_string()));
        }
        if self.extra_ns.contains(ns) {
            return Ok(());
        }
        Err(ValidationError::NamespaceNotAllowed(ns.to_string()))
    }

    /// Check the base name of a label against the whitelist
    pub fn check_whitelist(&self, name: &str) -> Result<(), ValidationError> {
        let (_, base) = split_ns(name);
        match &self.whitelist {
            Some(re) if !re.is_match(base) => Err(ValidationError::NotWhitelisted(name.to_string())),
            _ => Ok(()),
        }
    }

    /// Whether a (qualified) label is nominated to become an extended resource.
    ///
    /// Configured entries without a namespace refer to the default one.
    pub fn is_resource_label(&self, name: &str) -> bool {
        if self.resource_labels.contains(name) {
            return true;
        }
        let (ns, base) = split_ns(name);
        ns == FEATURE_NS && self.resource_labels.contains(base)
    }
}

// ============================================================================
// Format validation
// ============================================================================

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// `([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]`, at most 63 characters
fn check_name_part(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name part must not be empty".to_string());
    }
    if s.len() > MAX_NAME_LEN {
        return Err(format!("name part must be at most {} characters", MAX_NAME_LEN));
    }
    let alnum_ends = s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !alnum_ends || !s.chars().all(is_name_char) {
        return Err(format!(
            "'{}' must consist of alphanumerics, '-', '_' or '.' and start and end with an alphanumeric",
            s
        ));
    }
    Ok(())
}

/// A lowercase DNS subdomain
fn check_prefix(s: &str) -> Result<(), String> {
    if s.len() > MAX_PREFIX_LEN {
        return Err(format!("prefix must be at most {} characters", MAX_PREFIX_LEN));
    }
    for label in s.split('.') {
        let ok = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !ok {
            return Err(format!("prefix '{}' is not a valid DNS subdomain", s));
        }
    }
    Ok(())
}

/// Validate a `[prefix/]name` key
pub fn validate_qualified_name(name: &str) -> Result<(), ValidationError> {
    let (prefix, base) = split_ns(name);
    if name.contains('/') {
        check_prefix(prefix).map_err(ValidationError::InvalidName)?;
    }
    check_name_part(base).map_err(ValidationError::InvalidName)
}

pub fn validate_label_value(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    check_name_part(value).map_err(|e| ValidationError::InvalidValue(value.to_string(), e))
}

pub fn validate_annotation_value(value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_ANNOTATION_VALUE_LEN {
        return Err(ValidationError::InvalidValue(
            format!("<{} bytes>", value.len()),
            format!("must be at most {} characters", MAX_ANNOTATION_VALUE_LEN),
        ));
    }
    Ok(())
}

/// Extended resource values are plain non-negative integers
pub fn validate_extended_resource_value(value: &str) -> Result<u64, ValidationError> {
    value.trim().parse::<u64>().map_err(|_| {
        ValidationError::InvalidValue(value.to_string(), "must be a non-negative integer".to_string())
    })
}

pub fn validate_taint(taint: &Taint) -> Result<(), ValidationError> {
    validate_qualified_name(&taint.key)?;
    let (ns, _) = split_ns(&taint.key);
    if !is_feature_ns(ns) {
        return Err(ValidationError::TaintNamespace);
    }
    taint
        .effect
        .parse::<TaintEffect>()
        .map_err(|_| ValidationError::InvalidTaintEffect(taint.effect.clone()))?;
    validate_label_value(&taint.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(extra: &[&str], deny: &[&str]) -> LabelPolicy {
        let config = MasterConfig {
            extra_label_ns: extra.iter().map(|s| s.to_string()).collect(),
            deny_label_ns: deny.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        LabelPolicy::from_config(&config).unwrap()
    }

    #[test]
    fn test_default_namespace_always_allowed() {
        let p = policy(&[], &["feature.node.kubernetes.io", "*.kubernetes.io"]);
        assert!(p.check_namespace("feature.node.kubernetes.io/cpu").is_ok());
        assert!(p.check_namespace("cpu.feature.node.kubernetes.io/avx").is_ok());
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        let p = policy(&["nfd.node.kubernetes.io"], &[]);
        assert!(matches!(
            p.check_namespace("nfd.node.kubernetes.io/feature-labels"),
            Err(ValidationError::ReservedNamespace(_))
        ));
    }

    #[test]
    fn test_foreign_namespace_requires_allow_list() {
        let p = policy(&[], &[]);
        assert!(matches!(
            p.check_namespace("vendor.example.com/gpu"),
            Err(ValidationError::NamespaceNotAllowed(_))
        ));

        let p = policy(&["vendor.example.com"], &[]);
        assert!(p.check_namespace("vendor.example.com/gpu").is_ok());
    }

    #[test]
    fn test_deny_overrides_allow() {
        let p = policy(&["a.denied.example.com"], &["*.denied.example.com"]);
        assert!(matches!(
            p.check_namespace("a.denied.example.com/x"),
            Err(ValidationError::DeniedNamespace(_))
        ));
    }

    #[test]
    fn test_unprefixed_name_rejected() {
        let p = policy(&[], &[]);
        assert_eq!(p.check_namespace("bare"), Err(ValidationError::MissingNamespace));
    }

    #[test]
    fn test_whitelist_matches_base_name() {
        let config = MasterConfig {
            label_white_list: Some("^cpu-".to_string()),
            ..Default::default()
        };
        let p = LabelPolicy::from_config(&config).unwrap();
        assert!(p.check_whitelist("feature.node.kubernetes.io/cpu-avx").is_ok());
        assert!(p.check_whitelist("feature.node.kubernetes.io/gpu").is_err());
    }

    #[test]
    fn test_resource_label_lookup() {
        let config = MasterConfig {
            resource_labels: ["widgets", "vendor/gadgets"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let p = LabelPolicy::from_config(&config).unwrap();
        assert!(p.is_resource_label("feature.node.kubernetes.io/widgets"));
        assert!(p.is_resource_label("vendor/gadgets"));
        assert!(!p.is_resource_label("vendor/widgets"));
    }

    #[test]
    fn test_qualified_name() {
        assert!(validate_qualified_name("feature.node.kubernetes.io/cpu-cpuid.AVX2").is_ok());
        assert!(validate_qualified_name("Upper.example.com/x").is_err());
        assert!(validate_qualified_name("example.com/-bad").is_err());
        assert!(validate_qualified_name(&format!("example.com/{}", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_label_value() {
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("true").is_ok());
        assert!(validate_label_value("6.1.0-rc1").is_ok());
        assert!(validate_label_value("has space").is_err());
    }

    #[test]
    fn test_annotation_value_length() {
        assert!(validate_annotation_value("any value, with spaces").is_ok());
        assert!(validate_annotation_value(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn test_extended_resource_value() {
        assert_eq!(validate_extended_resource_value("3").unwrap(), 3);
        assert!(validate_extended_resource_value("-1").is_err());
        assert!(validate_extended_resource_value("many").is_err());
    }

    #[test]
    fn test_taint_validation() {
        let ok = Taint::new("feature.node.kubernetes.io/gpu", "true", TaintEffect::NoSchedule);
        assert!(validate_taint(&ok).is_ok());

        let foreign = Taint::new("example.com/gpu", "true", TaintEffect::NoSchedule);
        assert_eq!(validate_taint(&foreign), Err(ValidationError::TaintNamespace));

        let mut bad_effect = ok.clone();
        bad_effect.effect = "Sometimes".to_string();
        assert!(matches!(
            validate_taint(&bad_effect),
            Err(ValidationError::InvalidTaintEffect(_))
        ));
    }
}
