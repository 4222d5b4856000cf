//! Throttle policy configuration.
//!
//! A policy selects which request dimensions take part in identity and
//! matching, lists the requests that bypass throttling, and maps IP ranges,
//! user-agent substrings and path substrings to quotas.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::RateQuota;

/// The throttle policy.
///
/// Rule maps keep document order, which is also the order rules are
/// evaluated in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    /// Client IP participates in identity and the IP whitelist
    pub enable_ip: bool,
    /// User-agent participates in identity and the user-agent whitelist
    pub enable_user_agent: bool,
    /// HTTP method participates in identity
    pub enable_http_method: bool,
    /// Request path participates in identity and the path whitelist
    pub enable_request_path: bool,

    /// IP ranges that bypass throttling
    pub ip_whitelist: Vec<String>,
    /// User-agent substrings that bypass throttling
    pub user_agent_whitelist: Vec<String>,
    /// Path substrings that bypass throttling
    pub path_whitelist: Vec<String>,

    /// IP range -> quota. Rules apply whether or not the dimension is enabled.
    pub ip_rules: IndexMap<String, RateQuota>,
    /// User-agent substring -> quota
    pub user_agent_rules: IndexMap<String, RateQuota>,
    /// Path substring -> quota
    pub path_rules: IndexMap<String, RateQuota>,
}

impl ThrottlePolicy {
    /// Create an empty policy with every dimension disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle policy: {}", e)))
    }

    /// Whether any whitelist has entries.
    pub fn has_whitelist(&self) -> bool {
        !self.ip_whitelist.is_empty()
            || !self.user_agent_whitelist.is_empty()
            || !self.path_whitelist.is_empty()
    }

    /// Total number of configured rules.
    pub fn rule_count(&self) -> usize {
        self.ip_rules.len() + self.user_agent_rules.len() + self.path_rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitPeriod;

    const POLICY_YAML: &str = r#"
enable_ip: true
enable_request_path: true
ip_whitelist:
  - "127.0.0.1"
  - "10.0.0.0/8"
path_whitelist:
  - /health
ip_rules:
  "192.168.0.0/24": { max_rate: 10, max_burst: 5, period: minute }
  "8.8.8.8": { max_rate: 1, max_burst: 1 }
path_rules:
  /api/search: { max_rate: 100, max_burst: 20, period: hour }
  /api: { max_rate: 1000, max_burst: 100, period: day }
"#;

    #[test]
    fn test_parse_policy() {
        let policy = ThrottlePolicy::from_yaml(POLICY_YAML).unwrap();

        assert!(policy.enable_ip);
        assert!(!policy.enable_user_agent);
        assert!(!policy.enable_http_method);
        assert!(policy.enable_request_path);
        assert_eq!(policy.ip_whitelist, vec!["127.0.0.1", "10.0.0.0/8"]);
        assert!(policy.user_agent_whitelist.is_empty());
        assert!(policy.has_whitelist());
        assert_eq!(policy.rule_count(), 4);

        assert_eq!(
            policy.ip_rules["192.168.0.0/24"],
            RateQuota::new(10, 5, RateLimitPeriod::Minute)
        );
        assert_eq!(policy.ip_rules["8.8.8.8"].period, RateLimitPeriod::Second);
    }

    #[test]
    fn test_rule_order_follows_document() {
        let policy = ThrottlePolicy::from_yaml(POLICY_YAML).unwrap();
        let paths: Vec<&str> = policy.path_rules.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["/api/search", "/api"]);
    }

    #[test]
    fn test_empty_policy() {
        let policy = ThrottlePolicy::from_yaml("{}").unwrap();
        assert_eq!(policy, ThrottlePolicy::new());
        assert!(!policy.has_whitelist());
        assert_eq!(policy.rule_count(), 0);
    }

    #[test]
    fn test_invalid_policy() {
        let err = ThrottlePolicy::from_yaml("ip_rules: [1, 2]").unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }
}
