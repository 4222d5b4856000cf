//! Throttle identity generation.

use sha1::{Digest, Sha1};

use super::context::RequestContext;
use super::rules::ThrottlePolicy;

const ROOT_SEGMENT: &str = "throttle";
const SEPARATOR: &str = "_";

/// The request attributes a rate limit bucket is keyed by.
///
/// Segments are collected in a fixed order (IP, method, path, user-agent),
/// each only when the policy enables that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleIdentity {
    /// Selected request attributes, in order
    pub segments: Vec<String>,
}

impl ThrottleIdentity {
    /// Collect the identity segments for a request under a policy.
    pub fn new(policy: &ThrottlePolicy, ctx: &RequestContext) -> Self {
        let mut segments = vec![ROOT_SEGMENT.to_string()];

        if policy.enable_ip {
            segments.push(ctx.client_address.to_string());
        }
        if policy.enable_http_method {
            segments.push(ctx.method.clone());
        }
        if policy.enable_request_path {
            segments.push(ctx.path.clone());
        }
        if policy.enable_user_agent {
            segments.push(ctx.user_agent().unwrap_or_default());
        }

        Self { segments }
    }

    /// The plain joined key, useful for logging.
    pub fn to_string_key(&self) -> String {
        self.segments.join(SEPARATOR)
    }

    /// SHA-1 of the joined key, as uppercase hex.
    pub fn fingerprint(&self) -> String {
        let digest = Sha1::digest(self.to_string_key().as_bytes());
        hex::encode_upper(digest)
    }
}

impl std::fmt::Display for ThrottleIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("GET", "/home/index", "10.0.0.1".parse().unwrap())
            .with_user_agent("Mozilla/5.0")
    }

    #[test]
    fn test_root_only() {
        let identity = ThrottleIdentity::new(&ThrottlePolicy::new(), &ctx());
        assert_eq!(identity.to_string_key(), "throttle");
        assert_eq!(identity.fingerprint().len(), 40);
        assert!(identity
            .fingerprint()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digest() {
        // SHA-1("abc") = A9993E364706816ABA3E25717850C26C9CD0D89D
        let identity = ThrottleIdentity {
            segments: vec!["abc".to_string()],
        };
        assert_eq!(identity.fingerprint(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn test_segment_order() {
        let policy = ThrottlePolicy {
            enable_ip: true,
            enable_user_agent: true,
            enable_http_method: true,
            enable_request_path: true,
            ..Default::default()
        };
        let identity = ThrottleIdentity::new(&policy, &ctx());
        assert_eq!(identity.to_string_key(), "throttle_10.0.0.1_GET_/home/index_Mozilla/5.0");
        assert_eq!(identity.to_string(), identity.to_string_key());
    }

    #[test]
    fn test_missing_user_agent_is_empty_segment() {
        let policy = ThrottlePolicy {
            enable_user_agent: true,
            ..Default::default()
        };
        let ctx = RequestContext::new("GET", "/", "10.0.0.1".parse().unwrap());
        assert_eq!(ThrottleIdentity::new(&policy, &ctx).to_string_key(), "throttle_");
    }
}
