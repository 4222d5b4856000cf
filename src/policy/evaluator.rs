//! Policy evaluation: identity, whitelist and quota resolution.

use tracing::debug;

use super::context::RequestContext;
use super::identity::ThrottleIdentity;
use super::rules::ThrottlePolicy;
use crate::error::Result;
use crate::net::AddressRange;
use crate::ratelimit::RateQuota;

/// Decides what throttling applies to a request.
pub trait ThrottleService: Send + Sync {
    /// The fingerprint of the bucket this request is counted against.
    fn compute_identity(&self, ctx: &RequestContext) -> String;

    /// Whether the request bypasses throttling.
    fn is_whitelisted(&self, ctx: &RequestContext) -> bool;

    /// Every configured quota matching the request: IP rules, then
    /// user-agent rules, then path rules, each in configuration order.
    fn applicable_quotas(&self, ctx: &RequestContext) -> Vec<RateQuota>;
}

/// A [`ThrottlePolicy`] with its ranges parsed and its substrings
/// lowercased, ready for matching.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    policy: ThrottlePolicy,
    ip_whitelist: Vec<AddressRange>,
    user_agent_whitelist: Vec<String>,
    path_whitelist: Vec<String>,
    ip_rules: Vec<(AddressRange, RateQuota)>,
    user_agent_rules: Vec<(String, RateQuota)>,
    path_rules: Vec<(String, RateQuota)>,
}

impl PolicyEvaluator {
    /// Compile a policy.
    ///
    /// Fails with a format error if any whitelist entry or IP rule is not a
    /// valid range expression.
    pub fn new(policy: ThrottlePolicy) -> Result<Self> {
        let ip_whitelist = policy
            .ip_whitelist
            .iter()
            .map(|text| AddressRange::parse(text))
            .collect::<Result<Vec<_>>>()?;

        let ip_rules = policy
            .ip_rules
            .iter()
            .map(|(text, quota)| Ok((AddressRange::parse(text)?, *quota)))
            .collect::<Result<Vec<_>>>()?;

        let user_agent_whitelist = lowercase_all(&policy.user_agent_whitelist);
        let path_whitelist = lowercase_all(&policy.path_whitelist);
        let user_agent_rules = lowercase_keys(policy.user_agent_rules.iter());
        let path_rules = lowercase_keys(policy.path_rules.iter());

        debug!(
            ip_whitelist = ip_whitelist.len(),
            ip_rules = ip_rules.len(),
            user_agent_rules = user_agent_rules.len(),
            path_rules = path_rules.len(),
            "Compiled throttle policy"
        );

        Ok(Self {
            policy,
            ip_whitelist,
            user_agent_whitelist,
            path_whitelist,
            ip_rules,
            user_agent_rules,
            path_rules,
        })
    }

    /// The policy this evaluator was compiled from.
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// The identity segments for a request, before hashing.
    pub fn identity(&self, ctx: &RequestContext) -> ThrottleIdentity {
        ThrottleIdentity::new(&self.policy, ctx)
    }
}

impl ThrottleService for PolicyEvaluator {
    fn compute_identity(&self, ctx: &RequestContext) -> String {
        self.identity(ctx).fingerprint()
    }

    fn is_whitelisted(&self, ctx: &RequestContext) -> bool {
        if !self.policy.has_whitelist() {
            return false;
        }

        if self.policy.enable_ip {
            if let Some(range) = self
                .ip_whitelist
                .iter()
                .find(|range| range.contains(&ctx.client_address))
            {
                debug!(client = %ctx.client_address, range = %range, "IP whitelisted");
                return true;
            }
        }

        if self.policy.enable_request_path {
            let path = ctx.path.to_lowercase();
            if self.path_whitelist.iter().any(|white| path.contains(white.as_str())) {
                debug!(path = %ctx.path, "Path whitelisted");
                return true;
            }
        }

        if self.policy.enable_user_agent {
            // Anonymous clients are never whitelisted.
            let Some(user_agent) = ctx.user_agent() else {
                return false;
            };
            let user_agent = user_agent.to_lowercase();
            if self
                .user_agent_whitelist
                .iter()
                .any(|white| user_agent.contains(white.as_str()))
            {
                debug!(user_agent = %user_agent, "User-agent whitelisted");
                return true;
            }
        }

        false
    }

    fn applicable_quotas(&self, ctx: &RequestContext) -> Vec<RateQuota> {
        let mut quotas = Vec::new();

        for (range, quota) in &self.ip_rules {
            if range.contains(&ctx.client_address) {
                debug!(client = %ctx.client_address, range = %range, quota = %quota, "IP rule matched");
                quotas.push(*quota);
            }
        }

        if !self.user_agent_rules.is_empty() {
            if let Some(user_agent) = ctx.user_agent() {
                let user_agent = user_agent.to_lowercase();
                for (needle, quota) in &self.user_agent_rules {
                    if user_agent.contains(needle.as_str()) {
                        debug!(rule = %needle, quota = %quota, "User-agent rule matched");
                        quotas.push(*quota);
                    }
                }
            }
        }

        if !self.path_rules.is_empty() {
            let path = ctx.path.to_lowercase();
            for (needle, quota) in &self.path_rules {
                if path.contains(needle.as_str()) {
                    debug!(rule = %needle, quota = %quota, "Path rule matched");
                    quotas.push(*quota);
                }
            }
        }

        quotas
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn lowercase_keys<'a>(
    rules: impl Iterator<Item = (&'a String, &'a RateQuota)>,
) -> Vec<(String, RateQuota)> {
    rules.map(|(k, q)| (k.to_lowercase(), *q)).collect()
}
