//! Admission decisions for requests.
//!
//! The guard ties the policy evaluator to the rate limiter: it decides
//! whether throttling applies to an endpoint, skips whitelisted requests,
//! and checks every applicable quota against the request's identity.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ThrottleOptions;
use crate::error::Result;
use crate::policy::{PolicyEvaluator, RequestContext, ThrottlePolicy, ThrottleService};
use crate::ratelimit::{RateLimitResult, RateLimitStore, RateLimiter, RateQuota};

/// How an endpoint opts in or out of throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointThrottle {
    /// Never throttled.
    Disabled,
    /// Throttled only when the global filter is on.
    #[default]
    Inherit,
    /// Throttled with this quota when no configured rule applies.
    Quota(RateQuota),
}

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Throttling does not apply to this endpoint.
    Skipped,
    /// The request matched a whitelist.
    Whitelisted,
    /// Every applicable quota admitted the request.
    Allowed {
        identity: String,
        results: Vec<RateLimitResult>,
    },
    /// A quota rejected the request.
    Limited {
        identity: String,
        result: RateLimitResult,
    },
}

impl Admission {
    /// Whether the request should be rejected.
    pub fn is_limited(&self) -> bool {
        matches!(self, Admission::Limited { .. })
    }

    /// The rejecting result, if any.
    pub fn limited_result(&self) -> Option<&RateLimitResult> {
        match self {
            Admission::Limited { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Decides whether requests are admitted.
pub struct ThrottleGuard {
    enable_global_filter: bool,
    service: RwLock<Arc<dyn ThrottleService>>,
    limiter: RateLimiter,
}

impl ThrottleGuard {
    /// Create a guard from options, keeping limiter state in `store`.
    pub fn new(options: &ThrottleOptions, store: Arc<dyn RateLimitStore>) -> Result<Self> {
        let evaluator = options.validate()?;
        Ok(Self::with_service(
            options.enable_global_filter,
            Arc::new(evaluator),
            RateLimiter::new(store),
        ))
    }

    /// Create a guard from its parts.
    pub fn with_service(
        enable_global_filter: bool,
        service: Arc<dyn ThrottleService>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            enable_global_filter,
            service: RwLock::new(service),
            limiter,
        }
    }

    /// Replace the policy. Requests already being checked finish under the
    /// previous one.
    pub fn set_policy(&self, policy: ThrottlePolicy) -> Result<()> {
        let evaluator = PolicyEvaluator::new(policy)?;
        self.set_service(Arc::new(evaluator));
        info!("Throttle policy updated");
        Ok(())
    }

    /// Replace the evaluator.
    pub fn set_service(&self, service: Arc<dyn ThrottleService>) {
        *self.service.write() = service;
    }

    /// The evaluator currently in use.
    pub fn service(&self) -> Arc<dyn ThrottleService> {
        self.service.read().clone()
    }

    /// Check whether a request to an endpoint is admitted.
    ///
    /// Configured quotas matching the request take precedence over the
    /// endpoint's own quota; the endpoint quota is only checked when none of
    /// them was enforced. The first rejection wins.
    pub async fn check(&self, ctx: &RequestContext, endpoint: EndpointThrottle) -> Result<Admission> {
        self.check_quantity(ctx, endpoint, 1).await
    }

    /// Like [`ThrottleGuard::check`], charging `quantity` units per quota.
    pub async fn check_quantity(
        &self,
        ctx: &RequestContext,
        endpoint: EndpointThrottle,
        quantity: u32,
    ) -> Result<Admission> {
        let endpoint_quota = match endpoint {
            EndpointThrottle::Disabled => return Ok(Admission::Skipped),
            EndpointThrottle::Inherit if !self.enable_global_filter => {
                return Ok(Admission::Skipped)
            }
            EndpointThrottle::Inherit => None,
            EndpointThrottle::Quota(quota) => Some(quota),
        };

        let service = self.service();

        if service.is_whitelisted(ctx) {
            return Ok(Admission::Whitelisted);
        }

        let identity = service.compute_identity(ctx);
        let mut results = Vec::new();

        for quota in service.applicable_quotas(ctx) {
            if !quota.is_effective() {
                continue;
            }

            let result = self.limiter.rate_limit(quota, &identity, quantity).await?;
            if result.is_limited() {
                return Ok(self.limited(ctx, identity, result));
            }
            results.push(result);
        }

        if results.is_empty() {
            if let Some(quota) = endpoint_quota.filter(|q| !q.is_none() && q.is_effective()) {
                let result = self.limiter.rate_limit(quota, &identity, quantity).await?;
                if result.is_limited() {
                    return Ok(self.limited(ctx, identity, result));
                }
                results.push(result);
            }
        }

        Ok(Admission::Allowed { identity, results })
    }

    fn limited(&self, ctx: &RequestContext, identity: String, result: RateLimitResult) -> Admission {
        debug!(
            identity = %identity,
            method = %ctx.method,
            path = %ctx.path,
            client = %ctx.client_address,
            result = %result,
            "Request throttled"
        );
        Admission::Limited { identity, result }
    }
}
