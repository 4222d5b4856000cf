//! Outcome of a rate limit decision.

use chrono::Duration;
use std::fmt;

/// Status code a rejection should be reported with.
pub const REJECTION_STATUS: u16 = 429;

/// Header carrying the burst limit.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining capacity.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the seconds until the bucket resets.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Header carrying the seconds until a retry may succeed.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// The result of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitResult {
    /// Whether the request was rejected
    pub limited: bool,
    /// The burst limit (`max_burst + 1`)
    pub max_limit: i64,
    /// Requests left before the limit is hit
    pub remaining: i64,
    /// Time until the limiter returns to its initial state
    pub reset_after: Duration,
    /// Time until the next request will be allowed; negative when not applicable
    pub retry_after: Duration,
}

impl RateLimitResult {
    /// The "not applicable" value for `retry_after`.
    pub fn no_retry() -> Duration {
        Duration::nanoseconds(-1)
    }

    /// Whether the request was rejected.
    pub fn is_limited(&self) -> bool {
        self.limited
    }

    /// The retry hint, if one applies.
    pub fn retry_after_hint(&self) -> Option<Duration> {
        if self.retry_after < Duration::zero() {
            None
        } else {
            Some(self.retry_after)
        }
    }

    /// Project the result onto protocol headers.
    ///
    /// Only non-negative values are emitted; durations are rendered in
    /// (possibly fractional) seconds.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);

        if self.max_limit >= 0 {
            headers.push((HEADER_LIMIT, self.max_limit.to_string()));
        }
        if self.remaining >= 0 {
            headers.push((HEADER_REMAINING, self.remaining.to_string()));
        }
        if self.reset_after >= Duration::zero() {
            headers.push((HEADER_RESET, format_seconds(self.reset_after)));
        }
        if let Some(retry_after) = self.retry_after_hint() {
            headers.push((HEADER_RETRY_AFTER, format_seconds(retry_after)));
        }

        headers
    }
}

impl fmt::Display for RateLimitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Limited:{}, MaxLimit:{}, Remaining:{}, ResetAfter:{}s, RetryAfter:{}s",
            self.limited,
            self.max_limit,
            self.remaining,
            format_seconds(self.reset_after),
            format_seconds(self.retry_after)
        )
    }
}

/// Render a duration as seconds with sub-second precision.
pub fn format_seconds(duration: Duration) -> String {
    match duration.num_nanoseconds() {
        Some(nanos) => (nanos as f64 / 1e9).to_string(),
        None => duration.num_seconds().to_string(),
    }
}
