//! Rate quota and period definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ThrottleError;

/// Period over which a quota's rate is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPeriod {
    /// Per-second rate limiting
    #[default]
    #[serde(alias = "sec")]
    Second,
    /// Per-minute rate limiting
    #[serde(alias = "min")]
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Per-week rate limiting
    Week,
}

impl RateLimitPeriod {
    /// Get the duration of this period.
    pub fn duration(&self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(3600),
            RateLimitPeriod::Day => Duration::from_secs(86_400),
            RateLimitPeriod::Week => Duration::from_secs(7 * 86_400),
        }
    }

    /// Convert from a numeric period code (1 = second .. 5 = week).
    ///
    /// Unrecognized codes fall back to seconds.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => RateLimitPeriod::Minute,
            3 => RateLimitPeriod::Hour,
            4 => RateLimitPeriod::Day,
            5 => RateLimitPeriod::Week,
            _ => RateLimitPeriod::Second,
        }
    }

    /// Convert to the numeric period code.
    pub fn code(&self) -> i32 {
        match self {
            RateLimitPeriod::Second => 1,
            RateLimitPeriod::Minute => 2,
            RateLimitPeriod::Hour => 3,
            RateLimitPeriod::Day => 4,
            RateLimitPeriod::Week => 5,
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" | "sec" => Ok(RateLimitPeriod::Second),
            "minute" | "min" => Ok(RateLimitPeriod::Minute),
            "hour" => Ok(RateLimitPeriod::Hour),
            "day" => Ok(RateLimitPeriod::Day),
            "week" => Ok(RateLimitPeriod::Week),
            other => Err(ThrottleError::Config(format!("Unknown rate limit period '{}'", other))),
        }
    }
}

/// A configured limit: `max_rate` events per `period`, with up to
/// `max_burst` extra events absorbed as burst capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateQuota {
    /// Maximum events per period
    pub max_rate: i64,
    /// Extra events tolerated in a burst
    pub max_burst: i64,
    /// The period `max_rate` is measured over
    #[serde(default)]
    pub period: RateLimitPeriod,
}

impl RateQuota {
    /// Sentinel meaning "no effective limit". Never passed to the limiter.
    pub const NONE: RateQuota = RateQuota {
        max_rate: 0,
        max_burst: 0,
        period: RateLimitPeriod::Second,
    };

    /// Create a new quota.
    pub const fn new(max_rate: i64, max_burst: i64, period: RateLimitPeriod) -> Self {
        Self {
            max_rate,
            max_burst,
            period,
        }
    }

    /// Check whether this is the `NONE` sentinel.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Check whether this quota should be enforced at all.
    ///
    /// Quotas without burst capacity are skipped by callers.
    pub fn is_effective(&self) -> bool {
        self.max_burst > 0
    }
}

impl fmt::Display for RateQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:?} (burst {})",
            self.max_rate, self.period, self.max_burst
        )
    }
}
