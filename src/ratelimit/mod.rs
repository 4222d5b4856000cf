//! Rate limiting logic and state management.

mod clock;
mod distributed;
mod limiter;
mod quota;
mod result;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::MeshStore;
pub use limiter::{RateLimiter, MAX_CAS_ATTEMPTS};
pub use quota::{RateLimitPeriod, RateQuota};
pub use result::{
    format_seconds, RateLimitResult, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_RETRY_AFTER, REJECTION_STATUS,
};
pub use store::{normalize_ttl, MemoryStore, RateLimitStore};
