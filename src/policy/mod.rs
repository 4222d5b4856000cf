//! Throttle policy: configuration, request snapshot, identity and
//! evaluation.

mod context;
mod evaluator;
mod identity;
mod rules;

pub use context::RequestContext;
pub use evaluator::{PolicyEvaluator, ThrottleService};
pub use identity::ThrottleIdentity;
pub use rules::ThrottlePolicy;
