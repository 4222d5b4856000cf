//! Throttle - Request Admission Control
//!
//! This crate decides, per incoming request, whether to allow or reject it
//! based on configurable rate quotas. It combines a GCRA rate limiter running
//! against a pluggable key/value store, an IP range model for both address
//! families, and a policy evaluator that derives a request's throttle
//! identity and the quotas that apply to it.

pub mod config;
pub mod error;
pub mod guard;
pub mod mesh;
pub mod net;
pub mod policy;
pub mod ratelimit;

pub use error::{Result, ThrottleError};
