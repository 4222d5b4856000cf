//! Dotted-decimal IPv4 pattern matching.
//!
//! Patterns come in three shapes:
//! - `127.0.0.5` exact text match
//! - `127.0.*.*` wildcard octets
//! - `127.0.0.1-127.0.0.255` inclusive range
//!
//! Wildcard patterns decide on the first octet that is not `*`: that octet
//! is compared and the remaining octets are not looked at.

use crate::error::{Result, ThrottleError};

/// Check whether `ip` matches any of `patterns`.
///
/// Returns a format error if a range pattern has a malformed bound.
pub fn ipv4_in_patterns<S: AsRef<str>>(ip: &str, patterns: &[S]) -> Result<bool> {
    let segments: Vec<&str> = ip.split('.').collect();

    for pattern in patterns {
        let pattern = pattern.as_ref();

        if pattern.contains('*') {
            if wildcard_matches(&segments, pattern) {
                return Ok(true);
            }
        } else if let Some((begin, end)) = pattern.split_once('-') {
            if ipv4_between(ip, begin, end)? {
                return Ok(true);
            }
        } else if ip == pattern {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Check whether `ip` lies between two dotted-decimal bounds, in either order.
pub fn ipv4_between(ip: &str, begin: &str, end: &str) -> Result<bool> {
    let ip = dotted_to_u32(ip)?;
    let mut begin = dotted_to_u32(begin)?;
    let mut end = dotted_to_u32(end)?;

    if begin > end {
        std::mem::swap(&mut begin, &mut end);
    }
    Ok(ip >= begin && ip <= end)
}

fn wildcard_matches(segments: &[&str], pattern: &str) -> bool {
    for (i, part) in pattern.split('.').enumerate() {
        if part != "*" {
            return segments.get(i).is_some_and(|s| *s == part);
        }
    }
    true
}

fn dotted_to_u32(text: &str) -> Result<u32> {
    let mut octets = [0u8; 4];
    let mut count = 0;

    for part in text.trim().split('.') {
        if count == 4 {
            return Err(invalid(text));
        }
        octets[count] = part.parse::<u8>().map_err(|_| invalid(text))?;
        count += 1;
    }

    if count != 4 {
        return Err(invalid(text));
    }
    Ok(u32::from_be_bytes(octets))
}

fn invalid(text: &str) -> ThrottleError {
    ThrottleError::Format(format!("IPv4 address '{}' must have four decimal octets", text))
}
