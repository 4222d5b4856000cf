//! Client address resolution from forwarding headers.

use std::net::{IpAddr, Ipv4Addr};

use super::address::is_private;

/// Resolve the address a request should be attributed to.
///
/// The first parseable entry of a comma-separated `X-Forwarded-For` value
/// wins; with `filter_private` set, private addresses are skipped. Falls back
/// to the connection's remote address, then to loopback.
pub fn resolve_client_ip(
    remote: Option<IpAddr>,
    forwarded_for: Option<&str>,
    filter_private: bool,
) -> IpAddr {
    let forwarded = forwarded_for
        .into_iter()
        .flat_map(|value| value.split(','))
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .find(|addr| !filter_private || !is_private(addr));

    forwarded
        .or(remote)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_no_forwarding_header() {
        assert_eq!(resolve_client_ip(Some(ip("8.8.8.8")), None, true), ip("8.8.8.8"));
        assert_eq!(resolve_client_ip(None, None, true), ip("127.0.0.1"));
    }

    #[test]
    fn test_first_forwarded_address_wins() {
        let resolved = resolve_client_ip(Some(ip("10.0.0.1")), Some("1.1.1.1, 2.2.2.2"), false);
        assert_eq!(resolved, ip("1.1.1.1"));
    }

    #[test]
    fn test_private_forwarded_addresses_filtered() {
        let header = Some("192.168.1.10, 10.0.0.3, 203.0.113.7");
        assert_eq!(resolve_client_ip(Some(ip("10.0.0.1")), header, true), ip("203.0.113.7"));
        assert_eq!(resolve_client_ip(Some(ip("10.0.0.1")), header, false), ip("192.168.1.10"));
    }

    #[test]
    fn test_unparseable_entries_fall_back_to_remote() {
        let resolved = resolve_client_ip(Some(ip("8.8.4.4")), Some("unknown, garbage"), true);
        assert_eq!(resolved, ip("8.8.4.4"));

        let resolved = resolve_client_ip(Some(ip("8.8.4.4")), Some("10.1.1.1"), true);
        assert_eq!(resolved, ip("8.8.4.4"));
    }
}
