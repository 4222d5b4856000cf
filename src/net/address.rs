//! Address family, validity and private-network predicates.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Check whether an address belongs to a private network.
///
/// IPv4: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16 and the 169.254.0.0/16
/// link-local block. IPv6: unique-local addresses starting with `0xfd`.
pub fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => v6.octets()[0] == 0xfd,
    }
}

/// Check whether an address is a 4-byte address.
pub fn is_ipv4(addr: &IpAddr) -> bool {
    matches!(addr, IpAddr::V4(_))
}

/// Check whether an address is a 16-byte address.
pub fn is_ipv6(addr: &IpAddr) -> bool {
    matches!(addr, IpAddr::V6(_))
}

/// Convert an IPv4 address to its big-endian integer value.
pub fn ipv4_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

/// Convert a big-endian integer value to an IPv4 address.
pub fn u32_to_ipv4(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

/// Check whether text is a valid IPv4 or IPv6 address.
pub fn is_valid(text: &str) -> bool {
    is_valid_ipv4(text) || is_valid_ipv6(text)
}

/// Check whether text is a dotted-decimal IPv4 address.
///
/// Exactly four decimal octets in `0..=255`. Leading zeros are accepted.
pub fn is_valid_ipv4(text: &str) -> bool {
    let mut octets = 0;
    for part in text.split('.') {
        if octets == 4 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        match part.parse::<u32>() {
            Ok(v) if v <= 255 => octets += 1,
            _ => return false,
        }
    }
    octets == 4
}

/// Check whether text is a valid IPv6 address.
pub fn is_valid_ipv6(text: &str) -> bool {
    text.parse::<Ipv6Addr>().is_ok()
}

/// Check whether text is `address/mask` where the mask is either an address
/// of the same family or a prefix length within the family width.
pub fn is_valid_with_netmask(text: &str) -> bool {
    let Some((addr, mask)) = text.split_once('/') else {
        return false;
    };
    if addr.is_empty() {
        return false;
    }

    if is_valid_ipv4(addr) {
        is_valid_ipv4(mask) || is_mask_length(mask, 32)
    } else if is_valid_ipv6(addr) {
        is_valid_ipv6(mask) || is_mask_length(mask, 128)
    } else {
        false
    }
}

fn is_mask_length(text: &str, max: u32) -> bool {
    !text.is_empty()
        && text.bytes().all(|b| b.is_ascii_digit())
        && text.parse::<u32>().map(|v| v <= max).unwrap_or(false)
}
