//! Address classification for both IP families.
//!
//! Ranges are parsed from four textual forms (CIDR, single address,
//! `begin-end`, `address/netmask`) and compared over raw big-endian bytes.
//! A separate dotted-decimal matcher handles `*` octet patterns.

mod address;
mod client;
mod range;
mod wildcard;

pub use address::{
    ipv4_to_u32, is_ipv4, is_ipv6, is_private, is_valid, is_valid_ipv4, is_valid_ipv6,
    is_valid_with_netmask, u32_to_ipv4,
};
pub use client::resolve_client_ip;
pub use range::{bits, in_range, parse_range, AddressFamily, AddressRange};
pub use wildcard::{ipv4_between, ipv4_in_patterns};
