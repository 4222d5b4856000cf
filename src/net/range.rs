//! IP range parsing and containment over raw address bytes.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{Result, ThrottleError};

/// Address family of an IP address or range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// 4-byte addresses
    V4,
    /// 16-byte addresses
    V6,
}

impl AddressFamily {
    /// Get the family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Width of an address of this family in bytes.
    pub fn width(&self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }
}

/// Byte-wise primitives over fixed-length address buffers.
pub mod bits {
    use std::cmp::Ordering;

    /// Bitwise complement.
    pub fn not<const N: usize>(a: &[u8; N]) -> [u8; N] {
        let mut out = [0u8; N];
        for (o, x) in out.iter_mut().zip(a) {
            *o = !x;
        }
        out
    }

    /// Bitwise AND.
    pub fn and<const N: usize>(a: &[u8; N], b: &[u8; N]) -> [u8; N] {
        let mut out = [0u8; N];
        for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
            *o = x & y;
        }
        out
    }

    /// Bitwise OR.
    pub fn or<const N: usize>(a: &[u8; N], b: &[u8; N]) -> [u8; N] {
        let mut out = [0u8; N];
        for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
            *o = x | y;
        }
        out
    }

    /// Lexicographic comparison from the most significant byte.
    ///
    /// Stops at the first byte that differs.
    pub fn compare<const N: usize>(a: &[u8; N], b: &[u8; N]) -> Ordering {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.cmp(y))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// `a >= b` under [`compare`].
    pub fn ge<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
        compare(a, b) != Ordering::Less
    }

    /// `a <= b` under [`compare`].
    pub fn le<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
        compare(a, b) != Ordering::Greater
    }

    /// Build a mask with the `prefix_len` most significant bits set.
    ///
    /// Returns `None` if the prefix is wider than the buffer.
    pub fn prefix_mask<const N: usize>(prefix_len: u32) -> Option<[u8; N]> {
        if prefix_len as usize > N * 8 {
            return None;
        }

        let mut mask = [0u8; N];
        for (i, byte) in mask.iter_mut().enumerate() {
            let start = (i * 8) as u32;
            if prefix_len >= start + 8 {
                *byte = 0xff;
            } else if prefix_len > start {
                *byte = 0xff << (8 - (prefix_len - start));
            }
        }
        Some(mask)
    }

    /// Apply a mask to a base address, returning `(base & mask, base | !mask)`.
    pub fn masked_bounds<const N: usize>(base: &[u8; N], mask: &[u8; N]) -> ([u8; N], [u8; N]) {
        let begin = and(base, mask);
        let end = or(&begin, &not(mask));
        (begin, end)
    }
}

/// A contiguous range of addresses of a single family.
///
/// `begin <= end` always holds over the raw byte representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    begin: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    /// Create a range from two bounds of the same family, in either order.
    pub fn new(a: IpAddr, b: IpAddr) -> Result<Self> {
        if AddressFamily::of(&a) != AddressFamily::of(&b) {
            return Err(ThrottleError::Format(format!(
                "Range bounds {} and {} belong to different address families",
                a, b
            )));
        }

        if in_order(&a, &b) {
            Ok(Self { begin: a, end: b })
        } else {
            Ok(Self { begin: b, end: a })
        }
    }

    /// Parse a range from one of the supported textual forms.
    pub fn parse(text: &str) -> Result<Self> {
        let (begin, end) = parse_range(text)?;
        Self::new(begin, end)
    }

    /// The lowest address in the range.
    pub fn begin(&self) -> IpAddr {
        self.begin
    }

    /// The highest address in the range.
    pub fn end(&self) -> IpAddr {
        self.end
    }

    /// The address family of this range.
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.begin)
    }

    /// Check whether an address falls within this range.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        in_range(addr, &self.begin, &self.end)
    }

    /// Check whether two ranges share at least one address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.family() == other.family()
            && in_order(&self.begin, &other.end)
            && in_order(&other.begin, &self.end)
    }
}

impl FromStr for AddressRange {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

/// Parse an IP range expression into its `(begin, end)` bounds.
///
/// Recognized forms, tried in this order:
/// 1. `192.168.0.0/24`, `fe80::/10` (CIDR)
/// 2. `127.0.0.1`, `::1` (single address)
/// 3. `192.168.0.0-192.168.0.255` (explicit range, bounds returned as written)
/// 4. `192.168.0.0/255.255.255.0` (address and netmask)
///
/// Spaces are ignored anywhere in the text.
pub fn parse_range(text: &str) -> Result<(IpAddr, IpAddr)> {
    let text: String = text.chars().filter(|c| *c != ' ').collect();

    if let Some((addr, prefix)) = text.split_once('/') {
        if is_address_text(addr) && !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
            let base = parse_address(addr)?;
            let prefix_len: u32 = prefix
                .parse()
                .map_err(|_| format_error(&text, "prefix length out of range"))?;
            return cidr_bounds(&text, base, prefix_len);
        }
    }

    if is_address_text(&text) {
        let addr = parse_address(&text)?;
        return Ok((addr, addr));
    }

    if let Some((begin, end)) = text.split_once('-') {
        if is_address_text(begin) && is_address_text(end) {
            let begin = parse_address(begin)?;
            let end = parse_address(end)?;
            if AddressFamily::of(&begin) != AddressFamily::of(&end) {
                return Err(format_error(&text, "bounds belong to different address families"));
            }
            return Ok((begin, end));
        }
    }

    if let Some((addr, mask)) = text.split_once('/') {
        if is_address_text(addr) && is_address_text(mask) {
            let base = parse_address(addr)?;
            let mask = parse_address(mask)?;
            return netmask_bounds(&text, base, mask);
        }
    }

    Err(format_error(&text, "unknown IP range string"))
}

/// Check whether `addr` lies within `[begin, end]`.
///
/// Bounds may be given in either order. Returns `false` when the three
/// addresses do not share a family.
pub fn in_range(addr: &IpAddr, begin: &IpAddr, end: &IpAddr) -> bool {
    let (begin, end) = if in_order(begin, end) { (begin, end) } else { (end, begin) };

    match (addr, begin, end) {
        (IpAddr::V4(a), IpAddr::V4(b), IpAddr::V4(e)) => {
            let a = a.octets();
            bits::ge(&a, &b.octets()) && bits::le(&a, &e.octets())
        }
        (IpAddr::V6(a), IpAddr::V6(b), IpAddr::V6(e)) => {
            let a = a.octets();
            bits::ge(&a, &b.octets()) && bits::le(&a, &e.octets())
        }
        _ => false,
    }
}

/// `a <= b` for same-family addresses; `true` across families so callers
/// never swap mismatched bounds.
fn in_order(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => bits::le(&a.octets(), &b.octets()),
        (IpAddr::V6(a), IpAddr::V6(b)) => bits::le(&a.octets(), &b.octets()),
        _ => true,
    }
}

fn cidr_bounds(text: &str, base: IpAddr, prefix_len: u32) -> Result<(IpAddr, IpAddr)> {
    match base {
        IpAddr::V4(addr) => {
            let mask = bits::prefix_mask::<4>(prefix_len)
                .ok_or_else(|| format_error(text, "prefix length exceeds 32 bits"))?;
            let (begin, end) = bits::masked_bounds(&addr.octets(), &mask);
            Ok((IpAddr::from(begin), IpAddr::from(end)))
        }
        IpAddr::V6(addr) => {
            let mask = bits::prefix_mask::<16>(prefix_len)
                .ok_or_else(|| format_error(text, "prefix length exceeds 128 bits"))?;
            let (begin, end) = bits::masked_bounds(&addr.octets(), &mask);
            Ok((IpAddr::from(begin), IpAddr::from(end)))
        }
    }
}

fn netmask_bounds(text: &str, base: IpAddr, mask: IpAddr) -> Result<(IpAddr, IpAddr)> {
    match (base, mask) {
        (IpAddr::V4(addr), IpAddr::V4(mask)) => {
            let (begin, end) = bits::masked_bounds(&addr.octets(), &mask.octets());
            Ok((IpAddr::from(begin), IpAddr::from(end)))
        }
        (IpAddr::V6(addr), IpAddr::V6(mask)) => {
            let (begin, end) = bits::masked_bounds(&addr.octets(), &mask.octets());
            Ok((IpAddr::from(begin), IpAddr::from(end)))
        }
        _ => Err(format_error(text, "netmask family does not match address")),
    }
}

/// Characters allowed in an address token: hex digits, dots and colons.
fn is_address_text(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit() || b == b'.' || b == b':')
}

fn parse_address(s: &str) -> Result<IpAddr> {
    s.parse::<IpAddr>()
        .map_err(|e| ThrottleError::Format(format!("Invalid IP address '{}': {}", s, e)))
}

fn format_error(text: &str, reason: &str) -> ThrottleError {
    ThrottleError::Format(format!("Invalid IP range '{}': {}", text, reason))
}
