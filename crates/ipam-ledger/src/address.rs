//! Address arithmetic shared by the tree, the ledger and the allocator
//!
//! Both families are mapped onto `u128` so that range walks, gap detection
//! and capacity counts use one code path. IPv4 values occupy the low 32 bits.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

/// Convert an address to its integer value
pub fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(a) as u128,
        IpAddr::V6(a) => u128::from(a),
    }
}

/// Convert an integer value back to an address of the given family
///
/// IPv4 values are truncated to 32 bits.
pub fn from_bits(family: Family, bits: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

/// Inclusive integer bounds of the whole network (network to last address)
pub fn bounds(net: &IpNet) -> (u128, u128) {
    (to_bits(net.network()), to_bits(net.broadcast()))
}

/// Inclusive integer bounds of the usable host addresses
///
/// IPv4 up to /30 drops network and broadcast; /31 and /32 are fully usable.
/// IPv6 up to /126 drops the subnet-router anycast address; /127 and /128
/// are fully usable.
pub fn usable_bounds(net: &IpNet) -> (u128, u128) {
    let (lo, hi) = bounds(net);
    match net {
        IpNet::V4(v4) if v4.prefix_len() <= 30 => (lo + 1, hi - 1),
        IpNet::V6(v6) if v6.prefix_len() <= 126 => (lo + 1, hi),
        _ => (lo, hi),
    }
}

/// Number of usable host addresses
pub fn usable_count(net: &IpNet) -> u128 {
    let (lo, hi) = usable_bounds(net);
    hi - lo + 1
}

/// Whether `addr` is a usable host address of `net`
pub fn is_usable(net: &IpNet, addr: IpAddr) -> bool {
    if Family::of(addr) != Family::of_net(net) {
        return false;
    }
    let (lo, hi) = usable_bounds(net);
    let bits = to_bits(addr);
    bits >= lo && bits <= hi
}

/// Whether `addr` lies anywhere inside `net`
pub fn contains(net: &IpNet, addr: IpAddr) -> bool {
    net.contains(&addr)
}

/// Whether `outer` contains `inner` and is strictly larger
pub fn strictly_contains(outer: &IpNet, inner: &IpNet) -> bool {
    Family::of_net(outer) == Family::of_net(inner)
        && outer.prefix_len() < inner.prefix_len()
        && outer.contains(&inner.network())
}

/// Whether two networks share at least one address
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    if Family::of_net(a) != Family::of_net(b) {
        return false;
    }
    let (alo, ahi) = bounds(a);
    let (blo, bhi) = bounds(b);
    alo <= bhi && blo <= ahi
}

/// Size of the intersection of two inclusive integer ranges
pub fn intersection_len(a: (u128, u128), b: (u128, u128)) -> u128 {
    let lo = a.0.max(b.0);
    let hi = a.1.min(b.1);
    if lo > hi {
        0
    } else {
        hi - lo + 1
    }
}

/// Maximum prefix length for a family
pub fn max_prefix(family: Family) -> u8 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}

/// Number of addresses in a block of the given prefix length, saturating at
/// `u128::MAX` for `::/0`
pub fn block_size(family: Family, prefix_len: u8) -> u128 {
    let host_bits = (max_prefix(family) - prefix_len) as u32;
    if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    }
}

/// Build a network from an integer network address and prefix length
pub fn net_from_bits(family: Family, bits: u128, prefix_len: u8) -> Option<IpNet> {
    IpNet::new(from_bits(family, bits), prefix_len).ok()
}

/// Normalize a MAC address to lowercase colon-separated form
///
/// Accepts `:`, `-` and `.` separated forms. Returns `None` when the input
/// does not contain exactly twelve hex digits.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let lower = digits.to_ascii_lowercase();
    let pairs: Vec<&str> = (0..6).map(|i| &lower[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn net(s: &str) -> IpNet {
        IpNet::from_str(s).unwrap()
    }

    #[test]
    fn test_usable_v4() {
        assert_eq!(usable_count(&net("10.0.0.0/29")), 6);
        assert_eq!(usable_count(&net("10.0.0.0/24")), 254);
        assert_eq!(usable_count(&net("10.0.0.0/31")), 2);
        assert_eq!(usable_count(&net("10.0.0.7/32")), 1);

        let n = net("10.0.0.0/29");
        assert!(!is_usable(&n, "10.0.0.0".parse().unwrap()));
        assert!(is_usable(&n, "10.0.0.1".parse().unwrap()));
        assert!(is_usable(&n, "10.0.0.6".parse().unwrap()));
        assert!(!is_usable(&n, "10.0.0.7".parse().unwrap()));
    }

    #[test]
    fn test_usable_v6() {
        let n = net("2001:db8::/126");
        assert_eq!(usable_count(&n), 3);
        assert!(!is_usable(&n, "2001:db8::".parse().unwrap()));
        assert!(is_usable(&n, "2001:db8::3".parse().unwrap()));

        assert_eq!(usable_count(&net("2001:db8::/64")), (1u128 << 64) - 1);
        assert_eq!(usable_count(&net("2001:db8::/127")), 2);
    }

    #[test]
    fn test_family_mismatch_never_usable() {
        assert!(!is_usable(&net("10.0.0.0/24"), "::a00:1".parse().unwrap()));
    }

    #[test]
    fn test_containment_and_overlap() {
        assert!(strictly_contains(&net("10.0.0.0/16"), &net("10.0.4.0/24")));
        assert!(!strictly_contains(&net("10.0.0.0/24"), &net("10.0.0.0/24")));
        assert!(!strictly_contains(&net("10.0.0.0/24"), &net("10.0.0.0/16")));

        assert!(overlaps(&net("10.0.0.0/24"), &net("10.0.0.128/25")));
        assert!(!overlaps(&net("10.0.0.0/25"), &net("10.0.0.128/25")));
        assert!(!overlaps(&net("10.0.0.0/8"), &net("::/0")));
    }

    #[test]
    fn test_bits_roundtrip_v4() {
        let addr: IpAddr = "192.168.1.77".parse().unwrap();
        assert_eq!(from_bits(Family::V4, to_bits(addr)), addr);
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(Family::V4, 24), 256);
        assert_eq!(block_size(Family::V6, 64), 1u128 << 64);
        assert_eq!(block_size(Family::V6, 0), u128::MAX);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("AA-BB-CC-00-11-22").as_deref(),
            Some("aa:bb:cc:00:11:22")
        );
        assert_eq!(
            normalize_mac("aabb.cc00.1122").as_deref(),
            Some("aa:bb:cc:00:11:22")
        );
        assert_eq!(normalize_mac("not-a-mac"), None);
    }
}
