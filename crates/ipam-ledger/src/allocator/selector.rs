//! Lowest-first free address selection

use crate::address;
use crate::space::SubnetView;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Up to `count` free addresses of the subnet, ascending
///
/// Walks the policy window from its low end, jumping over child ranges and
/// skipping the reserved gateway and every `active` address.
pub(crate) fn lowest_free(view: &SubnetView, active: &BTreeSet<IpAddr>, count: usize) -> Vec<IpAddr> {
    let (lo, hi) = view.window();
    let family = view.family();
    let gateway = view.gateway();
    let children = view.child_bounds();

    let mut out = Vec::with_capacity(count.min(1024));
    let mut next_child = 0;
    let mut cursor = lo;

    while cursor <= hi && out.len() < count {
        while next_child < children.len() && children[next_child].1 < cursor {
            next_child += 1;
        }
        if let Some(&(start, end)) = children.get(next_child) {
            if start <= cursor {
                match end.checked_add(1) {
                    Some(after) => {
                        cursor = after;
                        continue;
                    }
                    None => break,
                }
            }
        }

        let addr = address::from_bits(family, cursor);
        if gateway != Some(addr) && !active.contains(&addr) {
            out.push(addr);
        }

        match cursor.checked_add(1) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::AllocationLedger;
    use crate::models::{AllocationPolicy, SubnetSpec};
    use crate::space::AddressSpace;
    use ipnet::IpNet;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn space() -> AddressSpace {
        AddressSpace::new(Arc::new(AllocationLedger::new(Duration::from_millis(100))))
    }

    #[test]
    fn test_skips_gateway_and_active() {
        let space = space();
        let id = space
            .insert_subnet(
                IpNet::from_str("10.0.0.0/29").unwrap(),
                None,
                SubnetSpec::new("tiny").with_policy(AllocationPolicy::new().reserve_gateway()),
            )
            .unwrap();
        let active: BTreeSet<IpAddr> = [ip("10.0.0.3")].into_iter().collect();

        let free = space
            .with_subnet(id, |view| Ok(lowest_free(view, &active, 10)))
            .unwrap();
        assert_eq!(
            free,
            vec![ip("10.0.0.2"), ip("10.0.0.4"), ip("10.0.0.5"), ip("10.0.0.6")]
        );
    }

    #[test]
    fn test_jumps_over_children() {
        let space = space();
        let id = space
            .insert_subnet(
                IpNet::from_str("10.0.0.0/24").unwrap(),
                None,
                SubnetSpec::new("lan"),
            )
            .unwrap();
        space
            .insert_subnet(
                IpNet::from_str("10.0.0.0/25").unwrap(),
                Some(id),
                SubnetSpec::new("low"),
            )
            .unwrap();

        let free = space
            .with_subnet(id, |view| Ok(lowest_free(view, &BTreeSet::new(), 2)))
            .unwrap();
        assert_eq!(free, vec![ip("10.0.0.128"), ip("10.0.0.129")]);
    }

    #[test]
    fn test_v6_window() {
        let space = space();
        let id = space
            .insert_subnet(
                IpNet::from_str("2001:db8::/64").unwrap(),
                None,
                SubnetSpec::new("v6"),
            )
            .unwrap();
        let free = space
            .with_subnet(id, |view| Ok(lowest_free(view, &BTreeSet::new(), 2)))
            .unwrap();
        assert_eq!(free, vec![ip("2001:db8::1"), ip("2001:db8::2")]);
    }
}
