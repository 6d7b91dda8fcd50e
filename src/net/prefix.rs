//! IPv4 prefix math used by the address coordinator.

use ipnet::Ipv4Net;

/// The /24 prefix covering a downstream link address.
#[must_use]
pub fn ipv4_prefix_of(address: Ipv4Net) -> Ipv4Net {
    address.trunc()
}

/// Two prefixes conflict iff the shorter one contains the other's base
/// address. Works in both directions regardless of argument order.
#[must_use]
pub fn is_conflict_prefix(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    if b.prefix_len() < a.prefix_len() {
        b.contains(&a.network())
    } else {
        a.contains(&b.network())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn conflict_is_symmetric_over_containment() {
        let wide = net("10.0.0.0/8");
        let narrow = net("10.1.2.0/24");
        assert!(is_conflict_prefix(&wide, &narrow));
        assert!(is_conflict_prefix(&narrow, &wide));
    }

    #[test]
    fn disjoint_prefixes_do_not_conflict() {
        let a = net("192.168.43.0/24");
        let b = net("192.168.44.0/24");
        assert!(!is_conflict_prefix(&a, &b));
        assert!(!is_conflict_prefix(&b, &a));
    }

    #[test]
    fn identical_prefixes_conflict() {
        let a = net("172.16.5.0/24");
        assert!(is_conflict_prefix(&a, &a));
    }

    #[test]
    fn prefix_of_truncates_host_bits() {
        let addr = net("192.168.43.1/24");
        assert_eq!(ipv4_prefix_of(addr), net("192.168.43.0/24"));
    }
}
