//! IPv4 downstream address coordinator
//!
//! Tethering downstream addresses may conflict with addresses assigned by
//! upstream networks. The coordinator records every upstream IPv4 prefix
//! and hands out free /24s to downstream interfaces.
//!
//! Not thread-safe; lives on the tethering event loop like everything
//! else that mutates tethering state.

use std::collections::HashMap;

use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::ipserver::ServerId;
use crate::net::prefix::{ipv4_prefix_of, is_conflict_prefix};
use crate::net::{
    ConnectivityScope, DownstreamType, LinkProperties, Network, NetworkCapabilities, Transport,
};

/// Downstream prefixes are always /24.
pub const PREFIX_LENGTH: u8 = 24;

/// Dedicated address for Wi-Fi Direct group owners.
pub const WIFI_P2P_IFACE_ADDRESS: &str = "192.168.49.1/24";

/// Default address for Bluetooth PAN.
pub const BLUETOOTH_IFACE_ADDRESS: &str = "192.168.44.1/24";

/// Attempts per pool before falling through to the next one.
const CANDIDATES_PER_POOL: u32 = 20;

/// Sticky-address cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AddressKey {
    tethering_type: DownstreamType,
    scope: ConnectivityScope,
}

/// Allocates downstream IPv4 prefixes and detects conflicts against
/// upstream prefixes and other downstreams.
///
/// Upstream records deliberately survive tethering teardown: when
/// tethering restarts, a downstream address may be requested before the
/// first upstream notification arrives, and a stale-but-recent record is
/// better than none. Deprecated records are dropped on orchestrator start
/// via [`maybe_remove_deprecated_upstreams`].
///
/// [`maybe_remove_deprecated_upstreams`]: PrivateAddressCoordinator::maybe_remove_deprecated_upstreams
pub struct PrivateAddressCoordinator {
    downstreams: HashMap<ServerId, Ipv4Net>,
    upstream_prefixes: HashMap<Network, Vec<Ipv4Net>>,
    /// Sticky reservations per (type, scope), kept across release so the
    /// same prefix is reused when no conflict is present.
    cached_addresses: HashMap<AddressKey, Ipv4Net>,
    /// Pool walk order; index 0 is the least likely random start.
    pools: [Ipv4Net; 3],
    rng: StdRng,
    random_prefix_base: bool,
    wifi_p2p_dedicated_ip: bool,
}

impl PrivateAddressCoordinator {
    #[must_use]
    pub fn new(random_prefix_base: bool, wifi_p2p_dedicated_ip: bool) -> Self {
        Self::with_rng(random_prefix_base, wifi_p2p_dedicated_ip, StdRng::from_entropy())
    }

    /// Constructor with caller-provided RNG, used by tests for
    /// deterministic selection.
    #[must_use]
    pub fn with_rng(random_prefix_base: bool, wifi_p2p_dedicated_ip: bool, rng: StdRng) -> Self {
        let mut cached_addresses = HashMap::new();
        // Reserved static addresses for bluetooth and wifi p2p.
        cached_addresses.insert(
            AddressKey {
                tethering_type: DownstreamType::Bluetooth,
                scope: ConnectivityScope::Global,
            },
            BLUETOOTH_IFACE_ADDRESS.parse().expect("valid literal"),
        );
        cached_addresses.insert(
            AddressKey {
                tethering_type: DownstreamType::WifiP2p,
                scope: ConnectivityScope::Local,
            },
            WIFI_P2P_IFACE_ADDRESS.parse().expect("valid literal"),
        );

        Self {
            downstreams: HashMap::new(),
            upstream_prefixes: HashMap::new(),
            cached_addresses,
            pools: [
                "192.168.0.0/16".parse().expect("valid literal"),
                "172.16.0.0/12".parse().expect("valid literal"),
                "10.0.0.0/8".parse().expect("valid literal"),
            ],
            rng,
            random_prefix_base,
            wifi_p2p_dedicated_ip,
        }
    }

    /// Pick an available address and mark its prefix in use for `server`.
    ///
    /// Returns `None` when every pool is exhausted; the caller reports
    /// `NoAddressAvailable` and backs off.
    pub fn request_downstream_address(
        &mut self,
        server: ServerId,
        tethering_type: DownstreamType,
        scope: ConnectivityScope,
        use_last: bool,
    ) -> Option<Ipv4Net> {
        if self.wifi_p2p_dedicated_ip && tethering_type == DownstreamType::WifiP2p {
            return Some(WIFI_P2P_IFACE_ADDRESS.parse().expect("valid literal"));
        }

        let key = AddressKey {
            tethering_type,
            scope,
        };
        // At most one downstream per (type, scope) is active, so the
        // cached reservation is free whenever it does not conflict with
        // an upstream.
        if use_last {
            if let Some(cached) = self.cached_addresses.get(&key).copied() {
                if self.conflict_with_upstream(&ipv4_prefix_of(cached)).is_none() {
                    self.downstreams.insert(server, cached);
                    return Some(cached);
                }
            }
        }

        let start = self.random_pool_index();
        for i in 0..self.pools.len() {
            let pool = self.pools[(start + i) % self.pools.len()];
            if let Some(address) = self.choose_downstream_address(pool) {
                self.downstreams.insert(server, address);
                self.cached_addresses.insert(key, address);
                return Some(address);
            }
        }

        warn!("no downstream address available for {tethering_type}");
        None
    }

    /// Release the active record for `server`. The sticky cache entry is
    /// kept for the next `use_last` request.
    pub fn release_downstream(&mut self, server: ServerId) {
        self.downstreams.remove(&server);
    }

    /// Record a new upstream prefix list, replacing any previous record
    /// for the network. Returns the downstreams whose prefix now
    /// conflicts; the caller notifies each of them.
    ///
    /// VPNs are not usable as tethering upstreams, so a VPN update clears
    /// the record instead.
    pub fn update_upstream_prefix(
        &mut self,
        link_properties: &LinkProperties,
        capabilities: &NetworkCapabilities,
        network: Network,
    ) -> Vec<ServerId> {
        if capabilities.has_transport(Transport::Vpn) {
            self.remove_upstream_prefix(network);
            return Vec::new();
        }

        let prefixes: Vec<Ipv4Net> = link_properties
            .ipv4_addresses()
            .into_iter()
            .map(ipv4_prefix_of)
            .collect();
        if prefixes.is_empty() {
            self.remove_upstream_prefix(network);
            return Vec::new();
        }

        debug!("upstream {network} prefixes: {prefixes:?}");
        self.upstream_prefixes.insert(network, prefixes.clone());

        let mut conflicted: Vec<ServerId> = self
            .downstreams
            .iter()
            .filter(|(_, address)| {
                let target = ipv4_prefix_of(**address);
                prefixes.iter().any(|p| is_conflict_prefix(p, &target))
            })
            .map(|(id, _)| *id)
            .collect();
        conflicted.sort_unstable();
        conflicted
    }

    /// Drop the prefix record for a lost network.
    pub fn remove_upstream_prefix(&mut self, network: Network) {
        self.upstream_prefixes.remove(&network);
    }

    /// Drop records for networks that no longer exist. Called when the
    /// orchestrator starts serving and has a fresh all-networks snapshot.
    pub fn maybe_remove_deprecated_upstreams(&mut self, all_networks: &[Network]) {
        self.upstream_prefixes
            .retain(|network, _| all_networks.contains(network));
    }

    /// Forget all upstream prefixes.
    pub fn clear_upstream_prefixes(&mut self) {
        self.upstream_prefixes.clear();
    }

    /// The active prefix held by `server`, if any.
    #[must_use]
    pub fn downstream_address(&self, server: ServerId) -> Option<Ipv4Net> {
        self.downstreams.get(&server).copied()
    }

    /// Weighted random pool start index. /8 covers roughly 2^4 times the
    /// space of /12, and /12 2^4 times /16, so 24 random bits map as:
    /// value > 0xFFFFF (93.7%) -> 10.0.0.0/8, value > 0xFFFF (5.86%) ->
    /// 172.16.0.0/12, else (0.39%) -> 192.168.0.0/16.
    fn random_pool_index(&mut self) -> usize {
        if !self.random_prefix_base {
            return 0;
        }

        let random = self.rng.gen::<u32>() & 0x00ff_ffff;
        if random > 0xf_ffff {
            2
        } else if random > 0xffff {
            1
        } else {
            0
        }
    }

    /// Try up to 20 random /24 candidates inside `pool`; `None` means the
    /// caller should move on to the next pool.
    fn choose_downstream_address(&mut self, pool: Ipv4Net) -> Option<Ipv4Net> {
        let pool_mask = u32::from(pool.netmask());
        let base = u32::from(pool.network());

        for _ in 0..CANDIDATES_PER_POOL {
            let suffix = self.rng.gen::<u32>() & !pool_mask;
            let candidate = base | suffix;

            if !is_valid_candidate(candidate) {
                continue;
            }

            let address = Ipv4Net::new(candidate.into(), PREFIX_LENGTH).expect("/24 is valid");
            if self.conflict_prefix(&ipv4_prefix_of(address)).is_some() {
                continue;
            }
            return Some(address);
        }
        None
    }

    fn conflict_prefix(&self, prefix: &Ipv4Net) -> Option<Ipv4Net> {
        self.conflict_with_upstream(prefix)
            .or_else(|| self.in_use_downstream_prefix(prefix))
    }

    fn conflict_with_upstream(&self, prefix: &Ipv4Net) -> Option<Ipv4Net> {
        self.upstream_prefixes
            .values()
            .flatten()
            .find(|upstream| is_conflict_prefix(prefix, upstream))
            .copied()
    }

    /// In-use prefixes are the sticky reservations (active, last-used and
    /// static addresses) plus every live downstream prefix.
    fn in_use_downstream_prefix(&self, prefix: &Ipv4Net) -> Option<Ipv4Net> {
        for cached in self.cached_addresses.values() {
            let downstream = ipv4_prefix_of(*cached);
            if is_conflict_prefix(prefix, &downstream) {
                return Some(downstream);
            }
        }
        for address in self.downstreams.values() {
            let downstream = ipv4_prefix_of(*address);
            if is_conflict_prefix(prefix, &downstream) {
                return Some(downstream);
            }
        }
        None
    }
}

/// Static candidate checks, independent of current allocations:
/// x.x.x.{0,1,255} hosts, well-known home subnets and the carrier-grade
/// 10.0.0.0-10.10.255.255 block are never selected.
fn is_valid_candidate(address: u32) -> bool {
    match address & 0xff {
        0 | 1 | 255 => return false,
        _ => {}
    }

    match address & 0xffff_ff00 {
        0xc0a8_0000 | 0xc0a8_0100 | 0xc0a8_5800 | 0xc0a8_6400 => return false,
        _ => {}
    }

    !(0x0a00_0000..=0x0a0a_ffff).contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn seeded(random_prefix_base: bool) -> PrivateAddressCoordinator {
        PrivateAddressCoordinator::with_rng(random_prefix_base, false, StdRng::seed_from_u64(42))
    }

    fn addr(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn lp_with_v4(iface: &str, address: &str) -> LinkProperties {
        let mut lp = LinkProperties::new(iface);
        lp.link_addresses.push(address.parse().unwrap());
        lp
    }

    fn cell_caps() -> NetworkCapabilities {
        NetworkCapabilities::new(
            vec![Transport::Cellular],
            vec![crate::net::NetCapability::Internet, crate::net::NetCapability::NotVpn],
        )
    }

    #[test]
    fn candidate_rejects_reserved_hosts_and_subnets() {
        // Host octets 0, 1, 255.
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(10, 20, 5, 0))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(10, 20, 5, 1))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(10, 20, 5, 255))));

        // Commonly used subnets.
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(192, 168, 0, 5))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(192, 168, 1, 5))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(192, 168, 88, 5))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(192, 168, 100, 5))));

        // 10.0.0.0 - 10.10.255.255 block, boundaries included.
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(10, 0, 0, 5))));
        assert!(!is_valid_candidate(u32::from(Ipv4Addr::new(10, 10, 255, 254))));
        assert!(is_valid_candidate(u32::from(Ipv4Addr::new(10, 11, 0, 5))));

        assert!(is_valid_candidate(u32::from(Ipv4Addr::new(192, 168, 43, 5))));
        assert!(is_valid_candidate(u32::from(Ipv4Addr::new(172, 16, 9, 7))));
    }

    #[test]
    fn allocations_are_pairwise_disjoint() {
        let mut coordinator = seeded(true);
        let mut taken: Vec<Ipv4Net> = Vec::new();

        for i in 0..8 {
            let address = coordinator
                .request_downstream_address(
                    ServerId(i),
                    DownstreamType::Wifi,
                    ConnectivityScope::Global,
                    false,
                )
                .expect("address available");
            assert_eq!(address.prefix_len(), PREFIX_LENGTH);
            let prefix = ipv4_prefix_of(address);
            for other in &taken {
                assert!(!is_conflict_prefix(&prefix, other), "{prefix} vs {other}");
            }
            taken.push(prefix);
        }
    }

    #[test]
    fn sticky_address_reused_when_no_conflict() {
        let mut coordinator = seeded(true);
        let first = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();

        coordinator.release_downstream(ServerId(1));

        let second = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sticky_address_abandoned_on_upstream_conflict() {
        let mut coordinator = seeded(true);
        let first = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();
        coordinator.release_downstream(ServerId(1));

        // Upstream takes the sticky prefix.
        let conflicted = coordinator.update_upstream_prefix(
            &lp_with_v4("rmnet0", &first.to_string()),
            &cell_caps(),
            Network(100),
        );
        assert!(conflicted.is_empty());

        let second = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();
        assert_ne!(ipv4_prefix_of(first), ipv4_prefix_of(second));
    }

    #[test]
    fn bluetooth_default_is_reserved_address() {
        let mut coordinator = seeded(true);
        let address = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Bluetooth,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();
        assert_eq!(address, addr(BLUETOOTH_IFACE_ADDRESS));
    }

    #[test]
    fn p2p_dedicated_ip_policy() {
        let mut with_policy =
            PrivateAddressCoordinator::with_rng(true, true, StdRng::seed_from_u64(7));
        let address = with_policy
            .request_downstream_address(
                ServerId(1),
                DownstreamType::WifiP2p,
                ConnectivityScope::Local,
                false,
            )
            .unwrap();
        assert_eq!(address, addr(WIFI_P2P_IFACE_ADDRESS));

        // Policy off, use_last still returns the seeded reservation.
        let mut without_policy = seeded(true);
        let address = without_policy
            .request_downstream_address(
                ServerId(1),
                DownstreamType::WifiP2p,
                ConnectivityScope::Local,
                true,
            )
            .unwrap();
        assert_eq!(address, addr(WIFI_P2P_IFACE_ADDRESS));
    }

    #[test]
    fn upstream_conflict_notifies_downstream() {
        let mut coordinator = seeded(true);
        let address = coordinator
            .request_downstream_address(
                ServerId(3),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                false,
            )
            .unwrap();

        // Upstream arrives with an address inside the downstream's /24.
        let upstream_addr = Ipv4Net::new(address.addr(), 24).unwrap();
        let conflicted = coordinator.update_upstream_prefix(
            &lp_with_v4("rmnet0", &upstream_addr.to_string()),
            &cell_caps(),
            Network(101),
        );
        assert_eq!(conflicted, vec![ServerId(3)]);

        // Re-request must avoid the conflicted prefix now.
        coordinator.release_downstream(ServerId(3));
        let fresh = coordinator
            .request_downstream_address(
                ServerId(3),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                true,
            )
            .unwrap();
        assert!(!is_conflict_prefix(&ipv4_prefix_of(fresh), &ipv4_prefix_of(address)));
    }

    #[test]
    fn vpn_upstream_is_ignored() {
        let mut coordinator = seeded(true);
        coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                false,
            )
            .unwrap();

        let address = coordinator.downstream_address(ServerId(1)).unwrap();
        let vpn_caps = NetworkCapabilities::new(vec![Transport::Vpn], vec![]);
        let conflicted = coordinator.update_upstream_prefix(
            &lp_with_v4("tun0", &address.to_string()),
            &vpn_caps,
            Network(200),
        );
        assert!(conflicted.is_empty());
    }

    #[test]
    fn deprecated_upstreams_removed() {
        let mut coordinator = seeded(true);
        coordinator.update_upstream_prefix(
            &lp_with_v4("rmnet0", "10.20.30.5/24"),
            &cell_caps(),
            Network(1),
        );
        coordinator.update_upstream_prefix(
            &lp_with_v4("wlan1", "172.20.5.9/24"),
            &cell_caps(),
            Network(2),
        );

        coordinator.maybe_remove_deprecated_upstreams(&[Network(2)]);
        assert!(coordinator.upstream_prefixes.contains_key(&Network(2)));
        assert!(!coordinator.upstream_prefixes.contains_key(&Network(1)));
    }

    #[test]
    fn exhausted_pools_return_none() {
        let mut coordinator = seeded(false);
        // Upstreams cover all three pools entirely.
        coordinator.update_upstream_prefix(
            &lp_with_v4("eth0", "10.0.0.1/8"),
            &cell_caps(),
            Network(1),
        );
        coordinator.update_upstream_prefix(
            &lp_with_v4("eth1", "172.16.0.1/12"),
            &cell_caps(),
            Network(2),
        );
        coordinator.update_upstream_prefix(
            &lp_with_v4("eth2", "192.168.0.1/16"),
            &cell_caps(),
            Network(3),
        );

        let result = coordinator.request_downstream_address(
            ServerId(1),
            DownstreamType::Wifi,
            ConnectivityScope::Global,
            false,
        );
        assert!(result.is_none());
    }

    #[test]
    fn pool_walk_falls_through_on_conflicts() {
        let mut coordinator = seeded(false);
        // 192.168/16 and 172.16/12 fully taken; only 10/8 remains.
        coordinator.update_upstream_prefix(
            &lp_with_v4("eth1", "172.16.0.1/12"),
            &cell_caps(),
            Network(2),
        );
        coordinator.update_upstream_prefix(
            &lp_with_v4("eth2", "192.168.0.1/16"),
            &cell_caps(),
            Network(3),
        );

        let address = coordinator
            .request_downstream_address(
                ServerId(1),
                DownstreamType::Wifi,
                ConnectivityScope::Global,
                false,
            )
            .unwrap();
        assert!(addr("10.0.0.0/8").contains(&address.addr()));
    }
}
