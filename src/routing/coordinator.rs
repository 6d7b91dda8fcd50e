//! Routing coordinator
//!
//! Single owner of route and interface bookkeeping. Components never talk
//! to netd about routes directly; they go through this coordinator so
//! interface-forward pairs can be torn down reliably and downstream
//! address assignment stays consistent with upstream prefix tracking.

use std::collections::HashSet;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, warn};

use super::netd::NetdService;
use crate::addr::PrivateAddressCoordinator;
use crate::error::ServiceError;
use crate::ipserver::ServerId;
use crate::net::{
    ConnectivityScope, DownstreamType, LinkProperties, Network, NetworkCapabilities, RouteInfo,
};

/// Installs and removes routes and interface-to-network bindings, and
/// fronts the private address coordinator.
pub struct RoutingCoordinator {
    netd: Arc<dyn NetdService>,
    addresses: PrivateAddressCoordinator,
    /// Active (downstream, upstream) forward pairs, so teardown can be
    /// exact and double-adds are refused.
    forwarded_pairs: HashSet<(String, String)>,
}

impl RoutingCoordinator {
    #[must_use]
    pub fn new(netd: Arc<dyn NetdService>, addresses: PrivateAddressCoordinator) -> Self {
        Self {
            netd,
            addresses,
            forwarded_pairs: HashSet::new(),
        }
    }

    // --- Routes and network bindings -------------------------------------

    pub fn add_route(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.netd.route_add(network, route)
    }

    pub fn remove_route(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.netd.route_remove(network, route)
    }

    pub fn update_route(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.netd.route_update(network, route)
    }

    pub fn add_interface_to_network(
        &self,
        network: Network,
        iface: &str,
    ) -> Result<(), ServiceError> {
        self.netd.network_add_interface(network, iface)
    }

    pub fn remove_interface_from_network(
        &self,
        network: Network,
        iface: &str,
    ) -> Result<(), ServiceError> {
        self.netd.network_remove_interface(network, iface)
    }

    /// Set or clear the IPv4 address of a downstream interface.
    pub fn set_interface_config(
        &self,
        iface: &str,
        address: Option<Ipv4Net>,
        up: bool,
    ) -> Result<(), ServiceError> {
        self.netd.interface_set_cfg(iface, address, up)
    }

    /// Add an interface to the tether daemon's forwarding set.
    pub fn tether_interface_add(&self, iface: &str) -> Result<(), ServiceError> {
        self.netd.tether_interface_add(iface)
    }

    pub fn tether_interface_remove(&self, iface: &str) -> Result<(), ServiceError> {
        self.netd.tether_interface_remove(iface)
    }

    // --- Interface forwarding --------------------------------------------

    /// Install a kernel forward pair. Refuses duplicates so teardown
    /// stays balanced.
    pub fn add_interface_forward(&mut self, from: &str, to: &str) -> Result<(), ServiceError> {
        let key = (from.to_string(), to.to_string());
        if self.forwarded_pairs.contains(&key) {
            debug!("forward {from} -> {to} already installed");
            return Ok(());
        }
        self.netd.ipfwd_add_interface_forward(from, to)?;
        self.forwarded_pairs.insert(key);
        Ok(())
    }

    pub fn remove_interface_forward(&mut self, from: &str, to: &str) -> Result<(), ServiceError> {
        let key = (from.to_string(), to.to_string());
        if !self.forwarded_pairs.remove(&key) {
            debug!("forward {from} -> {to} not installed");
            return Ok(());
        }
        self.netd.ipfwd_remove_interface_forward(from, to)
    }

    /// Remove every forward pair originating at `from`. Best effort;
    /// failures are logged and the bookkeeping entry dropped regardless,
    /// since the downstream interface is usually already gone.
    pub fn remove_all_forwards_from(&mut self, from: &str) {
        let pairs: Vec<(String, String)> = self
            .forwarded_pairs
            .iter()
            .filter(|(f, _)| f == from)
            .cloned()
            .collect();
        for (f, t) in pairs {
            if let Err(e) = self.netd.ipfwd_remove_interface_forward(&f, &t) {
                warn!("failed to remove forward {f} -> {t}: {e}");
            }
            self.forwarded_pairs.remove(&(f, t));
        }
    }

    /// Current forward pairs originating at `from`.
    #[must_use]
    pub fn forwards_from(&self, from: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .forwarded_pairs
            .iter()
            .filter(|(f, _)| f == from)
            .map(|(_, t)| t.clone())
            .collect();
        targets.sort_unstable();
        targets
    }

    // --- Upstream prefix tracking ----------------------------------------

    /// Record upstream prefixes; returns downstreams that now conflict.
    pub fn update_upstream_prefix(
        &mut self,
        link_properties: &LinkProperties,
        capabilities: &NetworkCapabilities,
        network: Network,
    ) -> Vec<ServerId> {
        self.addresses
            .update_upstream_prefix(link_properties, capabilities, network)
    }

    pub fn remove_upstream_prefix(&mut self, network: Network) {
        self.addresses.remove_upstream_prefix(network);
    }

    pub fn maybe_remove_deprecated_upstreams(&mut self, all_networks: &[Network]) {
        self.addresses.maybe_remove_deprecated_upstreams(all_networks);
    }

    // --- Downstream addressing -------------------------------------------

    /// Request the cached address for (type, scope) when it is still
    /// conflict-free, otherwise a fresh one.
    pub fn request_sticky_downstream_address(
        &mut self,
        server: ServerId,
        tethering_type: DownstreamType,
        scope: ConnectivityScope,
    ) -> Option<Ipv4Net> {
        self.addresses
            .request_downstream_address(server, tethering_type, scope, true)
    }

    /// Request a fresh random address, bypassing the sticky cache.
    pub fn request_downstream_address(
        &mut self,
        server: ServerId,
        tethering_type: DownstreamType,
        scope: ConnectivityScope,
    ) -> Option<Ipv4Net> {
        self.addresses
            .request_downstream_address(server, tethering_type, scope, false)
    }

    pub fn release_downstream(&mut self, server: ServerId) {
        self.addresses.release_downstream(server);
    }

    #[must_use]
    pub fn downstream_address(&self, server: ServerId) -> Option<Ipv4Net> {
        self.addresses.downstream_address(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::netd::{FakeNetd, NetdOp};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn coordinator() -> (Arc<FakeNetd>, RoutingCoordinator) {
        let netd = Arc::new(FakeNetd::new());
        let addresses =
            PrivateAddressCoordinator::with_rng(true, false, StdRng::seed_from_u64(99));
        (netd.clone(), RoutingCoordinator::new(netd, addresses))
    }

    #[test]
    fn forward_pairs_are_deduplicated() {
        let (netd, mut rc) = coordinator();
        rc.add_interface_forward("wlan0", "rmnet0").unwrap();
        rc.add_interface_forward("wlan0", "rmnet0").unwrap();

        let adds = netd
            .ops()
            .iter()
            .filter(|op| matches!(op, NetdOp::IpfwdAddForward(_, _)))
            .count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn remove_all_forwards_clears_bookkeeping() {
        let (netd, mut rc) = coordinator();
        rc.add_interface_forward("wlan0", "rmnet0").unwrap();
        rc.add_interface_forward("wlan0", "v4-rmnet0").unwrap();
        rc.add_interface_forward("rndis0", "rmnet0").unwrap();

        rc.remove_all_forwards_from("wlan0");
        assert!(rc.forwards_from("wlan0").is_empty());
        assert_eq!(rc.forwards_from("rndis0"), vec!["rmnet0".to_string()]);

        let removes = netd
            .ops()
            .iter()
            .filter(|op| matches!(op, NetdOp::IpfwdRemoveForward(_, _)))
            .count();
        assert_eq!(removes, 2);
    }

    #[test]
    fn remove_unknown_forward_is_noop() {
        let (netd, mut rc) = coordinator();
        rc.remove_interface_forward("wlan0", "rmnet0").unwrap();
        assert!(netd.ops().is_empty());
    }
}
