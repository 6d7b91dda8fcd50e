//! Per-network 464xlat control
//!
//! One controller per upstream network. It discovers a NAT64 prefix (from
//! RAs or DNS), runs the clat translation daemon, and tells the owner
//! when the stacked v4 interface should be added to or removed from the
//! network's link properties.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv6Net};
use tracing::{debug, info, warn};

use crate::net::{LinkProperties, Network, NetworkCapabilities, RouteInfo, Transport};
use crate::routing::{DnsResolverService, NetdService};

/// Stacked interface name prefix; must match the translation daemon.
pub const CLAT_PREFIX: &str = "v4-";

/// Well-known clat IPv4 address (RFC 7335 range).
pub const CLAT_V4_ADDRESS: &str = "192.0.0.4/29";

/// Translation daemon lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClatState {
    /// Not needed, or needed but no prefix known and discovery not
    /// required either.
    Idle,
    /// Clat required but no prefix yet; prefix discovery in progress.
    Discovering,
    /// Daemon launched; stacked interface not up yet.
    Starting,
    /// Stacked interface up and injected into link properties.
    Running,
}

/// Owner-maintained snapshot of the network the controller serves.
#[derive(Debug, Clone)]
pub struct ClatNetworkState {
    pub connected: bool,
    pub destroyed: bool,
    pub skip_464xlat: bool,
    pub capabilities: NetworkCapabilities,
    pub link_properties: LinkProperties,
}

/// Result of an `update` pass: the stacked interface to drop from the
/// network's link properties, if a running clat was stopped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClatUpdate {
    pub remove_stacked_iface: Option<String>,
}

/// 464xlat state machine for one network.
pub struct Nat464Controller {
    network: Network,
    netd: Arc<dyn NetdService>,
    resolver: Arc<dyn DnsResolverService>,
    cellular_clat_enabled: bool,

    state: ClatState,
    prefix_from_ra: Option<Ipv6Net>,
    prefix_from_dns: Option<Ipv6Net>,
    prefix_in_use: Option<Ipv6Net>,
    base_iface: Option<String>,
    stacked_iface: Option<String>,
    v6_address: Option<Ipv6Addr>,
    prefix_discovery_running: bool,
}

impl Nat464Controller {
    #[must_use]
    pub fn new(
        network: Network,
        netd: Arc<dyn NetdService>,
        resolver: Arc<dyn DnsResolverService>,
        cellular_clat_enabled: bool,
    ) -> Self {
        Self {
            network,
            netd,
            resolver,
            cellular_clat_enabled,
            state: ClatState::Idle,
            prefix_from_ra: None,
            prefix_from_dns: None,
            prefix_in_use: None,
            base_iface: None,
            stacked_iface: None,
            v6_address: None,
            prefix_discovery_running: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> ClatState {
        self.state
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self.state, ClatState::Starting | ClatState::Running)
    }

    #[must_use]
    pub fn stacked_iface(&self) -> Option<&str> {
        self.stacked_iface.as_deref()
    }

    #[must_use]
    pub fn prefix_in_use(&self) -> Option<Ipv6Net> {
        self.prefix_in_use
    }

    /// Record a prefix learned (or withdrawn) via router advertisement.
    /// The owner must call `update` afterwards.
    pub fn set_nat64_prefix_from_ra(&mut self, prefix: Option<Ipv6Net>) {
        debug!("{}: RA NAT64 prefix {prefix:?}", self.network);
        self.prefix_from_ra = prefix;
    }

    /// Record a prefix learned (or withdrawn) via DNS64 discovery.
    pub fn set_nat64_prefix_from_dns(&mut self, prefix: Option<Ipv6Net>) {
        debug!("{}: DNS NAT64 prefix {prefix:?}", self.network);
        self.prefix_from_dns = prefix;
    }

    /// Whether clat should be attempted at all on this network: an
    /// IPv6-only, connected network of a supported type that has not
    /// opted out.
    fn requires_clat(&self, view: &ClatNetworkState) -> bool {
        let caps = &view.capabilities;
        let supported = caps.has_transport(Transport::Cellular)
            || caps.has_transport(Transport::Wifi)
            || caps.has_transport(Transport::Ethernet)
            || caps.has_transport(Transport::Test);

        let lp = &view.link_properties;
        let ipv6_only = lp.has_global_ipv6_address() && !lp.has_ipv4_address();

        let cellular_allowed =
            !caps.has_transport(Transport::Cellular) || self.cellular_clat_enabled;

        supported
            && view.connected
            && ipv6_only
            && !view.skip_464xlat
            && !view.destroyed
            && cellular_allowed
    }

    /// Whether the daemon should be running now: clat required and a
    /// prefix selected.
    fn should_start(&self, view: &ClatNetworkState) -> bool {
        self.requires_clat(view) && self.selected_prefix().is_some()
    }

    /// RA-learned prefixes win over DNS: better security and the RA will
    /// almost always arrive first anyway. The DNS prefix remains as a
    /// fallback when the RA withdraws.
    fn selected_prefix(&self) -> Option<Ipv6Net> {
        self.prefix_from_ra.or(self.prefix_from_dns)
    }

    /// Discovery must run whenever clat is required and the RA has not
    /// provided a prefix. It keeps running even after DNS succeeds:
    /// stopping it would make the resolver report the prefix as removed.
    fn is_prefix_discovery_needed(&self, view: &ClatNetworkState) -> bool {
        self.requires_clat(view) && self.prefix_from_ra.is_none()
    }

    /// Drive the state machine from the current network view. Call on
    /// any relevant signal (connectivity, link properties, prefixes).
    pub fn update(&mut self, view: &ClatNetworkState) -> ClatUpdate {
        match self.state {
            ClatState::Idle => {
                if self.is_prefix_discovery_needed(view) {
                    self.start_prefix_discovery();
                    self.state = ClatState::Discovering;
                } else if self.requires_clat(view) {
                    self.start(view);
                }
                ClatUpdate::default()
            }
            ClatState::Discovering => {
                if self.should_start(view) {
                    self.start(view);
                    return ClatUpdate::default();
                }
                if !self.requires_clat(view) {
                    self.stop_prefix_discovery();
                    self.state = ClatState::Idle;
                }
                ClatUpdate::default()
            }
            ClatState::Starting | ClatState::Running => {
                if !self.should_start(view) {
                    return self.stop(view);
                }
                // Prefix moved (e.g. RA learned while running on the DNS
                // prefix): restart on the new selection.
                if self.prefix_in_use != self.selected_prefix() {
                    info!(
                        "{}: NAT64 prefix changed from {:?} to {:?}",
                        self.network,
                        self.prefix_in_use,
                        self.selected_prefix()
                    );
                    let mut result = self.stop(view);
                    let again = self.update(view);
                    if result.remove_stacked_iface.is_none() {
                        result.remove_stacked_iface = again.remove_stacked_iface;
                    }
                    return result;
                }
                ClatUpdate::default()
            }
        }
    }

    /// The stacked interface came up (or went down). Returns the link to
    /// inject into the network's properties on Starting -> Running.
    pub fn handle_interface_link_state_changed(
        &mut self,
        iface: &str,
        up: bool,
    ) -> Option<LinkProperties> {
        if Some(iface) != self.stacked_iface.as_deref() {
            return None;
        }
        if self.state == ClatState::Starting && up {
            info!("{}: clat {iface} is up", self.network);
            self.state = ClatState::Running;
            return Some(self.stacked_link_properties());
        }
        None
    }

    /// Stop everything for network teardown. Returns the stacked iface
    /// to remove, if any.
    pub fn network_destroyed(&mut self, view: &ClatNetworkState) -> ClatUpdate {
        let result = if self.is_started() {
            self.stop(view)
        } else {
            ClatUpdate::default()
        };
        if self.prefix_discovery_running {
            self.stop_prefix_discovery();
        }
        self.state = ClatState::Idle;
        result
    }

    fn start(&mut self, view: &ClatNetworkState) {
        let Some(base_iface) = view.link_properties.interface_name.clone() else {
            warn!("{}: cannot start clat without a base interface", self.network);
            return;
        };
        let Some(prefix) = self.selected_prefix() else {
            return;
        };

        let stacked = format!("{CLAT_PREFIX}{base_iface}");
        info!("{}: starting clatd on {base_iface}", self.network);
        match self.netd.clatd_start(&base_iface, prefix) {
            Ok(v6) => {
                self.prefix_in_use = Some(prefix);
                self.base_iface = Some(base_iface);
                self.stacked_iface = Some(stacked);
                self.v6_address = Some(v6);
                if !self.prefix_discovery_running {
                    self.set_prefix64(Some(prefix));
                }
                self.state = ClatState::Starting;
            }
            Err(e) => {
                warn!("{}: clatd start failed: {e}", self.network);
                // Remain in discovery if it is running; a later prefix
                // update retries.
                self.state = if self.prefix_discovery_running {
                    ClatState::Discovering
                } else {
                    ClatState::Idle
                };
            }
        }
    }

    fn stop(&mut self, view: &ClatNetworkState) -> ClatUpdate {
        let was_running = self.state == ClatState::Running;
        if let Some(base_iface) = &self.base_iface {
            info!("{}: stopping clatd on {base_iface}", self.network);
            if let Err(e) = self.netd.clatd_stop(base_iface) {
                warn!("{}: clatd stop failed: {e}", self.network);
            }
        }

        let stacked = self.stacked_iface.take();
        self.prefix_in_use = None;
        self.base_iface = None;
        self.v6_address = None;

        if !self.prefix_discovery_running {
            self.set_prefix64(None);
        }

        if self.is_prefix_discovery_needed(view) {
            if !self.prefix_discovery_running {
                self.start_prefix_discovery();
            }
            self.state = ClatState::Discovering;
        } else {
            if self.prefix_discovery_running {
                self.stop_prefix_discovery();
            }
            self.state = ClatState::Idle;
        }

        ClatUpdate {
            remove_stacked_iface: if was_running { stacked } else { None },
        }
    }

    fn start_prefix_discovery(&mut self) {
        if let Err(e) = self.resolver.start_prefix64_discovery(self.network) {
            warn!("{}: prefix discovery start failed: {e}", self.network);
        }
        self.prefix_discovery_running = true;
    }

    fn stop_prefix_discovery(&mut self) {
        if let Err(e) = self.resolver.stop_prefix64_discovery(self.network) {
            warn!("{}: prefix discovery stop failed: {e}", self.network);
        }
        self.prefix_discovery_running = false;
    }

    fn set_prefix64(&self, prefix: Option<Ipv6Net>) {
        if let Err(e) = self.resolver.set_prefix64(self.network, prefix) {
            warn!("{}: setPrefix64 failed: {e}", self.network);
        }
    }

    /// Link properties of the stacked v4 interface: the well-known clat
    /// address and a default route through it.
    fn stacked_link_properties(&self) -> LinkProperties {
        let iface = self.stacked_iface.clone().unwrap_or_default();
        let mut lp = LinkProperties::new(iface.clone());
        let address: IpNet = CLAT_V4_ADDRESS.parse().expect("valid literal");
        let gateway = match address {
            IpNet::V4(v4) => v4.addr(),
            IpNet::V6(_) => unreachable!("clat address is IPv4"),
        };
        lp.link_addresses.push(address);
        lp.routes.push(RouteInfo::default_v4(gateway, &iface));
        lp
    }
}

/// Synthesize the IPv6 address for an IPv4 destination: the first 12
/// bytes of the /96 prefix followed by the 4 address bytes, big-endian.
#[must_use]
pub fn translate_v4_to_v6(prefix: Ipv6Net, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.network().octets();
    octets[12..].copy_from_slice(&v4.octets());
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::net::NetCapability;
    use crate::routing::{FakeDnsResolver, FakeNetd, NetdOp};

    const WELL_KNOWN: &str = "64:ff9b::/96";

    fn ipv6_only_view(iface: &str) -> ClatNetworkState {
        let mut lp = LinkProperties::new(iface);
        lp.link_addresses.push("2001:db8::5/64".parse().unwrap());
        ClatNetworkState {
            connected: true,
            destroyed: false,
            skip_464xlat: false,
            capabilities: NetworkCapabilities::new(
                vec![Transport::Cellular],
                vec![NetCapability::Internet, NetCapability::NotVpn],
            ),
            link_properties: lp,
        }
    }

    struct Rig {
        netd: Arc<FakeNetd>,
        resolver: Arc<FakeDnsResolver>,
        clat: Nat464Controller,
    }

    fn rig() -> Rig {
        let netd = Arc::new(FakeNetd::new());
        let resolver = Arc::new(FakeDnsResolver::new());
        let clat = Nat464Controller::new(Network(42), netd.clone(), resolver.clone(), true);
        Rig {
            netd,
            resolver,
            clat,
        }
    }

    #[test]
    fn translation_is_bit_exact() {
        let prefix: Ipv6Net = WELL_KNOWN.parse().unwrap();
        let v4 = Ipv4Addr::new(198, 51, 100, 7);
        let v6 = translate_v4_to_v6(prefix, v4);

        assert_eq!(&v6.octets()[..12], &prefix.network().octets()[..12]);
        assert_eq!(&v6.octets()[12..], &v4.octets());
        assert_eq!(v6, "64:ff9b::c633:6407".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ipv6_only_network_starts_discovery() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        r.clat.update(&view);
        assert_eq!(r.clat.state(), ClatState::Discovering);
        assert!(r.resolver.discovery_running(Network(42)));
    }

    #[test]
    fn dual_stack_network_stays_idle() {
        let mut r = rig();
        let mut view = ipv6_only_view("rmnet0");
        view.link_properties
            .link_addresses
            .push("10.1.2.3/24".parse().unwrap());

        r.clat.update(&view);
        assert_eq!(r.clat.state(), ClatState::Idle);
        assert!(!r.resolver.discovery_running(Network(42)));
    }

    #[test]
    fn cellular_clat_can_be_disabled() {
        let netd = Arc::new(FakeNetd::new());
        let resolver = Arc::new(FakeDnsResolver::new());
        let mut clat = Nat464Controller::new(Network(1), netd, resolver, false);

        clat.update(&ipv6_only_view("rmnet0"));
        assert_eq!(clat.state(), ClatState::Idle);
    }

    #[test]
    fn ra_prefix_starts_daemon_then_interface_up_runs() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        r.clat.update(&view);
        r.clat
            .set_nat64_prefix_from_ra(Some(WELL_KNOWN.parse().unwrap()));
        r.clat.update(&view);
        assert_eq!(r.clat.state(), ClatState::Starting);
        assert_eq!(r.clat.stacked_iface(), Some("v4-rmnet0"));
        assert!(r
            .netd
            .ops()
            .iter()
            .any(|op| matches!(op, NetdOp::ClatdStart(i, _) if i == "rmnet0")));

        // Unrelated interface events are ignored.
        assert!(r
            .clat
            .handle_interface_link_state_changed("wlan0", true)
            .is_none());

        let stacked = r
            .clat
            .handle_interface_link_state_changed("v4-rmnet0", true)
            .expect("stacked link");
        assert_eq!(r.clat.state(), ClatState::Running);
        assert_eq!(stacked.interface_name.as_deref(), Some("v4-rmnet0"));
        assert!(stacked.has_ipv4_address());
        assert!(stacked
            .routes
            .iter()
            .any(|route| route.destination.prefix_len() == 0));
    }

    #[test]
    fn ra_withdrawal_falls_back_to_dns_prefix() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        // Discovery learns a network-specific prefix from DNS, then an
        // RA advertises the well-known one; the RA prefix wins.
        r.clat.update(&view);
        r.clat
            .set_nat64_prefix_from_dns(Some("2001:db8:64::/96".parse().unwrap()));
        r.clat
            .set_nat64_prefix_from_ra(Some(WELL_KNOWN.parse().unwrap()));
        r.clat.update(&view);
        r.clat.handle_interface_link_state_changed("v4-rmnet0", true);
        assert_eq!(r.clat.state(), ClatState::Running);
        assert_eq!(r.clat.prefix_in_use(), Some(WELL_KNOWN.parse().unwrap()));

        // RA withdraws. DNS still knows a prefix, so clat restarts on
        // it; the running stacked interface is dropped first.
        r.clat.set_nat64_prefix_from_ra(None);
        let update = r.clat.update(&view);
        assert_eq!(update.remove_stacked_iface.as_deref(), Some("v4-rmnet0"));
        assert_eq!(r.clat.state(), ClatState::Starting);
        assert_eq!(
            r.clat.prefix_in_use(),
            Some("2001:db8:64::/96".parse().unwrap())
        );

        let starts = r
            .netd
            .ops()
            .iter()
            .filter(|op| matches!(op, NetdOp::ClatdStart(_, _)))
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn same_prefix_from_other_source_does_not_restart() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        r.clat.update(&view);
        r.clat
            .set_nat64_prefix_from_dns(Some(WELL_KNOWN.parse().unwrap()));
        r.clat
            .set_nat64_prefix_from_ra(Some(WELL_KNOWN.parse().unwrap()));
        r.clat.update(&view);
        r.clat.handle_interface_link_state_changed("v4-rmnet0", true);

        // RA withdrawn but DNS still reports the identical prefix: the
        // selection does not change, so the daemon keeps running.
        r.clat.set_nat64_prefix_from_ra(None);
        let update = r.clat.update(&view);
        assert_eq!(update, ClatUpdate::default());
        assert_eq!(r.clat.state(), ClatState::Running);
    }

    #[test]
    fn prefix_withdrawal_without_fallback_returns_to_discovering() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        r.clat.update(&view);
        r.clat
            .set_nat64_prefix_from_ra(Some(WELL_KNOWN.parse().unwrap()));
        r.clat.update(&view);
        r.clat.handle_interface_link_state_changed("v4-rmnet0", true);

        r.clat.set_nat64_prefix_from_ra(None);
        let update = r.clat.update(&view);
        assert_eq!(update.remove_stacked_iface.as_deref(), Some("v4-rmnet0"));
        assert_eq!(r.clat.state(), ClatState::Discovering);
        assert!(r.resolver.discovery_running(Network(42)));
    }

    #[test]
    fn ipv4_appearing_stops_clat() {
        let mut r = rig();
        let mut view = ipv6_only_view("rmnet0");

        r.clat
            .set_nat64_prefix_from_ra(Some(WELL_KNOWN.parse().unwrap()));
        r.clat.update(&view);
        r.clat.handle_interface_link_state_changed("v4-rmnet0", true);
        assert_eq!(r.clat.state(), ClatState::Running);

        view.link_properties
            .link_addresses
            .push("10.5.6.7/24".parse().unwrap());
        let update = r.clat.update(&view);
        assert_eq!(update.remove_stacked_iface.as_deref(), Some("v4-rmnet0"));
        assert_eq!(r.clat.state(), ClatState::Idle);
        assert!(r
            .netd
            .ops()
            .iter()
            .any(|op| matches!(op, NetdOp::ClatdStop(i) if i == "rmnet0")));
    }

    #[test]
    fn network_destroyed_cleans_up() {
        let mut r = rig();
        let view = ipv6_only_view("rmnet0");

        r.clat.update(&view);
        assert!(r.resolver.discovery_running(Network(42)));

        let mut destroyed = view.clone();
        destroyed.destroyed = true;
        r.clat.network_destroyed(&destroyed);
        assert_eq!(r.clat.state(), ClatState::Idle);
        assert!(!r.resolver.discovery_running(Network(42)));
    }
}
