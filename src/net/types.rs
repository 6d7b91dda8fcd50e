//! Network state types
//!
//! The tethering core reasons about networks entirely through these value
//! types. They are snapshots delivered over the event bus; no component
//! holds a live reference into another component's state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// Opaque network identifier (netId).
///
/// Identifies an upstream network across link-property and capability
/// updates. Comparable and hashable; the numeric value is only meaningful
/// to the platform that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Network(pub u32);

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "netId {}", self.0)
    }
}

/// Kind of downstream a tethering request serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamType {
    Wifi,
    WifiP2p,
    Usb,
    Ncm,
    Bluetooth,
    Ethernet,
    Virtual,
    Wigig,
}

impl DownstreamType {
    /// All downstream types, in bitmap-bit order.
    pub const ALL: [DownstreamType; 8] = [
        DownstreamType::Wifi,
        DownstreamType::WifiP2p,
        DownstreamType::Usb,
        DownstreamType::Ncm,
        DownstreamType::Bluetooth,
        DownstreamType::Ethernet,
        DownstreamType::Virtual,
        DownstreamType::Wigig,
    ];

    /// Bit used for this type in the supported-types bitmap.
    #[must_use]
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// The serving scope a request of this type gets when the caller does
    /// not say otherwise. Wi-Fi P2P groups never forward to an upstream.
    #[must_use]
    pub fn default_scope(self) -> ConnectivityScope {
        match self {
            DownstreamType::WifiP2p => ConnectivityScope::Local,
            _ => ConnectivityScope::Global,
        }
    }
}

impl fmt::Display for DownstreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownstreamType::Wifi => "wifi",
            DownstreamType::WifiP2p => "wifi-p2p",
            DownstreamType::Usb => "usb",
            DownstreamType::Ncm => "ncm",
            DownstreamType::Bluetooth => "bluetooth",
            DownstreamType::Ethernet => "ethernet",
            DownstreamType::Virtual => "virtual",
            DownstreamType::Wigig => "wigig",
        };
        f.write_str(name)
    }
}

/// Whether a downstream forwards to an upstream (global) or only provides
/// local addressing and DHCP (local).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityScope {
    Global,
    Local,
}

/// Physical transport of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Cellular,
    Wifi,
    Bluetooth,
    Ethernet,
    Vpn,
    Test,
}

/// Capability bits the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetCapability {
    Internet,
    NotVpn,
    Dun,
    NotSuspended,
}

/// Capability snapshot for a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapabilities {
    #[serde(default)]
    pub transports: Vec<Transport>,
    #[serde(default)]
    pub capabilities: Vec<NetCapability>,
}

impl NetworkCapabilities {
    #[must_use]
    pub fn new(transports: Vec<Transport>, capabilities: Vec<NetCapability>) -> Self {
        Self {
            transports,
            capabilities,
        }
    }

    #[must_use]
    pub fn has_transport(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }

    #[must_use]
    pub fn has_capability(&self, capability: NetCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// A network is treated as a VPN when it carries the VPN transport or
    /// lacks the NOT_VPN capability.
    #[must_use]
    pub fn is_vpn(&self) -> bool {
        self.has_transport(Transport::Vpn) || !self.has_capability(NetCapability::NotVpn)
    }
}

/// A single route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: String,
}

impl RouteInfo {
    /// Default IPv4 route through `gateway` on `interface`.
    #[must_use]
    pub fn default_v4(gateway: Ipv4Addr, interface: &str) -> Self {
        Self {
            destination: IpNet::V4(Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("/0 is valid")),
            gateway: Some(IpAddr::V4(gateway)),
            interface: interface.to_string(),
        }
    }

    /// Directly-connected route covering `prefix` on `interface`.
    #[must_use]
    pub fn direct(prefix: IpNet, interface: &str) -> Self {
        Self {
            destination: prefix,
            gateway: None,
            interface: interface.to_string(),
        }
    }
}

/// Link state of one interface, plus any stacked links (e.g. the clat
/// interface synthesized on top of an IPv6-only upstream).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProperties {
    pub interface_name: Option<String>,
    #[serde(default)]
    pub link_addresses: Vec<IpNet>,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub nat64_prefix: Option<Ipv6Net>,
    #[serde(default)]
    pub stacked_links: BTreeMap<String, LinkProperties>,
}

impl LinkProperties {
    #[must_use]
    pub fn new(interface_name: impl Into<String>) -> Self {
        Self {
            interface_name: Some(interface_name.into()),
            ..Self::default()
        }
    }

    /// IPv4 addresses on this link only (stacked links excluded).
    #[must_use]
    pub fn ipv4_addresses(&self) -> Vec<Ipv4Net> {
        self.link_addresses
            .iter()
            .filter_map(|net| match net {
                IpNet::V4(v4) => Some(*v4),
                IpNet::V6(_) => None,
            })
            .collect()
    }

    /// True when this link itself carries an IPv4 address. Stacked links
    /// are deliberately excluded: a clat interface must not make the base
    /// network look dual-stack.
    #[must_use]
    pub fn has_ipv4_address(&self) -> bool {
        !self.ipv4_addresses().is_empty()
    }

    /// True when the link holds a globally-routable IPv6 address
    /// (not loopback, link-local or unique-local).
    #[must_use]
    pub fn has_global_ipv6_address(&self) -> bool {
        self.link_addresses.iter().any(|net| match net {
            IpNet::V6(v6) => {
                let addr = v6.addr();
                let segments = addr.segments();
                !addr.is_loopback()
                    && (segments[0] & 0xffc0) != 0xfe80
                    && (segments[0] & 0xfe00) != 0xfc00
            }
            IpNet::V4(_) => false,
        })
    }

    /// Interface names of this link and all stacked links.
    #[must_use]
    pub fn all_interface_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(name) = &self.interface_name {
            names.push(name.clone());
        }
        for stacked in self.stacked_links.values() {
            names.extend(stacked.all_interface_names());
        }
        names
    }

    pub fn add_stacked_link(&mut self, link: LinkProperties) {
        if let Some(name) = link.interface_name.clone() {
            self.stacked_links.insert(name, link);
        }
    }

    /// Remove a stacked link by interface name. Returns true if one was
    /// removed.
    pub fn remove_stacked_link(&mut self, interface_name: &str) -> bool {
        self.stacked_links.remove(interface_name).is_some()
    }
}

/// Everything the orchestrator knows about one candidate upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamNetworkState {
    pub network: Network,
    pub link_properties: LinkProperties,
    pub capabilities: NetworkCapabilities,
}

impl UpstreamNetworkState {
    #[must_use]
    pub fn new(
        network: Network,
        link_properties: LinkProperties,
        capabilities: NetworkCapabilities,
    ) -> Self {
        Self {
            network,
            link_properties,
            capabilities,
        }
    }

    /// The interfaces downstream traffic forwards through: whichever
    /// interfaces carry a default route, on the base link or a stacked
    /// (clat) link. `None` when the network has no default route at all
    /// and therefore cannot serve as an upstream path.
    #[must_use]
    pub fn tethering_interfaces(&self) -> Option<BTreeSet<String>> {
        fn collect(lp: &LinkProperties, out: &mut BTreeSet<String>) {
            for route in &lp.routes {
                if route.destination.prefix_len() == 0 {
                    out.insert(route.interface.clone());
                }
            }
            for stacked in lp.stacked_links.values() {
                collect(stacked, out);
            }
        }

        let mut out = BTreeSet::new();
        collect(&self.link_properties, &mut out);
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Soft AP parameters carried by a Wi-Fi tethering request.
///
/// Contents are opaque to the core; they exist so the callback registry can
/// redact them for unprivileged listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftApConfig {
    pub ssid: String,
    pub passphrase: Option<String>,
}

/// Immutable record of one caller's request to start tethering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetheringRequest {
    pub tethering_type: DownstreamType,
    pub connectivity_scope: ConnectivityScope,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub soft_ap_config: Option<SoftApConfig>,
    #[serde(default)]
    pub exempt_from_entitlement_check: bool,
    pub uid: u32,
    pub package_name: String,
}

impl TetheringRequest {
    /// Request with the type's default scope and no special options.
    #[must_use]
    pub fn new(tethering_type: DownstreamType, uid: u32, package_name: &str) -> Self {
        Self {
            tethering_type,
            connectivity_scope: tethering_type.default_scope(),
            interface_name: None,
            soft_ap_config: None,
            exempt_from_entitlement_check: false,
            uid,
            package_name: package_name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_is_local_only_for_p2p() {
        assert_eq!(DownstreamType::WifiP2p.default_scope(), ConnectivityScope::Local);
        for ty in DownstreamType::ALL {
            if ty != DownstreamType::WifiP2p {
                assert_eq!(ty.default_scope(), ConnectivityScope::Global, "{ty}");
            }
        }
    }

    #[test]
    fn type_bits_are_distinct() {
        let mut seen = 0u32;
        for ty in DownstreamType::ALL {
            assert_eq!(seen & ty.bit(), 0);
            seen |= ty.bit();
        }
    }

    #[test]
    fn vpn_detection() {
        let vpn = NetworkCapabilities::new(vec![Transport::Vpn], vec![]);
        assert!(vpn.is_vpn());

        let cell = NetworkCapabilities::new(
            vec![Transport::Cellular],
            vec![NetCapability::Internet, NetCapability::NotVpn],
        );
        assert!(!cell.is_vpn());

        // Missing NOT_VPN is treated as VPN even without the transport.
        let unknown = NetworkCapabilities::new(vec![Transport::Wifi], vec![NetCapability::Internet]);
        assert!(unknown.is_vpn());
    }

    #[test]
    fn global_ipv6_excludes_link_local_and_ula() {
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses.push("fe80::1/64".parse().unwrap());
        lp.link_addresses.push("fd00:1234::1/64".parse().unwrap());
        assert!(!lp.has_global_ipv6_address());

        lp.link_addresses.push("2001:db8::5/64".parse().unwrap());
        assert!(lp.has_global_ipv6_address());
    }

    #[test]
    fn tethering_interfaces_follow_default_routes() {
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses.push("10.9.0.5/24".parse().unwrap());
        let mut state = UpstreamNetworkState::new(Network(1), lp, NetworkCapabilities::default());

        // Addresses alone are not enough: no default route, no upstream
        // interfaces.
        assert_eq!(state.tethering_interfaces(), None);

        state
            .link_properties
            .routes
            .push(RouteInfo::direct("0.0.0.0/0".parse().unwrap(), "rmnet0"));
        assert_eq!(
            state.tethering_interfaces(),
            Some(["rmnet0".to_string()].into())
        );

        // A stacked clat link contributes its own default route.
        let mut stacked = LinkProperties::new("v4-rmnet0");
        stacked
            .routes
            .push(RouteInfo::default_v4(Ipv4Addr::new(192, 0, 0, 4), "v4-rmnet0"));
        state.link_properties.add_stacked_link(stacked);
        assert_eq!(
            state.tethering_interfaces(),
            Some(["rmnet0".to_string(), "v4-rmnet0".to_string()].into())
        );
    }

    #[test]
    fn stacked_links_extend_names_but_not_ipv4() {
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses.push("2001:db8::5/64".parse().unwrap());
        assert!(!lp.has_ipv4_address());

        let mut stacked = LinkProperties::new("v4-rmnet0");
        stacked.link_addresses.push("192.0.0.4/29".parse().unwrap());
        lp.add_stacked_link(stacked);

        // The stacked clat address does not make the base link dual-stack,
        // but its interface is part of the forwarding set.
        assert!(!lp.has_ipv4_address());
        assert_eq!(
            lp.all_interface_names(),
            vec!["rmnet0".to_string(), "v4-rmnet0".to_string()]
        );

        assert!(lp.remove_stacked_link("v4-rmnet0"));
        assert_eq!(lp.all_interface_names(), vec!["rmnet0".to_string()]);
    }
}
