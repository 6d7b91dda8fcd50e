//! Kernel-facing service traits
//!
//! These traits are the narrow contracts between the control plane and
//! the platform daemons that actually touch the kernel: the network
//! daemon (forwarding, tether daemon, routes, clat), the DNS resolver
//! (NAT64 prefix discovery) and the DHCP server. Production wires real
//! clients; tests and the simulated mode use the fakes below, which
//! record every call and can be told to fail specific operations.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{errno, ServiceError};
use crate::net::{Network, RouteInfo};

/// Network daemon operations used by tethering.
///
/// Calls are synchronous and bounded-time; failures carry the errno the
/// daemon reported and are translated into state transitions by the
/// caller, never propagated out of the event loop.
pub trait NetdService: Send + Sync {
    /// Toggle the kernel IPv4 forwarding sysctl.
    fn ip_forward_enable(&self) -> Result<(), ServiceError>;
    fn ip_forward_disable(&self) -> Result<(), ServiceError>;

    /// Start the tether daemon with the given DHCP range strings (empty
    /// when the legacy in-daemon DHCP server is unused).
    fn tether_start(&self, dhcp_ranges: &[String]) -> Result<(), ServiceError>;
    fn tether_stop(&self) -> Result<(), ServiceError>;

    /// Install DNS forwarders for the upstream network.
    fn tether_dns_set(&self, network: Network, dns: &[IpAddr]) -> Result<(), ServiceError>;

    /// Add/remove an interface to the tether daemon's forwarding set.
    fn tether_interface_add(&self, iface: &str) -> Result<(), ServiceError>;
    fn tether_interface_remove(&self, iface: &str) -> Result<(), ServiceError>;

    /// Set or clear the IPv4 configuration of an interface.
    fn interface_set_cfg(
        &self,
        iface: &str,
        address: Option<Ipv4Net>,
        up: bool,
    ) -> Result<(), ServiceError>;

    /// Bind an interface into a network's routing namespace.
    fn network_add_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError>;
    fn network_remove_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError>;

    fn route_add(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError>;
    fn route_remove(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError>;
    fn route_update(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError>;

    /// Kernel forwarding pair between a downstream and an upstream
    /// interface.
    fn ipfwd_add_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError>;
    fn ipfwd_remove_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError>;

    /// Start the clat translation daemon on `iface` with the given NAT64
    /// prefix. Returns the IPv6 address the daemon bound.
    fn clatd_start(&self, iface: &str, prefix: Ipv6Net) -> Result<Ipv6Addr, ServiceError>;
    fn clatd_stop(&self, iface: &str) -> Result<(), ServiceError>;
}

/// DNS resolver operations for NAT64 prefix discovery (RFC 7050).
pub trait DnsResolverService: Send + Sync {
    fn start_prefix64_discovery(&self, network: Network) -> Result<(), ServiceError>;
    fn stop_prefix64_discovery(&self, network: Network) -> Result<(), ServiceError>;
    /// `None` clears the prefix.
    fn set_prefix64(&self, network: Network, prefix: Option<Ipv6Net>) -> Result<(), ServiceError>;
}

/// Parameters for the per-downstream DHCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpServerParams {
    /// Gateway address with its /24.
    pub server_address: Ipv4Net,
    /// First and last handed-out address.
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_time_secs: u32,
}

impl DhcpServerParams {
    /// Derive the lease range from the server's /24: skip the network
    /// address, the broadcast address and the gateway itself.
    #[must_use]
    pub fn from_prefix(server_address: Ipv4Net, lease_time_secs: u32) -> Self {
        let network = u32::from(server_address.network());
        let broadcast = u32::from(server_address.broadcast());
        let gateway = u32::from(server_address.addr());

        let mut start = network + 1;
        if start == gateway {
            start += 1;
        }
        let mut end = broadcast - 1;
        if end == gateway {
            end -= 1;
        }

        Self {
            server_address,
            range_start: start.into(),
            range_end: end.into(),
            lease_time_secs,
        }
    }
}

/// Per-downstream DHCP server lifecycle.
pub trait DhcpServerController: Send + Sync {
    fn start(&self, iface: &str, params: &DhcpServerParams) -> Result<(), ServiceError>;
    fn stop(&self, iface: &str) -> Result<(), ServiceError>;
}

/// One recorded fake-service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetdOp {
    IpForwardEnable,
    IpForwardDisable,
    TetherStart(Vec<String>),
    TetherStop,
    TetherDnsSet(Network, Vec<IpAddr>),
    TetherInterfaceAdd(String),
    TetherInterfaceRemove(String),
    InterfaceSetCfg(String, Option<Ipv4Net>, bool),
    NetworkAddInterface(Network, String),
    NetworkRemoveInterface(Network, String),
    RouteAdd(Network, RouteInfo),
    RouteRemove(Network, RouteInfo),
    RouteUpdate(Network, RouteInfo),
    IpfwdAddForward(String, String),
    IpfwdRemoveForward(String, String),
    ClatdStart(String, Ipv6Net),
    ClatdStop(String),
    DhcpStart(String, DhcpServerParams),
    DhcpStop(String),
    StartPrefix64Discovery(Network),
    StopPrefix64Discovery(Network),
    SetPrefix64(Network, Option<Ipv6Net>),
}

#[derive(Default)]
struct FakeState {
    ops: Vec<NetdOp>,
    failing: HashSet<&'static str>,
    ip_forwarding: bool,
    tether_running: bool,
}

/// Recording fake for [`NetdService`].
///
/// `fail_on` makes the named operation return `EIO` until cleared. Fakes
/// are shared via `Arc` and locked per call, so tests can inspect the
/// call log while the control plane holds a handle.
#[derive(Default)]
pub struct FakeNetd {
    state: Mutex<FakeState>,
}

impl FakeNetd {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.state.lock().failing.remove(operation);
    }

    /// Snapshot of all recorded operations.
    #[must_use]
    pub fn ops(&self) -> Vec<NetdOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    #[must_use]
    pub fn ip_forwarding(&self) -> bool {
        self.state.lock().ip_forwarding
    }

    #[must_use]
    pub fn tether_running(&self) -> bool {
        self.state.lock().tether_running
    }

    fn record(&self, operation: &'static str, op: NetdOp) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        if state.failing.contains(operation) {
            return Err(ServiceError::new(errno::EIO, operation));
        }
        debug!("fake netd: {op:?}");
        state.ops.push(op);
        Ok(())
    }
}

impl NetdService for FakeNetd {
    fn ip_forward_enable(&self) -> Result<(), ServiceError> {
        self.record("ipfwdEnableForwarding", NetdOp::IpForwardEnable)?;
        self.state.lock().ip_forwarding = true;
        Ok(())
    }

    fn ip_forward_disable(&self) -> Result<(), ServiceError> {
        self.record("ipfwdDisableForwarding", NetdOp::IpForwardDisable)?;
        self.state.lock().ip_forwarding = false;
        Ok(())
    }

    fn tether_start(&self, dhcp_ranges: &[String]) -> Result<(), ServiceError> {
        self.record("tetherStart", NetdOp::TetherStart(dhcp_ranges.to_vec()))?;
        self.state.lock().tether_running = true;
        Ok(())
    }

    fn tether_stop(&self) -> Result<(), ServiceError> {
        self.record("tetherStop", NetdOp::TetherStop)?;
        self.state.lock().tether_running = false;
        Ok(())
    }

    fn tether_dns_set(&self, network: Network, dns: &[IpAddr]) -> Result<(), ServiceError> {
        self.record("tetherDnsSet", NetdOp::TetherDnsSet(network, dns.to_vec()))
    }

    fn tether_interface_add(&self, iface: &str) -> Result<(), ServiceError> {
        self.record("tetherInterfaceAdd", NetdOp::TetherInterfaceAdd(iface.into()))
    }

    fn tether_interface_remove(&self, iface: &str) -> Result<(), ServiceError> {
        self.record(
            "tetherInterfaceRemove",
            NetdOp::TetherInterfaceRemove(iface.into()),
        )
    }

    fn interface_set_cfg(
        &self,
        iface: &str,
        address: Option<Ipv4Net>,
        up: bool,
    ) -> Result<(), ServiceError> {
        self.record(
            "interfaceSetCfg",
            NetdOp::InterfaceSetCfg(iface.into(), address, up),
        )
    }

    fn network_add_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError> {
        self.record(
            "networkAddInterface",
            NetdOp::NetworkAddInterface(network, iface.into()),
        )
    }

    fn network_remove_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError> {
        self.record(
            "networkRemoveInterface",
            NetdOp::NetworkRemoveInterface(network, iface.into()),
        )
    }

    fn route_add(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.record("networkAddRoute", NetdOp::RouteAdd(network, route.clone()))
    }

    fn route_remove(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.record("networkRemoveRoute", NetdOp::RouteRemove(network, route.clone()))
    }

    fn route_update(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        self.record("networkUpdateRoute", NetdOp::RouteUpdate(network, route.clone()))
    }

    fn ipfwd_add_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        self.record(
            "ipfwdAddInterfaceForward",
            NetdOp::IpfwdAddForward(from.into(), to.into()),
        )
    }

    fn ipfwd_remove_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        self.record(
            "ipfwdRemoveInterfaceForward",
            NetdOp::IpfwdRemoveForward(from.into(), to.into()),
        )
    }

    fn clatd_start(&self, iface: &str, prefix: Ipv6Net) -> Result<Ipv6Addr, ServiceError> {
        self.record("clatdStart", NetdOp::ClatdStart(iface.into(), prefix))?;
        // A stable placeholder address inside the documentation range.
        Ok("2001:db8::464".parse().expect("valid literal"))
    }

    fn clatd_stop(&self, iface: &str) -> Result<(), ServiceError> {
        self.record("clatdStop", NetdOp::ClatdStop(iface.into()))
    }
}

/// Recording fake for [`DnsResolverService`]. Shares the op-log shape
/// with [`FakeNetd`] so scenario tests read one kind of log.
#[derive(Default)]
pub struct FakeDnsResolver {
    state: Mutex<FakeState>,
}

impl FakeDnsResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    #[must_use]
    pub fn ops(&self) -> Vec<NetdOp> {
        self.state.lock().ops.clone()
    }

    /// True while discovery is running for `network`.
    #[must_use]
    pub fn discovery_running(&self, network: Network) -> bool {
        let state = self.state.lock();
        let mut running = false;
        for op in &state.ops {
            match op {
                NetdOp::StartPrefix64Discovery(n) if *n == network => running = true,
                NetdOp::StopPrefix64Discovery(n) if *n == network => running = false,
                _ => {}
            }
        }
        running
    }

    fn record(&self, operation: &'static str, op: NetdOp) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        if state.failing.contains(operation) {
            return Err(ServiceError::new(errno::EIO, operation));
        }
        state.ops.push(op);
        Ok(())
    }
}

impl DnsResolverService for FakeDnsResolver {
    fn start_prefix64_discovery(&self, network: Network) -> Result<(), ServiceError> {
        self.record("startPrefix64Discovery", NetdOp::StartPrefix64Discovery(network))
    }

    fn stop_prefix64_discovery(&self, network: Network) -> Result<(), ServiceError> {
        self.record("stopPrefix64Discovery", NetdOp::StopPrefix64Discovery(network))
    }

    fn set_prefix64(&self, network: Network, prefix: Option<Ipv6Net>) -> Result<(), ServiceError> {
        self.record("setPrefix64", NetdOp::SetPrefix64(network, prefix))
    }
}

/// Recording fake for [`DhcpServerController`].
#[derive(Default)]
pub struct FakeDhcpServer {
    state: Mutex<FakeState>,
}

impl FakeDhcpServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().failing.insert(operation);
    }

    #[must_use]
    pub fn ops(&self) -> Vec<NetdOp> {
        self.state.lock().ops.clone()
    }

    /// True while a server is running on `iface`.
    #[must_use]
    pub fn running_on(&self, iface: &str) -> bool {
        let state = self.state.lock();
        let mut running = false;
        for op in &state.ops {
            match op {
                NetdOp::DhcpStart(i, _) if i == iface => running = true,
                NetdOp::DhcpStop(i) if i == iface => running = false,
                _ => {}
            }
        }
        running
    }

    fn record(&self, operation: &'static str, op: NetdOp) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        if state.failing.contains(operation) {
            return Err(ServiceError::new(errno::EIO, operation));
        }
        state.ops.push(op);
        Ok(())
    }
}

impl DhcpServerController for FakeDhcpServer {
    fn start(&self, iface: &str, params: &DhcpServerParams) -> Result<(), ServiceError> {
        self.record("dhcpStart", NetdOp::DhcpStart(iface.into(), params.clone()))
    }

    fn stop(&self, iface: &str) -> Result<(), ServiceError> {
        self.record("dhcpStop", NetdOp::DhcpStop(iface.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dhcp_range_skips_network_broadcast_and_gateway() {
        let params = DhcpServerParams::from_prefix("192.168.43.1/24".parse().unwrap(), 3600);
        // Gateway is .1, so the range starts at .2.
        assert_eq!(params.range_start, Ipv4Addr::new(192, 168, 43, 2));
        assert_eq!(params.range_end, Ipv4Addr::new(192, 168, 43, 254));

        // Gateway in the middle leaves .1 available.
        let params = DhcpServerParams::from_prefix("10.20.5.7/24".parse().unwrap(), 3600);
        assert_eq!(params.range_start, Ipv4Addr::new(10, 20, 5, 1));
        assert_eq!(params.range_end, Ipv4Addr::new(10, 20, 5, 254));

        // Gateway at .254 shrinks the top end.
        let params = DhcpServerParams::from_prefix("10.20.5.254/24".parse().unwrap(), 3600);
        assert_eq!(params.range_end, Ipv4Addr::new(10, 20, 5, 253));
    }

    #[test]
    fn fake_netd_records_and_fails() {
        let netd = FakeNetd::new();
        netd.ip_forward_enable().unwrap();
        assert!(netd.ip_forwarding());

        netd.fail_on("ipfwdDisableForwarding");
        let err = netd.ip_forward_disable().unwrap_err();
        assert_eq!(err.operation, "ipfwdDisableForwarding");
        // State unchanged on failure.
        assert!(netd.ip_forwarding());

        netd.clear_failure("ipfwdDisableForwarding");
        netd.ip_forward_disable().unwrap();
        assert!(!netd.ip_forwarding());
    }

    #[test]
    fn fake_resolver_tracks_discovery() {
        let resolver = FakeDnsResolver::new();
        let net = Network(17);
        assert!(!resolver.discovery_running(net));
        resolver.start_prefix64_discovery(net).unwrap();
        assert!(resolver.discovery_running(net));
        resolver.stop_prefix64_discovery(net).unwrap();
        assert!(!resolver.discovery_running(net));
    }
}
