//! Linux implementations of the kernel-facing services
//!
//! Plain-Linux backends for deployments without a dedicated network
//! daemon: sysctl writes for forwarding, iproute2/iptables for interface
//! and route manipulation, dnsmasq as the per-downstream DHCP server and
//! an external clatd for 464xlat. Every call is a short-lived subprocess;
//! a non-zero exit becomes a `ServiceError`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::netd::{DhcpServerController, DhcpServerParams, DnsResolverService, NetdService};
use crate::error::{errno, ServiceError};
use crate::net::{Network, RouteInfo};

const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// True when `interface` exists under /sys/class/net.
#[must_use]
pub fn interface_exists(interface: &str) -> bool {
    Path::new("/sys/class/net").join(interface).exists()
}

/// True when the interface reports an up operstate.
#[must_use]
pub fn interface_is_up(interface: &str) -> bool {
    let path = Path::new("/sys/class/net").join(interface).join("operstate");
    matches!(
        std::fs::read_to_string(path).as_deref().map(str::trim),
        Ok("up") | Ok("unknown")
    )
}

/// Names of all present interfaces.
#[must_use]
pub fn list_interfaces() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}

fn run(operation: &'static str, program: &str, args: &[&str]) -> Result<(), ServiceError> {
    debug!("{operation}: {program} {}", args.join(" "));
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            warn!("{operation}: failed to spawn {program}: {e}");
            ServiceError::new(errno::ENOENT, operation)
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ServiceError::new(errno::EIO, operation))
    }
}

/// NetdService backed by sysctl, iproute2 and iptables.
#[derive(Default)]
pub struct LinuxNetd {
    clatd: Mutex<HashMap<String, Child>>,
}

impl LinuxNetd {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write_ip_forward(&self, value: &str, operation: &'static str) -> Result<(), ServiceError> {
        std::fs::write(IP_FORWARD_SYSCTL, value).map_err(|e| {
            warn!("{operation}: writing {IP_FORWARD_SYSCTL} failed: {e}");
            ServiceError::new(errno::EPERM, operation)
        })
    }
}

impl NetdService for LinuxNetd {
    fn ip_forward_enable(&self) -> Result<(), ServiceError> {
        self.write_ip_forward("1\n", "ipfwdEnableForwarding")
    }

    fn ip_forward_disable(&self) -> Result<(), ServiceError> {
        self.write_ip_forward("0\n", "ipfwdDisableForwarding")
    }

    fn tether_start(&self, _dhcp_ranges: &[String]) -> Result<(), ServiceError> {
        // Downstreams run their own DHCP server; the daemon-level work
        // is the NAT rule.
        run(
            "tetherStart",
            "iptables",
            &["-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"],
        )
    }

    fn tether_stop(&self) -> Result<(), ServiceError> {
        run(
            "tetherStop",
            "iptables",
            &["-t", "nat", "-D", "POSTROUTING", "-j", "MASQUERADE"],
        )
    }

    fn tether_dns_set(&self, network: Network, dns: &[IpAddr]) -> Result<(), ServiceError> {
        // Downstream clients learn resolvers from DHCP option 6; there
        // is no separate forwarder daemon to program on plain Linux.
        info!("DNS forwarders for {network}: {dns:?}");
        Ok(())
    }

    fn tether_interface_add(&self, iface: &str) -> Result<(), ServiceError> {
        run(
            "tetherInterfaceAdd",
            "iptables",
            &["-A", "FORWARD", "-i", iface, "-j", "ACCEPT"],
        )
    }

    fn tether_interface_remove(&self, iface: &str) -> Result<(), ServiceError> {
        run(
            "tetherInterfaceRemove",
            "iptables",
            &["-D", "FORWARD", "-i", iface, "-j", "ACCEPT"],
        )
    }

    fn interface_set_cfg(
        &self,
        iface: &str,
        address: Option<Ipv4Net>,
        up: bool,
    ) -> Result<(), ServiceError> {
        run("interfaceSetCfg", "ip", &["addr", "flush", "dev", iface])?;
        if let Some(address) = address {
            let addr = address.to_string();
            run("interfaceSetCfg", "ip", &["addr", "add", &addr, "dev", iface])?;
        }
        let state = if up { "up" } else { "down" };
        run("interfaceSetCfg", "ip", &["link", "set", iface, state])
    }

    fn network_add_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError> {
        // Networks map to routing tables.
        let table = network.0.to_string();
        run(
            "networkAddInterface",
            "ip",
            &["rule", "add", "iif", iface, "lookup", &table],
        )
    }

    fn network_remove_interface(&self, network: Network, iface: &str) -> Result<(), ServiceError> {
        let table = network.0.to_string();
        run(
            "networkRemoveInterface",
            "ip",
            &["rule", "del", "iif", iface, "lookup", &table],
        )
    }

    fn route_add(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        route_cmd("networkAddRoute", "add", network, route)
    }

    fn route_remove(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        route_cmd("networkRemoveRoute", "del", network, route)
    }

    fn route_update(&self, network: Network, route: &RouteInfo) -> Result<(), ServiceError> {
        route_cmd("networkUpdateRoute", "replace", network, route)
    }

    fn ipfwd_add_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        run(
            "ipfwdAddInterfaceForward",
            "iptables",
            &["-A", "FORWARD", "-i", from, "-o", to, "-j", "ACCEPT"],
        )
    }

    fn ipfwd_remove_interface_forward(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        run(
            "ipfwdRemoveInterfaceForward",
            "iptables",
            &["-D", "FORWARD", "-i", from, "-o", to, "-j", "ACCEPT"],
        )
    }

    fn clatd_start(&self, iface: &str, prefix: Ipv6Net) -> Result<Ipv6Addr, ServiceError> {
        let prefix_arg = prefix.to_string();
        let child = Command::new("clatd")
            .args(["-i", iface, "-p", &prefix_arg])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                warn!("clatdStart: spawning clatd failed: {e}");
                ServiceError::new(errno::ENODEV, "clatdStart")
            })?;
        self.clatd.lock().insert(iface.to_string(), child);
        // clatd derives its own address; expose the unspecified address
        // until the stacked link reports real configuration.
        Ok(Ipv6Addr::UNSPECIFIED)
    }

    fn clatd_stop(&self, iface: &str) -> Result<(), ServiceError> {
        let Some(mut child) = self.clatd.lock().remove(iface) else {
            return Err(ServiceError::new(errno::ENOENT, "clatdStop"));
        };
        if let Err(e) = child.kill() {
            warn!("clatdStop: kill failed: {e}");
        }
        let _ = child.wait();
        Ok(())
    }
}

fn route_cmd(
    operation: &'static str,
    action: &str,
    network: Network,
    route: &RouteInfo,
) -> Result<(), ServiceError> {
    let table = network.0.to_string();
    let destination = route.destination.to_string();
    let mut args = vec!["route", action, &destination];
    let gateway;
    if let Some(gw) = route.gateway {
        gateway = gw.to_string();
        args.push("via");
        args.push(&gateway);
    }
    args.extend(["dev", route.interface.as_str(), "table", &table]);
    run(operation, "ip", &args)
}

/// Resolver service for platforms without a DNS64-capable resolver
/// daemon: discovery requests are accepted and never produce a result.
pub struct UnsupportedDnsResolver;

impl DnsResolverService for UnsupportedDnsResolver {
    fn start_prefix64_discovery(&self, network: Network) -> Result<(), ServiceError> {
        info!("prefix64 discovery unavailable on this platform ({network})");
        Ok(())
    }

    fn stop_prefix64_discovery(&self, _network: Network) -> Result<(), ServiceError> {
        Ok(())
    }

    fn set_prefix64(&self, _network: Network, _prefix: Option<Ipv6Net>) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// DHCP server backed by one dnsmasq process per downstream interface.
#[derive(Default)]
pub struct DnsmasqDhcpServer {
    children: Mutex<HashMap<String, Child>>,
}

impl DnsmasqDhcpServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DhcpServerController for DnsmasqDhcpServer {
    fn start(&self, iface: &str, params: &DhcpServerParams) -> Result<(), ServiceError> {
        let mut children = self.children.lock();
        if let Some(mut old) = children.remove(iface) {
            let _ = old.kill();
            let _ = old.wait();
        }

        let range = format!(
            "--dhcp-range={},{},{}s",
            params.range_start, params.range_end, params.lease_time_secs
        );
        let child = Command::new("dnsmasq")
            .args([
                "--keep-in-foreground",
                "--port=0",
                "--no-resolv",
                &format!("--interface={iface}"),
                "--bind-interfaces",
                &range,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                warn!("dhcpStart: spawning dnsmasq failed: {e}");
                ServiceError::new(errno::ENOENT, "dhcpStart")
            })?;
        info!("dnsmasq serving {iface} ({}-{})", params.range_start, params.range_end);
        children.insert(iface.to_string(), child);
        Ok(())
    }

    fn stop(&self, iface: &str) -> Result<(), ServiceError> {
        let Some(mut child) = self.children.lock().remove(iface) else {
            return Err(ServiceError::new(errno::ENOENT, "dhcpStop"));
        };
        if let Err(e) = child.kill() {
            warn!("dhcpStop: kill failed: {e}");
        }
        let _ = child.wait();
        Ok(())
    }
}
