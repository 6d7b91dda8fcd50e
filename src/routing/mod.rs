//! Routing and kernel-facing services
//!
//! The control plane never manipulates kernel state directly; everything
//! goes through the narrow service traits in [`netd`], and route or
//! interface bookkeeping goes through the [`RoutingCoordinator`].

pub mod coordinator;
pub mod linux;
pub mod netd;

pub use coordinator::RoutingCoordinator;
pub use linux::{DnsmasqDhcpServer, LinuxNetd, UnsupportedDnsResolver};
pub use netd::{
    DhcpServerController, DhcpServerParams, DnsResolverService, FakeDhcpServer, FakeDnsResolver,
    FakeNetd, NetdOp, NetdService,
};
