//! Per-downstream state machine
//!
//! One `IpServer` exists for every tetherable interface that is present.
//! It owns the interface's IPv4 configuration, DHCP server and forwarding
//! pairs, and reports serving-state changes to the orchestrator over the
//! event bus.

pub mod server;

pub use server::{
    IpServer, IpServerCommand, IpServerDeps, IpServerPhase, ServingMode, LOCAL_NET_ID,
};

use std::fmt;

/// Stable identifier of one downstream server, assigned by the
/// orchestrator. Survives as a key in the address coordinator even after
/// the server is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}
