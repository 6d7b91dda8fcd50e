//! tetherd: tethering control plane
//!
//! This crate turns a Linux device into an IP gateway that shares one or
//! more upstream connections with downstream clients over USB, Wi-Fi
//! SoftAP, Bluetooth PAN, Wi-Fi Direct, Ethernet, NCM or virtual TAP
//! carriers.
//!
//! # Architecture
//!
//! ```text
//! USB / Wi-Fi AP / netlink / IPC ──► EventBus ──► Tethering (orchestrator)
//!                                                  │
//!                     ┌──────────┬─────────────────┼───────────┬──────────┐
//!                     ▼          ▼                 ▼           ▼          ▼
//!                 IpServer   UpstreamMonitor   Offload    Nat464      Callback
//!                 (per-      (default network  Controller (per-net    Registry
//!                 downstream) + candidates)               clat)       (redacted)
//!                     │
//!                     ▼
//!              RoutingCoordinator ──► netd / dnsresolver / DHCP traits
//!                     │
//!                     ▼
//!            PrivateAddressCoordinator (conflict-free /24 allocation)
//! ```
//!
//! Everything above the collaborator traits runs on one serial event
//! loop; external processes talk to it over the Unix-socket IPC surface.
//!
//! # Modules
//!
//! - [`addr`]: private IPv4 prefix allocation and conflict tracking
//! - [`callbacks`]: listener registry with privilege redaction
//! - [`config`]: configuration types and loading
//! - [`error`]: error types and result codes
//! - [`event`]: the typed event bus
//! - [`ipc`]: Unix-socket control protocol, server and permissions
//! - [`ipserver`]: per-downstream state machine
//! - [`nat464`]: per-network 464xlat control
//! - [`net`]: shared network data model
//! - [`offload`]: hardware offload control
//! - [`orchestrator`]: the top-level tethering state machine
//! - [`routing`]: routing coordinator and kernel service traits
//! - [`upstream`]: upstream network monitor

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod addr;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod event;
pub mod ipc;
pub mod ipserver;
pub mod nat464;
pub mod net;
pub mod offload;
pub mod orchestrator;
pub mod routing;
pub mod upstream;

// Re-export commonly used types at the crate root.
pub use callbacks::{
    CallbackEvent, CallbackRegistry, ChannelCallbackSink, DownstreamState, DownstreamStateKind,
    EventCallbackSink, ListenerCookie, TetheredClient,
};
pub use config::{load_config, load_config_str, load_config_with_env, Config};
pub use error::{
    ConfigError, IpServerError, IpcError, Result, ServiceError, TetherResultCode, TetherdError,
};
pub use event::{EventSender, NetworkEvent, TetherEvent, UpstreamEvent, WifiP2pGroup};
pub use ipc::{CallerIdentity, IpcClient, IpcCommand, IpcResponse, IpcServer, Permission};
pub use ipserver::{IpServer, IpServerCommand, IpServerPhase, ServerId, ServingMode};
pub use nat464::{translate_v4_to_v6, ClatState, Nat464Controller};
pub use net::{
    ConnectivityScope, DownstreamType, LinkProperties, NetCapability, Network,
    NetworkCapabilities, RouteInfo, SoftApConfig, TetheringRequest, Transport,
    UpstreamNetworkState,
};
pub use offload::{OffloadController, OffloadStatus};
pub use orchestrator::{fake_deps, MainSmState, SharedState, Tethering, TetheringDeps};
pub use routing::{
    DhcpServerController, DhcpServerParams, DnsResolverService, NetdService, RoutingCoordinator,
};
pub use upstream::{SelectionPolicy, UpstreamMonitor};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
