//! Typed event bus
//!
//! Every external signal (interface netlink, USB gadget state, Wi-Fi AP
//! state, platform network callbacks, IPC calls) becomes one `TetherEvent`
//! posted onto a single-consumer channel. The control plane consumes the
//! channel serially, so all state transitions happen in one total order
//! and no component ever sees another mid-transition.

use std::collections::BTreeSet;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ipc::protocol::IpcRequest;
use crate::ipserver::{ServerId, ServingMode};
use crate::net::{DownstreamType, LinkProperties, Network, NetworkCapabilities, UpstreamNetworkState};

/// A Wi-Fi Direct group notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiP2pGroup {
    pub interface_name: String,
    pub is_group_owner: bool,
}

/// Raw platform network callbacks, consumed by the upstream monitor.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Available(UpstreamNetworkState),
    LinkPropertiesChanged {
        network: Network,
        link_properties: LinkProperties,
    },
    CapabilitiesChanged {
        network: Network,
        capabilities: NetworkCapabilities,
    },
    Lost {
        network: Network,
    },
    DefaultSwitched {
        network: Option<Network>,
    },
}

/// Digested upstream notifications, emitted by the upstream monitor for
/// the orchestrator.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    LinkProperties(UpstreamNetworkState),
    Capabilities(UpstreamNetworkState),
    Lost(Network),
    DefaultSwitched(Option<UpstreamNetworkState>),
    LocalPrefixes(BTreeSet<IpNet>),
}

/// Everything the control-plane loop reacts to.
#[derive(Debug)]
pub enum TetherEvent {
    /// Kernel interface appeared/disappeared or changed link state.
    InterfaceStateChanged { iface: String, up: bool },

    /// USB gadget state broadcast.
    UsbStateChanged {
        connected: bool,
        configured: bool,
        rndis: bool,
        ncm: bool,
    },

    /// Wi-Fi AP enabled or disabled. The interface name may be absent on
    /// legacy platforms (see `legacy_wifi_ap_compat`).
    WifiApStateChanged {
        enabled: bool,
        iface: Option<String>,
        local_only: bool,
    },

    /// Wi-Fi Direct group formed or dissolved.
    WifiP2pGroupChanged { group: Option<WifiP2pGroup> },

    /// The DISALLOW_CONFIG_TETHERING user restriction changed.
    UserRestrictionsChanged { disallow_config_tethering: bool },

    /// A runtime settings toggle (e.g. forced USB NCM function).
    ForceUsbNcmChanged { force_ncm: bool },

    /// Platform network callback for the upstream monitor.
    Network(NetworkEvent),

    /// DNS64 prefix discovery result from the resolver.
    Nat64PrefixDiscovered {
        network: Network,
        prefix: Option<ipnet::Ipv6Net>,
    },

    /// Digested upstream notification for the orchestrator.
    Upstream(UpstreamEvent),

    /// Entitlement/permission re-evaluation requested.
    UpstreamPermissionChanged,

    /// Delayed upstream re-selection.
    RetryUpstream,

    /// Leave an orchestrator error state.
    ClearError,

    /// A downstream entered serving state.
    ServingStateActive { id: ServerId, mode: ServingMode },

    /// A downstream left serving state.
    ServingStateInactive { id: ServerId },

    /// A downstream's link properties changed.
    ServerLinkProperties {
        id: ServerId,
        tethered: bool,
        link_properties: LinkProperties,
    },

    /// A downstream asks the orchestrator to start or stop a type.
    RequestChangeDownstream {
        tethering_type: DownstreamType,
        enable: bool,
    },

    /// An IPC call with its reply channel.
    Ipc(IpcRequest),

    /// Stop the control plane.
    Shutdown,
}

/// Sending half of the event bus. Cheap to clone; safe to use from any
/// task or thread.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TetherEvent>,
}

impl EventSender {
    /// Post an event. Drops silently if the loop has shut down.
    pub fn send(&self, event: TetherEvent) {
        trace!("posting event: {event:?}");
        if self.tx.send(event).is_err() {
            debug!("event bus closed, dropping event");
        }
    }

    /// Post an event after `delay`. Requires a running tokio runtime;
    /// without one the event is dropped (unit tests drive handlers
    /// directly instead).
    pub fn send_delayed(&self, event: TetherEvent, delay: Duration) {
        let tx = self.tx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(event);
                });
            }
            Err(_) => debug!("no runtime, dropping delayed event: {event:?}"),
        }
    }
}

/// Create the event bus.
#[must_use]
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<TetherEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_delivers_in_order() {
        let (tx, mut rx) = channel();
        tx.send(TetherEvent::RetryUpstream);
        tx.send(TetherEvent::ClearError);

        assert!(matches!(rx.try_recv().unwrap(), TetherEvent::RetryUpstream));
        assert!(matches!(rx.try_recv().unwrap(), TetherEvent::ClearError));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_close_does_not_panic() {
        let (tx, rx) = channel();
        drop(rx);
        tx.send(TetherEvent::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_send_fires_after_delay() {
        let (tx, mut rx) = channel();
        tx.send_delayed(TetherEvent::RetryUpstream, Duration::from_secs(10));

        assert!(rx.try_recv().is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        // Yield so the spawned task runs.
        tokio::task::yield_now().await;
        assert!(matches!(rx.recv().await.unwrap(), TetherEvent::RetryUpstream));
    }
}
