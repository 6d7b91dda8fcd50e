//! Upstream network monitor
//!
//! Mirrors the platform's network table from raw network callbacks and
//! digests them into upstream notifications for the orchestrator. The
//! table is maintained continuously; notifications are only emitted while
//! the orchestrator is observing (i.e. some downstream is serving).

use std::collections::{BTreeSet, HashMap};

use ipnet::IpNet;
use tracing::{debug, info};

use crate::event::{EventSender, NetworkEvent, TetherEvent, UpstreamEvent};
use crate::net::{NetCapability, Network, Transport, UpstreamNetworkState};

/// Upstream selection inputs the orchestrator reads from config each time
/// it selects (DUN requirement can change at runtime).
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub dun_required: bool,
    pub allow_vpn: bool,
    pub prefer_test_networks: bool,
}

/// Tracks candidate upstream networks and the platform default.
pub struct UpstreamMonitor {
    networks: HashMap<Network, UpstreamNetworkState>,
    default_network: Option<Network>,
    local_prefixes: BTreeSet<IpNet>,
    try_cell: bool,
    observing: bool,
    events: EventSender,
}

impl UpstreamMonitor {
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self {
            networks: HashMap::new(),
            default_network: None,
            local_prefixes: BTreeSet::new(),
            try_cell: false,
            observing: false,
            events,
        }
    }

    /// Begin emitting upstream notifications.
    pub fn start_observing(&mut self) {
        self.observing = true;
        // Replay current state so the orchestrator sees what connected
        // before observation started.
        let mut networks: Vec<&UpstreamNetworkState> = self.networks.values().collect();
        networks.sort_by_key(|state| state.network);
        for state in networks {
            self.events
                .send(TetherEvent::Upstream(UpstreamEvent::LinkProperties(state.clone())));
        }
        self.emit_local_prefixes();
    }

    /// Stop emitting notifications. The network table keeps updating.
    pub fn stop_observing(&mut self) {
        self.observing = false;
        self.try_cell = false;
    }

    #[must_use]
    pub fn is_observing(&self) -> bool {
        self.observing
    }

    /// Request (or release) a cellular upstream. On a real platform this
    /// files a network request that can bring up DUN; here it only gates
    /// selection until the platform reports the network.
    pub fn set_try_cell(&mut self, try_cell: bool) {
        if self.try_cell != try_cell {
            debug!("try_cell -> {try_cell}");
        }
        self.try_cell = try_cell;
    }

    #[must_use]
    pub fn try_cell(&self) -> bool {
        self.try_cell
    }

    /// Current snapshot of known networks, for deprecation cleanup.
    #[must_use]
    pub fn all_networks(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self.networks.keys().copied().collect();
        networks.sort_unstable();
        networks
    }

    #[must_use]
    pub fn network_state(&self, network: Network) -> Option<&UpstreamNetworkState> {
        self.networks.get(&network)
    }

    /// Inject a stacked (clat) link into a tracked network and re-emit
    /// its link properties, so the new interface reaches every consumer
    /// the same way a platform update would.
    pub fn inject_stacked_link(&mut self, network: Network, stacked: crate::net::LinkProperties) {
        if let Some(state) = self.networks.get_mut(&network) {
            state.link_properties.add_stacked_link(stacked);
            let notify = state.clone();
            self.notify(UpstreamEvent::LinkProperties(notify));
            self.maybe_emit_local_prefixes();
        }
    }

    /// Remove a stacked link and re-emit, if the network still exists.
    pub fn remove_stacked_link(&mut self, network: Network, iface: &str) {
        if let Some(state) = self.networks.get_mut(&network) {
            if state.link_properties.remove_stacked_link(iface) {
                let notify = state.clone();
                self.notify(UpstreamEvent::LinkProperties(notify));
                self.maybe_emit_local_prefixes();
            }
        }
    }

    /// Ingest one platform callback, in arrival order.
    pub fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Available(state) => {
                info!("{} available", state.network);
                let notify = state.clone();
                self.networks.insert(state.network, state);
                self.notify(UpstreamEvent::LinkProperties(notify));
                self.maybe_emit_local_prefixes();
            }
            NetworkEvent::LinkPropertiesChanged {
                network,
                mut link_properties,
            } => {
                if let Some(state) = self.networks.get_mut(&network) {
                    // Platform updates do not know about injected clat
                    // links; carry them over unless the update brings its
                    // own stacked set.
                    if link_properties.stacked_links.is_empty() {
                        link_properties.stacked_links =
                            std::mem::take(&mut state.link_properties.stacked_links);
                    }
                    state.link_properties = link_properties;
                    let notify = state.clone();
                    self.notify(UpstreamEvent::LinkProperties(notify));
                    self.maybe_emit_local_prefixes();
                }
            }
            NetworkEvent::CapabilitiesChanged {
                network,
                capabilities,
            } => {
                if let Some(state) = self.networks.get_mut(&network) {
                    state.capabilities = capabilities;
                    let notify = state.clone();
                    self.notify(UpstreamEvent::Capabilities(notify));
                }
            }
            NetworkEvent::Lost { network } => {
                info!("{network} lost");
                self.networks.remove(&network);
                if self.default_network == Some(network) {
                    self.default_network = None;
                }
                self.notify(UpstreamEvent::Lost(network));
                self.maybe_emit_local_prefixes();
            }
            NetworkEvent::DefaultSwitched { network } => {
                self.default_network = network;
                let state = network.and_then(|n| self.networks.get(&n)).cloned();
                self.notify(UpstreamEvent::DefaultSwitched(state));
            }
        }
    }

    /// Preferred upstream in auto-select mode: a test network when the
    /// policy prefers them, a DUN network when required, otherwise the
    /// platform default.
    #[must_use]
    pub fn get_current_preferred_upstream(
        &self,
        policy: SelectionPolicy,
    ) -> Option<&UpstreamNetworkState> {
        if policy.prefer_test_networks {
            if let Some(state) = self.first_with(|s| {
                s.capabilities.has_transport(Transport::Test)
            }) {
                return Some(state);
            }
        }

        if policy.dun_required {
            return self.first_with(|s| {
                s.capabilities.has_transport(Transport::Cellular)
                    && s.capabilities.has_capability(NetCapability::Dun)
            });
        }

        let default = self
            .default_network
            .and_then(|network| self.networks.get(&network))?;
        if default.capabilities.is_vpn() && !policy.allow_vpn {
            return None;
        }
        Some(default)
    }

    /// Explicit priority walk over preferred transports.
    #[must_use]
    pub fn select_preferred_upstream_type(
        &self,
        preferred: &[Transport],
        policy: SelectionPolicy,
    ) -> Option<&UpstreamNetworkState> {
        for transport in preferred {
            let candidate = self.first_with(|s| {
                if !s.capabilities.has_transport(*transport) {
                    return false;
                }
                if !s.capabilities.has_capability(NetCapability::Internet) {
                    return false;
                }
                if s.capabilities.is_vpn() && !policy.allow_vpn {
                    return false;
                }
                if *transport == Transport::Cellular
                    && policy.dun_required
                    && !s.capabilities.has_capability(NetCapability::Dun)
                {
                    return false;
                }
                true
            });
            if candidate.is_some() {
                return candidate;
            }
        }
        None
    }

    fn first_with(
        &self,
        predicate: impl Fn(&UpstreamNetworkState) -> bool,
    ) -> Option<&UpstreamNetworkState> {
        // Deterministic order: lowest netId wins among equals.
        let mut candidates: Vec<&UpstreamNetworkState> = self
            .networks
            .values()
            .filter(|s| predicate(s))
            .collect();
        candidates.sort_by_key(|state| state.network);
        candidates.first().copied()
    }

    fn notify(&self, event: UpstreamEvent) {
        if self.observing {
            self.events.send(TetherEvent::Upstream(event));
        }
    }

    /// On-device prefixes across all tracked networks; offload must not
    /// touch traffic destined to them.
    fn compute_local_prefixes(&self) -> BTreeSet<IpNet> {
        self.networks
            .values()
            .flat_map(|state| state.link_properties.link_addresses.iter())
            .map(|address| address.trunc())
            .collect()
    }

    fn maybe_emit_local_prefixes(&mut self) {
        let prefixes = self.compute_local_prefixes();
        if prefixes != self.local_prefixes {
            self.local_prefixes = prefixes.clone();
            self.notify(UpstreamEvent::LocalPrefixes(prefixes));
        }
    }

    fn emit_local_prefixes(&mut self) {
        self.local_prefixes = self.compute_local_prefixes();
        self.notify(UpstreamEvent::LocalPrefixes(self.local_prefixes.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::event::channel;
    use crate::net::{LinkProperties, NetworkCapabilities};

    fn state(id: u32, iface: &str, transport: Transport, caps: &[NetCapability]) -> UpstreamNetworkState {
        let mut lp = LinkProperties::new(iface);
        lp.link_addresses.push("10.20.30.5/24".parse().unwrap());
        UpstreamNetworkState::new(
            Network(id),
            lp,
            NetworkCapabilities::new(vec![transport], caps.to_vec()),
        )
    }

    fn internet() -> Vec<NetCapability> {
        vec![NetCapability::Internet, NetCapability::NotVpn]
    }

    fn monitor() -> (UpstreamMonitor, UnboundedReceiver<TetherEvent>) {
        let (tx, rx) = channel();
        (UpstreamMonitor::new(tx), rx)
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy {
            dun_required: false,
            allow_vpn: false,
            prefer_test_networks: false,
        }
    }

    #[test]
    fn silent_until_observing() {
        let (mut monitor, mut rx) = monitor();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));
        assert!(rx.try_recv().is_err());

        monitor.start_observing();
        // Replay of the known network plus local prefixes.
        assert!(matches!(
            rx.try_recv().unwrap(),
            TetherEvent::Upstream(UpstreamEvent::LinkProperties(_))
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TetherEvent::Upstream(UpstreamEvent::LocalPrefixes(_))
        ));
    }

    #[test]
    fn default_network_is_preferred() {
        let (mut monitor, _rx) = monitor();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));
        monitor.handle_network_event(NetworkEvent::Available(state(
            2,
            "wlan1",
            Transport::Wifi,
            &internet(),
        )));
        monitor.handle_network_event(NetworkEvent::DefaultSwitched {
            network: Some(Network(2)),
        });

        let chosen = monitor.get_current_preferred_upstream(policy()).unwrap();
        assert_eq!(chosen.network, Network(2));
    }

    #[test]
    fn vpn_default_is_rejected_unless_allowed() {
        let (mut monitor, _rx) = monitor();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "tun0",
            Transport::Vpn,
            &[NetCapability::Internet],
        )));
        monitor.handle_network_event(NetworkEvent::DefaultSwitched {
            network: Some(Network(1)),
        });

        assert!(monitor.get_current_preferred_upstream(policy()).is_none());

        let mut allow = policy();
        allow.allow_vpn = true;
        assert!(monitor.get_current_preferred_upstream(allow).is_some());
    }

    #[test]
    fn dun_requirement_narrows_choice() {
        let (mut monitor, _rx) = monitor();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));
        monitor.handle_network_event(NetworkEvent::DefaultSwitched {
            network: Some(Network(1)),
        });

        let mut dun = policy();
        dun.dun_required = true;
        assert!(monitor.get_current_preferred_upstream(dun).is_none());

        let mut caps = internet();
        caps.push(NetCapability::Dun);
        monitor.handle_network_event(NetworkEvent::Available(state(
            7,
            "rmnet_dun0",
            Transport::Cellular,
            &caps,
        )));
        let chosen = monitor.get_current_preferred_upstream(dun).unwrap();
        assert_eq!(chosen.network, Network(7));
    }

    #[test]
    fn explicit_priority_walk() {
        let (mut monitor, _rx) = monitor();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));
        monitor.handle_network_event(NetworkEvent::Available(state(
            2,
            "wlan1",
            Transport::Wifi,
            &internet(),
        )));

        let chosen = monitor
            .select_preferred_upstream_type(
                &[Transport::Ethernet, Transport::Wifi, Transport::Cellular],
                policy(),
            )
            .unwrap();
        assert_eq!(chosen.network, Network(2));

        let chosen = monitor
            .select_preferred_upstream_type(&[Transport::Cellular], policy())
            .unwrap();
        assert_eq!(chosen.network, Network(1));

        assert!(monitor
            .select_preferred_upstream_type(&[Transport::Bluetooth], policy())
            .is_none());
    }

    #[test]
    fn lost_network_clears_default_and_notifies() {
        let (mut monitor, mut rx) = monitor();
        monitor.start_observing();
        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));
        monitor.handle_network_event(NetworkEvent::DefaultSwitched {
            network: Some(Network(1)),
        });
        while rx.try_recv().is_ok() {}

        monitor.handle_network_event(NetworkEvent::Lost { network: Network(1) });
        assert!(monitor.get_current_preferred_upstream(policy()).is_none());

        let mut saw_lost = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, TetherEvent::Upstream(UpstreamEvent::Lost(Network(1)))) {
                saw_lost = true;
            }
        }
        assert!(saw_lost);
    }

    #[test]
    fn local_prefixes_follow_link_changes() {
        let (mut monitor, mut rx) = monitor();
        monitor.start_observing();
        while rx.try_recv().is_ok() {}

        monitor.handle_network_event(NetworkEvent::Available(state(
            1,
            "rmnet0",
            Transport::Cellular,
            &internet(),
        )));

        let mut prefixes = None;
        while let Ok(ev) = rx.try_recv() {
            if let TetherEvent::Upstream(UpstreamEvent::LocalPrefixes(set)) = ev {
                prefixes = Some(set);
            }
        }
        let prefixes = prefixes.expect("local prefixes emitted");
        assert!(prefixes.contains(&"10.20.30.0/24".parse::<IpNet>().unwrap()));
    }
}
