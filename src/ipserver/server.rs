//! Downstream interface state machine
//!
//! Phases: UNAVAILABLE -> AVAILABLE -> TETHERED | LOCAL_ONLY -> AVAILABLE
//! -> UNAVAILABLE. Serving setup is a strict step sequence; any failing
//! step reverts the ones before it and parks the server in AVAILABLE with
//! `last_error` set.

use std::collections::BTreeSet;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::{debug, info, warn};

use super::ServerId;
use crate::error::{IpServerError, TetherResultCode};
use crate::event::{EventSender, TetherEvent};
use crate::net::{ConnectivityScope, DownstreamType, LinkProperties, Network, RouteInfo, TetheringRequest};
use crate::routing::{DhcpServerController, DhcpServerParams, RoutingCoordinator};

/// The local network's routing namespace; downstream interfaces live
/// there so local-only traffic routes without an upstream.
pub const LOCAL_NET_ID: Network = Network(99);

/// Serving mode, fixed by the request scope at enable time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingMode {
    Tethered,
    LocalOnly,
}

impl From<ConnectivityScope> for ServingMode {
    fn from(scope: ConnectivityScope) -> Self {
        match scope {
            ConnectivityScope::Global => ServingMode::Tethered,
            ConnectivityScope::Local => ServingMode::LocalOnly,
        }
    }
}

impl ServingMode {
    #[must_use]
    pub fn scope(self) -> ConnectivityScope {
        match self {
            ServingMode::Tethered => ConnectivityScope::Global,
            ServingMode::LocalOnly => ConnectivityScope::Local,
        }
    }
}

/// Lifecycle phase of a downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpServerPhase {
    Unavailable,
    Available,
    Tethered,
    LocalOnly,
}

impl IpServerPhase {
    #[must_use]
    pub fn is_serving(self) -> bool {
        matches!(self, IpServerPhase::Tethered | IpServerPhase::LocalOnly)
    }
}

/// Commands delivered to a downstream server by the orchestrator (all on
/// the tethering thread).
#[derive(Debug)]
pub enum IpServerCommand {
    /// AVAILABLE -> TETHERED | LOCAL_ONLY.
    Enable {
        mode: ServingMode,
        request: TetheringRequest,
    },
    /// Serving -> AVAILABLE.
    Unwanted,
    /// Any -> UNAVAILABLE (interface disappeared).
    InterfaceDown,
    /// New upstream interface set; `None` means no upstream.
    TetherConnectionChanged {
        upstream_ifaces: Option<BTreeSet<String>>,
    },
    /// The assigned prefix now conflicts with an upstream.
    NotifyPrefixConflict,
    /// Upstream-delegated IPv6 prefix for proxied tethered IPv6.
    UpstreamIpv6Changed { prefix: Option<Ipv6Net> },
    /// Orchestrator-level failure fanned out to serving downstreams.
    ErrorNotification { code: TetherResultCode },
}

/// Collaborators handed in per call; the server holds no references
/// between events.
pub struct IpServerDeps<'a> {
    pub routing: &'a mut RoutingCoordinator,
    pub dhcp: &'a dyn DhcpServerController,
    pub events: &'a EventSender,
    pub lease_time_secs: u32,
}

/// State machine for one downstream interface.
pub struct IpServer {
    id: ServerId,
    iface: String,
    tethering_type: DownstreamType,
    phase: IpServerPhase,
    last_error: TetherResultCode,
    serving_mode: Option<ServingMode>,
    request: Option<TetheringRequest>,
    ipv4_address: Option<Ipv4Net>,
    delegated_ipv6: Option<Ipv6Net>,
    upstream_ifaces: BTreeSet<String>,
    dhcp_running: bool,
    tether_iface_added: bool,
    in_local_network: bool,
    link_properties: LinkProperties,
}

impl IpServer {
    #[must_use]
    pub fn new(id: ServerId, iface: impl Into<String>, tethering_type: DownstreamType) -> Self {
        let iface = iface.into();
        Self {
            id,
            link_properties: LinkProperties::new(iface.clone()),
            iface,
            tethering_type,
            phase: IpServerPhase::Unavailable,
            last_error: TetherResultCode::NoError,
            serving_mode: None,
            request: None,
            ipv4_address: None,
            delegated_ipv6: None,
            upstream_ifaces: BTreeSet::new(),
            dhcp_running: false,
            tether_iface_added: false,
            in_local_network: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ServerId {
        self.id
    }

    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.iface
    }

    #[must_use]
    pub fn tethering_type(&self) -> DownstreamType {
        self.tethering_type
    }

    #[must_use]
    pub fn is_ncm(&self) -> bool {
        self.tethering_type == DownstreamType::Ncm
    }

    #[must_use]
    pub fn phase(&self) -> IpServerPhase {
        self.phase
    }

    #[must_use]
    pub fn last_error(&self) -> TetherResultCode {
        self.last_error
    }

    #[must_use]
    pub fn serving_mode(&self) -> Option<ServingMode> {
        self.serving_mode
    }

    #[must_use]
    pub fn ipv4_address(&self) -> Option<Ipv4Net> {
        self.ipv4_address
    }

    #[must_use]
    pub fn link_properties(&self) -> &LinkProperties {
        &self.link_properties
    }

    #[must_use]
    pub fn request(&self) -> Option<&TetheringRequest> {
        self.request.as_ref()
    }

    /// Interface became present: UNAVAILABLE -> AVAILABLE.
    pub fn start(&mut self) {
        if self.phase != IpServerPhase::Unavailable {
            return;
        }
        debug!("{}: available on {}", self.id, self.iface);
        self.phase = IpServerPhase::Available;
        self.last_error = TetherResultCode::NoError;
    }

    /// Dispatch one command. All transitions happen synchronously; state
    /// change notifications are posted onto the event bus for the
    /// orchestrator to pick up in order.
    pub fn handle_command(&mut self, command: IpServerCommand, deps: &mut IpServerDeps<'_>) {
        match command {
            IpServerCommand::Enable { mode, request } => {
                if let Err(e) = self.enable(mode, request, deps) {
                    warn!("{}: enable failed: {e}", self.id);
                }
            }
            IpServerCommand::Unwanted => {
                if self.phase.is_serving() {
                    self.tear_down_serving(deps);
                    self.phase = IpServerPhase::Available;
                    self.notify_inactive(deps);
                }
            }
            IpServerCommand::InterfaceDown => {
                if self.phase.is_serving() {
                    self.tear_down_serving(deps);
                    self.notify_inactive(deps);
                }
                self.phase = IpServerPhase::Unavailable;
            }
            IpServerCommand::TetherConnectionChanged { upstream_ifaces } => {
                self.update_upstream_forwards(upstream_ifaces, deps);
            }
            IpServerCommand::NotifyPrefixConflict => {
                self.handle_prefix_conflict(deps);
            }
            IpServerCommand::UpstreamIpv6Changed { prefix } => {
                self.update_delegated_ipv6(prefix, deps);
            }
            IpServerCommand::ErrorNotification { code } => {
                self.last_error = code;
                if self.phase.is_serving() {
                    self.tear_down_serving(deps);
                    self.phase = IpServerPhase::Available;
                    self.notify_inactive(deps);
                }
            }
        }
    }

    /// Bring the downstream up in the requested mode.
    fn enable(
        &mut self,
        mode: ServingMode,
        request: TetheringRequest,
        deps: &mut IpServerDeps<'_>,
    ) -> Result<(), IpServerError> {
        if self.phase != IpServerPhase::Available {
            return Err(IpServerError::InvalidPhase {
                phase: match self.phase {
                    IpServerPhase::Unavailable => "unavailable",
                    IpServerPhase::Available => "available",
                    IpServerPhase::Tethered => "tethered",
                    IpServerPhase::LocalOnly => "local-only",
                },
            });
        }

        self.last_error = TetherResultCode::NoError;
        self.serving_mode = Some(mode);
        self.request = Some(request);

        if let Err(e) = self.bring_up(mode, deps) {
            self.last_error = e.result_code();
            self.tear_down_serving(deps);
            self.serving_mode = None;
            // Stay in AVAILABLE; the orchestrator reads last_error from
            // the state broadcast.
            self.notify_inactive(deps);
            return Err(e);
        }

        self.phase = match mode {
            ServingMode::Tethered => IpServerPhase::Tethered,
            ServingMode::LocalOnly => IpServerPhase::LocalOnly,
        };
        info!("{}: serving {} as {:?}", self.id, self.iface, mode);

        deps.events.send(TetherEvent::ServingStateActive {
            id: self.id,
            mode,
        });
        self.publish_link_properties(deps);
        Ok(())
    }

    /// The serving step sequence. Each step records what it did on self
    /// so `tear_down_serving` can revert exactly as far as we got.
    fn bring_up(
        &mut self,
        mode: ServingMode,
        deps: &mut IpServerDeps<'_>,
    ) -> Result<(), IpServerError> {
        let address = deps
            .routing
            .request_sticky_downstream_address(self.id, self.tethering_type, mode.scope())
            .ok_or(IpServerError::NoAddressAvailable)?;
        self.ipv4_address = Some(address);

        deps.routing
            .set_interface_config(&self.iface, Some(address), true)?;

        deps.routing
            .add_interface_to_network(LOCAL_NET_ID, &self.iface)?;
        self.in_local_network = true;

        let prefix_route = RouteInfo::direct(IpNet::V4(address.trunc()), &self.iface);
        deps.routing.add_route(LOCAL_NET_ID, &prefix_route)?;

        let params = DhcpServerParams::from_prefix(address, deps.lease_time_secs);
        deps.dhcp
            .start(&self.iface, &params)
            .map_err(|e| IpServerError::Dhcp {
                iface: self.iface.clone(),
                reason: e.to_string(),
            })?;
        self.dhcp_running = true;

        if mode == ServingMode::Tethered {
            deps.routing.tether_interface_add(&self.iface)?;
            self.tether_iface_added = true;
        } else {
            // Local-only serving carries a ULA so IPv6-capable clients
            // get addressing without an upstream.
            self.link_properties
                .link_addresses
                .push(IpNet::V6(local_only_ula(self.id)));
        }

        self.link_properties.link_addresses.push(IpNet::V4(address));
        Ok(())
    }

    /// Best-effort teardown of whatever `bring_up` managed to install.
    /// Failures are logged; the interface is usually going away anyway.
    fn tear_down_serving(&mut self, deps: &mut IpServerDeps<'_>) {
        if self.tether_iface_added {
            if let Err(e) = deps.routing.tether_interface_remove(&self.iface) {
                warn!("{}: tetherInterfaceRemove failed: {e}", self.id);
            }
            self.tether_iface_added = false;
        }

        deps.routing.remove_all_forwards_from(&self.iface);
        self.upstream_ifaces.clear();

        if self.dhcp_running {
            if let Err(e) = deps.dhcp.stop(&self.iface) {
                warn!("{}: dhcp stop failed: {e}", self.id);
            }
            self.dhcp_running = false;
        }

        if let Some(address) = self.ipv4_address.take() {
            let prefix_route = RouteInfo::direct(IpNet::V4(address.trunc()), &self.iface);
            if let Err(e) = deps.routing.remove_route(LOCAL_NET_ID, &prefix_route) {
                warn!("{}: route removal failed: {e}", self.id);
            }
            if self.in_local_network {
                if let Err(e) = deps
                    .routing
                    .remove_interface_from_network(LOCAL_NET_ID, &self.iface)
                {
                    warn!("{}: local network removal failed: {e}", self.id);
                }
            }
            if let Err(e) = deps.routing.set_interface_config(&self.iface, None, false) {
                warn!("{}: interface unconfigure failed: {e}", self.id);
            }
            deps.routing.release_downstream(self.id);
        } else if self.in_local_network {
            if let Err(e) = deps
                .routing
                .remove_interface_from_network(LOCAL_NET_ID, &self.iface)
            {
                warn!("{}: local network removal failed: {e}", self.id);
            }
        }
        self.in_local_network = false;

        self.delegated_ipv6 = None;
        self.serving_mode = None;
        self.link_properties = LinkProperties::new(self.iface.clone());
        self.publish_link_properties(deps);
    }

    /// Apply a new upstream interface set by diffing forwards.
    fn update_upstream_forwards(
        &mut self,
        upstream_ifaces: Option<BTreeSet<String>>,
        deps: &mut IpServerDeps<'_>,
    ) {
        if self.phase != IpServerPhase::Tethered {
            return;
        }
        let new_set = upstream_ifaces.unwrap_or_default();

        let stale: Vec<String> = self
            .upstream_ifaces
            .difference(&new_set)
            .cloned()
            .collect();
        for upstream in stale {
            if let Err(e) = deps.routing.remove_interface_forward(&self.iface, &upstream) {
                warn!("{}: forward removal to {upstream} failed: {e}", self.id);
            }
            self.upstream_ifaces.remove(&upstream);
        }

        let added: Vec<String> = new_set
            .difference(&self.upstream_ifaces)
            .cloned()
            .collect();
        for upstream in added {
            match deps.routing.add_interface_forward(&self.iface, &upstream) {
                Ok(()) => {
                    self.upstream_ifaces.insert(upstream);
                }
                Err(e) => {
                    warn!("{}: forward to {upstream} failed: {e}", self.id);
                    self.last_error = TetherResultCode::InternalError;
                    self.tear_down_serving(deps);
                    self.phase = IpServerPhase::Available;
                    self.notify_inactive(deps);
                    return;
                }
            }
        }
    }

    /// The assigned prefix collided with an upstream: drop it and pick a
    /// new one. With no address left the downstream gives up serving.
    fn handle_prefix_conflict(&mut self, deps: &mut IpServerDeps<'_>) {
        if !self.phase.is_serving() {
            return;
        }
        let Some(mode) = self.serving_mode else {
            return;
        };
        info!("{}: prefix conflict on {}", self.id, self.iface);

        // Drop the conflicting IPv4 setup but keep the serving phase
        // while we try to recover.
        if self.dhcp_running {
            if let Err(e) = deps.dhcp.stop(&self.iface) {
                warn!("{}: dhcp stop failed: {e}", self.id);
            }
            self.dhcp_running = false;
        }
        if let Some(address) = self.ipv4_address.take() {
            let prefix_route = RouteInfo::direct(IpNet::V4(address.trunc()), &self.iface);
            if let Err(e) = deps.routing.remove_route(LOCAL_NET_ID, &prefix_route) {
                warn!("{}: route removal failed: {e}", self.id);
            }
            self.link_properties
                .link_addresses
                .retain(|net| *net != IpNet::V4(address));
            deps.routing.release_downstream(self.id);
        }

        // The sticky path skips a cached address that still conflicts.
        let fresh = deps
            .routing
            .request_sticky_downstream_address(self.id, self.tethering_type, mode.scope());

        match fresh {
            Some(address) => {
                let reconfigured = deps
                    .routing
                    .set_interface_config(&self.iface, Some(address), true)
                    .and_then(|()| {
                        let route = RouteInfo::direct(IpNet::V4(address.trunc()), &self.iface);
                        deps.routing.add_route(LOCAL_NET_ID, &route)
                    });
                if let Err(e) = reconfigured {
                    warn!("{}: reconfigure after conflict failed: {e}", self.id);
                    self.fail_serving(TetherResultCode::InternalError, deps);
                    return;
                }

                let params = DhcpServerParams::from_prefix(address, deps.lease_time_secs);
                if let Err(e) = deps.dhcp.start(&self.iface, &params) {
                    warn!("{}: dhcp restart after conflict failed: {e}", self.id);
                    self.fail_serving(TetherResultCode::InternalError, deps);
                    return;
                }
                self.dhcp_running = true;
                self.ipv4_address = Some(address);
                self.link_properties.link_addresses.push(IpNet::V4(address));
                self.publish_link_properties(deps);
            }
            None => {
                self.fail_serving(TetherResultCode::NoAddressAvailable, deps);
            }
        }
    }

    fn update_delegated_ipv6(&mut self, prefix: Option<Ipv6Net>, deps: &mut IpServerDeps<'_>) {
        if self.phase != IpServerPhase::Tethered {
            return;
        }
        if self.delegated_ipv6 == prefix {
            return;
        }
        if let Some(old) = self.delegated_ipv6.take() {
            self.link_properties
                .link_addresses
                .retain(|net| *net != IpNet::V6(old));
        }
        if let Some(new) = prefix {
            self.link_properties.link_addresses.push(IpNet::V6(new));
            self.delegated_ipv6 = Some(new);
        }
        self.publish_link_properties(deps);
    }

    fn fail_serving(&mut self, code: TetherResultCode, deps: &mut IpServerDeps<'_>) {
        self.last_error = code;
        self.tear_down_serving(deps);
        self.phase = IpServerPhase::Available;
        self.notify_inactive(deps);
    }

    fn notify_inactive(&self, deps: &IpServerDeps<'_>) {
        deps.events
            .send(TetherEvent::ServingStateInactive { id: self.id });
    }

    fn publish_link_properties(&self, deps: &IpServerDeps<'_>) {
        deps.events.send(TetherEvent::ServerLinkProperties {
            id: self.id,
            tethered: self.phase == IpServerPhase::Tethered
                || self.serving_mode == Some(ServingMode::Tethered),
            link_properties: self.link_properties.clone(),
        });
    }
}

/// ULA for local-only serving. The subnet only has to be unique within
/// this device, so it is derived from the server id.
fn local_only_ula(id: ServerId) -> Ipv6Net {
    let hi = ((id.0 >> 16) & 0xffff) as u16;
    let lo = (id.0 & 0xffff) as u16;
    let addr = std::net::Ipv6Addr::new(0xfd00, hi, lo, 0, 0, 0, 0, 1);
    Ipv6Net::new(addr, 64).expect("/64 is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::addr::PrivateAddressCoordinator;
    use crate::event::channel;
    use crate::net::NetCapability;
    use crate::net::NetworkCapabilities;
    use crate::net::Transport;
    use crate::routing::{FakeDhcpServer, FakeNetd, NetdOp};

    struct Rig {
        netd: Arc<FakeNetd>,
        dhcp: Arc<FakeDhcpServer>,
        routing: RoutingCoordinator,
        events: EventSender,
        rx: UnboundedReceiver<TetherEvent>,
    }

    impl Rig {
        fn new() -> Self {
            let netd = Arc::new(FakeNetd::new());
            let routing = RoutingCoordinator::new(
                netd.clone(),
                PrivateAddressCoordinator::with_rng(true, false, StdRng::seed_from_u64(5)),
            );
            let (events, rx) = channel();
            Self {
                netd,
                dhcp: Arc::new(FakeDhcpServer::new()),
                routing,
                events,
                rx,
            }
        }

        fn deps(&mut self) -> IpServerDeps<'_> {
            IpServerDeps {
                routing: &mut self.routing,
                dhcp: self.dhcp.as_ref(),
                events: &self.events,
                lease_time_secs: 3600,
            }
        }

        fn drain_events(&mut self) -> Vec<TetherEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.rx.try_recv() {
                out.push(ev);
            }
            out
        }
    }

    fn request(ty: DownstreamType) -> TetheringRequest {
        TetheringRequest::new(ty, 1000, "com.example.settings")
    }

    fn enabled_server(rig: &mut Rig, mode: ServingMode) -> IpServer {
        let mut server = IpServer::new(ServerId(1), "wlan0", DownstreamType::Wifi);
        server.start();
        server.handle_command(
            IpServerCommand::Enable {
                mode,
                request: request(DownstreamType::Wifi),
            },
            &mut rig.deps(),
        );
        server
    }

    #[test]
    fn enable_walks_the_setup_sequence() {
        let mut rig = Rig::new();
        let server = enabled_server(&mut rig, ServingMode::Tethered);

        assert_eq!(server.phase(), IpServerPhase::Tethered);
        assert_eq!(server.last_error(), TetherResultCode::NoError);
        let address = server.ipv4_address().unwrap();
        assert_eq!(address.prefix_len(), 24);

        assert!(rig.dhcp.running_on("wlan0"));
        let ops = rig.netd.ops();
        assert!(ops.iter().any(|op| matches!(op, NetdOp::InterfaceSetCfg(i, Some(_), true) if i == "wlan0")));
        assert!(ops.iter().any(|op| matches!(op, NetdOp::NetworkAddInterface(LOCAL_NET_ID, i) if i == "wlan0")));
        assert!(ops.iter().any(|op| matches!(op, NetdOp::TetherInterfaceAdd(i) if i == "wlan0")));

        let events = rig.drain_events();
        assert!(events
            .iter()
            .any(|ev| matches!(ev, TetherEvent::ServingStateActive { id: ServerId(1), mode: ServingMode::Tethered })));
    }

    #[test]
    fn local_only_gets_ula_and_skips_tether_add() {
        let mut rig = Rig::new();
        let server = enabled_server(&mut rig, ServingMode::LocalOnly);

        assert_eq!(server.phase(), IpServerPhase::LocalOnly);
        assert!(server
            .link_properties()
            .link_addresses
            .iter()
            .any(|net| matches!(net, IpNet::V6(v6) if v6.addr().segments()[0] == 0xfd00)));
        assert!(!rig
            .netd
            .ops()
            .iter()
            .any(|op| matches!(op, NetdOp::TetherInterfaceAdd(_))));
    }

    #[test]
    fn enable_in_wrong_phase_is_rejected() {
        let mut rig = Rig::new();
        let mut server = IpServer::new(ServerId(1), "wlan0", DownstreamType::Wifi);
        // Never started: still UNAVAILABLE.
        server.handle_command(
            IpServerCommand::Enable {
                mode: ServingMode::Tethered,
                request: request(DownstreamType::Wifi),
            },
            &mut rig.deps(),
        );
        assert_eq!(server.phase(), IpServerPhase::Unavailable);
        assert!(server.ipv4_address().is_none());
    }

    #[test]
    fn dhcp_failure_rolls_back_to_available() {
        let mut rig = Rig::new();
        rig.dhcp.fail_on("dhcpStart");

        let server = enabled_server(&mut rig, ServingMode::Tethered);
        assert_eq!(server.phase(), IpServerPhase::Available);
        assert_eq!(server.last_error(), TetherResultCode::InternalError);
        assert!(server.ipv4_address().is_none());

        // Interface config was cleared again.
        let ops = rig.netd.ops();
        assert!(ops
            .iter()
            .any(|op| matches!(op, NetdOp::InterfaceSetCfg(i, None, false) if i == "wlan0")));
        // Address registration was released.
        assert!(rig.routing.downstream_address(ServerId(1)).is_none());
    }

    #[test]
    fn unwanted_tears_down_and_reports_inactive() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);
        rig.drain_events();

        server.handle_command(IpServerCommand::Unwanted, &mut rig.deps());
        assert_eq!(server.phase(), IpServerPhase::Available);
        assert!(!rig.dhcp.running_on("wlan0"));
        assert!(rig.routing.downstream_address(ServerId(1)).is_none());

        let events = rig.drain_events();
        assert!(events
            .iter()
            .any(|ev| matches!(ev, TetherEvent::ServingStateInactive { id: ServerId(1) })));
    }

    #[test]
    fn connection_changed_diffs_forwards() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);

        let set: BTreeSet<String> = ["rmnet0".to_string()].into();
        server.handle_command(
            IpServerCommand::TetherConnectionChanged {
                upstream_ifaces: Some(set),
            },
            &mut rig.deps(),
        );
        assert_eq!(rig.routing.forwards_from("wlan0"), vec!["rmnet0".to_string()]);

        // Switch to a clat-stacked pair.
        let set: BTreeSet<String> = ["rmnet0".to_string(), "v4-rmnet0".to_string()].into();
        server.handle_command(
            IpServerCommand::TetherConnectionChanged {
                upstream_ifaces: Some(set),
            },
            &mut rig.deps(),
        );
        assert_eq!(
            rig.routing.forwards_from("wlan0"),
            vec!["rmnet0".to_string(), "v4-rmnet0".to_string()]
        );

        // Upstream lost.
        server.handle_command(
            IpServerCommand::TetherConnectionChanged {
                upstream_ifaces: None,
            },
            &mut rig.deps(),
        );
        assert!(rig.routing.forwards_from("wlan0").is_empty());
        assert_eq!(server.phase(), IpServerPhase::Tethered);
    }

    #[test]
    fn prefix_conflict_rerequests_address() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);
        let first = server.ipv4_address().unwrap();

        // Make the current prefix conflict via an upstream update.
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses
            .push(IpNet::V4(Ipv4Net::new(first.addr(), 24).unwrap()));
        let caps = NetworkCapabilities::new(
            vec![Transport::Cellular],
            vec![NetCapability::Internet, NetCapability::NotVpn],
        );
        let conflicted = rig
            .routing
            .update_upstream_prefix(&lp, &caps, crate::net::Network(55));
        assert_eq!(conflicted, vec![ServerId(1)]);

        server.handle_command(IpServerCommand::NotifyPrefixConflict, &mut rig.deps());

        let second = server.ipv4_address().unwrap();
        assert_ne!(first.trunc(), second.trunc());
        assert_eq!(server.phase(), IpServerPhase::Tethered);
        assert!(rig.dhcp.running_on("wlan0"));
    }

    #[test]
    fn error_notification_stops_serving() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);
        rig.drain_events();

        server.handle_command(
            IpServerCommand::ErrorNotification {
                code: TetherResultCode::EnableForwardingError,
            },
            &mut rig.deps(),
        );
        assert_eq!(server.phase(), IpServerPhase::Available);
        assert_eq!(server.last_error(), TetherResultCode::EnableForwardingError);
        assert!(rig
            .drain_events()
            .iter()
            .any(|ev| matches!(ev, TetherEvent::ServingStateInactive { .. })));
    }

    #[test]
    fn interface_down_from_serving_ends_unavailable() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);
        server.handle_command(IpServerCommand::InterfaceDown, &mut rig.deps());
        assert_eq!(server.phase(), IpServerPhase::Unavailable);
        assert!(!rig.dhcp.running_on("wlan0"));
    }

    #[test]
    fn delegated_ipv6_tracks_upstream() {
        let mut rig = Rig::new();
        let mut server = enabled_server(&mut rig, ServingMode::Tethered);

        let prefix: Ipv6Net = "2001:db8:1234::/64".parse().unwrap();
        server.handle_command(
            IpServerCommand::UpstreamIpv6Changed {
                prefix: Some(prefix),
            },
            &mut rig.deps(),
        );
        assert!(server
            .link_properties()
            .link_addresses
            .contains(&IpNet::V6(prefix)));

        server.handle_command(
            IpServerCommand::UpstreamIpv6Changed { prefix: None },
            &mut rig.deps(),
        );
        assert!(!server
            .link_properties()
            .link_addresses
            .contains(&IpNet::V6(prefix)));
    }
}
