//! Tethering orchestrator
//!
//! `Tethering` is the process singleton that owns every other component:
//! the downstream servers, the address/routing coordinators, the upstream
//! monitor, offload, the per-network clat controllers and the listener
//! registry. It consumes the event bus serially; nothing in here is
//! re-entrant.
//!
//! The top-level state machine (Initial / TetherModeAlive / error states)
//! lives in [`main_sm`]; the IPC-facing operations in [`service_api`].

pub mod drivers;
mod main_sm;
mod service_api;

pub use drivers::{
    AllowAllEntitlement, DownstreamDriver, DriverOp, EntitlementChecker, FakeDownstreamDriver,
    UnmanagedDownstreamDriver, UsbFunction,
};
pub use main_sm::MainSmState;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::addr::PrivateAddressCoordinator;
use crate::callbacks::{
    CallbackRegistry, DownstreamState, DownstreamStateKind, ListenerId, TetheredClient,
};
use crate::config::Config;
use crate::event::{channel, EventSender, TetherEvent, WifiP2pGroup};
use crate::ipc::PackageManager;
use crate::ipserver::{IpServer, IpServerCommand, IpServerDeps, IpServerPhase, ServerId, ServingMode};
use crate::nat464::Nat464Controller;
use crate::net::{DownstreamType, Network, TetheringRequest, UpstreamNetworkState};
use crate::offload::{OffloadController, OffloadHal};
use crate::routing::{DhcpServerController, DnsResolverService, NetdService, RoutingCoordinator};
use crate::upstream::UpstreamMonitor;

/// The only state crossing the thread boundary: the IPC layer reads the
/// supported-types bitmap and the active-requests map without posting an
/// event.
pub struct SharedState {
    supported_bitmap: AtomicU32,
    tethering_allowed: AtomicBool,
    active_requests: Mutex<HashMap<DownstreamType, TetheringRequest>>,
}

impl SharedState {
    #[must_use]
    pub fn new(supported_bitmap: u32) -> Self {
        Self {
            supported_bitmap: AtomicU32::new(supported_bitmap),
            tethering_allowed: AtomicBool::new(true),
            active_requests: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn supported_bitmap(&self) -> u32 {
        self.supported_bitmap.load(Ordering::Acquire)
    }

    pub fn set_supported_bitmap(&self, bitmap: u32) {
        self.supported_bitmap.store(bitmap, Ordering::Release);
    }

    #[must_use]
    pub fn tethering_allowed(&self) -> bool {
        self.tethering_allowed.load(Ordering::Acquire)
    }

    pub fn set_tethering_allowed(&self, allowed: bool) {
        self.tethering_allowed.store(allowed, Ordering::Release);
    }

    #[must_use]
    pub fn active_request(&self, tethering_type: DownstreamType) -> Option<TetheringRequest> {
        self.active_requests.lock().get(&tethering_type).cloned()
    }

    /// Returns the displaced request when one of the same type existed.
    pub fn insert_request(&self, request: TetheringRequest) -> Option<TetheringRequest> {
        self.active_requests
            .lock()
            .insert(request.tethering_type, request)
    }

    pub fn remove_request(&self, tethering_type: DownstreamType) -> Option<TetheringRequest> {
        self.active_requests.lock().remove(&tethering_type)
    }

    pub fn clear_requests(&self) -> Vec<TetheringRequest> {
        self.active_requests.lock().drain().map(|(_, r)| r).collect()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.active_requests.lock().len()
    }
}

/// External collaborators, injected at construction.
pub struct TetheringDeps {
    pub netd: Arc<dyn NetdService>,
    pub resolver: Arc<dyn DnsResolverService>,
    pub dhcp: Arc<dyn DhcpServerController>,
    pub offload_hal: Arc<dyn OffloadHal>,
    pub driver: Arc<dyn DownstreamDriver>,
    pub entitlement: Arc<dyn EntitlementChecker>,
    pub packages: Arc<dyn PackageManager>,
}

/// Handles onto the fake collaborators, for tests and simulated runs.
pub struct FakeHandles {
    pub netd: Arc<crate::routing::FakeNetd>,
    pub resolver: Arc<crate::routing::FakeDnsResolver>,
    pub dhcp: Arc<crate::routing::FakeDhcpServer>,
    pub offload_hal: Arc<crate::offload::FakeOffloadHal>,
    pub driver: Arc<FakeDownstreamDriver>,
}

/// Deps wired entirely to recording fakes.
#[must_use]
pub fn fake_deps() -> (TetheringDeps, FakeHandles) {
    let netd = Arc::new(crate::routing::FakeNetd::new());
    let resolver = Arc::new(crate::routing::FakeDnsResolver::new());
    let dhcp = Arc::new(crate::routing::FakeDhcpServer::new());
    let offload_hal = Arc::new(crate::offload::FakeOffloadHal::new());
    let driver = Arc::new(FakeDownstreamDriver::new());

    let deps = TetheringDeps {
        netd: netd.clone(),
        resolver: resolver.clone(),
        dhcp: dhcp.clone(),
        offload_hal: offload_hal.clone(),
        driver: driver.clone(),
        entitlement: Arc::new(AllowAllEntitlement),
        packages: Arc::new(crate::ipc::PermissivePackageManager),
    };
    let handles = FakeHandles {
        netd,
        resolver,
        dhcp,
        offload_hal,
        driver,
    };
    (deps, handles)
}

/// Last observed USB gadget state.
#[derive(Debug, Clone, Copy, Default)]
struct UsbState {
    connected: bool,
    configured: bool,
    rndis: bool,
    ncm: bool,
}

/// The tethering control plane.
pub struct Tethering {
    pub(crate) config: Config,
    tx: EventSender,
    rx: Option<UnboundedReceiver<TetherEvent>>,
    pub(crate) deps: TetheringDeps,
    shared: Arc<SharedState>,

    pub(crate) routing: RoutingCoordinator,
    pub(crate) upstream: UpstreamMonitor,
    pub(crate) offload: OffloadController,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) clat: HashMap<Network, Nat464Controller>,

    servers: HashMap<ServerId, IpServer>,
    iface_to_server: HashMap<String, ServerId>,
    next_server_id: u64,

    // Main state machine.
    pub(crate) sm: MainSmState,
    pub(crate) notify_list: Vec<ServerId>,
    pub(crate) forwarded_downstreams: HashSet<ServerId>,
    pub(crate) try_cell: bool,
    pub(crate) current_upstream: Option<UpstreamNetworkState>,
    pub(crate) current_upstream_ifaces: Option<BTreeSet<String>>,

    usb: UsbState,
    pub(crate) prefer_test_networks: bool,
    pub(crate) listener_handles: HashMap<u64, ListenerId>,
    pub(crate) next_listener_handle: u64,
}

impl Tethering {
    #[must_use]
    pub fn new(config: Config, deps: TetheringDeps) -> Self {
        let (tx, rx) = channel();
        Self::with_sender(config, deps, tx, Some(rx))
    }

    /// Construct around an existing bus, used when the caller needs the
    /// sender before the control plane exists.
    #[must_use]
    pub fn with_sender(
        config: Config,
        deps: TetheringDeps,
        tx: EventSender,
        rx: Option<UnboundedReceiver<TetherEvent>>,
    ) -> Self {
        let shared = Arc::new(SharedState::new(if config.tethering.supported {
            config.downstreams.supported_type_bitmap()
        } else {
            0
        }));

        let addresses = PrivateAddressCoordinator::with_rng(
            config.tethering.random_prefix_base,
            config.tethering.wifi_p2p_dedicated_ip,
            StdRng::from_entropy(),
        );
        let routing = RoutingCoordinator::new(deps.netd.clone(), addresses);
        let upstream = UpstreamMonitor::new(tx.clone());
        let offload = OffloadController::new(deps.offload_hal.clone());
        let prefer_test_networks = config.upstream.prefer_test_networks;

        Self {
            config,
            tx,
            rx,
            deps,
            shared,
            routing,
            upstream,
            offload,
            callbacks: CallbackRegistry::new(),
            clat: HashMap::new(),
            servers: HashMap::new(),
            iface_to_server: HashMap::new(),
            next_server_id: 0,
            sm: MainSmState::Initial,
            notify_list: Vec::new(),
            forwarded_downstreams: HashSet::new(),
            try_cell: true,
            current_upstream: None,
            current_upstream_ifaces: None,
            usb: UsbState::default(),
            prefer_test_networks,
            listener_handles: HashMap::new(),
            next_listener_handle: 0,
        }
    }

    #[must_use]
    pub fn event_sender(&self) -> EventSender {
        self.tx.clone()
    }

    #[must_use]
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    #[must_use]
    pub fn sm_state(&self) -> MainSmState {
        self.sm
    }

    #[must_use]
    pub fn server_phase(&self, iface: &str) -> Option<IpServerPhase> {
        let id = self.iface_to_server.get(iface)?;
        self.servers.get(id).map(IpServer::phase)
    }

    #[must_use]
    pub fn serving_count(&self) -> usize {
        self.notify_list.len()
    }

    #[must_use]
    pub fn server_ipv4_address(&self, iface: &str) -> Option<ipnet::Ipv4Net> {
        let id = self.iface_to_server.get(iface)?;
        self.servers.get(id).and_then(IpServer::ipv4_address)
    }

    #[must_use]
    pub fn current_upstream_network(&self) -> Option<Network> {
        self.current_upstream.as_ref().map(|state| state.network)
    }

    /// Consume the event bus until shutdown.
    pub async fn run(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            warn!("control plane already running");
            return;
        };
        info!("tethering control plane running");
        while let Some(event) = rx.recv().await {
            let shutdown = matches!(event, TetherEvent::Shutdown);
            self.handle_event(event);
            if shutdown {
                break;
            }
        }
        info!("tethering control plane stopped");
    }

    /// Drain queued events synchronously. Tests drive the loop with this
    /// instead of `run`.
    pub fn pump(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event);
        }
        self.rx = Some(rx);
    }

    /// Dispatch a single event. Public so tests can drive the loop
    /// synchronously.
    pub fn handle_event(&mut self, event: TetherEvent) {
        match event {
            TetherEvent::InterfaceStateChanged { iface, up } => {
                self.handle_interface_state(&iface, up);
            }
            TetherEvent::UsbStateChanged {
                connected,
                configured,
                rndis,
                ncm,
            } => {
                self.handle_usb_state(UsbState {
                    connected,
                    configured,
                    rndis,
                    ncm,
                });
            }
            TetherEvent::WifiApStateChanged {
                enabled,
                iface,
                local_only,
            } => {
                self.handle_wifi_ap_state(enabled, iface, local_only);
            }
            TetherEvent::WifiP2pGroupChanged { group } => {
                self.handle_p2p_group(group);
            }
            TetherEvent::UserRestrictionsChanged {
                disallow_config_tethering,
            } => {
                self.handle_user_restriction(disallow_config_tethering);
            }
            TetherEvent::ForceUsbNcmChanged { force_ncm } => {
                self.handle_force_usb_ncm(force_ncm);
            }
            TetherEvent::Network(network_event) => {
                self.sync_clat(&network_event);
                self.upstream.handle_network_event(network_event);
            }
            TetherEvent::Nat64PrefixDiscovered { network, prefix } => {
                self.handle_nat64_dns_prefix(network, prefix);
            }
            TetherEvent::Upstream(upstream_event) => {
                self.handle_upstream_event(upstream_event);
            }
            TetherEvent::UpstreamPermissionChanged => {
                self.handle_upstream_changed();
            }
            TetherEvent::RetryUpstream => {
                self.handle_retry_upstream();
            }
            TetherEvent::ClearError => {
                self.handle_clear_error();
            }
            TetherEvent::ServingStateActive { id, mode } => {
                self.handle_serving_active(id, mode);
            }
            TetherEvent::ServingStateInactive { id } => {
                self.handle_serving_inactive(id);
            }
            TetherEvent::ServerLinkProperties {
                id,
                tethered,
                link_properties,
            } => {
                if self.sm == MainSmState::TetherModeAlive {
                    if tethered {
                        self.offload.notify_downstream(&link_properties);
                    } else if let Some(iface) = link_properties.interface_name.as_deref() {
                        self.offload.remove_downstream(iface);
                    }
                }
                let _ = id;
            }
            TetherEvent::RequestChangeDownstream {
                tethering_type,
                enable,
            } => {
                if enable {
                    let request = self
                        .shared
                        .active_request(tethering_type)
                        .unwrap_or_else(|| TetheringRequest::new(tethering_type, 0, "system"));
                    let _ = self.start_tethering_internal(request);
                } else {
                    let _ = self.stop_tethering_internal(tethering_type);
                }
            }
            TetherEvent::Ipc(request) => {
                self.handle_ipc_request(request);
            }
            TetherEvent::Shutdown => {
                self.shutdown();
            }
        }
    }

    // --- Downstream interface lifecycle ----------------------------------

    fn handle_interface_state(&mut self, iface: &str, up: bool) {
        // Stacked clat interfaces route to their controllers first.
        let mut injections = Vec::new();
        for (network, clat) in &mut self.clat {
            if let Some(stacked) = clat.handle_interface_link_state_changed(iface, up) {
                injections.push((*network, stacked));
            }
        }
        for (network, stacked) in injections {
            self.upstream.inject_stacked_link(network, stacked);
        }

        if up {
            if let Some(tethering_type) = self.config.downstreams.classify(iface) {
                self.ensure_server(iface, tethering_type);
                self.maybe_enable_pending(iface, tethering_type);
                self.broadcast_states();
            }
        } else if let Some(id) = self.iface_to_server.remove(iface) {
            info!("{iface} disappeared");
            self.send_server_command(id, IpServerCommand::InterfaceDown);
            self.servers.remove(&id);
            self.broadcast_states();
        }
    }

    /// Create the server for a present interface if it does not exist.
    fn ensure_server(&mut self, iface: &str, tethering_type: DownstreamType) -> ServerId {
        if let Some(id) = self.iface_to_server.get(iface) {
            return *id;
        }
        self.next_server_id += 1;
        let id = ServerId(self.next_server_id);
        let mut server = IpServer::new(id, iface, tethering_type);
        server.start();
        debug!("{id} created for {iface} ({tethering_type})");
        self.servers.insert(id, server);
        self.iface_to_server.insert(iface.to_string(), id);
        id
    }

    /// Enable a newly appeared interface when a matching request is
    /// already active.
    fn maybe_enable_pending(&mut self, iface: &str, tethering_type: DownstreamType) {
        let request = match tethering_type {
            // USB interfaces wait for the gadget to be configured with
            // the right function.
            DownstreamType::Usb => {
                if !(self.usb.configured && self.usb.rndis && !self.config.tethering.force_usb_ncm)
                {
                    return;
                }
                self.shared.active_request(DownstreamType::Usb)
            }
            DownstreamType::Ncm => {
                if !(self.usb.configured && self.usb.ncm) {
                    return;
                }
                self.shared
                    .active_request(DownstreamType::Ncm)
                    .or_else(|| {
                        self.config
                            .tethering
                            .force_usb_ncm
                            .then(|| self.shared.active_request(DownstreamType::Usb))
                            .flatten()
                    })
            }
            other => self.shared.active_request(other),
        };

        if let Some(request) = request {
            if let Some(id) = self.iface_to_server.get(iface).copied() {
                self.enable_server(id, &request);
            }
        }
    }

    pub(crate) fn enable_server(&mut self, id: ServerId, request: &TetheringRequest) {
        let mode = ServingMode::from(request.connectivity_scope);
        self.send_server_command(
            id,
            IpServerCommand::Enable {
                mode,
                request: request.clone(),
            },
        );
    }

    fn handle_usb_state(&mut self, state: UsbState) {
        let was = self.usb;
        self.usb = state;

        if !state.connected && was.connected {
            // Cable pulled: both gadget downstreams stop serving.
            self.unwanted_by_type(&[DownstreamType::Usb, DownstreamType::Ncm]);
            return;
        }

        if state.configured {
            // Enable any present-but-idle gadget interfaces that now have
            // their function active.
            let candidates: Vec<(String, DownstreamType)> = self
                .servers
                .values()
                .filter(|server| {
                    server.phase() == IpServerPhase::Available
                        && matches!(
                            server.tethering_type(),
                            DownstreamType::Usb | DownstreamType::Ncm
                        )
                })
                .map(|server| (server.interface_name().to_string(), server.tethering_type()))
                .collect();
            for (iface, tethering_type) in candidates {
                self.maybe_enable_pending(&iface, tethering_type);
            }
        }
    }

    fn handle_wifi_ap_state(&mut self, enabled: bool, iface: Option<String>, local_only: bool) {
        if enabled {
            let Some(iface) = iface else {
                warn!("AP enabled without interface name, ignoring");
                return;
            };
            let id = self.ensure_server(&iface, DownstreamType::Wifi);
            let mut request = self
                .shared
                .active_request(DownstreamType::Wifi)
                .unwrap_or_else(|| TetheringRequest::new(DownstreamType::Wifi, 0, "system"));
            request.connectivity_scope = if local_only {
                crate::net::ConnectivityScope::Local
            } else {
                request.connectivity_scope
            };
            self.enable_server(id, &request);
            self.broadcast_states();
            return;
        }

        match iface {
            Some(iface) => {
                if let Some(id) = self.iface_to_server.get(&iface).copied() {
                    self.send_server_command(id, IpServerCommand::Unwanted);
                }
            }
            None if self.config.tethering.legacy_wifi_ap_compat => {
                // Pre-U platforms may omit the interface; stop every
                // serving Wi-Fi downstream.
                warn!("AP disabled without interface name, guessing downstream");
                self.unwanted_by_type(&[DownstreamType::Wifi]);
            }
            None => {
                warn!("AP disabled without interface name, ignoring");
            }
        }
        self.broadcast_states();
    }

    fn handle_p2p_group(&mut self, group: Option<WifiP2pGroup>) {
        match group {
            Some(group) if group.is_group_owner => {
                let id = self.ensure_server(&group.interface_name, DownstreamType::WifiP2p);
                let request = TetheringRequest::new(DownstreamType::WifiP2p, 0, "system");
                self.enable_server(id, &request);
            }
            Some(_) => {
                // Group formed with us as a client; nothing to serve.
            }
            None => {
                self.unwanted_by_type(&[DownstreamType::WifiP2p]);
            }
        }
        self.broadcast_states();
    }

    fn handle_user_restriction(&mut self, disallow: bool) {
        self.shared.set_tethering_allowed(!disallow);
        if disallow {
            info!("tethering disallowed by user restriction");
            self.untether_all();
            self.shared.set_supported_bitmap(0);
            self.callbacks.broadcast_supported_types(0);
        } else {
            let bitmap = if self.config.tethering.supported {
                self.config.downstreams.supported_type_bitmap()
            } else {
                0
            };
            self.shared.set_supported_bitmap(bitmap);
            self.callbacks.broadcast_supported_types(bitmap);
        }
    }

    /// TETHER_FORCE_USB_FUNCTIONS flipped: restart the gadget downstreams
    /// on the newly selected function.
    fn handle_force_usb_ncm(&mut self, force_ncm: bool) {
        if self.config.tethering.force_usb_ncm == force_ncm {
            return;
        }
        info!("USB function switched to {}", if force_ncm { "NCM" } else { "RNDIS" });
        self.config.tethering.force_usb_ncm = force_ncm;

        self.unwanted_by_type(&[DownstreamType::Usb, DownstreamType::Ncm]);

        if self.shared.active_request(DownstreamType::Usb).is_some()
            || self.shared.active_request(DownstreamType::Ncm).is_some()
        {
            let function = if force_ncm {
                UsbFunction::Ncm
            } else {
                UsbFunction::Rndis
            };
            if let Err(e) = self.deps.driver.set_usb_function(function) {
                warn!("USB function switch failed: {e}");
            }
        }
    }

    pub(crate) fn unwanted_by_type(&mut self, types: &[DownstreamType]) {
        let ids: Vec<ServerId> = self
            .servers
            .values()
            .filter(|server| types.contains(&server.tethering_type()) && server.phase().is_serving())
            .map(IpServer::id)
            .collect();
        for id in ids {
            self.send_server_command(id, IpServerCommand::Unwanted);
        }
    }

    /// Stop serving on every downstream.
    pub(crate) fn untether_all(&mut self) {
        let ids: Vec<ServerId> = self
            .servers
            .values()
            .filter(|server| server.phase().is_serving())
            .map(IpServer::id)
            .collect();
        for id in ids {
            self.send_server_command(id, IpServerCommand::Unwanted);
        }
    }

    /// Deliver a command to one server with a freshly assembled deps
    /// bundle. Events the server posts land back on the bus.
    pub(crate) fn send_server_command(&mut self, id: ServerId, command: IpServerCommand) {
        let Some(server) = self.servers.get_mut(&id) else {
            debug!("{id} gone, dropping command");
            return;
        };
        let mut deps = IpServerDeps {
            routing: &mut self.routing,
            dhcp: self.deps.dhcp.as_ref(),
            events: &self.tx,
            lease_time_secs: self.config.dhcp.lease_time_secs,
        };
        server.handle_command(command, &mut deps);
    }

    pub(crate) fn server(&self, id: ServerId) -> Option<&IpServer> {
        self.servers.get(&id)
    }

    pub(crate) fn server_id_for_iface(&self, iface: &str) -> Option<ServerId> {
        self.iface_to_server.get(iface).copied()
    }

    pub(crate) fn available_ids_of_type(&self, tethering_type: DownstreamType) -> Vec<ServerId> {
        self.servers
            .values()
            .filter(|server| {
                server.tethering_type() == tethering_type
                    && server.phase() == IpServerPhase::Available
            })
            .map(IpServer::id)
            .collect()
    }

    // --- Listener snapshots ----------------------------------------------

    /// Downstream states as exposed to listeners.
    #[must_use]
    pub(crate) fn states_snapshot(&self) -> Vec<DownstreamState> {
        let mut states: Vec<DownstreamState> = self
            .servers
            .values()
            .filter(|server| server.phase() != IpServerPhase::Unavailable)
            .map(|server| {
                let kind = match server.phase() {
                    IpServerPhase::Tethered => DownstreamStateKind::Tethered,
                    IpServerPhase::LocalOnly => DownstreamStateKind::LocalOnly,
                    _ => DownstreamStateKind::Available,
                };
                let request = server.request();
                DownstreamState {
                    iface: server.interface_name().to_string(),
                    tethering_type: server.tethering_type(),
                    state: kind,
                    last_error: server.last_error(),
                    soft_ap_config: request.and_then(|r| r.soft_ap_config.clone()),
                    request_uid: request.map(|r| r.uid),
                }
            })
            .collect();
        states.sort_by(|a, b| a.iface.cmp(&b.iface));
        states
    }

    pub(crate) fn broadcast_states(&mut self) {
        let states = self.states_snapshot();
        self.callbacks.broadcast_tether_states(&states);
    }

    /// Connected clients are tracked by the DHCP collaborator in real
    /// deployments; the control plane only fans the list out.
    pub fn report_clients(&mut self, clients: Vec<TetheredClient>) {
        self.callbacks.broadcast_clients(&clients);
    }

    fn shutdown(&mut self) {
        info!("shutting down tethering");
        self.untether_all();
        self.shared.clear_requests();
    }
}
