//! Top-level tethering state machine
//!
//! States: Initial, TetherModeAlive and five error states. TetherModeAlive
//! owns the process-wide kernel state (IPv4 forwarding, tether daemon) and
//! drives upstream selection; the error states park everything until
//! CLEAR_ERROR.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::{IpNet, Ipv6Net};
use tracing::{debug, info, warn};

use super::Tethering;
use crate::error::TetherResultCode;
use crate::event::{NetworkEvent, TetherEvent, UpstreamEvent};
use crate::ipserver::{IpServerCommand, ServerId, ServingMode};
use crate::nat464::{ClatNetworkState, Nat464Controller};
use crate::net::{Network, Transport, UpstreamNetworkState};
use crate::upstream::SelectionPolicy;

/// Delay before re-trying upstream selection when no candidate exists.
pub(crate) const UPSTREAM_SETTLE_TIME: Duration = Duration::from_secs(10);

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainSmState {
    Initial,
    TetherModeAlive,
    SetIpForwardingEnabledError,
    SetIpForwardingDisabledError,
    StartTetheringError,
    StopTetheringError,
    SetDnsForwardersError,
}

impl MainSmState {
    #[must_use]
    pub fn is_error(self) -> bool {
        !matches!(self, MainSmState::Initial | MainSmState::TetherModeAlive)
    }

    /// The error fanned out to downstreams while in this state.
    #[must_use]
    pub fn error_code(self) -> Option<TetherResultCode> {
        match self {
            MainSmState::SetIpForwardingEnabledError => {
                Some(TetherResultCode::EnableForwardingError)
            }
            MainSmState::SetIpForwardingDisabledError => {
                Some(TetherResultCode::DisableForwardingError)
            }
            MainSmState::StartTetheringError => Some(TetherResultCode::TetherIfaceError),
            MainSmState::StopTetheringError => Some(TetherResultCode::UntetherIfaceError),
            MainSmState::SetDnsForwardersError => Some(TetherResultCode::SetDnsForwardersError),
            _ => None,
        }
    }
}

impl Tethering {
    /// An upstream is wanted while at least one downstream forwards.
    /// Local-only downstreams never pull an upstream up.
    #[must_use]
    pub(crate) fn upstream_wanted(&self) -> bool {
        !self.forwarded_downstreams.is_empty()
    }

    pub(crate) fn handle_serving_active(&mut self, id: ServerId, mode: ServingMode) {
        debug!("{id} serving ({mode:?})");
        match self.sm {
            MainSmState::Initial => {
                self.notify_list.push(id);
                if mode == ServingMode::Tethered {
                    self.forwarded_downstreams.insert(id);
                }
                self.enter_tether_mode_alive();
                self.broadcast_states();
            }
            MainSmState::TetherModeAlive => {
                let previously_wanted = self.upstream_wanted();
                if !self.notify_list.contains(&id) {
                    self.notify_list.push(id);
                }
                if mode == ServingMode::Tethered {
                    self.forwarded_downstreams.insert(id);
                }
                self.send_server_command(
                    id,
                    IpServerCommand::TetherConnectionChanged {
                        upstream_ifaces: self.current_upstream_ifaces.clone(),
                    },
                );
                if !previously_wanted && self.upstream_wanted() {
                    self.offload_start_and_report();
                    self.choose_upstream(true);
                    self.try_cell = false;
                }
                self.broadcast_states();
            }
            error_state => {
                if let Some(code) = error_state.error_code() {
                    self.send_server_command(id, IpServerCommand::ErrorNotification { code });
                }
            }
        }
    }

    pub(crate) fn handle_serving_inactive(&mut self, id: ServerId) {
        let previously_wanted = self.upstream_wanted();
        self.notify_list.retain(|member| *member != id);
        self.forwarded_downstreams.remove(&id);
        if let Some(server) = self.server(id) {
            let iface = server.interface_name().to_string();
            self.offload.remove_downstream(&iface);
        }
        self.broadcast_states();

        if self.sm != MainSmState::TetherModeAlive {
            return;
        }

        if self.notify_list.is_empty() {
            self.exit_tether_mode_alive();
            if self.turn_off_main_tether_settings() {
                info!("tethering idle");
                self.sm = MainSmState::Initial;
            }
            return;
        }

        if previously_wanted && !self.upstream_wanted() {
            // Only local-only downstreams remain.
            self.upstream.set_try_cell(false);
            self.offload_stop_and_report();
            self.set_current_upstream(None);
        }
    }

    fn enter_tether_mode_alive(&mut self) {
        info!("tether mode alive");
        self.sm = MainSmState::TetherModeAlive;

        if let Err(e) = self.deps.netd.ip_forward_enable() {
            warn!("enabling IPv4 forwarding failed: {e}");
            self.enter_error_state(MainSmState::SetIpForwardingEnabledError);
            return;
        }
        // The in-daemon DHCP server is unused; every downstream runs its
        // own, so the range list is empty.
        if let Err(e) = self.deps.netd.tether_start(&[]) {
            warn!("starting tether daemon failed: {e}");
            let _ = self.deps.netd.ip_forward_disable();
            self.enter_error_state(MainSmState::StartTetheringError);
            return;
        }

        let all_networks = self.upstream.all_networks();
        self.routing.maybe_remove_deprecated_upstreams(&all_networks);
        self.upstream.start_observing();

        if self.upstream_wanted() {
            self.offload_start_and_report();
            self.choose_upstream(true);
            self.try_cell = false;
        }
    }

    fn exit_tether_mode_alive(&mut self) {
        self.offload_stop_and_report();
        self.upstream.stop_observing();
        for id in self.notify_list.clone() {
            self.send_server_command(
                id,
                IpServerCommand::TetherConnectionChanged {
                    upstream_ifaces: None,
                },
            );
        }
        if self.current_upstream.take().is_some() {
            self.current_upstream_ifaces = None;
            self.callbacks.broadcast_upstream_changed(None);
        }
        self.try_cell = true;
    }

    /// Returns false when a teardown step failed and an error state was
    /// entered instead.
    fn turn_off_main_tether_settings(&mut self) -> bool {
        if let Err(e) = self.deps.netd.tether_stop() {
            warn!("stopping tether daemon failed: {e}");
            self.enter_error_state(MainSmState::StopTetheringError);
            return false;
        }
        if let Err(e) = self.deps.netd.ip_forward_disable() {
            warn!("disabling IPv4 forwarding failed: {e}");
            self.enter_error_state(MainSmState::SetIpForwardingDisabledError);
            return false;
        }
        true
    }

    fn enter_error_state(&mut self, state: MainSmState) {
        warn!("entering error state {state:?}");
        self.sm = state;
        if let Some(code) = state.error_code() {
            for id in self.notify_list.clone() {
                self.send_server_command(id, IpServerCommand::ErrorNotification { code });
            }
        }
        self.broadcast_states();
    }

    pub(crate) fn handle_clear_error(&mut self) {
        if self.sm.is_error() {
            info!("error cleared");
            self.sm = MainSmState::Initial;
        }
    }

    // --- Upstream handling ------------------------------------------------

    pub(crate) fn handle_upstream_event(&mut self, event: UpstreamEvent) {
        if self.sm != MainSmState::TetherModeAlive {
            return;
        }
        match event {
            UpstreamEvent::LinkProperties(state) => {
                let conflicted = self.routing.update_upstream_prefix(
                    &state.link_properties,
                    &state.capabilities,
                    state.network,
                );
                for id in conflicted {
                    self.send_server_command(id, IpServerCommand::NotifyPrefixConflict);
                }

                match &self.current_upstream {
                    Some(current) if current.network == state.network => {
                        self.set_current_upstream(Some(state));
                    }
                    None if self.upstream_wanted() => {
                        self.choose_upstream(false);
                    }
                    _ => {}
                }
            }
            UpstreamEvent::Capabilities(state) => {
                if let Some(current) = &self.current_upstream {
                    if current.network == state.network {
                        self.offload
                            .set_upstream(Some((&state.link_properties, &state.capabilities)));
                        self.current_upstream = Some(state);
                    }
                }
            }
            UpstreamEvent::Lost(network) => {
                self.routing.remove_upstream_prefix(network);
                let lost_current = self
                    .current_upstream
                    .as_ref()
                    .is_some_and(|current| current.network == network);
                if lost_current {
                    self.set_current_upstream(None);
                    if self.upstream_wanted() {
                        // Try a cellular (DUN) upstream immediately.
                        self.choose_upstream(true);
                        self.try_cell = false;
                    }
                }
            }
            UpstreamEvent::DefaultSwitched(_) => {
                if self.config.upstream.auto_select && self.upstream_wanted() {
                    self.choose_upstream(true);
                    self.try_cell = false;
                }
            }
            UpstreamEvent::LocalPrefixes(prefixes) => {
                self.offload.set_local_prefixes(prefixes);
            }
        }
    }

    /// UPSTREAM_CHANGED / UPSTREAM_PERMISSION_CHANGED: reselect, trying
    /// cellular first.
    pub(crate) fn handle_upstream_changed(&mut self) {
        if self.sm != MainSmState::TetherModeAlive || !self.upstream_wanted() {
            return;
        }
        self.choose_upstream(true);
        self.try_cell = false;
    }

    /// Delayed retry alternates between plain selection and requesting a
    /// cellular upstream.
    pub(crate) fn handle_retry_upstream(&mut self) {
        if self.sm != MainSmState::TetherModeAlive || !self.upstream_wanted() {
            return;
        }
        let try_cell = self.try_cell;
        self.choose_upstream(try_cell);
        self.try_cell = !try_cell;
    }

    pub(crate) fn choose_upstream(&mut self, try_cell: bool) {
        let policy = SelectionPolicy {
            dun_required: self.config.upstream.dun_required,
            allow_vpn: self.config.tethering.allow_vpn_upstreams,
            prefer_test_networks: self.prefer_test_networks,
        };

        let selected: Option<UpstreamNetworkState> = if self.config.upstream.auto_select {
            self.upstream.get_current_preferred_upstream(policy).cloned()
        } else {
            self.upstream
                .select_preferred_upstream_type(&self.config.upstream.preferred_types, policy)
                .cloned()
        };

        match &selected {
            None => {
                if try_cell {
                    self.upstream.set_try_cell(true);
                    // No retry scheduled; the cell network's arrival will
                    // re-trigger selection.
                } else {
                    self.tx
                        .send_delayed(TetherEvent::RetryUpstream, UPSTREAM_SETTLE_TIME);
                }
            }
            Some(state) => {
                if !state.capabilities.has_transport(Transport::Cellular) {
                    self.upstream.set_try_cell(false);
                }
            }
        }

        self.set_current_upstream(selected);
    }

    /// Install a newly selected upstream: DNS forwarders, downstream
    /// fan-out, offload, IPv6 delegation, listener notification.
    pub(crate) fn set_current_upstream(&mut self, new: Option<UpstreamNetworkState>) {
        let old_network = self.current_upstream.as_ref().map(|state| state.network);
        let new_network = new.as_ref().map(|state| state.network);

        // The forwarding path is the upstream's default-route interface
        // set (base or stacked). A network without a default route gets
        // no DNS forwarders and an empty fan-out.
        let ifaces: Option<BTreeSet<String>> = new
            .as_ref()
            .and_then(UpstreamNetworkState::tethering_interfaces);

        if let Some(state) = &new {
            if ifaces.is_none() {
                debug!("{} has no default route, skipping DNS forwarders", state.network);
            } else {
                let mut dns: Vec<IpAddr> = state.link_properties.dns_servers.clone();
                if dns.is_empty() {
                    dns = self
                        .config
                        .upstream
                        .fallback_dns
                        .iter()
                        .filter_map(|server| server.parse().ok())
                        .collect();
                }
                if let Err(e) = self.deps.netd.tether_dns_set(state.network, &dns) {
                    warn!("setting DNS forwarders failed: {e}");
                    self.enter_error_state(MainSmState::SetDnsForwardersError);
                    return;
                }
            }
        }

        self.current_upstream = new.clone();
        if ifaces != self.current_upstream_ifaces {
            self.current_upstream_ifaces = ifaces.clone();
            for id in self.notify_list.clone() {
                self.send_server_command(
                    id,
                    IpServerCommand::TetherConnectionChanged {
                        upstream_ifaces: ifaces.clone(),
                    },
                );
            }
        }

        self.offload
            .set_upstream(new.as_ref().map(|state| (&state.link_properties, &state.capabilities)));

        let delegated = new.as_ref().and_then(upstream_delegated_prefix);
        for id in self.forwarded_downstreams.clone() {
            self.send_server_command(
                id,
                IpServerCommand::UpstreamIpv6Changed { prefix: delegated },
            );
        }

        if old_network != new_network {
            info!("upstream changed: {old_network:?} -> {new_network:?}");
            self.callbacks.broadcast_upstream_changed(new_network);
        }
    }

    fn offload_start_and_report(&mut self) {
        let status = self.offload.start();
        self.callbacks.broadcast_offload_status(status);
    }

    fn offload_stop_and_report(&mut self) {
        let status = self.offload.stop();
        self.callbacks.broadcast_offload_status(status);
    }

    // --- 464xlat ----------------------------------------------------------

    /// Keep the per-network clat controllers in step with platform
    /// network callbacks. Runs before the upstream monitor ingests the
    /// event, so views are built from the event payload.
    pub(crate) fn sync_clat(&mut self, event: &NetworkEvent) {
        match event {
            NetworkEvent::Available(state) => {
                let network = state.network;
                let view = ClatNetworkState {
                    connected: true,
                    destroyed: false,
                    skip_464xlat: false,
                    capabilities: state.capabilities.clone(),
                    link_properties: state.link_properties.clone(),
                };
                self.drive_clat(network, Some(state.link_properties.nat64_prefix), &view);
            }
            NetworkEvent::LinkPropertiesChanged {
                network,
                link_properties,
            } => {
                let capabilities = self
                    .upstream
                    .network_state(*network)
                    .map(|state| state.capabilities.clone())
                    .unwrap_or_default();
                let view = ClatNetworkState {
                    connected: true,
                    destroyed: false,
                    skip_464xlat: false,
                    capabilities,
                    link_properties: link_properties.clone(),
                };
                self.drive_clat(*network, Some(link_properties.nat64_prefix), &view);
            }
            NetworkEvent::CapabilitiesChanged {
                network,
                capabilities,
            } => {
                let Some(link_properties) = self
                    .upstream
                    .network_state(*network)
                    .map(|state| state.link_properties.clone())
                else {
                    return;
                };
                let view = ClatNetworkState {
                    connected: true,
                    destroyed: false,
                    skip_464xlat: false,
                    capabilities: capabilities.clone(),
                    link_properties,
                };
                self.drive_clat(*network, None, &view);
            }
            NetworkEvent::Lost { network } => {
                if let Some(mut clat) = self.clat.remove(network) {
                    let dead = ClatNetworkState {
                        connected: false,
                        destroyed: true,
                        skip_464xlat: false,
                        capabilities: Default::default(),
                        link_properties: Default::default(),
                    };
                    let update = clat.network_destroyed(&dead);
                    if let Some(iface) = update.remove_stacked_iface {
                        self.upstream.remove_stacked_link(*network, &iface);
                    }
                }
            }
            NetworkEvent::DefaultSwitched { .. } => {}
        }
    }

    fn drive_clat(
        &mut self,
        network: Network,
        ra_prefix: Option<Option<Ipv6Net>>,
        view: &ClatNetworkState,
    ) {
        let netd = self.deps.netd.clone();
        let resolver = self.deps.resolver.clone();
        let clat_on_cellular = self.config.upstream.clat_on_cellular;
        let clat = self
            .clat
            .entry(network)
            .or_insert_with(|| Nat464Controller::new(network, netd, resolver, clat_on_cellular));

        if let Some(prefix) = ra_prefix {
            clat.set_nat64_prefix_from_ra(prefix);
        }
        let update = clat.update(view);
        if let Some(iface) = update.remove_stacked_iface {
            self.upstream.remove_stacked_link(network, &iface);
        }
    }

    pub(crate) fn handle_nat64_dns_prefix(&mut self, network: Network, prefix: Option<Ipv6Net>) {
        let Some(state) = self.upstream.network_state(network) else {
            return;
        };
        let view = ClatNetworkState {
            connected: true,
            destroyed: false,
            skip_464xlat: false,
            capabilities: state.capabilities.clone(),
            link_properties: state.link_properties.clone(),
        };
        let Some(clat) = self.clat.get_mut(&network) else {
            return;
        };
        clat.set_nat64_prefix_from_dns(prefix);
        let update = clat.update(&view);
        if let Some(iface) = update.remove_stacked_iface {
            self.upstream.remove_stacked_link(network, &iface);
        }
    }
}

/// The /64 an upstream delegates for downstream IPv6: the prefix of its
/// first global address.
fn upstream_delegated_prefix(state: &UpstreamNetworkState) -> Option<Ipv6Net> {
    state
        .link_properties
        .link_addresses
        .iter()
        .find_map(|address| match address {
            IpNet::V6(v6) => {
                let segments = v6.addr().segments();
                let global = !v6.addr().is_loopback()
                    && (segments[0] & 0xffc0) != 0xfe80
                    && (segments[0] & 0xfe00) != 0xfc00;
                if global {
                    Ipv6Net::new(v6.addr(), 64).ok().map(|net| net.trunc())
                } else {
                    None
                }
            }
            IpNet::V4(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{LinkProperties, NetworkCapabilities};

    #[test]
    fn delegated_prefix_skips_non_global() {
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses.push("fe80::1/64".parse().unwrap());
        lp.link_addresses.push("2001:db8:aa::77/64".parse().unwrap());
        let state =
            UpstreamNetworkState::new(Network(1), lp, NetworkCapabilities::default());

        assert_eq!(
            upstream_delegated_prefix(&state),
            Some("2001:db8:aa::/64".parse().unwrap())
        );
    }

    #[test]
    fn error_codes_match_states() {
        assert_eq!(
            MainSmState::SetDnsForwardersError.error_code(),
            Some(TetherResultCode::SetDnsForwardersError)
        );
        assert!(MainSmState::Initial.error_code().is_none());
        assert!(MainSmState::StartTetheringError.is_error());
        assert!(!MainSmState::TetherModeAlive.is_error());
    }
}
