//! Service operations
//!
//! Implements the control surface backing the IPC commands: permission
//! enforcement, request bookkeeping and the legacy per-interface entry
//! points. Runs on the event loop; replies go back through the oneshot
//! carried by the request.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Tethering, UsbFunction};
use crate::callbacks::{CallbackEvent, ListenerCookie};
use crate::error::TetherResultCode;
use crate::ipc::{
    check_callback_permission, check_change_permission, check_request_restrictions,
    check_system_permission, verify_caller_package, CallerIdentity, IpcCommand, IpcRequest,
    IpcResponse,
};
use crate::ipserver::IpServerCommand;
use crate::net::{ConnectivityScope, DownstreamType, TetheringRequest};

impl Tethering {
    pub(crate) fn handle_ipc_request(&mut self, request: IpcRequest) {
        let IpcRequest {
            command,
            caller,
            callback_sink,
            reply,
        } = request;

        debug!("IPC {command:?} from uid {}", caller.uid);
        let response = match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Tether { iface } => {
                IpcResponse::code(self.checked_change(&caller, |t| t.tether(&iface, &caller)))
            }

            IpcCommand::Untether { iface } => {
                IpcResponse::code(self.checked_change(&caller, |t| t.untether(&iface)))
            }

            IpcCommand::StartTethering { request } => {
                IpcResponse::code(self.start_tethering_checked(&caller, request))
            }

            IpcCommand::StopTethering { tethering_type } => IpcResponse::code(
                self.checked_change(&caller, |t| t.stop_tethering_internal(tethering_type)),
            ),

            IpcCommand::StopAllTethering => {
                IpcResponse::code(self.checked_change(&caller, |t| {
                    t.stop_all_tethering();
                    TetherResultCode::NoError
                }))
            }

            IpcCommand::SetUsbTethering { enable } => {
                IpcResponse::code(self.checked_change(&caller, |t| {
                    t.set_usb_tethering(enable, &caller)
                }))
            }

            IpcCommand::RequestEntitlementResult {
                tethering_type,
                show_ui,
            } => {
                let code = match self.check_caller_for_change(&caller) {
                    Err(code) => code,
                    Ok(()) => self
                        .deps
                        .entitlement
                        .check_entitlement(tethering_type, show_ui),
                };
                IpcResponse::Entitlement { code }
            }

            IpcCommand::IsTetheringSupported => IpcResponse::Supported {
                supported: self.is_tethering_supported(),
            },

            IpcCommand::SetPreferTestNetworks { prefer } => {
                let code = match check_system_permission(&caller) {
                    Err(code) => code,
                    Ok(()) => {
                        self.prefer_test_networks = prefer;
                        self.handle_upstream_changed();
                        TetherResultCode::NoError
                    }
                };
                IpcResponse::code(code)
            }

            IpcCommand::RegisterCallback => match check_callback_permission(&caller) {
                Err(code) => IpcResponse::code(code),
                Ok(()) => match callback_sink {
                    Some(sink) => IpcResponse::Registered {
                        listener: self.register_listener(&caller, sink),
                    },
                    None => IpcResponse::code(TetherResultCode::InternalError),
                },
            },

            IpcCommand::UnregisterCallback { listener } => {
                let code = match check_callback_permission(&caller) {
                    Err(code) => code,
                    Ok(()) => match self.listener_handles.remove(&listener) {
                        Some(id) => {
                            self.callbacks.unregister(id);
                            TetherResultCode::NoError
                        }
                        None => TetherResultCode::InternalError,
                    },
                };
                IpcResponse::code(code)
            }
        };

        if reply.send(response).is_err() {
            debug!("IPC caller went away before reply");
        }
    }

    /// Common gate for state-changing operations.
    fn check_caller_for_change(&self, caller: &CallerIdentity) -> Result<(), TetherResultCode> {
        if !self.is_tethering_supported() {
            return Err(TetherResultCode::Unsupported);
        }
        verify_caller_package(caller, self.deps.packages.as_ref())?;
        check_change_permission(caller, self.config.tethering.provisioning_required)?;
        Ok(())
    }

    fn checked_change(
        &mut self,
        caller: &CallerIdentity,
        operation: impl FnOnce(&mut Self) -> TetherResultCode,
    ) -> TetherResultCode {
        match self.check_caller_for_change(caller) {
            Err(code) => code,
            Ok(()) => operation(self),
        }
    }

    #[must_use]
    pub fn is_tethering_supported(&self) -> bool {
        self.config.tethering.supported
            && self.shared().tethering_allowed()
            && self.shared().supported_bitmap() != 0
    }

    fn start_tethering_checked(
        &mut self,
        caller: &CallerIdentity,
        request: TetheringRequest,
    ) -> TetherResultCode {
        if let Err(code) = self.check_caller_for_change(caller) {
            return code;
        }
        if let Err(code) = check_request_restrictions(&request, caller) {
            return code;
        }
        if self.config.tethering.provisioning_required && !request.exempt_from_entitlement_check {
            let code = self
                .deps
                .entitlement
                .check_entitlement(request.tethering_type, false);
            if code.is_error() {
                return code;
            }
        }
        self.start_tethering_internal(request)
    }

    /// Start (or restart) tethering of a type. At most one request per
    /// type is active; a newer request displaces the older one.
    pub(crate) fn start_tethering_internal(
        &mut self,
        request: TetheringRequest,
    ) -> TetherResultCode {
        let tethering_type = request.tethering_type;
        info!("start tethering: {tethering_type}");

        if self.shared().insert_request(request.clone()).is_some() {
            debug!("replacing active {tethering_type} request");
            self.unwanted_by_type(&[tethering_type]);
        }

        let driver_result = match tethering_type {
            DownstreamType::Wifi => self.deps.driver.start_wifi_ap(),
            DownstreamType::Usb => {
                let function = if self.config.tethering.force_usb_ncm {
                    UsbFunction::Ncm
                } else {
                    UsbFunction::Rndis
                };
                self.deps.driver.set_usb_function(function)
            }
            DownstreamType::Ncm => self.deps.driver.set_usb_function(UsbFunction::Ncm),
            DownstreamType::Bluetooth => self.deps.driver.set_bluetooth_tethering(true),
            DownstreamType::Ethernet => self.deps.driver.set_ethernet_tethering(true),
            // P2P groups and virtual interfaces are driven externally.
            DownstreamType::WifiP2p | DownstreamType::Virtual | DownstreamType::Wigig => Ok(()),
        };
        if let Err(e) = driver_result {
            warn!("downstream driver rejected {tethering_type}: {e}");
            self.shared().remove_request(tethering_type);
            return TetherResultCode::ServiceUnavail;
        }

        // Interfaces that already exist can be served immediately; the
        // rest are picked up when they appear.
        for id in self.available_ids_of_type(tethering_type) {
            self.enable_server(id, &request);
        }
        self.broadcast_states();
        TetherResultCode::NoError
    }

    pub(crate) fn stop_tethering_internal(
        &mut self,
        tethering_type: DownstreamType,
    ) -> TetherResultCode {
        info!("stop tethering: {tethering_type}");
        self.shared().remove_request(tethering_type);

        let driver_result = match tethering_type {
            DownstreamType::Wifi => self.deps.driver.stop_wifi_ap(),
            DownstreamType::Usb | DownstreamType::Ncm => {
                self.deps.driver.set_usb_function(UsbFunction::None)
            }
            DownstreamType::Bluetooth => self.deps.driver.set_bluetooth_tethering(false),
            DownstreamType::Ethernet => self.deps.driver.set_ethernet_tethering(false),
            DownstreamType::WifiP2p | DownstreamType::Virtual | DownstreamType::Wigig => Ok(()),
        };
        if let Err(e) = driver_result {
            warn!("downstream driver stop failed for {tethering_type}: {e}");
        }

        self.unwanted_by_type(&[tethering_type]);
        self.broadcast_states();
        TetherResultCode::NoError
    }

    pub(crate) fn stop_all_tethering(&mut self) {
        info!("stop all tethering");
        let requests = self.shared().clear_requests();
        for request in requests {
            let _ = match request.tethering_type {
                DownstreamType::Wifi => self.deps.driver.stop_wifi_ap(),
                DownstreamType::Usb | DownstreamType::Ncm => {
                    self.deps.driver.set_usb_function(UsbFunction::None)
                }
                DownstreamType::Bluetooth => self.deps.driver.set_bluetooth_tethering(false),
                DownstreamType::Ethernet => self.deps.driver.set_ethernet_tethering(false),
                _ => Ok(()),
            };
        }
        self.untether_all();
        self.broadcast_states();
    }

    fn set_usb_tethering(&mut self, enable: bool, caller: &CallerIdentity) -> TetherResultCode {
        if enable {
            self.start_tethering_internal(TetheringRequest::new(
                DownstreamType::Usb,
                caller.uid,
                &caller.package_name,
            ))
        } else {
            self.stop_tethering_internal(DownstreamType::Usb)
        }
    }

    /// Legacy per-interface start.
    fn tether(&mut self, iface: &str, caller: &CallerIdentity) -> TetherResultCode {
        let Some(id) = self.server_id_for_iface(iface) else {
            return TetherResultCode::UnknownIface;
        };
        let Some(server) = self.server(id) else {
            return TetherResultCode::UnknownIface;
        };
        if server.phase() != crate::ipserver::IpServerPhase::Available {
            return TetherResultCode::UnavailIface;
        }

        let tethering_type = server.tethering_type();
        let request = self
            .shared()
            .active_request(tethering_type)
            .unwrap_or_else(|| {
                let mut request =
                    TetheringRequest::new(tethering_type, caller.uid, &caller.package_name);
                request.connectivity_scope = ConnectivityScope::Global;
                request
            });
        self.enable_server(id, &request);
        self.broadcast_states();
        TetherResultCode::NoError
    }

    /// Legacy per-interface stop.
    fn untether(&mut self, iface: &str) -> TetherResultCode {
        let Some(id) = self.server_id_for_iface(iface) else {
            return TetherResultCode::UnknownIface;
        };
        let Some(server) = self.server(id) else {
            return TetherResultCode::UnknownIface;
        };
        if !server.phase().is_serving() {
            return TetherResultCode::UnavailIface;
        }
        self.send_server_command(id, IpServerCommand::Unwanted);
        self.broadcast_states();
        TetherResultCode::NoError
    }

    fn register_listener(
        &mut self,
        caller: &CallerIdentity,
        sink: Arc<dyn crate::callbacks::EventCallbackSink>,
    ) -> u64 {
        let cookie = ListenerCookie {
            uid: caller.uid,
            privileged: caller.has_system_permission(),
        };
        let id = self.callbacks.register(cookie, sink);
        self.next_listener_handle += 1;
        let handle = self.next_listener_handle;
        self.listener_handles.insert(handle, id);

        // Replay current state so the listener starts consistent.
        self.callbacks.notify_one(
            id,
            &CallbackEvent::ConfigurationChanged {
                supported_bitmap: self.shared().supported_bitmap(),
                provisioning_required: self.config.tethering.provisioning_required,
            },
        );
        self.callbacks.notify_one(
            id,
            &CallbackEvent::TetherStatesChanged {
                states: self.states_snapshot(),
            },
        );
        self.callbacks.notify_one(
            id,
            &CallbackEvent::OffloadStatusChanged {
                status: self.offload.status(),
            },
        );
        self.callbacks.notify_one(
            id,
            &CallbackEvent::UpstreamChanged {
                network: self.current_upstream.as_ref().map(|state| state.network),
            },
        );
        handle
    }
}
