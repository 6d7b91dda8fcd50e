//! Downstream hardware adapters
//!
//! Vendor subsystems (Wi-Fi manager, USB gadget, Bluetooth PAN, Ethernet)
//! are driven through this narrow trait. The adapters act asynchronously:
//! a successful call means the request was accepted, and the resulting
//! state lands on the event bus later (AP state broadcast, USB gadget
//! state, interface appearance).

use parking_lot::Mutex;

use crate::error::{errno, ServiceError, TetherResultCode};
use crate::net::DownstreamType;

/// USB gadget function selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbFunction {
    None,
    Rndis,
    Ncm,
}

/// Vendor adapter contract.
pub trait DownstreamDriver: Send + Sync {
    fn start_wifi_ap(&self) -> Result<(), ServiceError>;
    fn stop_wifi_ap(&self) -> Result<(), ServiceError>;
    fn set_usb_function(&self, function: UsbFunction) -> Result<(), ServiceError>;
    fn set_bluetooth_tethering(&self, enable: bool) -> Result<(), ServiceError>;
    fn set_ethernet_tethering(&self, enable: bool) -> Result<(), ServiceError>;
}

/// Carrier entitlement check. The real implementation talks to the
/// carrier app; deployments without one allow everything.
pub trait EntitlementChecker: Send + Sync {
    fn check_entitlement(&self, tethering_type: DownstreamType, show_ui: bool)
        -> TetherResultCode;
}

/// Entitlement checker that always allows.
pub struct AllowAllEntitlement;

impl EntitlementChecker for AllowAllEntitlement {
    fn check_entitlement(&self, _: DownstreamType, _: bool) -> TetherResultCode {
        TetherResultCode::NoError
    }
}

/// Driver for deployments where AP, gadget and PAN bring-up happens
/// outside this daemon (hostapd, configfs scripts). Requests are
/// accepted and logged; the resulting interfaces are observed through
/// the normal interface events.
pub struct UnmanagedDownstreamDriver;

impl DownstreamDriver for UnmanagedDownstreamDriver {
    fn start_wifi_ap(&self) -> Result<(), ServiceError> {
        tracing::info!("wifi AP bring-up is externally managed");
        Ok(())
    }

    fn stop_wifi_ap(&self) -> Result<(), ServiceError> {
        tracing::info!("wifi AP teardown is externally managed");
        Ok(())
    }

    fn set_usb_function(&self, function: UsbFunction) -> Result<(), ServiceError> {
        tracing::info!("USB gadget function {function:?} is externally managed");
        Ok(())
    }

    fn set_bluetooth_tethering(&self, enable: bool) -> Result<(), ServiceError> {
        tracing::info!("bluetooth PAN {} is externally managed", if enable { "up" } else { "down" });
        Ok(())
    }

    fn set_ethernet_tethering(&self, enable: bool) -> Result<(), ServiceError> {
        tracing::info!("ethernet tethering {} is externally managed", if enable { "up" } else { "down" });
        Ok(())
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    StartWifiAp,
    StopWifiAp,
    SetUsbFunction(UsbFunction),
    SetBluetoothTethering(bool),
    SetEthernetTethering(bool),
}

/// Recording fake driver; tests post the follow-up events themselves.
#[derive(Default)]
pub struct FakeDownstreamDriver {
    ops: Mutex<Vec<DriverOp>>,
    fail_all: Mutex<bool>,
}

impl FakeDownstreamDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }

    #[must_use]
    pub fn ops(&self) -> Vec<DriverOp> {
        self.ops.lock().clone()
    }

    fn record(&self, op: DriverOp) -> Result<(), ServiceError> {
        if *self.fail_all.lock() {
            return Err(ServiceError::new(errno::ENODEV, "downstreamDriver"));
        }
        self.ops.lock().push(op);
        Ok(())
    }
}

impl DownstreamDriver for FakeDownstreamDriver {
    fn start_wifi_ap(&self) -> Result<(), ServiceError> {
        self.record(DriverOp::StartWifiAp)
    }

    fn stop_wifi_ap(&self) -> Result<(), ServiceError> {
        self.record(DriverOp::StopWifiAp)
    }

    fn set_usb_function(&self, function: UsbFunction) -> Result<(), ServiceError> {
        self.record(DriverOp::SetUsbFunction(function))
    }

    fn set_bluetooth_tethering(&self, enable: bool) -> Result<(), ServiceError> {
        self.record(DriverOp::SetBluetoothTethering(enable))
    }

    fn set_ethernet_tethering(&self, enable: bool) -> Result<(), ServiceError> {
        self.record(DriverOp::SetEthernetTethering(enable))
    }
}
