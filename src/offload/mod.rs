//! Hardware offload control
//!
//! Maintains the view the offload engine needs (upstream parameters,
//! downstream prefixes, prefixes exempt from offload) and mirrors it into
//! the HAL. The engine is a fire-and-forget accelerator: every call is a
//! bool success, and a failed start simply leaves forwarding on the
//! kernel path.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::net::{LinkProperties, NetworkCapabilities};

/// Offload engine status, reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadStatus {
    Started,
    Stopped,
    Failed,
}

/// Narrow HAL contract. Returns follow the vendor interface: plain
/// success booleans, no error detail.
pub trait OffloadHal: Send + Sync {
    fn init_offload(&self) -> bool;
    fn stop_offload(&self) -> bool;
    fn set_upstream_parameters(
        &self,
        iface: &str,
        v4_addr: Option<IpAddr>,
        v6_gateways: &[IpAddr],
    ) -> bool;
    fn clear_upstream_parameters(&self) -> bool;
    fn add_downstream(&self, iface: &str, prefix: IpNet) -> bool;
    fn remove_downstream(&self, iface: &str, prefix: IpNet) -> bool;
    fn set_local_prefixes(&self, prefixes: &[IpNet]) -> bool;
}

/// Tracks offload state and pushes it to the HAL.
pub struct OffloadController {
    hal: std::sync::Arc<dyn OffloadHal>,
    status: OffloadStatus,
    upstream: Option<LinkProperties>,
    downstreams: HashMap<String, Vec<IpNet>>,
    local_prefixes: BTreeSet<IpNet>,
    exempt_prefixes: BTreeSet<IpNet>,
}

impl OffloadController {
    #[must_use]
    pub fn new(hal: std::sync::Arc<dyn OffloadHal>) -> Self {
        Self {
            hal,
            status: OffloadStatus::Stopped,
            upstream: None,
            downstreams: HashMap::new(),
            local_prefixes: BTreeSet::new(),
            exempt_prefixes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> OffloadStatus {
        self.status
    }

    /// Initialize the engine. Failure is terminal for this serving
    /// session; forwarding stays on the kernel path.
    pub fn start(&mut self) -> OffloadStatus {
        if self.status == OffloadStatus::Started {
            return self.status;
        }
        self.status = if self.hal.init_offload() {
            info!("offload started");
            self.push_local_prefixes();
            OffloadStatus::Started
        } else {
            warn!("offload init failed");
            OffloadStatus::Failed
        };
        self.status
    }

    pub fn stop(&mut self) -> OffloadStatus {
        if self.status == OffloadStatus::Started && !self.hal.stop_offload() {
            warn!("offload stop failed");
        }
        self.status = OffloadStatus::Stopped;
        self.upstream = None;
        self.downstreams.clear();
        self.status
    }

    /// Update the upstream the engine forwards to. A VPN upstream always
    /// clears the parameters: offloaded packets would bypass the VPN.
    pub fn set_upstream(
        &mut self,
        upstream: Option<(&LinkProperties, &NetworkCapabilities)>,
    ) {
        let effective = match upstream {
            Some((_, caps)) if caps.is_vpn() => {
                debug!("refusing offload on VPN upstream");
                None
            }
            Some((lp, _)) => Some(lp.clone()),
            None => None,
        };

        self.upstream = effective;
        if self.status != OffloadStatus::Started {
            return;
        }

        match &self.upstream {
            Some(lp) => {
                let iface = lp.interface_name.clone().unwrap_or_default();
                let v4 = lp
                    .ipv4_addresses()
                    .first()
                    .map(|net| IpAddr::V4(net.addr()));
                let gateways: Vec<IpAddr> = lp
                    .routes
                    .iter()
                    .filter_map(|route| route.gateway)
                    .filter(IpAddr::is_ipv6)
                    .collect();
                if !self.hal.set_upstream_parameters(&iface, v4, &gateways) {
                    warn!("offload upstream update failed");
                }
            }
            None => {
                if !self.hal.clear_upstream_parameters() {
                    warn!("offload upstream clear failed");
                }
            }
        }
    }

    /// A downstream's link properties changed; sync its prefixes.
    pub fn notify_downstream(&mut self, link_properties: &LinkProperties) {
        let Some(iface) = link_properties.interface_name.clone() else {
            return;
        };
        let new_prefixes: Vec<IpNet> = link_properties
            .link_addresses
            .iter()
            .map(|address| address.trunc())
            .collect();

        let old = self.downstreams.insert(iface.clone(), new_prefixes.clone());
        if self.status != OffloadStatus::Started {
            return;
        }

        if let Some(old_prefixes) = old {
            for prefix in old_prefixes.iter().filter(|p| !new_prefixes.contains(p)) {
                self.hal.remove_downstream(&iface, *prefix);
            }
            for prefix in new_prefixes.iter().filter(|p| !old_prefixes.contains(p)) {
                self.hal.add_downstream(&iface, *prefix);
            }
        } else {
            for prefix in &new_prefixes {
                self.hal.add_downstream(&iface, *prefix);
            }
        }
    }

    /// Remove a downstream entirely.
    pub fn remove_downstream(&mut self, iface: &str) {
        if let Some(prefixes) = self.downstreams.remove(iface) {
            if self.status == OffloadStatus::Started {
                for prefix in prefixes {
                    self.hal.remove_downstream(iface, prefix);
                }
            }
        }
    }

    /// On-device prefixes reported by the upstream monitor.
    pub fn set_local_prefixes(&mut self, prefixes: BTreeSet<IpNet>) {
        self.local_prefixes = prefixes;
        self.push_local_prefixes();
    }

    /// Additional prefixes that must stay on the kernel path.
    pub fn set_exempt_prefixes(&mut self, prefixes: BTreeSet<IpNet>) {
        self.exempt_prefixes = prefixes;
        self.push_local_prefixes();
    }

    fn push_local_prefixes(&self) {
        if self.status != OffloadStatus::Started {
            return;
        }
        let combined: Vec<IpNet> = self
            .local_prefixes
            .union(&self.exempt_prefixes)
            .copied()
            .collect();
        if !self.hal.set_local_prefixes(&combined) {
            warn!("offload local prefix update failed");
        }
    }
}

/// HAL for platforms without a hardware offload engine: initialization
/// reports failure, so forwarding stays entirely on the kernel path.
pub struct NoOffloadHal;

impl OffloadHal for NoOffloadHal {
    fn init_offload(&self) -> bool {
        false
    }

    fn stop_offload(&self) -> bool {
        true
    }

    fn set_upstream_parameters(&self, _: &str, _: Option<IpAddr>, _: &[IpAddr]) -> bool {
        false
    }

    fn clear_upstream_parameters(&self) -> bool {
        false
    }

    fn add_downstream(&self, _: &str, _: IpNet) -> bool {
        false
    }

    fn remove_downstream(&self, _: &str, _: IpNet) -> bool {
        false
    }

    fn set_local_prefixes(&self, _: &[IpNet]) -> bool {
        false
    }
}

/// Recorded HAL call, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadOp {
    Init,
    Stop,
    SetUpstream(String, Option<IpAddr>, Vec<IpAddr>),
    ClearUpstream,
    AddDownstream(String, IpNet),
    RemoveDownstream(String, IpNet),
    SetLocalPrefixes(Vec<IpNet>),
}

/// Recording fake HAL; `fail_init` makes `init_offload` report failure.
#[derive(Default)]
pub struct FakeOffloadHal {
    ops: Mutex<Vec<OffloadOp>>,
    fail_init: Mutex<bool>,
}

impl FakeOffloadHal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_init(&self, fail: bool) {
        *self.fail_init.lock() = fail;
    }

    #[must_use]
    pub fn ops(&self) -> Vec<OffloadOp> {
        self.ops.lock().clone()
    }
}

impl OffloadHal for FakeOffloadHal {
    fn init_offload(&self) -> bool {
        self.ops.lock().push(OffloadOp::Init);
        !*self.fail_init.lock()
    }

    fn stop_offload(&self) -> bool {
        self.ops.lock().push(OffloadOp::Stop);
        true
    }

    fn set_upstream_parameters(
        &self,
        iface: &str,
        v4_addr: Option<IpAddr>,
        v6_gateways: &[IpAddr],
    ) -> bool {
        self.ops.lock().push(OffloadOp::SetUpstream(
            iface.into(),
            v4_addr,
            v6_gateways.to_vec(),
        ));
        true
    }

    fn clear_upstream_parameters(&self) -> bool {
        self.ops.lock().push(OffloadOp::ClearUpstream);
        true
    }

    fn add_downstream(&self, iface: &str, prefix: IpNet) -> bool {
        self.ops
            .lock()
            .push(OffloadOp::AddDownstream(iface.into(), prefix));
        true
    }

    fn remove_downstream(&self, iface: &str, prefix: IpNet) -> bool {
        self.ops
            .lock()
            .push(OffloadOp::RemoveDownstream(iface.into(), prefix));
        true
    }

    fn set_local_prefixes(&self, prefixes: &[IpNet]) -> bool {
        self.ops
            .lock()
            .push(OffloadOp::SetLocalPrefixes(prefixes.to_vec()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::net::{NetCapability, Transport};

    fn controller() -> (Arc<FakeOffloadHal>, OffloadController) {
        let hal = Arc::new(FakeOffloadHal::new());
        (hal.clone(), OffloadController::new(hal))
    }

    fn upstream_lp() -> LinkProperties {
        let mut lp = LinkProperties::new("rmnet0");
        lp.link_addresses.push("10.64.0.5/24".parse().unwrap());
        lp
    }

    #[test]
    fn start_reports_status() {
        let (hal, mut offload) = controller();
        assert_eq!(offload.start(), OffloadStatus::Started);
        // Idempotent.
        assert_eq!(offload.start(), OffloadStatus::Started);
        assert_eq!(hal.ops().iter().filter(|op| **op == OffloadOp::Init).count(), 1);

        let failing_hal = Arc::new(FakeOffloadHal::new());
        failing_hal.set_fail_init(true);
        let mut failing = OffloadController::new(failing_hal);
        assert_eq!(failing.start(), OffloadStatus::Failed);
    }

    #[test]
    fn vpn_upstream_is_refused() {
        let (hal, mut offload) = controller();
        offload.start();

        let vpn = NetworkCapabilities::new(vec![Transport::Vpn], vec![]);
        offload.set_upstream(Some((&upstream_lp(), &vpn)));

        assert!(hal.ops().contains(&OffloadOp::ClearUpstream));
        assert!(!hal
            .ops()
            .iter()
            .any(|op| matches!(op, OffloadOp::SetUpstream(_, _, _))));
    }

    #[test]
    fn cellular_upstream_is_programmed() {
        let (hal, mut offload) = controller();
        offload.start();

        let caps = NetworkCapabilities::new(
            vec![Transport::Cellular],
            vec![NetCapability::Internet, NetCapability::NotVpn],
        );
        offload.set_upstream(Some((&upstream_lp(), &caps)));

        assert!(hal.ops().iter().any(|op| matches!(
            op,
            OffloadOp::SetUpstream(iface, Some(_), _) if iface == "rmnet0"
        )));
    }

    #[test]
    fn downstream_prefix_diffing() {
        let (hal, mut offload) = controller();
        offload.start();

        let mut lp = LinkProperties::new("wlan0");
        lp.link_addresses.push("192.168.43.1/24".parse().unwrap());
        offload.notify_downstream(&lp);

        let prefix: IpNet = "192.168.43.0/24".parse().unwrap();
        assert!(hal
            .ops()
            .contains(&OffloadOp::AddDownstream("wlan0".into(), prefix)));

        offload.remove_downstream("wlan0");
        assert!(hal
            .ops()
            .contains(&OffloadOp::RemoveDownstream("wlan0".into(), prefix)));
    }

    #[test]
    fn local_and_exempt_prefixes_combined() {
        let (hal, mut offload) = controller();
        offload.start();

        let local: BTreeSet<IpNet> = ["10.0.0.0/24".parse().unwrap()].into();
        let exempt: BTreeSet<IpNet> = ["192.168.43.0/24".parse().unwrap()].into();
        offload.set_local_prefixes(local);
        offload.set_exempt_prefixes(exempt);

        let last = hal
            .ops()
            .into_iter()
            .rev()
            .find_map(|op| match op {
                OffloadOp::SetLocalPrefixes(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(last.len(), 2);
    }

    #[test]
    fn stop_clears_tracked_state() {
        let (hal, mut offload) = controller();
        offload.start();
        let mut lp = LinkProperties::new("wlan0");
        lp.link_addresses.push("192.168.43.1/24".parse().unwrap());
        offload.notify_downstream(&lp);

        assert_eq!(offload.stop(), OffloadStatus::Stopped);
        assert!(hal.ops().contains(&OffloadOp::Stop));

        // Removing after stop issues no HAL calls.
        let before = hal.ops().len();
        offload.remove_downstream("wlan0");
        assert_eq!(hal.ops().len(), before);
    }
}
