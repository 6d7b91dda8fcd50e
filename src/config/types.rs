//! Configuration types for tetherd
//!
//! Configuration is loaded from a JSON file, with environment overrides
//! applied on top. Runtime-toggleable settings (the `tethering` section)
//! can also be flipped over IPC; the orchestrator reacts to those changes
//! the same way it reacts to platform events.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::net::{DownstreamType, Transport};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Feature flags and settings-key equivalents.
    #[serde(default)]
    pub tethering: TetheringConfig,

    /// Upstream selection policy.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Downstream interface classification.
    #[serde(default)]
    pub downstreams: DownstreamConfig,

    /// DHCP server parameters handed to the DHCP collaborator.
    #[serde(default)]
    pub dhcp: DhcpConfig,

    /// IPC configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.validate()?;
        self.downstreams.validate()?;
        self.dhcp.validate()?;
        self.ipc.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration.
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            tethering: TetheringConfig::default(),
            upstream: UpstreamConfig::default(),
            downstreams: DownstreamConfig::default(),
            dhcp: DhcpConfig::default(),
            ipc: IpcConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Settings-key equivalents controlling tethering behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TetheringConfig {
    /// Master switch; when false every IPC operation returns Unsupported.
    #[serde(default = "default_true")]
    pub supported: bool,

    /// When true, USB tethering uses the NCM function instead of RNDIS.
    /// Toggling this at runtime restarts any USB/NCM downstream.
    #[serde(default)]
    pub force_usb_ncm: bool,

    /// Allow selecting a VPN as upstream.
    #[serde(default)]
    pub allow_vpn_upstreams: bool,

    /// Weighted random choice of the starting prefix pool; when false the
    /// pool walk always starts at 192.168.0.0/16.
    #[serde(default = "default_true")]
    pub random_prefix_base: bool,

    /// Always hand 192.168.49.1/24 to Wi-Fi P2P groups.
    #[serde(default)]
    pub wifi_p2p_dedicated_ip: bool,

    /// Carrier provisioning check required before tethering may start.
    #[serde(default)]
    pub provisioning_required: bool,

    /// Accept Wi-Fi AP disable events that carry no interface name and
    /// guess the downstream to stop. Pre-U compatibility only.
    #[serde(default)]
    pub legacy_wifi_ap_compat: bool,
}

impl Default for TetheringConfig {
    fn default() -> Self {
        Self {
            supported: true,
            force_usb_ncm: false,
            allow_vpn_upstreams: false,
            random_prefix_base: true,
            wifi_p2p_dedicated_ip: false,
            provisioning_required: false,
            legacy_wifi_ap_compat: false,
        }
    }
}

/// Upstream selection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Follow the platform default network. When false the explicit
    /// `preferred_types` priority walk is used instead.
    #[serde(default = "default_true")]
    pub auto_select: bool,

    /// Prefer test networks over the default when auto-selecting.
    #[serde(default)]
    pub prefer_test_networks: bool,

    /// Carrier requires a DUN (dedicated tethering) cellular network.
    #[serde(default)]
    pub dun_required: bool,

    /// Priority-ordered transports tried when `auto_select` is off.
    #[serde(default = "default_preferred_types")]
    pub preferred_types: Vec<Transport>,

    /// Run 464xlat on IPv6-only cellular upstreams.
    #[serde(default = "default_true")]
    pub clat_on_cellular: bool,

    /// DNS servers installed when the chosen upstream reports none.
    #[serde(default = "default_dns")]
    pub fallback_dns: Vec<String>,
}

fn default_preferred_types() -> Vec<Transport> {
    vec![Transport::Ethernet, Transport::Wifi, Transport::Cellular]
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".into(), "8.8.4.4".into()]
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            auto_select: true,
            prefer_test_networks: false,
            dun_required: false,
            preferred_types: default_preferred_types(),
            clat_on_cellular: true,
            fallback_dns: default_dns(),
        }
    }
}

impl UpstreamConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.auto_select && self.preferred_types.is_empty() {
            return Err(ConfigError::ValidationError(
                "preferred_types must not be empty when auto_select is off".into(),
            ));
        }
        for dns in &self.fallback_dns {
            if dns.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid fallback DNS address: {dns}"
                )));
            }
        }
        Ok(())
    }
}

/// Interface-name prefixes used to classify appearing interfaces into
/// downstream types.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownstreamConfig {
    #[serde(default = "default_wifi_ifaces")]
    pub wifi: Vec<String>,
    #[serde(default = "default_p2p_ifaces")]
    pub wifi_p2p: Vec<String>,
    #[serde(default = "default_usb_ifaces")]
    pub usb: Vec<String>,
    #[serde(default = "default_ncm_ifaces")]
    pub ncm: Vec<String>,
    #[serde(default = "default_bluetooth_ifaces")]
    pub bluetooth: Vec<String>,
    #[serde(default = "default_ethernet_ifaces")]
    pub ethernet: Vec<String>,
    #[serde(default = "default_virtual_ifaces")]
    pub r#virtual: Vec<String>,
    #[serde(default)]
    pub wigig: Vec<String>,
}

fn default_wifi_ifaces() -> Vec<String> {
    vec!["wlan".into(), "ap".into()]
}
fn default_p2p_ifaces() -> Vec<String> {
    vec!["p2p-".into()]
}
fn default_usb_ifaces() -> Vec<String> {
    vec!["rndis".into()]
}
fn default_ncm_ifaces() -> Vec<String> {
    vec!["ncm".into(), "usb".into()]
}
fn default_bluetooth_ifaces() -> Vec<String> {
    vec!["bt-pan".into()]
}
fn default_ethernet_ifaces() -> Vec<String> {
    vec!["eth".into()]
}
fn default_virtual_ifaces() -> Vec<String> {
    vec!["tap".into()]
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            wifi: default_wifi_ifaces(),
            wifi_p2p: default_p2p_ifaces(),
            usb: default_usb_ifaces(),
            ncm: default_ncm_ifaces(),
            bluetooth: default_bluetooth_ifaces(),
            ethernet: default_ethernet_ifaces(),
            r#virtual: default_virtual_ifaces(),
            wigig: Vec::new(),
        }
    }
}

impl DownstreamConfig {
    /// Classify an interface name. P2P wins over Wi-Fi and USB over NCM
    /// when prefixes overlap, matching the match order below.
    #[must_use]
    pub fn classify(&self, iface: &str) -> Option<DownstreamType> {
        let table: [(&[String], DownstreamType); 8] = [
            (&self.wifi_p2p, DownstreamType::WifiP2p),
            (&self.wifi, DownstreamType::Wifi),
            (&self.usb, DownstreamType::Usb),
            (&self.ncm, DownstreamType::Ncm),
            (&self.bluetooth, DownstreamType::Bluetooth),
            (&self.ethernet, DownstreamType::Ethernet),
            (&self.r#virtual, DownstreamType::Virtual),
            (&self.wigig, DownstreamType::Wigig),
        ];
        for (prefixes, ty) in table {
            if prefixes.iter().any(|p| iface.starts_with(p.as_str())) {
                return Some(ty);
            }
        }
        None
    }

    /// Bitmap of types that have at least one configured interface prefix.
    #[must_use]
    pub fn supported_type_bitmap(&self) -> u32 {
        let mut bitmap = 0;
        let table: [(&[String], DownstreamType); 8] = [
            (&self.wifi, DownstreamType::Wifi),
            (&self.wifi_p2p, DownstreamType::WifiP2p),
            (&self.usb, DownstreamType::Usb),
            (&self.ncm, DownstreamType::Ncm),
            (&self.bluetooth, DownstreamType::Bluetooth),
            (&self.ethernet, DownstreamType::Ethernet),
            (&self.r#virtual, DownstreamType::Virtual),
            (&self.wigig, DownstreamType::Wigig),
        ];
        for (prefixes, ty) in table {
            if !prefixes.is_empty() {
                bitmap |= ty.bit();
            }
        }
        bitmap
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let all = [
            &self.wifi,
            &self.wifi_p2p,
            &self.usb,
            &self.ncm,
            &self.bluetooth,
            &self.ethernet,
            &self.r#virtual,
            &self.wigig,
        ];
        for prefixes in all {
            for prefix in prefixes {
                if prefix.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "Empty interface prefix".into(),
                    ));
                }
                seen.insert(prefix.as_str());
            }
        }
        if seen.is_empty() {
            return Err(ConfigError::ValidationError(
                "No tetherable interface prefixes configured".into(),
            ));
        }
        Ok(())
    }
}

/// DHCP server parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DhcpConfig {
    /// Lease duration handed to clients.
    #[serde(default = "default_lease_time_secs")]
    pub lease_time_secs: u32,
}

fn default_lease_time_secs() -> u32 {
    3600
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            lease_time_secs: default_lease_time_secs(),
        }
    }
}

impl DhcpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_time_secs < 60 {
            return Err(ConfigError::ValidationError(
                "dhcp.lease_time_secs must be at least 60".into(),
            ));
        }
        Ok(())
    }
}

/// IPC socket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Unix socket path.
    #[serde(default = "default_ipc_socket")]
    pub socket_path: PathBuf,

    /// Socket file mode.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Enable the IPC server.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum accepted message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_ipc_socket() -> PathBuf {
    PathBuf::from("/run/tetherd/tetherd.sock")
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_max_message_size() -> usize {
    256 * 1024
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_ipc_socket(),
            socket_mode: default_socket_mode(),
            enabled: true,
            max_message_size: default_max_message_size(),
        }
    }
}

impl IpcConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "ipc.max_message_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the event target in output.
    #[serde(default = "default_true")]
    pub target: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default_config().validate().unwrap();
    }

    #[test]
    fn classify_prefers_p2p_over_wifi() {
        let cfg = DownstreamConfig {
            wifi: vec!["p2p".into(), "wlan".into()],
            wifi_p2p: vec!["p2p-".into()],
            ..DownstreamConfig::default()
        };
        assert_eq!(cfg.classify("p2p-wlan0-0"), Some(DownstreamType::WifiP2p));
        assert_eq!(cfg.classify("wlan0"), Some(DownstreamType::Wifi));
        assert_eq!(cfg.classify("lo"), None);
    }

    #[test]
    fn supported_bitmap_reflects_configured_types() {
        let cfg = DownstreamConfig::default();
        let bitmap = cfg.supported_type_bitmap();
        assert_ne!(bitmap & DownstreamType::Wifi.bit(), 0);
        assert_ne!(bitmap & DownstreamType::Usb.bit(), 0);
        // Wigig has no default prefixes.
        assert_eq!(bitmap & DownstreamType::Wigig.bit(), 0);
    }

    #[test]
    fn explicit_selection_requires_preferences() {
        let mut cfg = Config::default_config();
        cfg.upstream.auto_select = false;
        cfg.upstream.preferred_types.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_fallback_dns_rejected() {
        let mut cfg = Config::default_config();
        cfg.upstream.fallback_dns = vec!["not-an-ip".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_dhcp_lease_rejected() {
        let mut cfg = Config::default_config();
        cfg.dhcp.lease_time_secs = 10;
        assert!(cfg.validate().is_err());
    }
}
