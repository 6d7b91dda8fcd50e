//! Error types for tetherd
//!
//! Errors are categorized by subsystem. Kernel-facing failures carry an
//! errno and the operation that failed; they are caught at the call site
//! and converted into state transitions, never unwound through the event
//! loop.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result codes reported on the IPC surface and stored as a downstream's
/// `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TetherResultCode {
    NoError,
    /// Interface is not present in the state table.
    UnknownIface,
    /// Interface exists but is in the wrong phase for the operation.
    UnavailIface,
    /// Kernel or service RPC refused the operation.
    InternalError,
    /// Tethering is disabled or the feature is off.
    Unsupported,
    /// A required system service is missing.
    ServiceUnavail,
    NoChangeTetheringPermission,
    NoAccessTetheringPermission,
    UnknownType,
    /// No downstream address could be allocated.
    NoAddressAvailable,
    /// IPv4 forwarding could not be enabled.
    EnableForwardingError,
    /// IPv4 forwarding could not be disabled.
    DisableForwardingError,
    /// The tether daemon could not be started.
    TetherIfaceError,
    /// The tether daemon could not be stopped.
    UntetherIfaceError,
    /// DNS forwarders could not be installed.
    SetDnsForwardersError,
}

impl TetherResultCode {
    #[must_use]
    pub fn is_error(self) -> bool {
        self != TetherResultCode::NoError
    }
}

impl fmt::Display for TetherResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure of a kernel-facing service call (netd, dnsresolver, dhcp).
///
/// Carries the errno the service reported and the operation name for
/// logging. These are expected runtime failures; handlers translate them
/// into state transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: errno {errno}")]
pub struct ServiceError {
    pub errno: i32,
    pub operation: &'static str,
}

impl ServiceError {
    #[must_use]
    pub const fn new(errno: i32, operation: &'static str) -> Self {
        Self { errno, operation }
    }

    /// Transient errnos may be retried; everything else needs state
    /// cleanup first.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.errno,
            errno::EAGAIN | errno::EINTR | errno::EBUSY
        )
    }
}

/// The errno values the control plane distinguishes.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EADDRNOTAVAIL: i32 = 99;
}

/// Configuration errors (file parsing, validation).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors need user intervention.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Per-downstream failures raised while bringing a served interface up or
/// down.
#[derive(Debug, Error)]
pub enum IpServerError {
    /// The address coordinator had no non-conflicting prefix left.
    #[error("No downstream address available")]
    NoAddressAvailable,

    /// A routing or interface-configuration call failed.
    #[error("Routing operation failed: {0}")]
    Routing(#[from] ServiceError),

    /// The DHCP server could not be started or reconfigured.
    #[error("DHCP server error on {iface}: {reason}")]
    Dhcp { iface: String, reason: String },

    /// Message arrived in a phase that cannot handle it.
    #[error("Operation invalid in phase {phase}")]
    InvalidPhase { phase: &'static str },
}

impl IpServerError {
    /// The result code stored as `last_error` and broadcast to listeners.
    #[must_use]
    pub fn result_code(&self) -> TetherResultCode {
        match self {
            IpServerError::NoAddressAvailable => TetherResultCode::NoAddressAvailable,
            IpServerError::Routing(_) | IpServerError::Dhcp { .. } => {
                TetherResultCode::InternalError
            }
            IpServerError::InvalidPhase { .. } => TetherResultCode::UnavailIface,
        }
    }
}

/// IPC communication errors.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// The event loop went away before replying.
    #[error("Control plane unavailable")]
    ControlPlaneGone,

    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            IpcError::SocketCreation { .. }
            | IpcError::BindError { .. }
            | IpcError::SerializationError(_)
            | IpcError::ControlPlaneGone => false,
            IpcError::ConnectionError(_) | IpcError::ProtocolError(_) => true,
            IpcError::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Top-level error type for tetherd.
#[derive(Debug, Error)]
pub enum TetherdError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Downstream error: {0}")]
    IpServer(#[from] IpServerError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TetherdError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            TetherdError::Config(e) => e.is_recoverable(),
            TetherdError::Service(e) => e.is_recoverable(),
            TetherdError::IpServer(_) => true,
            TetherdError::Ipc(e) => e.is_recoverable(),
            TetherdError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Type alias for Result with `TetherdError`.
pub type Result<T> = std::result::Result<T, TetherdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_recovery_classification() {
        assert!(ServiceError::new(errno::EAGAIN, "tetherStart").is_recoverable());
        assert!(ServiceError::new(errno::EBUSY, "ipfwdEnable").is_recoverable());
        assert!(!ServiceError::new(errno::EPERM, "ipfwdEnable").is_recoverable());
        assert!(!ServiceError::new(errno::EINVAL, "tetherDnsSet").is_recoverable());
    }

    #[test]
    fn ip_server_error_result_codes() {
        assert_eq!(
            IpServerError::NoAddressAvailable.result_code(),
            TetherResultCode::NoAddressAvailable
        );
        assert_eq!(
            IpServerError::Routing(ServiceError::new(errno::EIO, "interfaceSetCfg")).result_code(),
            TetherResultCode::InternalError
        );
        assert_eq!(
            IpServerError::InvalidPhase { phase: "unavailable" }.result_code(),
            TetherResultCode::UnavailIface
        );
    }

    #[test]
    fn error_display_carries_operation() {
        let err = ServiceError::new(errno::EPERM, "ipfwdEnable");
        let msg = err.to_string();
        assert!(msg.contains("ipfwdEnable"));
        assert!(msg.contains('1'));
    }

    #[test]
    fn error_conversion() {
        let svc = ServiceError::new(errno::EAGAIN, "tetherStart");
        let top: TetherdError = svc.into();
        assert!(top.is_recoverable());

        let cfg = ConfigError::ValidationError("invalid".into());
        let top: TetherdError = cfg.into();
        assert!(!top.is_recoverable());
    }
}
