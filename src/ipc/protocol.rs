//! IPC protocol definitions
//!
//! Commands and responses exchanged over the control socket. Frames are
//! length-prefixed JSON; a connection may also receive pushed callback
//! events after registering a listener.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::callbacks::{CallbackEvent, EventCallbackSink};
use crate::error::{IpcError, TetherResultCode};
use crate::net::{DownstreamType, TetheringRequest};

/// Length prefix size in bytes (u32 big-endian).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Hard cap on frame size, independent of configuration.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Permissions a caller may hold. The transport authenticates the peer
/// and fills these in; the control plane only enforces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    TetherPrivileged,
    WriteSettings,
    AccessNetworkState,
    NetworkSettings,
    NetworkStack,
}

/// Who is calling, as established by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub uid: u32,
    pub package_name: String,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

impl CallerIdentity {
    #[must_use]
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// NETWORK_SETTINGS or NETWORK_STACK.
    #[must_use]
    pub fn has_system_permission(&self) -> bool {
        self.has(Permission::NetworkSettings) || self.has(Permission::NetworkStack)
    }
}

/// Control operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Liveness check.
    Ping,

    /// Legacy per-interface start.
    Tether { iface: String },

    /// Legacy per-interface stop.
    Untether { iface: String },

    StartTethering { request: TetheringRequest },

    StopTethering { tethering_type: DownstreamType },

    StopAllTethering,

    SetUsbTethering { enable: bool },

    /// Run the carrier entitlement check for a type.
    RequestEntitlementResult {
        tethering_type: DownstreamType,
        show_ui: bool,
    },

    IsTetheringSupported,

    /// System-only: prefer test networks during upstream selection.
    SetPreferTestNetworks { prefer: bool },

    /// Start receiving callback events on this connection.
    RegisterCallback,

    UnregisterCallback { listener: u64 },
}

/// Replies to commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,
    Result { code: TetherResultCode },
    Supported { supported: bool },
    Entitlement { code: TetherResultCode },
    Registered { listener: u64 },
}

impl IpcResponse {
    #[must_use]
    pub fn ok() -> Self {
        IpcResponse::Result {
            code: TetherResultCode::NoError,
        }
    }

    #[must_use]
    pub fn code(code: TetherResultCode) -> Self {
        IpcResponse::Result { code }
    }
}

/// A command with the identity asserted by the caller. The server
/// cross-checks the uid against the socket peer credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub caller: CallerIdentity,
    pub command: IpcCommand,
}

/// One frame on the wire: a reply to a command, or a pushed callback
/// event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WireFrame {
    Response(IpcResponse),
    Event(CallbackEvent),
}

/// A decoded command plus its reply channel, posted onto the event bus.
/// The callback sink is present so `RegisterCallback` can attach this
/// connection to the registry.
pub struct IpcRequest {
    pub command: IpcCommand,
    pub caller: CallerIdentity,
    pub callback_sink: Option<Arc<dyn EventCallbackSink>>,
    pub reply: oneshot::Sender<IpcResponse>,
}

impl std::fmt::Debug for IpcRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcRequest")
            .field("command", &self.command)
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

/// Encode a message with its length prefix.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(message).map_err(|e| IpcError::serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&u32::try_from(body.len()).map_err(|_| {
        IpcError::serialization("message too large".to_string())
    })?.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a message body (length prefix already stripped).
pub fn decode_message<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, IpcError> {
    serde_json::from_slice(body).map_err(|e| IpcError::protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let command = IpcCommand::StartTethering {
            request: TetheringRequest::new(DownstreamType::Wifi, 1000, "com.example"),
        };
        let encoded = encode_message(&command).unwrap();
        assert_eq!(
            u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize,
            encoded.len() - LENGTH_PREFIX_SIZE
        );
        let decoded: IpcCommand = decode_message(&encoded[LENGTH_PREFIX_SIZE..]).unwrap();
        assert!(matches!(decoded, IpcCommand::StartTethering { .. }));
    }

    #[test]
    fn frame_roundtrip() {
        let frame = WireFrame::Response(IpcResponse::code(TetherResultCode::Unsupported));
        let encoded = encode_message(&frame).unwrap();
        let decoded: WireFrame = decode_message(&encoded[LENGTH_PREFIX_SIZE..]).unwrap();
        assert!(matches!(
            decoded,
            WireFrame::Response(IpcResponse::Result {
                code: TetherResultCode::Unsupported
            })
        ));
    }

    #[test]
    fn bad_body_is_protocol_error() {
        let err = decode_message::<IpcCommand>(b"{oops").unwrap_err();
        assert!(matches!(err, IpcError::ProtocolError(_)));
    }

    #[test]
    fn system_permission_helper() {
        let mut caller = CallerIdentity {
            uid: 1000,
            package_name: "com.example".into(),
            permissions: BTreeSet::new(),
        };
        assert!(!caller.has_system_permission());
        caller.permissions.insert(Permission::NetworkStack);
        assert!(caller.has_system_permission());
    }
}
