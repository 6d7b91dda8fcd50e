//! IPC surface
//!
//! Unix-socket control protocol for the tethering service: typed
//! commands, permission enforcement helpers and the server/client pair.

pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::{
    check_callback_permission, check_change_permission, check_request_restrictions,
    check_system_permission, verify_caller_package, PackageManager, PermissivePackageManager,
    StaticPackageManager,
};
pub use protocol::{
    CallerIdentity, CommandFrame, IpcCommand, IpcRequest, IpcResponse, Permission, WireFrame,
};
pub use server::{IpcClient, IpcServer};
