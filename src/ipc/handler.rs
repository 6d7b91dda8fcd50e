//! IPC permission enforcement
//!
//! Pure checks applied by the control plane before executing a command.
//! The transport authenticates the peer; these functions only decide
//! whether the authenticated identity may do what it asked.

use crate::error::TetherResultCode;
use crate::net::TetheringRequest;

use super::protocol::{CallerIdentity, Permission};

/// Maps uids to the packages they own. External collaborator; the fake
/// below backs tests and the simulated mode.
pub trait PackageManager: Send + Sync {
    fn packages_for_uid(&self, uid: u32) -> Vec<String>;
}

/// Accepts every (uid, package) pair. For deployments without a package
/// database the uid from the socket is the only identity that matters.
pub struct PermissivePackageManager;

impl PackageManager for PermissivePackageManager {
    fn packages_for_uid(&self, _uid: u32) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed uid -> package table.
#[derive(Default)]
pub struct StaticPackageManager {
    entries: Vec<(u32, String)>,
}

impl StaticPackageManager {
    #[must_use]
    pub fn new(entries: Vec<(u32, String)>) -> Self {
        Self { entries }
    }
}

impl PackageManager for StaticPackageManager {
    fn packages_for_uid(&self, uid: u32) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(u, _)| *u == uid)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// The stated package must belong to the caller uid. An empty package
/// list means the platform has no package database (permissive mode).
pub fn verify_caller_package(
    caller: &CallerIdentity,
    packages: &dyn PackageManager,
) -> Result<(), TetherResultCode> {
    let known = packages.packages_for_uid(caller.uid);
    if known.is_empty() || known.iter().any(|p| p == &caller.package_name) {
        Ok(())
    } else {
        Err(TetherResultCode::NoChangeTetheringPermission)
    }
}

/// State-changing operations: TETHER_PRIVILEGED always allowed;
/// WRITE_SETTINGS only when provisioning is not required.
pub fn check_change_permission(
    caller: &CallerIdentity,
    provisioning_required: bool,
) -> Result<(), TetherResultCode> {
    if caller.has(Permission::TetherPrivileged) {
        return Ok(());
    }
    if caller.has(Permission::WriteSettings) && !provisioning_required {
        return Ok(());
    }
    Err(TetherResultCode::NoChangeTetheringPermission)
}

/// Callback registration: TETHER_PRIVILEGED or ACCESS_NETWORK_STATE.
pub fn check_callback_permission(caller: &CallerIdentity) -> Result<(), TetherResultCode> {
    if caller.has(Permission::TetherPrivileged) || caller.has(Permission::AccessNetworkState) {
        Ok(())
    } else {
        Err(TetherResultCode::NoAccessTetheringPermission)
    }
}

/// Requests that name an explicit interface or bypass the entitlement
/// check need system-level permission, and the embedded uid must be the
/// caller's own.
pub fn check_request_restrictions(
    request: &TetheringRequest,
    caller: &CallerIdentity,
) -> Result<(), TetherResultCode> {
    if request.uid != caller.uid || request.package_name != caller.package_name {
        return Err(TetherResultCode::NoChangeTetheringPermission);
    }
    if (request.interface_name.is_some() || request.exempt_from_entitlement_check)
        && !caller.has_system_permission()
    {
        return Err(TetherResultCode::NoChangeTetheringPermission);
    }
    Ok(())
}

/// System-only operations (test network preference).
pub fn check_system_permission(caller: &CallerIdentity) -> Result<(), TetherResultCode> {
    if caller.has_system_permission() {
        Ok(())
    } else {
        Err(TetherResultCode::NoChangeTetheringPermission)
    }
}
